// 该文件是 Wangchuan （望川） 项目的一部分。
// src/output/log.rs - 日志输出
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use tracing::{error, info};

use crate::{
  FromUrlWithScheme,
  model::InferenceError,
  pipeline::{FrameResult, ResultSink},
};

/// 把结果写进 tracing 日志：`log://`
#[derive(Debug, Default)]
pub struct LogSink {
  frames: u64,
}

impl LogSink {
  pub fn frames(&self) -> u64 {
    self.frames
  }
}

impl FromUrlWithScheme for LogSink {
  const SCHEME: &'static str = "log";
}

impl crate::FromUrl for LogSink {
  type Error = std::convert::Infallible;

  fn from_url(_url: &url::Url) -> Result<Self, Self::Error> {
    Ok(Self::default())
  }
}

impl ResultSink for LogSink {
  fn on_result(&mut self, result: &FrameResult) {
    self.frames += 1;
    info!(
      "第 {} 帧: {} 个目标, {} 个分类, 推理耗时 {:.2} ms",
      self.frames,
      result.detections.len(),
      result.classifications.len(),
      result.inference_ms
    );
    for det in &result.detections {
      info!(
        "  {} ({}) {:.3} [{:.1}, {:.1}, {:.1}, {:.1}]",
        det.label,
        det.class_id,
        det.confidence,
        det.bbox.x,
        det.bbox.y,
        det.bbox.width,
        det.bbox.height
      );
    }
    for class in &result.classifications {
      info!("  {} ({}) {:.3}", class.label, class.class_id, class.confidence);
    }
  }

  fn on_fps(&mut self, fps: f32) {
    info!("FPS: {:.1}", fps);
  }

  fn on_degraded(&mut self, failures: usize, error: &InferenceError) {
    error!("连续 {} 次推理失败: {}", failures, error);
  }
}
