// 该文件是 Wangchuan （望川） 项目的一部分。
// src/args.rs - 命令行公共参数
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

use std::path::PathBuf;

use clap::Args;
use tracing::info;
use url::Url;

use crate::config::{ConfigError, PipelineConfig};

/// 各个可执行程序共用的参数
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
  /// 模型来源，例如 model:///path/to/output.bin?labels=/path/to/coco.toml
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 输入来源，例如 image:///path/to/photo.jpg 或 gst://camera/dev/video0
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 结果输出，例如 jsonl:///path/to/results.jsonl 或 log://
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,

  /// 管线配置文件（toml）
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 置信度阈值 (0.0 - 1.0)，覆盖配置文件
  #[arg(long, value_name = "THRESHOLD")]
  pub confidence: Option<f32>,

  /// NMS IoU 阈值 (0.0 - 1.0)，覆盖配置文件
  #[arg(long, value_name = "THRESHOLD")]
  pub iou: Option<f32>,

  /// 每帧最多输出的目标数，覆盖配置文件
  #[arg(long, value_name = "COUNT")]
  pub max_items: Option<usize>,
}

impl CommonArgs {
  /// 读取配置文件（如有），再叠加命令行上的阈值
  pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
    let mut config = match &self.config {
      Some(path) => PipelineConfig::from_file(path)?,
      None => PipelineConfig::default(),
    };
    if let Some(confidence) = self.confidence {
      config.thresholds.confidence = confidence;
    }
    if let Some(iou) = self.iou {
      config.thresholds.iou = iou;
    }
    if let Some(max_items) = self.max_items {
      config.thresholds.max_items = max_items;
    }
    config.validate()?;

    info!("模型来源: {}", self.model);
    info!("输入来源: {}", self.input);
    info!("结果输出: {}", self.output);
    info!(
      "阈值: 置信度 {}, IoU {}, 最多 {} 个目标",
      config.thresholds.confidence, config.thresholds.iou, config.thresholds.max_items
    );
    Ok(config)
  }
}
