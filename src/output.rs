// 该文件是 Wangchuan （望川） 项目的一部分。
// src/output.rs - 检测结果输出
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

use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::InferenceError,
  pipeline::{FrameResult, ResultSink},
};

mod jsonl;
mod log;

pub use self::jsonl::{BoxedJsonLinesSink, JsonLinesSink, JsonLinesSinkError};
pub use self::log::LogSink;

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("JSON Lines 输出错误: {0}")]
  JsonLinesSinkError(#[from] JsonLinesSinkError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum SinkWrapper {
  JsonLines(BoxedJsonLinesSink),
  Log(LogSink),
}

impl FromUrl for SinkWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      BoxedJsonLinesSink::SCHEME => {
        let sink = BoxedJsonLinesSink::from_url(url)?;
        Ok(SinkWrapper::JsonLines(sink))
      }
      LogSink::SCHEME => Ok(SinkWrapper::Log(LogSink::default())),
      scheme => Err(OutputError::SchemeMismatch(scheme.to_string())),
    }
  }
}

impl ResultSink for SinkWrapper {
  fn on_result(&mut self, result: &FrameResult) {
    match self {
      SinkWrapper::JsonLines(sink) => sink.on_result(result),
      SinkWrapper::Log(sink) => sink.on_result(result),
    }
  }

  fn on_fps(&mut self, fps: f32) {
    match self {
      SinkWrapper::JsonLines(sink) => sink.on_fps(fps),
      SinkWrapper::Log(sink) => sink.on_fps(fps),
    }
  }

  fn on_degraded(&mut self, failures: usize, error: &InferenceError) {
    match self {
      SinkWrapper::JsonLines(sink) => sink.on_degraded(failures, error),
      SinkWrapper::Log(sink) => sink.on_degraded(failures, error),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sink_from_url() {
    let url = Url::parse("log://").unwrap();
    assert!(matches!(SinkWrapper::from_url(&url), Ok(SinkWrapper::Log(_))));
    let url = Url::parse("jsonl://stdout").unwrap();
    assert!(matches!(
      SinkWrapper::from_url(&url),
      Ok(SinkWrapper::JsonLines(_))
    ));
    let url = Url::parse("rtsp://host/stream").unwrap();
    assert!(matches!(
      SinkWrapper::from_url(&url),
      Err(OutputError::SchemeMismatch(_))
    ));
  }
}
