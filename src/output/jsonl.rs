// 该文件是 Wangchuan （望川） 项目的一部分。
// src/output/jsonl.rs - JSON Lines 结果记录
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

use std::{
  fs::File,
  io::{BufWriter, Write},
  path::Path,
};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{Classification, Detection, InferenceError},
  pipeline::{FrameResult, ResultSink},
};

#[derive(Error, Debug)]
pub enum JsonLinesSinkError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  SerializeError(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct DetectionRecord<'a> {
  x: f32,
  y: f32,
  width: f32,
  height: f32,
  confidence: f32,
  index: usize,
  label: &'a str,
}

impl<'a> From<&'a Detection> for DetectionRecord<'a> {
  fn from(det: &'a Detection) -> Self {
    Self {
      x: det.bbox.x,
      y: det.bbox.y,
      width: det.bbox.width,
      height: det.bbox.height,
      confidence: det.confidence,
      index: det.class_id,
      label: &det.label,
    }
  }
}

#[derive(Serialize)]
struct ClassificationRecord<'a> {
  confidence: f32,
  index: usize,
  label: &'a str,
}

impl<'a> From<&'a Classification> for ClassificationRecord<'a> {
  fn from(class: &'a Classification) -> Self {
    Self {
      confidence: class.confidence,
      index: class.class_id,
      label: &class.label,
    }
  }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Record<'a> {
  Result {
    time: String,
    timestamp_ms: u64,
    inference_ms: f64,
    frame_width: u32,
    frame_height: u32,
    detections: Vec<DetectionRecord<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    classifications: Vec<ClassificationRecord<'a>>,
  },
  Fps {
    time: String,
    fps: f32,
  },
  Degraded {
    time: String,
    failures: usize,
    error: String,
  },
}

fn now() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 每个事件写一行 JSON
///
/// `jsonl:///path/to/results.jsonl` 写文件，`jsonl://stdout` 写标准输出。
pub struct JsonLinesSink<W: Write + Send> {
  writer: W,
}

pub type BoxedJsonLinesSink = JsonLinesSink<Box<dyn Write + Send>>;

impl<W: Write + Send> JsonLinesSink<W> {
  pub fn new(writer: W) -> Self {
    Self { writer }
  }

  pub fn into_inner(self) -> W {
    self.writer
  }

  fn write(&mut self, record: &Record<'_>) -> Result<(), JsonLinesSinkError> {
    serde_json::to_writer(&mut self.writer, record)?;
    self.writer.write_all(b"\n")?;
    self.writer.flush()?;
    Ok(())
  }

  fn emit(&mut self, record: Record<'_>) {
    if let Err(e) = self.write(&record) {
      error!("写入检测记录失败: {}", e);
    }
  }
}

impl BoxedJsonLinesSink {
  pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, JsonLinesSinkError> {
    let file = File::create(path)?;
    Ok(Self::new(Box::new(BufWriter::new(file))))
  }

  pub fn stdout() -> Self {
    Self::new(Box::new(std::io::stdout()))
  }
}

impl FromUrlWithScheme for BoxedJsonLinesSink {
  const SCHEME: &'static str = "jsonl";
}

impl FromUrl for BoxedJsonLinesSink {
  type Error = JsonLinesSinkError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(JsonLinesSinkError::SchemeMismatch);
    }
    match url.host_str() {
      Some("stdout") => Ok(Self::stdout()),
      _ => Self::create(url.path()),
    }
  }
}

impl<W: Write + Send> ResultSink for JsonLinesSink<W> {
  fn on_result(&mut self, result: &FrameResult) {
    self.emit(Record::Result {
      time: now(),
      timestamp_ms: result.timestamp.as_millis() as u64,
      inference_ms: result.inference_ms,
      frame_width: result.frame_size.0,
      frame_height: result.frame_size.1,
      detections: result.detections.iter().map(DetectionRecord::from).collect(),
      classifications: result
        .classifications
        .iter()
        .map(ClassificationRecord::from)
        .collect(),
    });
  }

  fn on_fps(&mut self, fps: f32) {
    self.emit(Record::Fps { time: now(), fps });
  }

  fn on_degraded(&mut self, failures: usize, error: &InferenceError) {
    self.emit(Record::Degraded {
      time: now(),
      failures,
      error: error.to_string(),
    });
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::model::BBox;

  #[test]
  fn writes_one_line_per_event() {
    let mut sink = JsonLinesSink::new(Vec::new());
    sink.on_result(&FrameResult {
      detections: vec![Detection {
        bbox: BBox::new(1.0, 2.0, 3.0, 4.0),
        confidence: 0.5,
        class_id: 2,
        label: "car".to_string(),
      }],
      classifications: Vec::new(),
      inference_ms: 12.5,
      timestamp: Duration::from_millis(40),
      frame_size: (640, 480),
    });
    sink.on_fps(29.5);
    sink.on_degraded(3, &InferenceError::Engine("boom".to_string()));

    let text = String::from_utf8(sink.into_inner()).unwrap();
    let lines: Vec<serde_json::Value> = text
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect();
    assert_eq!(lines.len(), 3);

    assert_eq!(lines[0]["event"], "result");
    assert_eq!(lines[0]["timestamp_ms"], 40);
    assert_eq!(lines[0]["frame_width"], 640);
    let det = &lines[0]["detections"][0];
    assert_eq!(det["label"], "car");
    assert_eq!(det["index"], 2);
    assert_eq!(det["width"], 3.0);

    assert!(lines[0].get("classifications").is_none());

    assert_eq!(lines[1]["event"], "fps");
    assert_eq!(lines[2]["event"], "degraded");
    assert_eq!(lines[2]["failures"], 3);
    assert!(lines[2]["time"].as_str().unwrap().ends_with('Z'));
  }

  #[test]
  fn file_sink_from_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.jsonl");
    let url = Url::parse(&format!("jsonl://{}", path.display())).unwrap();
    let mut sink = BoxedJsonLinesSink::from_url(&url).unwrap();
    sink.on_fps(10.0);
    drop(sink);
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("\"fps\":10.0"));
  }

  #[test]
  fn classification_results_are_written() {
    let mut sink = JsonLinesSink::new(Vec::new());
    sink.on_result(&FrameResult {
      detections: Vec::new(),
      classifications: vec![Classification {
        confidence: 0.9,
        class_id: 7,
        label: "truck".to_string(),
      }],
      inference_ms: 3.0,
      timestamp: Duration::ZERO,
      frame_size: (224, 224),
    });
    let text = String::from_utf8(sink.into_inner()).unwrap();
    let line: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
    assert_eq!(line["classifications"][0]["index"], 7);
    assert_eq!(line["classifications"][0]["label"], "truck");
    assert_eq!(line["detections"].as_array().unwrap().len(), 0);
  }
}
