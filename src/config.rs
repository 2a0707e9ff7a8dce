// 该文件是 Wangchuan （望川） 项目的一部分。
// src/config.rs - 阈值与管线配置
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
  path::Path,
  sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
  encode::{EncoderConfig, Normalization},
  remap::Target,
};

const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_MAX_ITEMS: usize = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("置信度阈值必须在 [0, 1] 之间, 实际为 {0}")]
  InvalidConfidence(f32),
  #[error("IoU 阈值必须在 [0, 1] 之间, 实际为 {0}")]
  InvalidIou(f32),
  #[error("最大检测数必须为正整数")]
  InvalidMaxItems,
  #[error("配置项 {0} 无效")]
  InvalidValue(&'static str),
  #[error("读取配置文件失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("解析配置文件失败: {0}")]
  Parse(#[from] toml::de::Error),
}

/// 解码阈值
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
  pub confidence: f32,
  pub iou: f32,
  pub max_items: usize,
}

impl Default for Thresholds {
  fn default() -> Self {
    Self {
      confidence: DEFAULT_CONFIDENCE,
      iou: DEFAULT_IOU,
      max_items: DEFAULT_MAX_ITEMS,
    }
  }
}

fn check_unit(value: f32) -> bool {
  (0.0..=1.0).contains(&value)
}

impl Thresholds {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if !check_unit(self.confidence) {
      return Err(ConfigError::InvalidConfidence(self.confidence));
    }
    if !check_unit(self.iou) {
      return Err(ConfigError::InvalidIou(self.iou));
    }
    if self.max_items == 0 {
      return Err(ConfigError::InvalidMaxItems);
    }
    Ok(())
  }
}

/// 跨线程共享的运行时阈值
///
/// 写入方可能在任意时刻更新，每帧开始时读取一次快照；
/// 新值只影响之后处理的帧。非法值被拒绝，旧值保持不变。
#[derive(Debug)]
pub struct SharedThresholds {
  confidence: AtomicU32,
  iou: AtomicU32,
  max_items: AtomicUsize,
  mirror: AtomicBool,
}

impl Default for SharedThresholds {
  fn default() -> Self {
    Self::new(Thresholds::default())
  }
}

impl SharedThresholds {
  pub fn new(thresholds: Thresholds) -> Self {
    Self {
      confidence: AtomicU32::new(thresholds.confidence.to_bits()),
      iou: AtomicU32::new(thresholds.iou.to_bits()),
      max_items: AtomicUsize::new(thresholds.max_items),
      mirror: AtomicBool::new(false),
    }
  }

  pub fn set_confidence(&self, confidence: f32) -> Result<(), ConfigError> {
    if !check_unit(confidence) {
      warn!("拒绝置信度阈值: {}", confidence);
      return Err(ConfigError::InvalidConfidence(confidence));
    }
    self
      .confidence
      .store(confidence.to_bits(), Ordering::Relaxed);
    info!("置信度阈值更新为 {}", confidence);
    Ok(())
  }

  pub fn set_iou(&self, iou: f32) -> Result<(), ConfigError> {
    if !check_unit(iou) {
      warn!("拒绝 IoU 阈值: {}", iou);
      return Err(ConfigError::InvalidIou(iou));
    }
    self.iou.store(iou.to_bits(), Ordering::Relaxed);
    info!("IoU 阈值更新为 {}", iou);
    Ok(())
  }

  pub fn set_max_items(&self, max_items: usize) -> Result<(), ConfigError> {
    if max_items == 0 {
      warn!("拒绝最大检测数: {}", max_items);
      return Err(ConfigError::InvalidMaxItems);
    }
    self.max_items.store(max_items, Ordering::Relaxed);
    info!("最大检测数更新为 {}", max_items);
    Ok(())
  }

  /// 前置摄像头（镜像）标志
  pub fn set_mirror(&self, mirror: bool) {
    self.mirror.store(mirror, Ordering::Relaxed);
  }

  pub fn mirror(&self) -> bool {
    self.mirror.load(Ordering::Relaxed)
  }

  pub fn snapshot(&self) -> Thresholds {
    Thresholds {
      confidence: f32::from_bits(self.confidence.load(Ordering::Relaxed)),
      iou: f32::from_bits(self.iou.load(Ordering::Relaxed)),
      max_items: self.max_items.load(Ordering::Relaxed),
    }
  }
}

/// 推理工作线程配置
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// 帧率统计窗口（毫秒）
  pub fps_window_ms: u64,
  /// 连续推理失败多少次后上报降级
  pub degraded_after: usize,
  /// 像素缓冲池槽位数
  pub pool_slots: usize,
  /// 像素缓冲初始容量（字节）
  pub pool_capacity: usize,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      fps_window_ms: 1000,
      degraded_after: 3,
      pool_slots: 1,
      pool_capacity: 1280 * 720 * 3,
    }
  }
}

/// 完整的管线配置，可以从 toml 文件读取
///
/// ```toml
/// mirror = false
///
/// [thresholds]
/// confidence = 0.25
/// iou = 0.45
/// max_items = 30
///
/// [encoder]
/// sampling = "bilinear"
/// normalization = { kind = "minus_one_to_one" }
///
/// [target]
/// kind = "screen"
/// width = 390.0
/// height = 844.0
/// ```
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub thresholds: Thresholds,
  pub mirror: bool,
  pub encoder: EncoderConfig,
  pub worker: WorkerConfig,
  pub target: Target,
}

impl PipelineConfig {
  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    let config: PipelineConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("读取配置文件: {}", path.display());
    let content = std::fs::read_to_string(path)?;
    Self::from_toml_str(&content)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    self.thresholds.validate()?;
    if self.worker.degraded_after == 0 {
      return Err(ConfigError::InvalidValue("worker.degraded_after"));
    }
    if self.worker.fps_window_ms == 0 {
      return Err(ConfigError::InvalidValue("worker.fps_window_ms"));
    }
    if let Normalization::MeanStd { mean, std } = self.encoder.normalization {
      if std.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
        return Err(ConfigError::InvalidValue("encoder.normalization.std"));
      }
      if mean.iter().any(|m| !m.is_finite()) {
        return Err(ConfigError::InvalidValue("encoder.normalization.mean"));
      }
    }
    self.target.validate()
  }
}
