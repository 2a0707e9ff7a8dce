// 该文件是 Wangchuan （望川） 项目的一部分。
// src/model.rs - 模型与推理引擎接口
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

use std::{fmt, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, pool::Tensor};

mod decode;
mod replay;

pub use self::decode::{Decoder, HeadConfig, HeadLayout, classify, decode};
pub use self::replay::{ReplayEngine, ReplayLoader};

const DEFAULT_INPUT_SIZE: u32 = 320;
const RGB_CHANNELS: usize = 3;

/// 张量形状
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorShape(pub Vec<usize>);

impl TensorShape {
  pub fn new(dims: &[usize]) -> Self {
    Self(dims.to_vec())
  }

  pub fn dims(&self) -> &[usize] {
    &self.0
  }

  pub fn elements(&self) -> usize {
    self.0.iter().product()
  }

  /// 去掉前导的 1 维（批大小）
  pub fn squeezed(&self) -> &[usize] {
    let lead = self.0.iter().take_while(|d| **d == 1).count();
    &self.0[lead.min(self.0.len().saturating_sub(1))..]
  }
}

impl fmt::Display for TensorShape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}", self.0)
  }
}

#[derive(Error, Debug)]
pub enum ModelLoadError {
  #[error("模型加载错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型元数据无效: {0}")]
  Metadata(#[from] toml::de::Error),
  #[error("模型元数据缺少类别名称")]
  MissingLabels,
  #[error("模型输入尺寸无效: {0:?}")]
  InvalidInputSize([u32; 2]),
  #[error("模型路径缺少 labels 参数")]
  MissingMetadata,
  #[error("模型路径必须使用 {expected} 方案, 实际为 {actual}")]
  SchemeMismatch { expected: String, actual: String },
  #[error("{tensor} 张量形状不匹配: 期望 {expected}, 实际 {actual}")]
  ShapeMismatch {
    tensor: &'static str,
    expected: String,
    actual: TensorShape,
  },
  #[error("推理引擎错误: {0}")]
  Engine(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
  #[error("推理引擎错误: {0}")]
  Engine(String),
  #[error("输出长度不匹配: 期望 {expected}, 实际 {actual}")]
  OutputLength { expected: usize, actual: usize },
  #[error("输出长度 {len} 不是行宽 {row_width} 的整数倍")]
  MalformedOutput { len: usize, row_width: usize },
  #[error("模型检测头是 {actual:?}, 不能用于{task}")]
  WrongHead { task: &'static str, actual: HeadLayout },
}

/// 推理引擎句柄
///
/// 输入、输出形状在加载后固定。同一个实例不允许并发调用，
/// 释放即关闭。
pub trait Engine: Send {
  fn input_shape(&self) -> TensorShape;
  fn output_shape(&self) -> TensorShape;
  fn infer(&mut self, input: &Tensor, output: &mut [f32]) -> Result<(), InferenceError>;
}

/// 把模型字节加载为推理引擎
pub trait EngineLoader: Send + Sync {
  type Engine: Engine;
  fn load(&self, model: &[u8], metadata: &ModelMetadata) -> Result<Self::Engine, ModelLoadError>;
}

fn default_imgsz() -> [u32; 2] {
  [DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE]
}

/// 模型元数据
///
/// ```toml
/// imgsz = [640, 640]
/// names = ["person", "bicycle", "car"]
///
/// [head]
/// layout = "class_scores"
/// transposed = true
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelMetadata {
  #[serde(default = "default_imgsz")]
  pub imgsz: [u32; 2],
  #[serde(default)]
  pub names: Vec<String>,
  #[serde(default)]
  pub head: HeadConfig,
}

impl ModelMetadata {
  pub fn from_toml_str(content: &str) -> Result<Self, ModelLoadError> {
    let metadata: ModelMetadata = toml::from_str(content)?;
    metadata.validate()?;
    Ok(metadata)
  }

  pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ModelLoadError> {
    let path = path.as_ref();
    info!("加载模型元数据: {}", path.display());
    Self::from_toml_str(&std::fs::read_to_string(path)?)
  }

  pub fn validate(&self) -> Result<(), ModelLoadError> {
    if self.names.is_empty() {
      return Err(ModelLoadError::MissingLabels);
    }
    if self.imgsz.contains(&0) {
      return Err(ModelLoadError::InvalidInputSize(self.imgsz));
    }
    Ok(())
  }

  /// 模型输入边长，取两个维度中较大者
  pub fn input_side(&self) -> u32 {
    self.imgsz[0].max(self.imgsz[1])
  }

  pub fn num_classes(&self) -> usize {
    self.names.len()
  }
}

/// 归一化或像素坐标下的轴对齐框，左上角为原点
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct BBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl BBox {
  pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  /// 由中心点和宽高构造（cx∓w/2, cy∓h/2）
  pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
    Self::new(cx - width / 2.0, cy - height / 2.0, width, height)
  }

  /// 由任意两个对角点构造
  pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
    let (left, right) = (x1.min(x2), x1.max(x2));
    let (top, bottom) = (y1.min(y2), y1.max(y2));
    Self::new(left, top, right - left, bottom - top)
  }

  pub fn right(&self) -> f32 {
    self.x + self.width
  }

  pub fn bottom(&self) -> f32 {
    self.y + self.height
  }

  pub fn center(&self) -> (f32, f32) {
    (self.x + self.width / 2.0, self.y + self.height / 2.0)
  }

  pub fn area(&self) -> f32 {
    self.width.max(0.0) * self.height.max(0.0)
  }

  pub fn iou(&self, other: &BBox) -> f32 {
    let x1 = self.x.max(other.x);
    let y1 = self.y.max(other.y);
    let x2 = self.right().min(other.right());
    let y2 = self.bottom().min(other.bottom());

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }

  /// 与 `[0, width] × [0, height]` 求交
  pub fn clamp_to(&self, width: f32, height: f32) -> BBox {
    let x1 = self.x.clamp(0.0, width);
    let y1 = self.y.clamp(0.0, height);
    let x2 = self.right().clamp(0.0, width);
    let y2 = self.bottom().clamp(0.0, height);
    BBox::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0))
  }
}

/// 检测结果，创建后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub bbox: BBox,
  pub confidence: f32,
  pub class_id: usize,
  pub label: String,
}

/// 分类结果
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
  pub confidence: f32,
  pub class_id: usize,
  pub label: String,
}

/// 已加载并通过形状校验的模型
pub struct LoadedModel<E> {
  engine: E,
  metadata: ModelMetadata,
  labels: Arc<[String]>,
  output_len: usize,
}

impl<E: Engine> LoadedModel<E> {
  pub fn new(engine: E, metadata: ModelMetadata) -> Result<Self, ModelLoadError> {
    metadata.validate()?;

    let side = metadata.input_side() as usize;
    let input = engine.input_shape();
    let expected_input = [1, side, side, RGB_CHANNELS];
    if input.dims() != expected_input {
      return Err(ModelLoadError::ShapeMismatch {
        tensor: "输入",
        expected: format!("{:?}", expected_input),
        actual: input,
      });
    }

    let output = engine.output_shape();
    if metadata
      .head
      .candidates(&output, metadata.num_classes())
      .is_none()
    {
      return Err(ModelLoadError::ShapeMismatch {
        tensor: "输出",
        expected: metadata.head.describe(metadata.num_classes()),
        actual: output,
      });
    }

    debug!("模型输入形状: {}", input);
    debug!("模型输出形状: {}", output);

    let labels: Arc<[String]> = metadata.names.clone().into();
    Ok(Self {
      output_len: output.elements(),
      engine,
      metadata,
      labels,
    })
  }

  pub fn engine(&self) -> &E {
    &self.engine
  }

  pub fn engine_mut(&mut self) -> &mut E {
    &mut self.engine
  }

  pub fn metadata(&self) -> &ModelMetadata {
    &self.metadata
  }

  pub fn labels(&self) -> &Arc<[String]> {
    &self.labels
  }

  pub fn input_side(&self) -> usize {
    self.metadata.input_side() as usize
  }

  pub fn output_len(&self) -> usize {
    self.output_len
  }

  pub fn head(&self) -> HeadConfig {
    self.metadata.head
  }

  pub fn into_engine(self) -> E {
    self.engine
  }
}

/// 模型来源：`model:///path/to/model.bin?labels=/path/to/metadata.toml`
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSource {
  model_path: String,
  metadata_path: String,
}

impl FromUrlWithScheme for ModelSource {
  const SCHEME: &'static str = "model";
}

impl FromUrl for ModelSource {
  type Error = ModelLoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelLoadError::SchemeMismatch {
        expected: Self::SCHEME.to_string(),
        actual: url.scheme().to_string(),
      });
    }

    let query = crate::input::query_map(url);
    let metadata_path = query
      .get("labels")
      .cloned()
      .ok_or(ModelLoadError::MissingMetadata)?;

    Ok(ModelSource {
      model_path: url.path().to_string(),
      metadata_path,
    })
  }
}

impl ModelSource {
  pub fn new(model_path: impl Into<String>, metadata_path: impl Into<String>) -> Self {
    Self {
      model_path: model_path.into(),
      metadata_path: metadata_path.into(),
    }
  }

  pub fn model_path(&self) -> &str {
    &self.model_path
  }

  pub fn metadata_path(&self) -> &str {
    &self.metadata_path
  }

  pub fn load<L: EngineLoader>(&self, loader: &L) -> Result<LoadedModel<L::Engine>, ModelLoadError> {
    let metadata = ModelMetadata::from_path(&self.metadata_path)?;

    info!("加载模型文件: {}", self.model_path);
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let engine = loader.load(&model_data, &metadata)?;
    let model = LoadedModel::new(engine, metadata)?;
    info!("模型加载完成, 类别数: {}", model.labels().len());
    Ok(model)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct ShapeEngine {
    input: TensorShape,
    output: TensorShape,
  }

  impl Engine for ShapeEngine {
    fn input_shape(&self) -> TensorShape {
      self.input.clone()
    }

    fn output_shape(&self) -> TensorShape {
      self.output.clone()
    }

    fn infer(&mut self, _input: &Tensor, _output: &mut [f32]) -> Result<(), InferenceError> {
      Ok(())
    }
  }

  fn metadata() -> ModelMetadata {
    ModelMetadata::from_toml_str(
      r#"
      imgsz = [320, 240]
      names = ["person", "car"]
      "#,
    )
    .unwrap()
  }

  #[test]
  fn metadata_defaults_and_side() {
    let meta = metadata();
    assert_eq!(meta.input_side(), 320);
    assert_eq!(meta.num_classes(), 2);
    assert_eq!(meta.head, HeadConfig::default());
  }

  #[test]
  fn bundled_coco_metadata() {
    let metadata = ModelMetadata::from_toml_str(include_str!("../configs/coco.toml")).unwrap();
    assert_eq!(metadata.num_classes(), 80);
    assert_eq!(metadata.input_side(), 320);
    assert_eq!(metadata.head, HeadConfig::default());
  }

  #[test]
  fn metadata_without_names_is_rejected() {
    assert!(matches!(
      ModelMetadata::from_toml_str("imgsz = [640, 640]"),
      Err(ModelLoadError::MissingLabels)
    ));
    assert!(matches!(
      ModelMetadata::from_toml_str("names = 3"),
      Err(ModelLoadError::Metadata(_))
    ));
  }

  #[test]
  fn loaded_model_checks_shapes() {
    let good = ShapeEngine {
      input: TensorShape::new(&[1, 320, 320, 3]),
      output: TensorShape::new(&[1, 6, 2100]),
    };
    let model = LoadedModel::new(good, metadata()).unwrap();
    assert_eq!(model.output_len(), 6 * 2100);

    let bad_input = ShapeEngine {
      input: TensorShape::new(&[1, 640, 640, 3]),
      output: TensorShape::new(&[1, 6, 2100]),
    };
    assert!(matches!(
      LoadedModel::new(bad_input, metadata()),
      Err(ModelLoadError::ShapeMismatch { tensor: "输入", .. })
    ));

    let bad_output = ShapeEngine {
      input: TensorShape::new(&[1, 320, 320, 3]),
      output: TensorShape::new(&[1, 85, 2100]),
    };
    assert!(matches!(
      LoadedModel::new(bad_output, metadata()),
      Err(ModelLoadError::ShapeMismatch { tensor: "输出", .. })
    ));
  }

  #[test]
  fn model_source_from_url() {
    let url = Url::parse("model:///models/yolo.bin?labels=/models/meta.toml").unwrap();
    let source = ModelSource::from_url(&url).unwrap();
    assert_eq!(source.model_path(), "/models/yolo.bin");
    assert_eq!(source.metadata_path(), "/models/meta.toml");

    let url = Url::parse("model:///models/yolo.bin").unwrap();
    assert!(matches!(
      ModelSource::from_url(&url),
      Err(ModelLoadError::MissingMetadata)
    ));
    let url = Url::parse("yolo26:///models/yolo.bin?labels=x").unwrap();
    assert!(matches!(
      ModelSource::from_url(&url),
      Err(ModelLoadError::SchemeMismatch { .. })
    ));
  }

  #[test]
  fn bbox_iou() {
    let a = BBox::from_center(0.5, 0.5, 0.2, 0.2);
    assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    let b = BBox::from_center(0.9, 0.9, 0.1, 0.1);
    assert_eq!(a.iou(&b), 0.0);
    let c = BBox::new(0.4, 0.4, 0.1, 0.2);
    assert!((a.iou(&c) - 0.5).abs() < 1e-5);
    assert_eq!(BBox::new(0.0, 0.0, 0.0, 0.0).iou(&BBox::default()), 0.0);
  }

  #[test]
  fn bbox_clamp_intersects() {
    let b = BBox::new(-10.0, 5.0, 30.0, 200.0).clamp_to(100.0, 100.0);
    assert_eq!(b, BBox::new(0.0, 5.0, 20.0, 95.0));
  }
}
