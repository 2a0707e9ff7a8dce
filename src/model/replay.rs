// 该文件是 Wangchuan （望川） 项目的一部分。
// src/model/replay.rs - 回放录制输出的推理引擎
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

//! 把一段录制下来的原始输出张量（小端 f32）当作“模型”加载，
//! 每次推理都原样返回。用于在没有加速器的机器上跑通整条管线。

use tracing::debug;

use super::{Engine, EngineLoader, InferenceError, ModelLoadError, ModelMetadata, TensorShape};
use crate::pool::Tensor;

pub struct ReplayEngine {
  input: TensorShape,
  output: TensorShape,
  data: Box<[f32]>,
}

impl ReplayEngine {
  pub fn new(side: usize, output: TensorShape, data: Vec<f32>) -> Result<Self, ModelLoadError> {
    if output.elements() != data.len() {
      return Err(ModelLoadError::Engine(format!(
        "录制数据长度 {} 与输出形状 {} 不符",
        data.len(),
        output
      )));
    }
    Ok(Self {
      input: TensorShape::new(&[1, side, side, 3]),
      output,
      data: data.into_boxed_slice(),
    })
  }
}

impl Engine for ReplayEngine {
  fn input_shape(&self) -> TensorShape {
    self.input.clone()
  }

  fn output_shape(&self) -> TensorShape {
    self.output.clone()
  }

  fn infer(&mut self, input: &Tensor, output: &mut [f32]) -> Result<(), InferenceError> {
    let expected = self.input.elements();
    if input.len() != expected {
      return Err(InferenceError::Engine(format!(
        "输入长度 {} 与模型输入 {} 不符",
        input.len(),
        self.input
      )));
    }
    if output.len() != self.data.len() {
      return Err(InferenceError::OutputLength {
        expected: self.data.len(),
        actual: output.len(),
      });
    }
    output.copy_from_slice(&self.data);
    Ok(())
  }
}

/// 从字节加载 [`ReplayEngine`]，输出形状由元数据中的检测头格式推出
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayLoader;

impl EngineLoader for ReplayLoader {
  type Engine = ReplayEngine;

  fn load(&self, model: &[u8], metadata: &ModelMetadata) -> Result<ReplayEngine, ModelLoadError> {
    if model.len() % 4 != 0 {
      return Err(ModelLoadError::Engine(format!(
        "录制数据长度 {} 不是 4 的整数倍",
        model.len()
      )));
    }
    let data: Vec<f32> = model
      .chunks_exact(4)
      .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
      .collect();

    let width = metadata.head.row_width(metadata.num_classes());
    if data.is_empty() || data.len() % width != 0 {
      return Err(ModelLoadError::Engine(format!(
        "录制数据 {} 个元素无法按行宽 {} 整除",
        data.len(),
        width
      )));
    }
    let rows = data.len() / width;
    let output = if metadata.head.is_classification() {
      TensorShape::new(&[1, data.len()])
    } else if metadata.head.transposed {
      TensorShape::new(&[1, width, rows])
    } else {
      TensorShape::new(&[1, rows, width])
    };
    debug!("回放引擎输出形状: {}", output);

    ReplayEngine::new(metadata.input_side() as usize, output, data)
  }
}
