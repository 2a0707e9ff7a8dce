// 该文件是 Wangchuan （望川） 项目的一部分。
// src/model/decode.rs - 检测输出解码
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

use serde::Deserialize;

use super::{BBox, Classification, Detection, InferenceError, TensorShape};
use crate::config::Thresholds;

/// 每行候选框的得分排布
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadLayout {
  /// `cx, cy, w, h, s_0 .. s_{C-1}`，置信度为最大类别得分
  #[default]
  ClassScores,
  /// `cx, cy, w, h, obj, s_0 .. s_{C-1}`，置信度为 `obj × 最大类别得分`
  Objectness,
  /// 整幅图像分类，输出 `[1, C]`
  Classification,
}

/// 检测头输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
  pub layout: HeadLayout,
  /// 输出为 `[1, 行宽, N]`（按属性存放）而不是 `[1, N, 行宽]`
  pub transposed: bool,
}

impl Default for HeadConfig {
  fn default() -> Self {
    Self {
      layout: HeadLayout::ClassScores,
      transposed: true,
    }
  }
}

impl HeadConfig {
  pub fn row_width(&self, num_classes: usize) -> usize {
    match self.layout {
      HeadLayout::ClassScores => 4 + num_classes,
      HeadLayout::Objectness => 5 + num_classes,
      HeadLayout::Classification => num_classes,
    }
  }

  fn score_offset(&self) -> usize {
    match self.layout {
      HeadLayout::ClassScores => 4,
      HeadLayout::Objectness => 5,
      HeadLayout::Classification => 0,
    }
  }

  pub fn is_classification(&self) -> bool {
    self.layout == HeadLayout::Classification
  }

  /// 输出形状与本格式匹配时返回候选框数，分类头恒为 1
  pub fn candidates(&self, shape: &TensorShape, num_classes: usize) -> Option<usize> {
    let width = self.row_width(num_classes);
    if self.is_classification() {
      return match *shape.squeezed() {
        [c] if c == width => Some(1),
        _ => None,
      };
    }
    match *shape.squeezed() {
      [c, n] if self.transposed && c == width => Some(n),
      [n, c] if !self.transposed && c == width => Some(n),
      _ => None,
    }
  }

  pub fn describe(&self, num_classes: usize) -> String {
    let width = self.row_width(num_classes);
    if self.is_classification() {
      format!("[1, {}]", width)
    } else if self.transposed {
      format!("[1, {}, N]", width)
    } else {
      format!("[1, N, {}]", width)
    }
  }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
  bbox: BBox,
  score: f32,
  class_id: usize,
  index: usize,
}

/// 可复用的解码器，内部缓冲在帧之间保留
#[derive(Debug, Default)]
pub struct Decoder {
  candidates: Vec<Candidate>,
  suppressed: Vec<bool>,
  kept: Vec<usize>,
}

impl Decoder {
  pub fn new() -> Self {
    Self::default()
  }

  /// 置信度过滤、逐类别非极大值抑制、全局取前 K 个
  ///
  /// 输出坐标为归一化画布坐标，按置信度降序排列，置信度相同时按原始行号升序。
  pub fn decode(
    &mut self,
    output: &[f32],
    head: &HeadConfig,
    labels: &[String],
    thresholds: &Thresholds,
  ) -> Result<Vec<Detection>, InferenceError> {
    if head.is_classification() {
      return Err(InferenceError::WrongHead {
        task: "检测",
        actual: head.layout,
      });
    }
    let Self {
      candidates,
      suppressed,
      kept,
    } = self;

    let num_classes = labels.len();
    let width = head.row_width(num_classes);
    if output.len() % width != 0 {
      return Err(InferenceError::MalformedOutput {
        len: output.len(),
        row_width: width,
      });
    }
    let rows = output.len() / width;
    let at = |row: usize, attr: usize| {
      if head.transposed {
        output[attr * rows + row]
      } else {
        output[row * width + attr]
      }
    };

    candidates.clear();
    let offset = head.score_offset();
    for index in 0..rows {
      let (mut best, mut class_id) = (f32::NEG_INFINITY, 0);
      for class in 0..num_classes {
        let score = at(index, offset + class);
        if score > best {
          best = score;
          class_id = class;
        }
      }
      let score = match head.layout {
        HeadLayout::ClassScores => best,
        HeadLayout::Objectness => at(index, 4) * best,
        // 分类头已在函数开头被拒绝
        HeadLayout::Classification => unreachable!(),
      };
      // NaN 也在这里被过滤
      if !(score >= thresholds.confidence) {
        continue;
      }
      candidates.push(Candidate {
        bbox: BBox::from_center(at(index, 0), at(index, 1), at(index, 2), at(index, 3)),
        score,
        class_id,
        index,
      });
    }

    candidates.sort_unstable_by(|a, b| {
      a.class_id
        .cmp(&b.class_id)
        .then(b.score.total_cmp(&a.score))
        .then(a.index.cmp(&b.index))
    });

    let total = candidates.len();
    suppressed.clear();
    suppressed.resize(total, false);
    kept.clear();

    let mut start = 0;
    while start < total {
      let class_id = candidates[start].class_id;
      let end = candidates[start..]
        .iter()
        .position(|c| c.class_id != class_id)
        .map_or(total, |len| start + len);
      for i in start..end {
        if suppressed[i] {
          continue;
        }
        kept.push(i);
        for j in (i + 1)..end {
          if !suppressed[j] && candidates[i].bbox.iou(&candidates[j].bbox) > thresholds.iou {
            suppressed[j] = true;
          }
        }
      }
      start = end;
    }

    kept.sort_unstable_by(|&a, &b| {
      let (a, b) = (&candidates[a], &candidates[b]);
      b.score.total_cmp(&a.score).then(a.index.cmp(&b.index))
    });
    kept.truncate(thresholds.max_items);

    Ok(
      kept
        .iter()
        .map(|&i| {
          let candidate = &candidates[i];
          Detection {
            bbox: candidate.bbox,
            confidence: candidate.score,
            class_id: candidate.class_id,
            label: labels[candidate.class_id].clone(),
          }
        })
        .collect(),
    )
  }

  /// 分类头：置信度过滤后按得分降序取前 K 个，得分相同时类别编号小的在前
  pub fn classify(
    &mut self,
    output: &[f32],
    head: &HeadConfig,
    labels: &[String],
    thresholds: &Thresholds,
  ) -> Result<Vec<Classification>, InferenceError> {
    if !head.is_classification() {
      return Err(InferenceError::WrongHead {
        task: "分类",
        actual: head.layout,
      });
    }
    if output.len() != labels.len() {
      return Err(InferenceError::MalformedOutput {
        len: output.len(),
        row_width: labels.len(),
      });
    }

    let kept = &mut self.kept;
    kept.clear();
    kept.extend((0..output.len()).filter(|&i| output[i] >= thresholds.confidence));
    kept.sort_unstable_by(|&a, &b| output[b].total_cmp(&output[a]).then(a.cmp(&b)));
    kept.truncate(thresholds.max_items);

    Ok(
      kept
        .iter()
        .map(|&i| Classification {
          confidence: output[i],
          class_id: i,
          label: labels[i].clone(),
        })
        .collect(),
    )
  }
}

/// 使用一次性解码器解码
pub fn decode(
  output: &[f32],
  head: &HeadConfig,
  labels: &[String],
  thresholds: &Thresholds,
) -> Result<Vec<Detection>, InferenceError> {
  Decoder::new().decode(output, head, labels, thresholds)
}

/// 使用一次性解码器分类
pub fn classify(
  output: &[f32],
  head: &HeadConfig,
  labels: &[String],
  thresholds: &Thresholds,
) -> Result<Vec<Classification>, InferenceError> {
  Decoder::new().classify(output, head, labels, thresholds)
}
