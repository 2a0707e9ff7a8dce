// 该文件是 Wangchuan （望川） 项目的一部分。
// src/remap.rs - 检测框坐标重映射
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

use crate::{
  config::ConfigError,
  model::{BBox, Detection},
  transform::LetterboxTransform,
};

/// 检测框输出到哪个坐标系
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
  /// 源帧像素坐标
  #[default]
  Source,
  /// 归一化源帧坐标
  SourceNormalized,
  /// 转正（按帧元数据旋转并撤销镜像）后的归一化坐标
  Upright,
  /// 预览视图的像素坐标
  Screen { width: f32, height: f32 },
}

impl Target {
  pub fn validate(&self) -> Result<(), ConfigError> {
    match *self {
      Target::Screen { width, height } if !(width > 0.0 && height > 0.0) => {
        Err(ConfigError::InvalidValue("target.width/height"))
      }
      _ => Ok(()),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
  Portrait,
  Landscape,
}

/// 预览视图尺寸
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
  pub width: f32,
  pub height: f32,
}

impl Viewport {
  pub fn new(width: f32, height: f32) -> Self {
    Self { width, height }
  }

  pub fn orientation(&self) -> Orientation {
    if self.height >= self.width {
      Orientation::Portrait
    } else {
      Orientation::Landscape
    }
  }

  /// 预览图像在视图中的位置 `(宽, 高, 左, 上)`
  ///
  /// 竖屏时按视图高度等比缩放并水平居中，横屏时按视图宽度缩放并垂直居中。
  /// 超出视图的部分偏移量为负。
  pub fn preview_rect(&self, aspect: f32) -> (f32, f32, f32, f32) {
    match self.orientation() {
      Orientation::Portrait => {
        let width = self.height * aspect;
        (width, self.height, (self.width - width) / 2.0, 0.0)
      }
      Orientation::Landscape => {
        let height = self.width / aspect;
        (self.width, height, 0.0, (self.height - height) / 2.0)
      }
    }
  }
}

/// 把归一化画布坐标下的检测框映射回目标坐标系
#[derive(Debug, Clone, Copy)]
pub struct Remapper<'a> {
  transform: &'a LetterboxTransform,
}

impl<'a> Remapper<'a> {
  pub fn new(transform: &'a LetterboxTransform) -> Self {
    Self { transform }
  }

  /// 逆变换作用于两个角点，结果为源帧像素坐标
  pub fn to_source(&self, bbox: &BBox) -> BBox {
    let side = self.transform.side() as f32;
    let inverse = self.transform.inverse();
    let (x1, y1) = inverse.apply(bbox.x * side, bbox.y * side);
    let (x2, y2) = inverse.apply(bbox.right() * side, bbox.bottom() * side);
    let (w, h) = self.transform.source_size();
    BBox::from_corners(x1, y1, x2, y2).clamp_to(w as f32, h as f32)
  }

  pub fn to_source_normalized(&self, bbox: &BBox) -> BBox {
    let (w, h) = self.transform.source_size();
    let (w, h) = (w as f32, h as f32);
    let b = self.to_source(bbox);
    BBox::new(b.x / w, b.y / h, b.width / w, b.height / h)
  }

  /// 撤销缩放与偏移得到转正图像坐标，最后做一次镜像翻转
  pub fn to_upright(&self, bbox: &BBox) -> BBox {
    let (x1, y1) = self.transform.canvas_to_upright(bbox.x, bbox.y);
    let (x2, y2) = self
      .transform
      .canvas_to_upright(bbox.right(), bbox.bottom());
    let mut upright = BBox::from_corners(x1, y1, x2, y2);
    if self.transform.mirror() {
      upright.x = 1.0 - upright.x - upright.width;
    }
    upright.clamp_to(1.0, 1.0)
  }

  pub fn to_screen(&self, bbox: &BBox, viewport: &Viewport) -> BBox {
    let upright = self.to_upright(bbox);
    let (uw, uh) = self.transform.upright_size();
    let (pw, ph, left, top) = viewport.preview_rect(uw as f32 / uh as f32);
    BBox::new(
      upright.x * pw + left,
      upright.y * ph + top,
      upright.width * pw,
      upright.height * ph,
    )
    .clamp_to(viewport.width, viewport.height)
  }

  pub fn map(&self, bbox: &BBox, target: &Target) -> BBox {
    match *target {
      Target::Source => self.to_source(bbox),
      Target::SourceNormalized => self.to_source_normalized(bbox),
      Target::Upright => self.to_upright(bbox),
      Target::Screen { width, height } => self.to_screen(bbox, &Viewport::new(width, height)),
    }
  }

  /// 原地改写一组检测结果，只修改框坐标
  pub fn remap(&self, detections: &mut [Detection], target: &Target) {
    for det in detections.iter_mut() {
      det.bbox = self.map(&det.bbox, target);
    }
  }
}
