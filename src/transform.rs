// 该文件是 Wangchuan （望川） 项目的一部分。
// src/transform.rs - 填充裁剪变换
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

//! 源帧像素坐标到模型正方形画布像素坐标的仿射变换。
//!
//! 正向变换依次为：源帧中心平移到原点、按帧元数据顺时针旋转、等比缩放、
//! 平移到画布中心，前置摄像头再叠加一次关于画布中心的水平翻转。
//! 逆变换严格取正向矩阵的逆，坐标重映射也只使用它。

use serde::Deserialize;

use crate::frame::{FrameError, Rotation};

/// 2x3 仿射矩阵 `[a, b, tx, c, d, ty]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
  m: [f32; 6],
}

impl Default for Affine {
  fn default() -> Self {
    Self::IDENTITY
  }
}

impl Affine {
  pub const IDENTITY: Affine = Affine {
    m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
  };

  pub fn new(m: [f32; 6]) -> Self {
    Self { m }
  }

  pub fn translate(tx: f32, ty: f32) -> Self {
    Self::new([1.0, 0.0, tx, 0.0, 1.0, ty])
  }

  pub fn scale(sx: f32, sy: f32) -> Self {
    Self::new([sx, 0.0, 0.0, 0.0, sy, 0.0])
  }

  /// 关于原点的顺时针旋转（y 轴向下），系数取精确整数值
  pub fn rotate(rotation: Rotation) -> Self {
    let (cos, sin) = match rotation {
      Rotation::Deg0 => (1.0, 0.0),
      Rotation::Deg90 => (0.0, 1.0),
      Rotation::Deg180 => (-1.0, 0.0),
      Rotation::Deg270 => (0.0, -1.0),
    };
    Self::new([cos, -sin, 0.0, sin, cos, 0.0])
  }

  /// 先应用 `self`，再应用 `next`
  pub fn then(&self, next: &Affine) -> Affine {
    let [a1, b1, t1, c1, d1, u1] = self.m;
    let [a2, b2, t2, c2, d2, u2] = next.m;
    Affine::new([
      a2 * a1 + b2 * c1,
      a2 * b1 + b2 * d1,
      a2 * t1 + b2 * u1 + t2,
      c2 * a1 + d2 * c1,
      c2 * b1 + d2 * d1,
      c2 * t1 + d2 * u1 + u2,
    ])
  }

  pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
    let [a, b, tx, c, d, ty] = self.m;
    (a * x + b * y + tx, c * x + d * y + ty)
  }

  pub fn invert(&self) -> Option<Affine> {
    let [a, b, tx, c, d, ty] = self.m;
    let det = a * d - b * c;
    // 缩放可以非常小，只排除真正奇异的矩阵
    if det == 0.0 || !det.is_finite() {
      return None;
    }
    let (ia, ib, ic, id) = (d / det, -b / det, -c / det, a / det);
    Some(Affine::new([
      ia,
      ib,
      -(ia * tx + ib * ty),
      ic,
      id,
      -(ic * tx + id * ty),
    ]))
  }

  pub fn coefficients(&self) -> [f32; 6] {
    self.m
  }
}

/// 缩放策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMode {
  /// 取较大的缩放因子，画布被完全覆盖，超出部分裁掉
  #[default]
  Fill,
  /// 取较小的缩放因子，整幅图像可见，空白处填充
  Fit,
}

/// 单帧的填充裁剪变换参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
  src_width: u32,
  src_height: u32,
  side: u32,
  rotation: Rotation,
  mirror: bool,
  mode: ScaleMode,
  scale: f32,
  offset: (f32, f32),
  forward: Affine,
  inverse: Affine,
}

impl LetterboxTransform {
  pub fn new(
    src_width: u32,
    src_height: u32,
    side: u32,
    rotation: Rotation,
    mirror: bool,
    mode: ScaleMode,
  ) -> Result<Self, FrameError> {
    if src_width == 0 || src_height == 0 {
      return Err(FrameError::ZeroDimension {
        width: src_width,
        height: src_height,
      });
    }
    if side == 0 {
      return Err(FrameError::ZeroDimension {
        width: side,
        height: side,
      });
    }

    let (sw, sh) = (src_width as f32, src_height as f32);
    let (uw, uh) = if rotation.is_transposed() {
      (sh, sw)
    } else {
      (sw, sh)
    };
    let side_f = side as f32;
    let (scale_x, scale_y) = (side_f / uw, side_f / uh);
    let scale = match mode {
      ScaleMode::Fill => scale_x.max(scale_y),
      ScaleMode::Fit => scale_x.min(scale_y),
    };
    let half = side_f / 2.0;
    let offset = (half - uw * scale / 2.0, half - uh * scale / 2.0);

    let mut forward = Affine::translate(-sw / 2.0, -sh / 2.0)
      .then(&Affine::rotate(rotation))
      .then(&Affine::scale(scale, scale))
      .then(&Affine::translate(half, half));
    if mirror {
      forward = forward.then(&Affine::new([-1.0, 0.0, side_f, 0.0, 1.0, 0.0]));
    }
    let inverse = forward.invert().ok_or(FrameError::SingularTransform {
      width: src_width,
      height: src_height,
      side,
    })?;

    Ok(Self {
      src_width,
      src_height,
      side,
      rotation,
      mirror,
      mode,
      scale,
      offset,
      forward,
      inverse,
    })
  }

  /// 源帧像素 → 画布像素
  pub fn forward(&self) -> &Affine {
    &self.forward
  }

  /// 画布像素 → 源帧像素
  pub fn inverse(&self) -> &Affine {
    &self.inverse
  }

  pub fn scale(&self) -> f32 {
    self.scale
  }

  /// 转正后的图像左上角落在画布上的像素位置（填充裁剪时为负）
  pub fn offset(&self) -> (f32, f32) {
    self.offset
  }

  pub fn side(&self) -> u32 {
    self.side
  }

  pub fn source_size(&self) -> (u32, u32) {
    (self.src_width, self.src_height)
  }

  /// 旋转后的图像尺寸
  pub fn upright_size(&self) -> (u32, u32) {
    if self.rotation.is_transposed() {
      (self.src_height, self.src_width)
    } else {
      (self.src_width, self.src_height)
    }
  }

  pub fn rotation(&self) -> Rotation {
    self.rotation
  }

  pub fn mirror(&self) -> bool {
    self.mirror
  }

  pub fn mode(&self) -> ScaleMode {
    self.mode
  }

  /// 归一化画布坐标 → 归一化转正图像坐标，不处理镜像
  pub fn canvas_to_upright(&self, x: f32, y: f32) -> (f32, f32) {
    let (uw, uh) = self.upright_size();
    let side = self.side as f32;
    (
      (x * side - self.offset.0) / (self.scale * uw as f32),
      (y * side - self.offset.1) / (self.scale * uh as f32),
    )
  }

  /// 归一化转正图像坐标 → 归一化画布坐标，不处理镜像
  pub fn upright_to_canvas(&self, x: f32, y: f32) -> (f32, f32) {
    let (uw, uh) = self.upright_size();
    let side = self.side as f32;
    (
      (x * self.scale * uw as f32 + self.offset.0) / side,
      (y * self.scale * uh as f32 + self.offset.1) / side,
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const EPS: f32 = 1e-3;

  fn close(a: (f32, f32), b: (f32, f32)) -> bool {
    (a.0 - b.0).abs() < EPS && (a.1 - b.1).abs() < EPS
  }

  #[test]
  fn same_size_without_rotation_is_identity() {
    let t = LetterboxTransform::new(320, 320, 320, Rotation::Deg0, false, ScaleMode::Fill).unwrap();
    assert!(close(t.forward().apply(10.0, 20.0), (10.0, 20.0)));
    assert_eq!(t.offset(), (0.0, 0.0));
  }

  #[test]
  fn fill_takes_larger_scale_and_fit_smaller() {
    let fill =
      LetterboxTransform::new(640, 480, 320, Rotation::Deg0, false, ScaleMode::Fill).unwrap();
    let fit = LetterboxTransform::new(640, 480, 320, Rotation::Deg0, false, ScaleMode::Fit).unwrap();
    assert!((fill.scale() - 320.0 / 480.0).abs() < 1e-6);
    assert!((fit.scale() - 0.5).abs() < 1e-6);
    // 填充裁剪时画布四角都来自源帧内部
    for (x, y) in [(0.0, 0.0), (320.0, 0.0), (0.0, 320.0), (320.0, 320.0)] {
      let (sx, sy) = fill.inverse().apply(x, y);
      assert!((-EPS..=640.0 + EPS).contains(&sx));
      assert!((-EPS..=480.0 + EPS).contains(&sy));
    }
    assert!(close(fit.offset(), (0.0, 40.0)));
  }

  #[test]
  fn tiny_scale_still_has_exact_inverse() {
    let t = LetterboxTransform::new(8000, 8000, 2, Rotation::Deg0, false, ScaleMode::Fill).unwrap();
    for (x, y) in [(4000.0, 4000.0), (0.0, 0.0), (8000.0, 2000.0)] {
      let (cx, cy) = t.forward().apply(x, y);
      let (sx, sy) = t.inverse().apply(cx, cy);
      assert!((sx - x).abs() < 0.5 && (sy - y).abs() < 0.5, "({}, {})", sx, sy);
    }
  }

  #[test]
  fn singular_matrix_has_no_inverse() {
    assert!(Affine::scale(0.0, 1.0).invert().is_none());
    assert!(Affine::scale(f32::INFINITY, 1.0).invert().is_none());
    assert!(Affine::scale(1e-4, 1e-4).invert().is_some());
  }

  #[test]
  fn quarter_turn_moves_top_left_to_top_right() {
    let t = LetterboxTransform::new(640, 480, 320, Rotation::Deg90, false, ScaleMode::Fill).unwrap();
    assert_eq!(t.upright_size(), (480, 640));
    let (x, y) = t.forward().apply(0.0, 0.0);
    assert!((x - 320.0).abs() < EPS);
    assert!((y - (160.0 - 640.0 * t.scale() / 2.0)).abs() < EPS);
  }

  #[test]
  fn mirror_flips_about_canvas_center() {
    let plain =
      LetterboxTransform::new(640, 480, 320, Rotation::Deg0, false, ScaleMode::Fill).unwrap();
    let mirrored =
      LetterboxTransform::new(640, 480, 320, Rotation::Deg0, true, ScaleMode::Fill).unwrap();
    let (px, py) = plain.forward().apply(100.0, 50.0);
    let (mx, my) = mirrored.forward().apply(100.0, 50.0);
    assert!((px + mx - 320.0).abs() < EPS);
    assert!((py - my).abs() < EPS);
  }

  #[test]
  fn inverse_round_trips_every_orientation() {
    for rotation in Rotation::ALL {
      for mirror in [false, true] {
        let t = LetterboxTransform::new(1280, 720, 640, rotation, mirror, ScaleMode::Fill).unwrap();
        for p in [(0.0, 0.0), (640.0, 360.0), (1000.5, 12.25)] {
          let (cx, cy) = t.forward().apply(p.0, p.1);
          let back = t.inverse().apply(cx, cy);
          assert!(close(back, p), "{:?} {} {:?} -> {:?}", rotation, mirror, p, back);
        }
      }
    }
  }

  #[test]
  fn upright_mapping_is_centered() {
    let t = LetterboxTransform::new(640, 480, 320, Rotation::Deg270, false, ScaleMode::Fill).unwrap();
    assert!(close(t.canvas_to_upright(0.5, 0.5), (0.5, 0.5)));
    let (u, v) = t.canvas_to_upright(0.1, 0.9);
    assert!(close(t.upright_to_canvas(u, v), (0.1, 0.9)));
  }

  #[test]
  fn rejects_zero_sizes() {
    assert!(LetterboxTransform::new(0, 10, 320, Rotation::Deg0, false, ScaleMode::Fill).is_err());
    assert!(LetterboxTransform::new(10, 10, 0, Rotation::Deg0, false, ScaleMode::Fill).is_err());
  }
}
