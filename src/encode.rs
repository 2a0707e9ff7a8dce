// 该文件是 Wangchuan （望川） 项目的一部分。
// src/encode.rs - 张量编码
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
  frame::{Frame, FrameError, PixelFormat},
  pool::Tensor,
  transform::LetterboxTransform,
};

const RGB_CHANNELS: usize = 3;

/// 像素归一化方式，必须与模型训练时一致
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Normalization {
  /// `v / 127.5 - 1`
  #[default]
  MinusOneToOne,
  /// `v / 255`
  ZeroToOne,
  /// `(v / 255 - mean) / std`
  MeanStd { mean: [f32; 3], std: [f32; 3] },
}

impl Normalization {
  pub fn apply(&self, channel: usize, value: u8) -> f32 {
    self.apply_f32(channel, value as f32)
  }

  fn apply_f32(&self, channel: usize, v: f32) -> f32 {
    match self {
      Normalization::MinusOneToOne => v / 127.5 - 1.0,
      Normalization::ZeroToOne => v / 255.0,
      Normalization::MeanStd { mean, std } => (v / 255.0 - mean[channel]) / std[channel],
    }
  }
}

/// 采样方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
  Nearest,
  #[default]
  Bilinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
  pub normalization: Normalization,
  pub sampling: Sampling,
  /// 画布上落在源帧之外的像素取值
  pub pad_value: [u8; 3],
}

impl Default for EncoderConfig {
  fn default() -> Self {
    Self {
      normalization: Normalization::default(),
      sampling: Sampling::default(),
      pad_value: [114, 114, 114],
    }
  }
}

#[inline]
fn clamp_u8(v: f32) -> u8 {
  v.round().clamp(0.0, 255.0) as u8
}

/// 全范围 BT.601（JFIF）YCbCr → RGB
#[inline]
pub fn yuv_to_rgb_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
  let y = y as f32;
  let u = u as f32 - 128.0;
  let v = v as f32 - 128.0;
  [
    clamp_u8(y + 1.402 * v),
    clamp_u8(y - 0.344_136 * u - 0.714_136 * v),
    clamp_u8(y + 1.772 * u),
  ]
}

/// 把帧直接转换为交错 RGB，写入 `out`（长度必须为 `frame.rgb_len()`）
pub fn convert_to_rgb(frame: &Frame, out: &mut [u8]) -> Result<(), FrameError> {
  frame.validate()?;
  let expected = frame.rgb_len();
  if out.len() != expected {
    return Err(FrameError::OutputSizeMismatch {
      expected,
      actual: out.len(),
    });
  }

  let (width, height) = (frame.width() as usize, frame.height() as usize);
  let planes = frame.planes();

  match frame.format() {
    PixelFormat::Rgb8 => {
      let plane = &planes[0];
      for row in 0..height {
        let dst = &mut out[row * width * RGB_CHANNELS..(row + 1) * width * RGB_CHANNELS];
        if plane.pixel_stride == RGB_CHANNELS {
          let start = row * plane.row_stride;
          dst.copy_from_slice(&plane.data[start..start + width * RGB_CHANNELS]);
        } else {
          for col in 0..width {
            let src = row * plane.row_stride + col * plane.pixel_stride;
            dst[col * RGB_CHANNELS..(col + 1) * RGB_CHANNELS]
              .copy_from_slice(&plane.data[src..src + RGB_CHANNELS]);
          }
        }
      }
    }
    format => {
      let luma = &planes[0];
      let chroma = &planes[1..];
      for row in 0..height {
        let crow = row / 2;
        for col in 0..width {
          let ccol = col / 2;
          let y = luma.data[row * luma.row_stride + col * luma.pixel_stride];
          let (u, v) = match format {
            PixelFormat::Nv21 => {
              let idx = crow * chroma[0].row_stride + ccol * chroma[0].pixel_stride;
              (chroma[0].data[idx + 1], chroma[0].data[idx])
            }
            PixelFormat::Nv12 => {
              let idx = crow * chroma[0].row_stride + ccol * chroma[0].pixel_stride;
              (chroma[0].data[idx], chroma[0].data[idx + 1])
            }
            _ => (
              chroma[0].data[crow * chroma[0].row_stride + ccol * chroma[0].pixel_stride],
              chroma[1].data[crow * chroma[1].row_stride + ccol * chroma[1].pixel_stride],
            ),
          };
          let idx = (row * width + col) * RGB_CHANNELS;
          out[idx..idx + RGB_CHANNELS].copy_from_slice(&yuv_to_rgb_pixel(y, u, v));
        }
      }
    }
  }

  Ok(())
}

/// 张量编码器
///
/// 对画布的每个像素，用逆变换找到源帧中的位置并采样，归一化后写入 NHWC 张量。
#[derive(Debug, Clone, Default)]
pub struct TensorEncoder {
  config: EncoderConfig,
}

impl TensorEncoder {
  pub fn new(config: EncoderConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &EncoderConfig {
    &self.config
  }

  pub fn encode(
    &self,
    raster: &[u8],
    width: u32,
    height: u32,
    transform: &LetterboxTransform,
    tensor: &mut Tensor,
  ) -> Result<(), FrameError> {
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 {
      return Err(FrameError::ZeroDimension { width, height });
    }
    if raster.len() < w * h * RGB_CHANNELS {
      return Err(FrameError::BufferTooShort {
        plane: 0,
        expected: w * h * RGB_CHANNELS,
        actual: raster.len(),
      });
    }

    let side = tensor.side();
    let channels = tensor.channels().min(RGB_CHANNELS);
    let norm = self.config.normalization;
    let pad: [f32; 3] = std::array::from_fn(|c| norm.apply(c, self.config.pad_value[c]));
    let [a, _, _, c, _, _] = transform.inverse().coefficients();
    let (wf, hf) = (w as f32, h as f32);
    let stride = tensor.channels();
    let data = tensor.as_mut_slice();

    for row in 0..side {
      // 像素中心映射回源帧，每列按矩阵第一列递增
      let (mut sx, mut sy) = transform.inverse().apply(0.5, row as f32 + 0.5);
      for col in 0..side {
        let dst = &mut data[(row * side + col) * stride..(row * side + col + 1) * stride];
        if sx < 0.0 || sy < 0.0 || sx >= wf || sy >= hf {
          dst[..channels].copy_from_slice(&pad[..channels]);
        } else {
          match self.config.sampling {
            Sampling::Nearest => {
              let idx = ((sy as usize) * w + sx as usize) * RGB_CHANNELS;
              for ch in 0..channels {
                dst[ch] = norm.apply(ch, raster[idx + ch]);
              }
            }
            Sampling::Bilinear => {
              let fx = (sx - 0.5).clamp(0.0, wf - 1.0);
              let fy = (sy - 0.5).clamp(0.0, hf - 1.0);
              let (x0, y0) = (fx as usize, fy as usize);
              let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
              let (tx, ty) = (fx - x0 as f32, fy - y0 as f32);
              for ch in 0..channels {
                let p = |x: usize, y: usize| raster[(y * w + x) * RGB_CHANNELS + ch] as f32;
                let top = p(x0, y0) * (1.0 - tx) + p(x1, y0) * tx;
                let bottom = p(x0, y1) * (1.0 - tx) + p(x1, y1) * tx;
                dst[ch] = norm.apply_f32(ch, top * (1.0 - ty) + bottom * ty);
              }
            }
          }
        }
        sx += a;
        sy += c;
      }
    }

    Ok(())
  }
}
