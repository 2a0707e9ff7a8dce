// 该文件是 Wangchuan （望川） 项目的一部分。
// src/frame.rs - 相机帧定义
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

use std::time::Duration;

use thiserror::Error;

const RGB_CHANNELS: usize = 3;

/// 帧转换错误
///
/// 单帧错误只会导致该帧被丢弃，管线继续处理后续帧。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
  #[error("帧尺寸无效: {width}x{height}")]
  ZeroDimension { width: u32, height: u32 },
  #[error("旋转角度必须是 90 的倍数, 实际为 {0}")]
  InvalidRotation(i32),
  #[error("无法解析旋转角度: {0}")]
  UnparsableRotation(String),
  #[error("像素格式 {format:?} 需要 {expected} 个平面, 实际为 {actual}")]
  PlaneCount {
    format: PixelFormat,
    expected: usize,
    actual: usize,
  },
  #[error("平面 {plane} 缓冲区过短: 期望至少 {expected} 字节, 实际 {actual} 字节")]
  BufferTooShort {
    plane: usize,
    expected: usize,
    actual: usize,
  },
  #[error("平面 {plane} 步长无效: 行步长 {row_stride}, 像素步长 {pixel_stride}")]
  InvalidStride {
    plane: usize,
    row_stride: usize,
    pixel_stride: usize,
  },
  #[error("{width}x{height} 到边长 {side} 的变换不可逆")]
  SingularTransform { width: u32, height: u32, side: u32 },
  #[error("输出缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  OutputSizeMismatch { expected: usize, actual: usize },
}

/// 顺时针旋转角度，把传感器图像转正所需的旋转
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Rotation {
  #[default]
  Deg0,
  Deg90,
  Deg180,
  Deg270,
}

impl Rotation {
  pub const ALL: [Rotation; 4] = [
    Rotation::Deg0,
    Rotation::Deg90,
    Rotation::Deg180,
    Rotation::Deg270,
  ];

  /// 接受任意 90 的倍数（包括负数和超过 360 的角度）
  pub fn from_degrees(degrees: i32) -> Result<Self, FrameError> {
    if degrees % 90 != 0 {
      return Err(FrameError::InvalidRotation(degrees));
    }
    Ok(match degrees.rem_euclid(360) {
      0 => Rotation::Deg0,
      90 => Rotation::Deg90,
      180 => Rotation::Deg180,
      _ => Rotation::Deg270,
    })
  }

  pub fn degrees(self) -> i32 {
    self.quarter_turns() as i32 * 90
  }

  pub fn quarter_turns(self) -> u8 {
    match self {
      Rotation::Deg0 => 0,
      Rotation::Deg90 => 1,
      Rotation::Deg180 => 2,
      Rotation::Deg270 => 3,
    }
  }

  /// 旋转后宽高是否互换
  pub fn is_transposed(self) -> bool {
    matches!(self, Rotation::Deg90 | Rotation::Deg270)
  }
}

/// 帧像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
  /// 三平面 4:2:0，平面可带行步长和像素步长（I420 或 Android YUV_420_888）
  Yuv420,
  /// 亮度平面 + VU 交错色度平面
  Nv21,
  /// 亮度平面 + UV 交错色度平面
  Nv12,
  /// 单平面交错 RGB
  Rgb8,
}

impl PixelFormat {
  pub fn plane_count(self) -> usize {
    match self {
      PixelFormat::Yuv420 => 3,
      PixelFormat::Nv21 | PixelFormat::Nv12 => 2,
      PixelFormat::Rgb8 => 1,
    }
  }
}

/// 图像平面
#[derive(Debug, Clone)]
pub struct Plane {
  pub data: Vec<u8>,
  pub row_stride: usize,
  pub pixel_stride: usize,
}

impl Plane {
  pub fn new(data: Vec<u8>, row_stride: usize, pixel_stride: usize) -> Self {
    Self {
      data,
      row_stride,
      pixel_stride,
    }
  }

  /// 紧密排列的平面
  pub fn packed(data: Vec<u8>, width: usize, pixel_stride: usize) -> Self {
    Self::new(data, width * pixel_stride, pixel_stride)
  }

  fn check(
    &self,
    index: usize,
    width: usize,
    height: usize,
    bytes_per_pixel: usize,
  ) -> Result<(), FrameError> {
    let row_bytes = (width - 1) * self.pixel_stride + bytes_per_pixel;
    if self.pixel_stride == 0 || self.row_stride < row_bytes {
      return Err(FrameError::InvalidStride {
        plane: index,
        row_stride: self.row_stride,
        pixel_stride: self.pixel_stride,
      });
    }
    let expected = (height - 1) * self.row_stride + row_bytes;
    if self.data.len() < expected {
      return Err(FrameError::BufferTooShort {
        plane: index,
        expected,
        actual: self.data.len(),
      });
    }
    Ok(())
  }
}

/// 相机帧
///
/// 帧在一个处理周期内被管线独占，周期结束（包括被丢弃、转换失败）时
/// 通过 `Drop` 调用释放回调，把底层资源交还给相机，且只调用一次。
pub struct Frame {
  format: PixelFormat,
  width: u32,
  height: u32,
  rotation: Rotation,
  timestamp: Duration,
  planes: Vec<Plane>,
  release: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for Frame {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Frame")
      .field("format", &self.format)
      .field("width", &self.width)
      .field("height", &self.height)
      .field("rotation", &self.rotation)
      .field("timestamp", &self.timestamp)
      .field("planes", &self.planes.len())
      .finish()
  }
}

impl Drop for Frame {
  fn drop(&mut self) {
    if let Some(release) = self.release.take() {
      release();
    }
  }
}

impl Frame {
  pub fn new(format: PixelFormat, width: u32, height: u32, planes: Vec<Plane>) -> Self {
    Self {
      format,
      width,
      height,
      rotation: Rotation::Deg0,
      timestamp: Duration::ZERO,
      planes,
      release: None,
    }
  }

  /// 紧密排列的 I420 数据（Y、U、V 依次排列）
  pub fn i420(width: u32, height: u32, mut data: Vec<u8>) -> Self {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = chroma_size(w, h);
    let y_len = (w * h).min(data.len());
    let mut rest = data.split_off(y_len);
    let u_len = (cw * ch).min(rest.len());
    let v = rest.split_off(u_len);
    Self::new(
      PixelFormat::Yuv420,
      width,
      height,
      vec![
        Plane::packed(data, w, 1),
        Plane::packed(rest, cw, 1),
        Plane::packed(v, cw, 1),
      ],
    )
  }

  /// 紧密排列的 NV21 数据（Y 之后是 VU 交错）
  pub fn nv21(width: u32, height: u32, data: Vec<u8>) -> Self {
    Self::semi_planar(PixelFormat::Nv21, width, height, data)
  }

  /// 紧密排列的 NV12 数据（Y 之后是 UV 交错）
  pub fn nv12(width: u32, height: u32, data: Vec<u8>) -> Self {
    Self::semi_planar(PixelFormat::Nv12, width, height, data)
  }

  fn semi_planar(format: PixelFormat, width: u32, height: u32, mut data: Vec<u8>) -> Self {
    let (w, h) = (width as usize, height as usize);
    let (cw, _) = chroma_size(w, h);
    let y_len = (w * h).min(data.len());
    let chroma = data.split_off(y_len);
    Self::new(
      format,
      width,
      height,
      vec![
        Plane::packed(data, w, 1),
        Plane::new(chroma, cw * 2, 2),
      ],
    )
  }

  /// 紧密排列的交错 RGB 数据
  pub fn rgb8(width: u32, height: u32, data: Vec<u8>) -> Self {
    Self::new(
      PixelFormat::Rgb8,
      width,
      height,
      vec![Plane::packed(data, width as usize, RGB_CHANNELS)],
    )
  }

  #[cfg(feature = "read_image_file")]
  pub fn from_rgb_image(image: image::RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self::rgb8(width, height, image.into_raw())
  }

  pub fn with_rotation(mut self, rotation: Rotation) -> Self {
    self.rotation = rotation;
    self
  }

  pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
    self.timestamp = timestamp;
    self
  }

  /// 设置释放回调，帧被丢弃时调用一次
  pub fn on_release<F: FnOnce() + Send + 'static>(mut self, release: F) -> Self {
    self.release = Some(Box::new(release));
    self
  }

  pub fn format(&self) -> PixelFormat {
    self.format
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn rotation(&self) -> Rotation {
    self.rotation
  }

  pub fn timestamp(&self) -> Duration {
    self.timestamp
  }

  pub fn planes(&self) -> &[Plane] {
    &self.planes
  }

  /// 转换为交错 RGB 后所需的字节数
  pub fn rgb_len(&self) -> usize {
    self.width as usize * self.height as usize * RGB_CHANNELS
  }

  /// 检查尺寸、平面数量和每个平面的缓冲区大小
  pub fn validate(&self) -> Result<(), FrameError> {
    if self.width == 0 || self.height == 0 {
      return Err(FrameError::ZeroDimension {
        width: self.width,
        height: self.height,
      });
    }

    let expected = self.format.plane_count();
    if self.planes.len() < expected {
      return Err(FrameError::PlaneCount {
        format: self.format,
        expected,
        actual: self.planes.len(),
      });
    }

    let (w, h) = (self.width as usize, self.height as usize);
    let (cw, ch) = chroma_size(w, h);
    match self.format {
      PixelFormat::Yuv420 => {
        self.planes[0].check(0, w, h, 1)?;
        self.planes[1].check(1, cw, ch, 1)?;
        self.planes[2].check(2, cw, ch, 1)?;
      }
      PixelFormat::Nv21 | PixelFormat::Nv12 => {
        self.planes[0].check(0, w, h, 1)?;
        self.planes[1].check(1, cw, ch, 2)?;
      }
      PixelFormat::Rgb8 => {
        self.planes[0].check(0, w, h, RGB_CHANNELS)?;
      }
    }
    Ok(())
  }
}

/// 4:2:0 色度平面尺寸（奇数边向上取整）
pub fn chroma_size(width: usize, height: usize) -> (usize, usize) {
  (width.div_ceil(2), height.div_ceil(2))
}
