// 该文件是 Wangchuan （望川） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::path::Path;

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use super::{query_map, query_mirror, query_rotation};
use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, FrameError, Rotation},
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("查询参数错误: {0}")]
  QueryError(#[from] FrameError),
}

/// 单张图像输入：`image:///path/to/photo.jpg?rotate=90`
///
/// 图像只产生一帧，`rotate` 作为帧的旋转元数据。
pub struct ImageFileInput {
  image: Option<RgbImage>,
  rotation: Rotation,
  mirror: bool,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    let query = query_map(url);
    let mut input = Self::open(url.path())?;
    input.rotation = query_rotation(&query)?;
    input.mirror = query_mirror(&query);
    Ok(input)
  }
}

impl ImageFileInput {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref();
    let image = ImageReader::open(path)?.decode()?.to_rgb8();
    debug!(
      "读取图像 {}: {}x{}",
      path.display(),
      image.width(),
      image.height()
    );
    Ok(Self::from_image(image))
  }

  pub fn from_image(image: RgbImage) -> Self {
    Self {
      image: Some(image),
      rotation: Rotation::Deg0,
      mirror: false,
    }
  }

  pub fn with_rotation(mut self, rotation: Rotation) -> Self {
    self.rotation = rotation;
    self
  }

  pub fn mirror(&self) -> bool {
    self.mirror
  }
}

impl Iterator for ImageFileInput {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    let rotation = self.rotation;
    self
      .image
      .take()
      .map(|image| Frame::from_rgb_image(image).with_rotation(rotation))
  }
}
