// 该文件是 Wangchuan （望川） 项目的一部分。
// src/input.rs - 相机帧输入
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

use std::collections::HashMap;

use thiserror::Error;

use crate::{
  FromUrl,
  frame::{Frame, FrameError, Rotation},
};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder,
};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("不支持的输入方案: {0}")]
  SchemeMismatch(String),
}

/// 解析 URL 查询参数
pub(crate) fn query_map(url: &url::Url) -> HashMap<String, String> {
  url
    .query_pairs()
    .map(|(k, v)| (String::from(k), String::from(v)))
    .collect()
}

/// 查询参数中的 `rotate`，缺省为 0 度
pub(crate) fn query_rotation(query: &HashMap<String, String>) -> Result<Rotation, FrameError> {
  match query.get("rotate") {
    None => Ok(Rotation::Deg0),
    Some(value) => {
      let degrees = value
        .parse::<i32>()
        .map_err(|_| FrameError::UnparsableRotation(value.clone()))?;
      Rotation::from_degrees(degrees)
    }
  }
}

/// 查询参数中的 `mirror`
pub(crate) fn query_mirror(query: &HashMap<String, String>) -> bool {
  matches!(
    query.get("mirror").map(String::as_str),
    Some("1") | Some("true") | Some("yes")
  )
}

pub enum InputWrapper {
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInput),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerInputPipelineBuilder::SCHEME {
        let input = GStreamerInputPipelineBuilder::from_url(url)?.build()?;
        return Ok(InputWrapper::GStreamerInput(input));
      }
    }
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl InputWrapper {
  /// 输入是否来自前置（镜像）摄像头
  pub fn mirror(&self) -> bool {
    // 不启用任何输入特性时枚举没有变体，按值匹配才能写出空的 match
    match *self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(ref input) => input.mirror(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(ref input) => input.mirror(),
    }
  }
}

impl Iterator for InputWrapper {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    match *self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(ref mut input) => input.next(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(ref mut input) => input.next(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rotation_and_mirror_from_query() {
    let url = url::Url::parse("image:///tmp/a.png?rotate=270&mirror=true").unwrap();
    let query = query_map(&url);
    assert_eq!(query_rotation(&query).unwrap(), Rotation::Deg270);
    assert!(query_mirror(&query));

    let url = url::Url::parse("image:///tmp/a.png?rotate=45").unwrap();
    assert!(query_rotation(&query_map(&url)).is_err());
    let url = url::Url::parse("image:///tmp/a.png").unwrap();
    let query = query_map(&url);
    assert_eq!(query_rotation(&query).unwrap(), Rotation::Deg0);
    assert!(!query_mirror(&query));
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = url::Url::parse("rtsp://camera/stream").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch(_))
    ));
  }

  #[cfg(feature = "read_image_file")]
  #[test]
  fn wrapper_forwards_mirror_and_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("front.png");
    image::RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]))
      .save(&path)
      .unwrap();

    let url = url::Url::parse(&format!("image://{}?mirror=1", path.display())).unwrap();
    let mut input = InputWrapper::from_url(&url).unwrap();
    assert!(input.mirror());
    assert_eq!(input.next().map(|frame| frame.width()), Some(4));
    assert!(input.next().is_none());
  }
}
