// 该文件是 Wangchuan （望川） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 相机输入
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

//! # GStreamer 相机输入
//!
//! 相机或视频文件经 `videoconvert` 统一转换为 I420 后交给 appsink，
//! 每个样本按 `VideoInfo` 中的偏移和行步长拆成三个平面，
//! 旋转角度不在管道里处理，而是作为帧元数据交给填充裁剪变换。
//!
//! ```text
//! gst://camera/dev/video0?width=1280&height=720&fps=30&rotate=90&mirror=true
//! gst://file/path/to/video.mp4?rotate=0
//! ```
//!
//! appsink 只保留最新的一个样本，来不及处理的帧在管道中就被丢弃。
//!
//! 使用前需要安装 GStreamer 开发库，并启用 `gstreamer_input` 特性。

use std::{collections::HashMap, time::Duration};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use super::{query_map, query_mirror, query_rotation};
use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, FrameError, PixelFormat, Plane, Rotation, chroma_size},
};

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 操作失败: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("找不到 appsink 元素")]
  AppSinkNotFound,
  #[error("无法转换为 appsink")]
  AppSinkConversionFailed,
  #[error("无法从 caps 获取视频信息")]
  VideoInfoError,
  #[error("不支持的视频格式: {0:?}")]
  UnsupportedFormat(gst_video::VideoFormat),
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("状态切换错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("查询参数错误: {0}")]
  QueryError(#[from] FrameError),
}

const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const DEFAULT_FPS: u32 = 30;

enum PipelineItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    width: u32,
    height: u32,
    fps: u32,
  },
  TargetFormat,
}

impl PipelineItem {
  fn to_pipeline(&self) -> String {
    match self {
      PipelineItem::FileSource(path) => {
        format!("filesrc location={} ! decodebin", path)
      }
      PipelineItem::CameraSource {
        camera,
        io_mode,
        width,
        height,
        fps,
      } => {
        let io_mode_str = if let Some(mode) = io_mode {
          format!(" io-mode={}", mode)
        } else {
          "".to_string()
        };
        format!(
          "v4l2src device={}{} ! video/x-raw,width={},height={},framerate={}/1",
          camera, io_mode_str, width, height, fps
        )
      }
      PipelineItem::TargetFormat => "videoconvert ! video/x-raw,format=I420".to_string(),
    }
  }
}

/// GStreamer 输入管道构建器
pub struct GStreamerInputPipelineBuilder {
  items: Vec<PipelineItem>,
  rotation: Rotation,
  mirror: bool,
}

impl GStreamerInputPipelineBuilder {
  pub fn camera(device: &str, width: u32, height: u32, fps: u32) -> Self {
    Self {
      items: vec![PipelineItem::CameraSource {
        camera: device.to_string(),
        io_mode: None,
        width,
        height,
        fps,
      }],
      rotation: Rotation::Deg0,
      mirror: false,
    }
  }

  pub fn file(path: &str) -> Self {
    Self {
      items: vec![PipelineItem::FileSource(path.to_string())],
      rotation: Rotation::Deg0,
      mirror: false,
    }
  }

  pub fn rotation(mut self, rotation: Rotation) -> Self {
    self.rotation = rotation;
    self
  }

  pub fn mirror(mut self, mirror: bool) -> Self {
    self.mirror = mirror;
    self
  }

  fn camera_from_query(path: &str, query: &HashMap<String, String>) -> Self {
    let parse = |key: &str, default: u32| {
      query
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
    };
    let mut builder = Self::camera(
      path,
      parse("width", DEFAULT_WIDTH),
      parse("height", DEFAULT_HEIGHT),
      parse("fps", DEFAULT_FPS),
    );
    if let Some(PipelineItem::CameraSource { io_mode, .. }) = builder.items.first_mut() {
      *io_mode = query.get("io-mode").and_then(|v| v.parse::<u32>().ok());
    }
    builder
  }

  pub fn build(mut self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    self.items.push(PipelineItem::TargetFormat);
    let basic_pipeline = self
      .items
      .iter()
      .map(PipelineItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    let full_pipeline = format!(
      "{} ! appsink max-buffers=1 drop=true name=sink",
      basic_pipeline
    );

    info!("GStreamer 管道: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("无法创建管道".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerInput {
      pipeline,
      appsink,
      rotation: self.rotation,
      mirror: self.mirror,
    })
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query = query_map(url);
    let builder = match url.host_str() {
      Some("camera") => Self::camera_from_query(url.path(), &query),
      Some("file") => Self::file(url.path()),
      _ => {
        return Err(GStreamerInputError::SchemeMismatch);
      }
    };

    Ok(
      builder
        .rotation(query_rotation(&query)?)
        .mirror(query_mirror(&query)),
    )
  }
}

/// GStreamer 帧输入，迭代产生 I420 帧
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  rotation: Rotation,
  mirror: bool,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 管道失败: {}", e);
    }
  }
}

impl GStreamerInput {
  pub fn mirror(&self) -> bool {
    self.mirror
  }

  fn pull_sample(&self) -> Option<gst::Sample> {
    self
      .appsink
      .pull_sample()
      .map_err(|e| {
        // 流结束时同样返回错误
        info!("appsink 没有更多样本: {}", e);
        e
      })
      .ok()
  }
}

impl Iterator for GStreamerInput {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      let sample = self.pull_sample()?;
      match convert_sample(&sample) {
        Ok(frame) => return Some(frame.with_rotation(self.rotation)),
        Err(e) => error!("无法转换样本: {}", e),
      }
    }
  }
}

fn convert_sample(sample: &gst::Sample) -> Result<Frame, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有缓冲区".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有 caps".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;
  if video_info.format() != gst_video::VideoFormat::I420 {
    return Err(GStreamerInputError::UnsupportedFormat(video_info.format()));
  }

  let width = video_info.width();
  let height = video_info.height();
  let (_, chroma_height) = chroma_size(width as usize, height as usize);

  let map = buffer
    .map_readable()
    .map_err(|e| GStreamerInputError::PipelineError(format!("无法映射缓冲区: {}", e)))?;
  let data = map.as_slice();

  let offsets = video_info.offset();
  let strides = video_info.stride();
  let mut planes = Vec::with_capacity(3);
  for (index, rows) in [height as usize, chroma_height, chroma_height]
    .into_iter()
    .enumerate()
  {
    let offset = offsets[index];
    let stride = strides[index].unsigned_abs() as usize;
    let end = offset + stride * rows;
    if data.len() < end {
      return Err(GStreamerInputError::BufferSizeMismatch {
        expected: end,
        actual: data.len(),
      });
    }
    planes.push(Plane::new(data[offset..end].to_vec(), stride, 1));
  }

  let timestamp = buffer
    .pts()
    .map(|pts| Duration::from_nanos(pts.nseconds()))
    .unwrap_or_default();

  Ok(Frame::new(PixelFormat::Yuv420, width, height, planes).with_timestamp(timestamp))
}
