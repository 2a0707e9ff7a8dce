// 该文件是 Wangchuan （望川） 项目的一部分。
// src/bin/simple_continueshot.rs - 连续帧检测
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

use anyhow::Result;
use clap::Parser;
use tracing::info;

use wangchuan::{
  FromUrl,
  args::CommonArgs,
  input::InputWrapper,
  model::{ModelSource, ReplayLoader},
  output::SinkWrapper,
  task::{ContinuousTask, Task},
};

/// 连续处理相机或视频帧
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub common: CommonArgs,

  /// 处理的最大帧数
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,

  /// 每一帧都等待推理线程接收（不丢帧）
  #[arg(long)]
  pub blocking: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let mut config = args.common.pipeline_config()?;

  let input = InputWrapper::from_url(&args.common.input)?;
  if input.mirror() {
    info!("输入来自前置摄像头, 启用镜像");
    config.mirror = true;
  }
  let model = ModelSource::from_url(&args.common.model)?.load(&ReplayLoader)?;
  let output = SinkWrapper::from_url(&args.common.output)?;

  ContinuousTask::new(config)
    .with_frame_number(args.frame_number)
    .with_blocking(args.blocking)
    .run_task(input, model, output)?;

  Ok(())
}
