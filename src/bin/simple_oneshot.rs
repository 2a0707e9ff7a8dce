// 该文件是 Wangchuan （望川） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像检测
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

use wangchuan::{
  FromUrl,
  args::CommonArgs,
  input::InputWrapper,
  model::{ModelSource, ReplayLoader},
  output::SinkWrapper,
  task::{OneShotTask, Task},
};

/// 对一张图像做一次检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub common: CommonArgs,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let config = args.common.pipeline_config()?;

  let input = InputWrapper::from_url(&args.common.input)?;
  let model = ModelSource::from_url(&args.common.model)?.load(&ReplayLoader)?;
  let output = SinkWrapper::from_url(&args.common.output)?;

  OneShotTask::new(config).run_task(input, model, output)?;

  Ok(())
}
