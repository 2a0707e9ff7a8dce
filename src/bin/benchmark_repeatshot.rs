// 该文件是 Wangchuan （望川） 项目的一部分。
// src/bin/benchmark_repeatshot.rs - 重复推理基准测试
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
  task::{RepeatShotTask, Task},
};

/// 对同一张图像反复检测，输出平均推理耗时
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub common: CommonArgs,

  /// 重复次数
  #[arg(long, value_name = "REPEAT", default_value_t = 1000)]
  pub repeat: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let config = args.common.pipeline_config()?;

  let input = InputWrapper::from_url(&args.common.input)?;
  let model = ModelSource::from_url(&args.common.model)?.load(&ReplayLoader)?;
  let output = SinkWrapper::from_url(&args.common.output)?;

  RepeatShotTask::new(config)
    .with_repeat(args.repeat)
    .run_task(input, model, output)?;

  Ok(())
}
