// 该文件是 Wangchuan （望川） 项目的一部分。
// src/task.rs - 推理任务
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

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::Duration,
};

use tracing::{info, warn};

use crate::{
  config::PipelineConfig,
  frame::Frame,
  model::{Engine, LoadedModel},
  pipeline::{Pipeline, ResultSink, Submission},
};

pub trait Task<I, E: Engine + 'static, S: ResultSink + 'static>: Sized {
  type Error;
  fn run_task(self, input: I, model: LoadedModel<E>, sink: S) -> Result<(), Self::Error>;
}

/// 单张图像检测或分类，取决于模型的输出头
#[derive(Default, Debug)]
pub struct OneShotTask {
  config: PipelineConfig,
}

impl OneShotTask {
  pub fn new(config: PipelineConfig) -> Self {
    Self { config }
  }
}

impl<I, E, S> Task<I, E, S> for OneShotTask
where
  I: Iterator<Item = Frame>,
  E: Engine + 'static,
  S: ResultSink + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: LoadedModel<E>, mut sink: S) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!("输入帧获取成功, 开始推理...");
    let pipeline = Pipeline::spawn(model, self.config, ())?;
    let result = pipeline.process_image(&frame)?;
    info!("推理完成, 耗时: {:.2} ms", result.inference_ms);
    sink.on_result(&result);
    pipeline.shutdown();

    Ok(())
  }
}

/// 对同一张图像反复检测，统计平均推理时间
#[derive(Debug)]
pub struct RepeatShotTask {
  config: PipelineConfig,
  repeat: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self {
      config: PipelineConfig::default(),
      repeat: 1000,
    }
  }
}

impl RepeatShotTask {
  pub fn new(config: PipelineConfig) -> Self {
    Self {
      config,
      ..Self::default()
    }
  }

  pub fn with_repeat(mut self, repeat: usize) -> Self {
    self.repeat = repeat.max(3);
    self
  }
}

impl<I, E, S> Task<I, E, S> for RepeatShotTask
where
  I: Iterator<Item = Frame>,
  E: Engine + 'static,
  S: ResultSink + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: LoadedModel<E>, mut sink: S) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!("输入帧获取成功, 开始推理...");
    let pipeline = Pipeline::spawn(model, self.config, ())?;

    let mut times = Vec::with_capacity(self.repeat);
    for i in 0..self.repeat {
      let result = pipeline.process_image(&frame)?;
      info!("({})推理完成, 耗时: {:.2} ms", i, result.inference_ms);
      sink.on_result(&result);
      times.push(result.inference_ms);
    }
    pipeline.shutdown();

    // 前两次通常包含预热开销
    let warm = &times[2.min(times.len())..];
    if !warm.is_empty() {
      warn!(
        "平均推理时间: {:.3} ms",
        warm.iter().sum::<f64>() / warm.len() as f64
      );
    }

    Ok(())
  }
}

/// 连续处理帧流，直到输入结束、达到指定帧数或收到中断信号
#[derive(Default, Debug)]
pub struct ContinuousTask {
  config: PipelineConfig,
  frame_number: Option<usize>,
  blocking: bool,
}

impl ContinuousTask {
  pub fn new(config: PipelineConfig) -> Self {
    Self {
      config,
      ..Self::default()
    }
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 阻塞投递：每一帧都等待推理线程接收，适用于文件等离线来源
  pub fn with_blocking(mut self, blocking: bool) -> Self {
    self.blocking = blocking;
    self
  }
}

impl<I, E, S> Task<I, E, S> for ContinuousTask
where
  I: Iterator<Item = Frame>,
  E: Engine + 'static,
  S: ResultSink + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: LoadedModel<E>, sink: S) -> Result<(), Self::Error> {
    info!("开始任务...");
    let interrupted = Arc::new(AtomicBool::new(false));
    let handler = {
      let interrupted = interrupted.clone();
      ctrlc::set_handler(move || {
        info!("收到中断信号, 准备退出...");
        interrupted.store(true, Ordering::SeqCst);
        thread::spawn(|| {
          thread::sleep(Duration::from_secs(30));
          warn!("强制退出程序");
          std::process::exit(1);
        });
      })
    };
    // 同一进程只能注册一次
    if let Err(e) = handler {
      warn!("无法设置中断处理: {}", e);
    }

    let pipeline = Pipeline::spawn(model, self.config, sink)?;

    let mut frame_index = 0;
    for frame in input {
      frame_index += 1;
      if self.blocking {
        pipeline.feed(frame)?;
      } else if pipeline.submit(frame) == Submission::Closed {
        warn!("管线已关闭, 退出任务循环");
        break;
      }
      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if interrupted.load(Ordering::SeqCst) {
        warn!("中断信号接收, 退出任务循环");
        break;
      }
    }

    let stats = pipeline.shutdown();
    info!(
      "任务完成: 投递 {} 帧, 处理 {} 帧, 忙时丢弃 {} 帧, 暂停跳过 {} 帧, 转换失败 {} 帧, 推理失败 {} 帧",
      stats.submitted,
      stats.processed,
      stats.dropped_busy,
      stats.skipped_paused,
      stats.conversion_failures,
      stats.inference_failures
    );
    Ok(())
  }
}
