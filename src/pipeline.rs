// 该文件是 Wangchuan （望川） 项目的一部分。
// src/pipeline.rs - 推理调用与结果分发
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

//! 单工作线程的检测管线。
//!
//! 相机线程通过 [`Pipeline::submit`] 投递帧。投递通道没有缓冲：工作线程
//! 空闲时帧被立即接收，忙碌时帧被直接丢弃并释放，任何时刻最多只有一帧在处理。
//! 推理引擎放在互斥锁中，工作线程与 [`Pipeline::detect_image`] 都在锁内调用它。

use std::{
  sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::{
  config::{ConfigError, PipelineConfig, SharedThresholds, Thresholds, WorkerConfig},
  encode::{TensorEncoder, convert_to_rgb},
  frame::{Frame, FrameError},
  model::{
    Classification, Decoder, Detection, Engine, EngineLoader, HeadConfig, InferenceError,
    LoadedModel, ModelLoadError, ModelSource,
  },
  pool::{BufferPool, Tensor},
  remap::{Remapper, Target},
  transform::{LetterboxTransform, ScaleMode},
};

const WORKER_NAME: &str = "wangchuan-infer";
const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("帧转换错误: {0}")]
  Frame(#[from] FrameError),
  #[error("推理错误: {0}")]
  Inference(#[from] InferenceError),
  #[error("模型加载错误: {0}")]
  ModelLoad(#[from] ModelLoadError),
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("无法启动推理线程: {0}")]
  Spawn(std::io::Error),
  #[error("模型未加载")]
  NotLoaded,
  #[error("管线已关闭")]
  Closed,
}

/// 单帧处理结果
#[derive(Debug, Clone, PartialEq)]
pub struct FrameResult {
  pub detections: Vec<Detection>,
  /// 分类模型的结果，检测模型时为空
  pub classifications: Vec<Classification>,
  /// 推理调用耗时（毫秒）
  pub inference_ms: f64,
  pub timestamp: Duration,
  pub frame_size: (u32, u32),
}

/// 结果回调，在工作线程上调用
pub trait ResultSink: Send {
  fn on_result(&mut self, result: &FrameResult);

  fn on_fps(&mut self, _fps: f32) {}

  /// 连续 `failures` 次推理失败
  fn on_degraded(&mut self, _failures: usize, _error: &InferenceError) {}
}

impl<S: ResultSink + ?Sized> ResultSink for Box<S> {
  fn on_result(&mut self, result: &FrameResult) {
    (**self).on_result(result)
  }

  fn on_fps(&mut self, fps: f32) {
    (**self).on_fps(fps)
  }

  fn on_degraded(&mut self, failures: usize, error: &InferenceError) {
    (**self).on_degraded(failures, error)
  }
}

/// 丢弃所有结果
impl ResultSink for () {
  fn on_result(&mut self, _result: &FrameResult) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
  Accepted,
  /// 工作线程忙，帧已释放
  Dropped,
  /// 管线已关闭，帧已释放
  Closed,
}

#[derive(Debug, Default)]
pub struct Stats {
  submitted: AtomicU64,
  accepted: AtomicU64,
  dropped_busy: AtomicU64,
  skipped_unloaded: AtomicU64,
  skipped_paused: AtomicU64,
  conversion_failures: AtomicU64,
  inference_failures: AtomicU64,
  processed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
  pub submitted: u64,
  pub accepted: u64,
  pub dropped_busy: u64,
  pub skipped_unloaded: u64,
  pub skipped_paused: u64,
  pub conversion_failures: u64,
  pub inference_failures: u64,
  pub processed: u64,
}

fn bump(counter: &AtomicU64) {
  counter.fetch_add(1, Ordering::Relaxed);
}

impl Stats {
  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      submitted: self.submitted.load(Ordering::Relaxed),
      accepted: self.accepted.load(Ordering::Relaxed),
      dropped_busy: self.dropped_busy.load(Ordering::Relaxed),
      skipped_unloaded: self.skipped_unloaded.load(Ordering::Relaxed),
      skipped_paused: self.skipped_paused.load(Ordering::Relaxed),
      conversion_failures: self.conversion_failures.load(Ordering::Relaxed),
      inference_failures: self.inference_failures.load(Ordering::Relaxed),
      processed: self.processed.load(Ordering::Relaxed),
    }
  }
}

/// 帧率统计：窗口结束时才给出一个值
#[derive(Debug)]
pub struct FpsMeter {
  window: Duration,
  start: Instant,
  count: u32,
}

impl FpsMeter {
  pub fn new(window: Duration, now: Instant) -> Self {
    Self {
      window,
      start: now,
      count: 0,
    }
  }

  pub fn tick(&mut self, now: Instant) -> Option<f32> {
    self.count += 1;
    let elapsed = now.saturating_duration_since(self.start);
    if elapsed <= self.window {
      return None;
    }
    let fps = self.count as f32 / elapsed.as_secs_f32();
    self.start = now;
    self.count = 0;
    Some(fps)
  }
}

struct Shared<E> {
  model: Mutex<Option<LoadedModel<E>>>,
  paused: AtomicBool,
  thresholds: SharedThresholds,
  stats: Stats,
}

impl<E> Shared<E> {
  fn model(&self) -> MutexGuard<'_, Option<LoadedModel<E>>> {
    self.model.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

type Decoded = (Vec<Detection>, Vec<Classification>);

/// 按检测头格式解码，检测框映射到目标坐标系
fn decode_output(
  decoder: &mut Decoder,
  output: &[f32],
  head: &HeadConfig,
  labels: &[String],
  thresholds: &Thresholds,
  transform: &LetterboxTransform,
  target: &Target,
) -> Result<Decoded, InferenceError> {
  if head.is_classification() {
    let classifications = decoder.classify(output, head, labels, thresholds)?;
    return Ok((Vec::new(), classifications));
  }
  let mut detections = decoder.decode(output, head, labels, thresholds)?;
  Remapper::new(transform).remap(&mut detections, target);
  Ok((detections, Vec::new()))
}

struct Worker<E, S> {
  receiver: Receiver<Frame>,
  shared: Arc<Shared<E>>,
  sink: S,
  encoder: TensorEncoder,
  pool: BufferPool,
  tensor: Tensor,
  output: Vec<f32>,
  decoder: Decoder,
  fps: FpsMeter,
  target: Target,
  config: WorkerConfig,
  consecutive_failures: usize,
}

enum Outcome {
  Done(FrameResult),
  Unloaded,
  Failed(InferenceError),
}

impl<E: Engine, S: ResultSink> Worker<E, S> {
  fn run(mut self) {
    info!("推理线程启动");
    while let Ok(frame) = self.receiver.recv() {
      self.process(frame);
    }
    info!("推理线程退出");
  }

  fn process(&mut self, frame: Frame) {
    if self.shared.paused.load(Ordering::SeqCst) {
      bump(&self.shared.stats.skipped_paused);
      trace!("检测已暂停, 跳过帧 {:?}", frame.timestamp());
      return;
    }

    let thresholds = self.shared.thresholds.snapshot();
    let mirror = self.shared.thresholds.mirror();
    let (width, height) = (frame.width(), frame.height());
    let rotation = frame.rotation();
    let timestamp = frame.timestamp();

    let Some(slot) = self.pool.acquire(frame.rgb_len()) else {
      warn!("像素缓冲池已满, 丢弃帧");
      return;
    };
    let converted = convert_to_rgb(&frame, self.pool.buffer_mut(slot));
    // 转换完成后帧就可以交还给相机
    drop(frame);
    if let Err(e) = converted {
      bump(&self.shared.stats.conversion_failures);
      warn!("帧转换失败: {}", e);
      self.pool.release(slot);
      return;
    }

    let outcome = {
      let mut guard = self.shared.model();
      match guard.as_mut() {
        None => Outcome::Unloaded,
        Some(model) => {
          let side = model.input_side();
          self.tensor.reshape(side);
          self.output.resize(model.output_len(), 0.0);
          let transform =
            LetterboxTransform::new(width, height, side as u32, rotation, mirror, ScaleMode::Fill);
          let encoded = transform.and_then(|transform| {
            self
              .encoder
              .encode(self.pool.buffer(slot), width, height, &transform, &mut self.tensor)
              .map(|_| transform)
          });
          match encoded {
            Err(e) => {
              bump(&self.shared.stats.conversion_failures);
              warn!("张量编码失败: {}", e);
              self.pool.release(slot);
              return;
            }
            Ok(transform) => {
              let start = Instant::now();
              let inferred = model.engine_mut().infer(&self.tensor, &mut self.output);
              let inference_ms = start.elapsed().as_secs_f64() * 1000.0;
              let head = model.head();
              let labels = model.labels().clone();
              drop(guard);

              match inferred.and_then(|_| {
                decode_output(
                  &mut self.decoder,
                  &self.output,
                  &head,
                  &labels,
                  &thresholds,
                  &transform,
                  &self.target,
                )
              }) {
                Err(e) => Outcome::Failed(e),
                Ok((detections, classifications)) => {
                  Outcome::Done(FrameResult {
                    detections,
                    classifications,
                    inference_ms,
                    timestamp,
                    frame_size: (width, height),
                  })
                }
              }
            }
          }
        }
      }
    };
    self.pool.release(slot);

    match outcome {
      Outcome::Unloaded => {
        bump(&self.shared.stats.skipped_unloaded);
        trace!("模型未加载, 跳过帧");
      }
      Outcome::Failed(e) => {
        bump(&self.shared.stats.inference_failures);
        self.consecutive_failures += 1;
        warn!("推理失败 (连续 {} 次): {}", self.consecutive_failures, e);
        if self.consecutive_failures == self.config.degraded_after {
          error!("连续 {} 次推理失败, 管线降级", self.consecutive_failures);
          self.sink.on_degraded(self.consecutive_failures, &e);
        }
      }
      Outcome::Done(result) => {
        if self.consecutive_failures >= self.config.degraded_after {
          info!("推理恢复");
        }
        self.consecutive_failures = 0;
        bump(&self.shared.stats.processed);
        debug!(
          "推理耗时 {:.2} ms, 检测到 {} 个目标",
          result.inference_ms,
          result.detections.len()
        );
        if let Some(fps) = self.fps.tick(Instant::now()) {
          debug!("FPS: {:.1}", fps);
          self.sink.on_fps(fps);
        }
        self.sink.on_result(&result);
      }
    }
  }
}

/// 检测管线
pub struct Pipeline<E: Engine + 'static> {
  shared: Arc<Shared<E>>,
  sender: Option<Sender<Frame>>,
  worker: Option<JoinHandle<()>>,
  encoder: TensorEncoder,
}

impl<E: Engine + 'static> Pipeline<E> {
  pub fn spawn<S: ResultSink + 'static>(
    model: LoadedModel<E>,
    config: PipelineConfig,
    sink: S,
  ) -> Result<Self, PipelineError> {
    config.validate()?;

    let thresholds = SharedThresholds::new(config.thresholds);
    thresholds.set_mirror(config.mirror);
    let side = model.input_side();
    let output_len = model.output_len();
    let shared = Arc::new(Shared {
      model: Mutex::new(Some(model)),
      paused: AtomicBool::new(false),
      thresholds,
      stats: Stats::default(),
    });

    let (sender, receiver) = bounded::<Frame>(0);
    let worker = Worker {
      receiver,
      shared: shared.clone(),
      sink,
      encoder: TensorEncoder::new(config.encoder),
      pool: BufferPool::new(config.worker.pool_slots, config.worker.pool_capacity),
      tensor: Tensor::new(side, RGB_CHANNELS),
      output: vec![0.0; output_len],
      decoder: Decoder::new(),
      fps: FpsMeter::new(
        Duration::from_millis(config.worker.fps_window_ms),
        Instant::now(),
      ),
      target: config.target,
      config: config.worker,
      consecutive_failures: 0,
    };
    let handle = thread::Builder::new()
      .name(WORKER_NAME.to_string())
      .spawn(move || worker.run())
      .map_err(PipelineError::Spawn)?;

    info!("检测管线启动, 模型输入边长 {}", side);
    Ok(Self {
      shared,
      sender: Some(sender),
      worker: Some(handle),
      encoder: TensorEncoder::new(config.encoder),
    })
  }

  /// 非阻塞投递，工作线程忙时帧被丢弃
  pub fn submit(&self, frame: Frame) -> Submission {
    let stats = &self.shared.stats;
    bump(&stats.submitted);
    let Some(sender) = self.sender.as_ref() else {
      return Submission::Closed;
    };
    match sender.try_send(frame) {
      Ok(()) => {
        bump(&stats.accepted);
        Submission::Accepted
      }
      Err(TrySendError::Full(frame)) => {
        bump(&stats.dropped_busy);
        trace!("推理线程忙, 丢弃帧 {:?}", frame.timestamp());
        Submission::Dropped
      }
      Err(TrySendError::Disconnected(_)) => {
        warn!("推理线程已退出, 丢弃帧");
        Submission::Closed
      }
    }
  }

  /// 阻塞投递，直到工作线程接收该帧
  pub fn feed(&self, frame: Frame) -> Result<(), PipelineError> {
    bump(&self.shared.stats.submitted);
    let sender = self.sender.as_ref().ok_or(PipelineError::Closed)?;
    sender.send(frame).map_err(|_| PipelineError::Closed)?;
    bump(&self.shared.stats.accepted);
    Ok(())
  }

  pub fn thresholds(&self) -> &SharedThresholds {
    &self.shared.thresholds
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.shared.stats.snapshot()
  }

  pub fn is_loaded(&self) -> bool {
    self.shared.model().is_some()
  }

  /// 替换模型，等待正在进行的推理结束后才释放旧模型
  pub fn reload(&self, model: LoadedModel<E>) {
    let side = model.input_side();
    let previous = self.shared.model().replace(model);
    if previous.is_some() {
      info!("模型已替换, 新的输入边长 {}", side);
    } else {
      info!("模型已加载, 输入边长 {}", side);
    }
  }

  /// 从来源加载并替换模型，失败时保留当前模型
  pub fn reload_from<L>(&self, source: &ModelSource, loader: &L) -> Result<(), PipelineError>
  where
    L: EngineLoader<Engine = E>,
  {
    let model = source.load(loader)?;
    self.reload(model);
    Ok(())
  }

  /// 卸载模型，之后接收到的帧都被跳过
  pub fn unload(&self) -> Option<LoadedModel<E>> {
    let previous = self.shared.model().take();
    if previous.is_some() {
      info!("模型已卸载");
    }
    previous
  }

  /// 暂停检测：帧照常被接收并立即释放，模型保持加载
  pub fn pause(&self) {
    if !self.shared.paused.swap(true, Ordering::SeqCst) {
      info!("检测已暂停");
    }
  }

  pub fn resume(&self) {
    if self.shared.paused.swap(false, Ordering::SeqCst) {
      info!("检测已恢复");
    }
  }

  pub fn is_paused(&self) -> bool {
    self.shared.paused.load(Ordering::SeqCst)
  }

  /// 当前模型的输出头格式，未加载时为 `None`
  pub fn head(&self) -> Option<HeadConfig> {
    self.shared.model().as_ref().map(LoadedModel::head)
  }

  /// 在调用线程上同步检测一张静态图像
  ///
  /// 图像整幅缩放进画布（不裁剪、不镜像），结果为图像像素坐标。
  pub fn detect_image(&self, frame: &Frame) -> Result<FrameResult, PipelineError> {
    self.run_image(frame, false)
  }

  /// 在调用线程上同步对一张静态图像分类，要求模型为分类头
  pub fn classify_image(&self, frame: &Frame) -> Result<FrameResult, PipelineError> {
    self.run_image(frame, true)
  }

  /// 按当前模型的输出头检测或分类
  pub fn process_image(&self, frame: &Frame) -> Result<FrameResult, PipelineError> {
    let classification = self
      .head()
      .ok_or(PipelineError::NotLoaded)?
      .is_classification();
    self.run_image(frame, classification)
  }

  fn run_image(&self, frame: &Frame, classification: bool) -> Result<FrameResult, PipelineError> {
    let mut raster = vec![0u8; frame.rgb_len()];
    convert_to_rgb(frame, &mut raster)?;
    let thresholds = self.shared.thresholds.snapshot();

    let mut guard = self.shared.model();
    let model = guard.as_mut().ok_or(PipelineError::NotLoaded)?;
    let head = model.head();
    if head.is_classification() != classification {
      return Err(
        InferenceError::WrongHead {
          task: if classification { "分类" } else { "检测" },
          actual: head.layout,
        }
        .into(),
      );
    }
    let side = model.input_side();
    let transform = LetterboxTransform::new(
      frame.width(),
      frame.height(),
      side as u32,
      frame.rotation(),
      false,
      ScaleMode::Fit,
    )?;
    let mut tensor = Tensor::new(side, RGB_CHANNELS);
    self
      .encoder
      .encode(&raster, frame.width(), frame.height(), &transform, &mut tensor)?;

    let mut output = vec![0.0; model.output_len()];
    let start = Instant::now();
    model.engine_mut().infer(&tensor, &mut output)?;
    let inference_ms = start.elapsed().as_secs_f64() * 1000.0;
    let labels = model.labels().clone();
    drop(guard);

    let (detections, classifications) = decode_output(
      &mut Decoder::new(),
      &output,
      &head,
      &labels,
      &thresholds,
      &transform,
      &Target::Source,
    )?;
    debug!(
      "静态图像推理耗时 {:.2} ms, {} 个目标, {} 个分类",
      inference_ms,
      detections.len(),
      classifications.len()
    );

    Ok(FrameResult {
      detections,
      classifications,
      inference_ms,
      timestamp: frame.timestamp(),
      frame_size: (frame.width(), frame.height()),
    })
  }

  /// 关闭投递通道并等待工作线程退出，返回最终的统计
  pub fn shutdown(mut self) -> StatsSnapshot {
    self.close();
    self.stats()
  }

  fn close(&mut self) {
    if let Some(sender) = self.sender.take() {
      drop(sender);
    }
    if let Some(handle) = self.worker.take() {
      if handle.join().is_err() {
        error!("推理线程异常退出");
      }
      info!("检测管线已关闭");
    }
  }
}

impl<E: Engine + 'static> Drop for Pipeline<E> {
  fn drop(&mut self) {
    self.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fps_only_reported_after_window() {
    let start = Instant::now();
    let mut meter = FpsMeter::new(Duration::from_millis(1000), start);
    for i in 1..=9 {
      assert!(meter.tick(start + Duration::from_millis(i * 100)).is_none());
    }
    // 恰好 1000 ms 还不算窗口结束
    assert!(meter.tick(start + Duration::from_millis(1000)).is_none());
    let fps = meter.tick(start + Duration::from_millis(1100)).unwrap();
    assert!((fps - 10.0).abs() < 1e-3);

    assert!(meter.tick(start + Duration::from_millis(1500)).is_none());
  }

  #[test]
  fn stats_snapshot_reads_counters() {
    let stats = Stats::default();
    bump(&stats.submitted);
    bump(&stats.submitted);
    bump(&stats.dropped_busy);
    let snap = stats.snapshot();
    assert_eq!(snap.submitted, 2);
    assert_eq!(snap.dropped_busy, 1);
    assert_eq!(snap.processed, 0);
  }
}
