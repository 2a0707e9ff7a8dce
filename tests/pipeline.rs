// 该文件是 Wangchuan （望川） 项目的一部分。
// tests/pipeline.rs - 检测管线集成测试
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
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, unbounded};

use wangchuan::{
  config::PipelineConfig,
  frame::{Frame, PixelFormat},
  model::{
    Engine, HeadLayout, InferenceError, LoadedModel, ModelMetadata, ModelSource, ReplayEngine,
    ReplayLoader, TensorShape,
  },
  pipeline::{FrameResult, Pipeline, PipelineError, ResultSink, Submission},
  pool::Tensor,
  remap::Target,
};

const SIDE: usize = 64;

fn metadata() -> ModelMetadata {
  ModelMetadata::from_toml_str("imgsz = [64, 64]\nnames = [\"person\", \"car\"]\n").unwrap()
}

/// 按 `[1, 6, N]` 排布的输出：`cx, cy, w, h, s_person, s_car`
fn transposed(rows: &[[f32; 6]]) -> Vec<f32> {
  let mut data = vec![0.0; rows.len() * 6];
  for (i, row) in rows.iter().enumerate() {
    for (attr, value) in row.iter().enumerate() {
      data[attr * rows.len() + i] = *value;
    }
  }
  data
}

fn gray_frame(width: u32, height: u32) -> Frame {
  Frame::rgb8(width, height, vec![128; (width * height * 3) as usize])
}

fn counted_frame(counter: &Arc<AtomicUsize>) -> Frame {
  let counter = counter.clone();
  gray_frame(SIDE as u32, SIDE as u32).on_release(move || {
    counter.fetch_add(1, Ordering::SeqCst);
  })
}

fn wait_for<F: Fn() -> bool>(condition: F) {
  let deadline = Instant::now() + Duration::from_secs(5);
  while !condition() {
    assert!(Instant::now() < deadline, "等待超时");
    thread::sleep(Duration::from_millis(1));
  }
}

/// 输出固定内容的引擎，可以选择让推理失败、变慢，或在推理中等待放行
struct FakeEngine {
  data: Vec<f32>,
  fail: Arc<AtomicBool>,
  delay: Duration,
  in_flight: Arc<AtomicBool>,
  overlaps: Arc<AtomicUsize>,
  calls: Arc<AtomicUsize>,
  gate: Option<(Sender<()>, Receiver<()>)>,
}

impl FakeEngine {
  fn new(rows: &[[f32; 6]]) -> Self {
    Self {
      data: transposed(rows),
      fail: Arc::new(AtomicBool::new(false)),
      delay: Duration::ZERO,
      in_flight: Arc::new(AtomicBool::new(false)),
      overlaps: Arc::new(AtomicUsize::new(0)),
      calls: Arc::new(AtomicUsize::new(0)),
      gate: None,
    }
  }

  fn load(self) -> LoadedModel<FakeEngine> {
    LoadedModel::new(self, metadata()).unwrap()
  }
}

impl Engine for FakeEngine {
  fn input_shape(&self) -> TensorShape {
    TensorShape::new(&[1, SIDE, SIDE, 3])
  }

  fn output_shape(&self) -> TensorShape {
    TensorShape::new(&[1, 6, self.data.len() / 6])
  }

  fn infer(&mut self, input: &Tensor, output: &mut [f32]) -> Result<(), InferenceError> {
    assert_eq!(input.len(), SIDE * SIDE * 3);
    if self.in_flight.swap(true, Ordering::SeqCst) {
      self.overlaps.fetch_add(1, Ordering::SeqCst);
    }
    self.calls.fetch_add(1, Ordering::SeqCst);
    if let Some((entered, release)) = &self.gate {
      entered.send(()).unwrap();
      release.recv().unwrap();
    }
    if !self.delay.is_zero() {
      thread::sleep(self.delay);
    }
    self.in_flight.store(false, Ordering::SeqCst);

    if self.fail.load(Ordering::SeqCst) {
      return Err(InferenceError::Engine("加速器不可用".to_string()));
    }
    output.copy_from_slice(&self.data);
    Ok(())
  }
}

#[derive(Clone, Default)]
struct CollectSink {
  results: Arc<Mutex<Vec<FrameResult>>>,
  degraded: Arc<Mutex<Vec<usize>>>,
}

impl CollectSink {
  fn results(&self) -> Vec<FrameResult> {
    self.results.lock().unwrap().clone()
  }

  fn degraded(&self) -> Vec<usize> {
    self.degraded.lock().unwrap().clone()
  }
}

impl ResultSink for CollectSink {
  fn on_result(&mut self, result: &FrameResult) {
    self.results.lock().unwrap().push(result.clone());
  }

  fn on_degraded(&mut self, failures: usize, _error: &InferenceError) {
    self.degraded.lock().unwrap().push(failures);
  }
}

const CENTER_BOX: [f32; 6] = [0.5, 0.5, 0.5, 0.5, 0.5, 0.1];

#[test]
fn engine_is_never_entered_concurrently() {
  let mut engine = FakeEngine::new(&[CENTER_BOX]);
  engine.delay = Duration::from_millis(2);
  let overlaps = engine.overlaps.clone();
  let calls = engine.calls.clone();

  let pipeline = Pipeline::spawn(engine.load(), PipelineConfig::default(), ()).unwrap();
  thread::scope(|scope| {
    for _ in 0..4 {
      scope.spawn(|| {
        for _ in 0..25 {
          let _ = pipeline.submit(gray_frame(64, 64));
          thread::sleep(Duration::from_micros(300));
        }
      });
    }
    scope.spawn(|| {
      for _ in 0..10 {
        pipeline.detect_image(&gray_frame(64, 64)).unwrap();
      }
    });
  });
  let stats = pipeline.shutdown();

  assert_eq!(overlaps.load(Ordering::SeqCst), 0);
  assert_eq!(stats.submitted, 100);
  assert_eq!(stats.accepted + stats.dropped_busy, stats.submitted);
  assert_eq!(stats.processed, stats.accepted);
  assert_eq!(calls.load(Ordering::SeqCst) as u64, stats.accepted + 10);
}

#[test]
fn frames_arriving_while_busy_are_dropped_and_released() {
  let (entered_tx, entered_rx) = unbounded();
  let (release_tx, release_rx) = unbounded();
  let mut engine = FakeEngine::new(&[CENTER_BOX]);
  engine.gate = Some((entered_tx, release_rx));

  let sink = CollectSink::default();
  let pipeline = Pipeline::spawn(engine.load(), PipelineConfig::default(), sink.clone()).unwrap();

  let counters: Vec<Arc<AtomicUsize>> = (0..4).map(|_| Arc::new(AtomicUsize::new(0))).collect();
  pipeline.feed(counted_frame(&counters[0])).unwrap();
  entered_rx.recv().unwrap();
  // 推理进行中时，源帧已经在转换后交还
  assert_eq!(counters[0].load(Ordering::SeqCst), 1);

  for counter in &counters[1..] {
    assert_eq!(pipeline.submit(counted_frame(counter)), Submission::Dropped);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  release_tx.send(()).unwrap();
  let stats = pipeline.shutdown();

  assert_eq!(stats.processed, 1);
  assert_eq!(stats.dropped_busy, 3);
  assert_eq!(sink.results().len(), 1);
  for counter in &counters {
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }
}

#[test]
fn degraded_is_reported_once_per_failure_streak() {
  let engine = FakeEngine::new(&[CENTER_BOX]);
  let fail = engine.fail.clone();
  let sink = CollectSink::default();
  let pipeline = Pipeline::spawn(engine.load(), PipelineConfig::default(), sink.clone()).unwrap();

  fail.store(true, Ordering::SeqCst);
  for _ in 0..5 {
    pipeline.feed(gray_frame(64, 64)).unwrap();
  }
  wait_for(|| pipeline.stats().inference_failures == 5);
  fail.store(false, Ordering::SeqCst);
  pipeline.feed(gray_frame(64, 64)).unwrap();
  wait_for(|| sink.results().len() == 1);
  fail.store(true, Ordering::SeqCst);
  for _ in 0..3 {
    pipeline.feed(gray_frame(64, 64)).unwrap();
  }
  let stats = pipeline.shutdown();

  assert_eq!(sink.degraded(), vec![3, 3]);
  assert_eq!(stats.inference_failures, 8);
  assert_eq!(stats.processed, 1);
}

#[test]
fn unloaded_pipeline_skips_frames_until_reloaded() {
  let sink = CollectSink::default();
  let pipeline = Pipeline::spawn(
    FakeEngine::new(&[CENTER_BOX]).load(),
    PipelineConfig::default(),
    sink.clone(),
  )
  .unwrap();

  let model = pipeline.unload().unwrap();
  assert!(!pipeline.is_loaded());
  assert!(matches!(
    pipeline.detect_image(&gray_frame(64, 64)),
    Err(PipelineError::NotLoaded)
  ));
  pipeline.feed(gray_frame(64, 64)).unwrap();
  wait_for(|| pipeline.stats().skipped_unloaded == 1);

  pipeline.reload(model);
  assert!(pipeline.is_loaded());
  pipeline.feed(gray_frame(64, 64)).unwrap();
  let stats = pipeline.shutdown();

  assert_eq!(stats.skipped_unloaded, 1);
  assert_eq!(stats.processed, 1);
  assert_eq!(sink.results().len(), 1);
}

#[test]
fn threshold_changes_apply_to_later_frames() {
  let sink = CollectSink::default();
  let pipeline = Pipeline::spawn(
    FakeEngine::new(&[CENTER_BOX]).load(),
    PipelineConfig::default(),
    sink.clone(),
  )
  .unwrap();

  pipeline.feed(gray_frame(64, 64)).unwrap();
  wait_for(|| sink.results().len() == 1);
  pipeline.thresholds().set_confidence(0.6).unwrap();
  assert!(pipeline.thresholds().set_iou(2.0).is_err());
  pipeline.feed(gray_frame(64, 64)).unwrap();
  pipeline.shutdown();

  let results = sink.results();
  assert_eq!(results.len(), 2);
  assert_eq!(results[0].detections.len(), 1);
  assert!(results[1].detections.is_empty());
}

#[test]
fn worker_results_are_in_source_pixels() {
  let sink = CollectSink::default();
  let pipeline = Pipeline::spawn(
    FakeEngine::new(&[CENTER_BOX]).load(),
    PipelineConfig::default(),
    sink.clone(),
  )
  .unwrap();
  pipeline
    .feed(gray_frame(64, 64).with_timestamp(Duration::from_millis(33)))
    .unwrap();
  pipeline.shutdown();

  let results = sink.results();
  assert_eq!(results.len(), 1);
  let result = &results[0];
  assert_eq!(result.timestamp, Duration::from_millis(33));
  assert_eq!(result.frame_size, (64, 64));
  assert!(result.inference_ms >= 0.0);

  let det = &result.detections[0];
  assert_eq!(det.label, "person");
  assert_eq!(det.class_id, 0);
  assert!((det.confidence - 0.5).abs() < 1e-6);
  assert!((det.bbox.x - 16.0).abs() < 1e-3);
  assert!((det.bbox.y - 16.0).abs() < 1e-3);
  assert!((det.bbox.width - 32.0).abs() < 1e-3);
  assert!((det.bbox.height - 32.0).abs() < 1e-3);
}

#[test]
fn mirrored_stream_is_flipped_once() {
  let config = PipelineConfig {
    mirror: true,
    target: Target::Upright,
    ..PipelineConfig::default()
  };
  let sink = CollectSink::default();
  let pipeline = Pipeline::spawn(
    FakeEngine::new(&[[0.2, 0.5, 0.2, 0.4, 0.9, 0.0]]).load(),
    config,
    sink.clone(),
  )
  .unwrap();
  pipeline.feed(gray_frame(64, 64)).unwrap();
  pipeline.shutdown();

  let results = sink.results();
  let bbox = results[0].detections[0].bbox;
  assert!((bbox.x - 0.7).abs() < 1e-4);
  assert!((bbox.width - 0.2).abs() < 1e-4);
  assert!((bbox.y - 0.3).abs() < 1e-4);
}

#[test]
fn still_image_keeps_whole_frame_visible() {
  // 128x64 的图像整幅缩进 64 画布：缩放 0.5，上下各留 16 像素
  let pipeline = Pipeline::spawn(
    FakeEngine::new(&[[0.5, 0.625, 0.5, 0.25, 0.0, 0.8]]).load(),
    PipelineConfig::default(),
    (),
  )
  .unwrap();
  let result = pipeline.detect_image(&gray_frame(128, 64)).unwrap();
  pipeline.shutdown();

  assert_eq!(result.frame_size, (128, 64));
  assert_eq!(result.detections.len(), 1);
  let det = &result.detections[0];
  assert_eq!(det.label, "car");
  assert!((det.bbox.x - 32.0).abs() < 1e-3);
  assert!((det.bbox.y - 32.0).abs() < 1e-3);
  assert!((det.bbox.width - 64.0).abs() < 1e-3);
  assert!((det.bbox.height - 32.0).abs() < 1e-3);
}

#[test]
fn recorded_model_loads_from_files() {
  let dir = tempfile::tempdir().unwrap();
  let metadata_path = dir.path().join("model.toml");
  std::fs::write(&metadata_path, "imgsz = [64, 64]\nnames = [\"person\", \"car\"]\n").unwrap();
  let model_path = dir.path().join("model.bin");
  let bytes: Vec<u8> = transposed(&[CENTER_BOX, [0.2, 0.2, 0.1, 0.1, 0.0, 0.3]])
    .iter()
    .flat_map(|v| v.to_le_bytes())
    .collect();
  std::fs::write(&model_path, bytes).unwrap();

  let source = ModelSource::new(
    model_path.to_string_lossy(),
    metadata_path.to_string_lossy(),
  );
  let model = source.load(&ReplayLoader).unwrap();
  assert_eq!(model.input_side(), SIDE);

  let pipeline = Pipeline::spawn(model, PipelineConfig::default(), ()).unwrap();
  let result = pipeline.detect_image(&gray_frame(64, 64)).unwrap();
  assert_eq!(result.detections.len(), 2);
  assert_eq!(result.detections[0].label, "person");
  assert_eq!(result.detections[1].label, "car");

  // 加载失败时保留当前模型
  let missing = ModelSource::new(
    dir.path().join("missing.bin").to_string_lossy(),
    metadata_path.to_string_lossy(),
  );
  assert!(matches!(
    pipeline.reload_from(&missing, &ReplayLoader),
    Err(PipelineError::ModelLoad(_))
  ));
  assert!(pipeline.is_loaded());
  assert!(pipeline.detect_image(&gray_frame(64, 64)).is_ok());
  pipeline.shutdown();
}

#[test]
fn paused_pipeline_releases_frames_without_inference() {
  let engine = FakeEngine::new(&[CENTER_BOX]);
  let calls = engine.calls.clone();
  let sink = CollectSink::default();
  let pipeline = Pipeline::spawn(engine.load(), PipelineConfig::default(), sink.clone()).unwrap();

  pipeline.pause();
  assert!(pipeline.is_paused());
  assert!(pipeline.is_loaded());
  let counters: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
  for counter in &counters[..2] {
    pipeline.feed(counted_frame(counter)).unwrap();
  }
  wait_for(|| pipeline.stats().skipped_paused == 2);
  assert_eq!(calls.load(Ordering::SeqCst), 0);

  pipeline.resume();
  assert!(!pipeline.is_paused());
  pipeline.feed(counted_frame(&counters[2])).unwrap();
  let stats = pipeline.shutdown();

  assert_eq!(stats.skipped_paused, 2);
  assert_eq!(stats.processed, 1);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(sink.results().len(), 1);
  for counter in &counters {
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }
}

#[test]
fn unconvertible_frames_are_counted_and_skipped() {
  let sink = CollectSink::default();
  let pipeline = Pipeline::spawn(
    FakeEngine::new(&[CENTER_BOX]).load(),
    PipelineConfig::default(),
    sink.clone(),
  )
  .unwrap();

  let released: Vec<Arc<AtomicUsize>> = (0..2).map(|_| Arc::new(AtomicUsize::new(0))).collect();
  let hook = |counter: &Arc<AtomicUsize>| {
    let counter = counter.clone();
    move || {
      counter.fetch_add(1, Ordering::SeqCst);
    }
  };
  let no_planes = Frame::new(PixelFormat::Yuv420, 64, 64, Vec::new()).on_release(hook(&released[0]));
  let zero_width = Frame::rgb8(0, 64, Vec::new()).on_release(hook(&released[1]));

  pipeline.feed(no_planes).unwrap();
  pipeline.feed(zero_width).unwrap();
  pipeline.feed(gray_frame(64, 64)).unwrap();
  let stats = pipeline.shutdown();

  assert_eq!(stats.submitted, 3);
  assert_eq!(stats.accepted, 3);
  assert_eq!(stats.conversion_failures, 2);
  assert_eq!(stats.inference_failures, 0);
  assert_eq!(stats.processed, 1);
  assert_eq!(sink.results().len(), 1);
  for counter in &released {
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }
}

fn classifier() -> LoadedModel<ReplayEngine> {
  let metadata = ModelMetadata::from_toml_str(
    "imgsz = [64, 64]\nnames = [\"cat\", \"dog\", \"bird\"]\n\n[head]\nlayout = \"classification\"\n",
  )
  .unwrap();
  assert_eq!(metadata.head.layout, HeadLayout::Classification);
  let engine = ReplayEngine::new(SIDE, TensorShape::new(&[1, 3]), vec![0.2, 0.7, 0.1]).unwrap();
  LoadedModel::new(engine, metadata).unwrap()
}

#[test]
fn classification_model_ranks_whole_image() {
  let pipeline = Pipeline::spawn(classifier(), PipelineConfig::default(), ()).unwrap();

  let result = pipeline.classify_image(&gray_frame(64, 64)).unwrap();
  assert!(result.detections.is_empty());
  let ranked: Vec<&str> = result
    .classifications
    .iter()
    .map(|c| c.label.as_str())
    .collect();
  assert_eq!(ranked, vec!["dog"]);
  assert!((result.classifications[0].confidence - 0.7).abs() < 1e-6);

  // 按模型输出头自动选择分类
  let auto = pipeline.process_image(&gray_frame(64, 64)).unwrap();
  assert_eq!(auto.classifications, result.classifications);
  assert!(matches!(
    pipeline.detect_image(&gray_frame(64, 64)),
    Err(PipelineError::Inference(InferenceError::WrongHead { .. }))
  ));
  pipeline.shutdown();
}

#[test]
fn worker_reports_classifications_for_classifier() {
  let sink = CollectSink::default();
  let pipeline = Pipeline::spawn(classifier(), PipelineConfig::default(), sink.clone()).unwrap();
  pipeline.thresholds().set_confidence(0.15).unwrap();

  pipeline.feed(gray_frame(96, 64)).unwrap();
  let stats = pipeline.shutdown();

  assert_eq!(stats.processed, 1);
  let results = sink.results();
  assert_eq!(results.len(), 1);
  assert!(results[0].detections.is_empty());
  let ranked: Vec<(usize, &str)> = results[0]
    .classifications
    .iter()
    .map(|c| (c.class_id, c.label.as_str()))
    .collect();
  assert_eq!(ranked, vec![(1, "dog"), (0, "cat")]);
}
