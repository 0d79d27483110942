// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/detector.rs - 目标检测器
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

use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{EncodeError, FrameEncoder},
  label::{LabelError, LabelTable},
  layout::{LayoutError, ModelLayout},
  model::{
    Candidate, DetectResult, Detection, DetectionDecoder, Model, Runtime, RuntimeOptions,
    Suppressor,
  },
  url_to_path,
};

pub const DEFAULT_INPUT_SIZE: u32 = 640;
pub const DEFAULT_THREADS: usize = 4;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

const DETECTOR_SCHEME: &str = "yolo";

#[derive(Error, Debug)]
pub enum DetectorError {
  #[error("模型加载错误: {path}: {source}")]
  ModelLoad {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("运行时错误: {0}")]
  Runtime(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("模型缺少{0}张量")]
  MissingTensor(&'static str),
  #[error("标签错误: {0}")]
  Label(#[from] LabelError),
  #[error("不支持的模型布局: {0}")]
  UnsupportedLayout(#[from] LayoutError),
  #[error("配置无效: {0}")]
  InvalidConfig(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("帧编码错误: {0}")]
  Encode(#[from] EncodeError),
  #[error("推理错误: {0}")]
  Inference(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("检测器不可用")]
  Disabled,
}

/// 上报给调用方的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// 构造失败，实例永久不可用
  Construction,
  /// 输出布局不受支持，构造时报告
  UnsupportedLayout,
  /// 单帧推理失败，下一帧照常
  Inference,
}

impl DetectorError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      DetectorError::UnsupportedLayout(_) => ErrorKind::UnsupportedLayout,
      DetectorError::Encode(_) | DetectorError::Inference(_) => ErrorKind::Inference,
      _ => ErrorKind::Construction,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
  /// 模型输入边长
  pub input_size: u32,
  /// 推理线程数提示
  pub threads: usize,
  pub confidence_threshold: f32,
  pub iou_threshold: f32,
}

impl Default for DetectorConfig {
  fn default() -> Self {
    Self {
      input_size: DEFAULT_INPUT_SIZE,
      threads: DEFAULT_THREADS,
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
    }
  }
}

impl DetectorConfig {
  fn validate(&self) -> Result<(), DetectorError> {
    if self.input_size == 0 {
      return Err(DetectorError::InvalidConfig("输入尺寸不能为 0".to_string()));
    }
    if self.threads == 0 {
      return Err(DetectorError::InvalidConfig("线程数不能为 0".to_string()));
    }
    for (name, value) in [
      ("置信度阈值", self.confidence_threshold),
      ("IoU 阈值", self.iou_threshold),
    ] {
      if !(0.0..=1.0).contains(&value) {
        return Err(DetectorError::InvalidConfig(format!(
          "{} 必须在 [0, 1] 内, 实际为 {}",
          name, value
        )));
      }
    }
    Ok(())
  }
}

/// 最近一帧各阶段耗时
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTiming {
  pub encode: Duration,
  pub infer: Duration,
  pub decode: Duration,
  pub suppress: Duration,
}

impl FrameTiming {
  pub fn total(&self) -> Duration {
    self.encode + self.infer + self.decode + self.suppress
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorStats {
  pub frames: u64,
  pub failed_frames: u64,
  pub detections: u64,
}

/// 运行时与每帧复用的缓冲区
struct Engine<R> {
  runtime: R,
  layout: ModelLayout,
  encoder: FrameEncoder,
  decoder: DetectionDecoder,
  suppressor: Suppressor,
  output: Box<[f32]>,
  candidates: Vec<Candidate>,
}

impl<R: Runtime> Engine<R> {
  fn run_frame(
    &mut self,
    image: &RgbImage,
    labels: &LabelTable,
    timing: &mut FrameTiming,
  ) -> Result<Vec<Detection>, DetectorError> {
    let start = Instant::now();
    self.encoder.encode(image)?;
    let encoded = Instant::now();
    timing.encode = encoded - start;

    self.output.fill(0.0);
    self
      .runtime
      .run(self.encoder.tensor(), &mut self.output)
      .map_err(|e| DetectorError::Inference(Box::new(e)))?;
    let inferred = Instant::now();
    timing.infer = inferred - encoded;

    self
      .decoder
      .decode(&self.output, &self.layout, &mut self.candidates);
    let decoded = Instant::now();
    timing.decode = decoded - inferred;

    let candidate_count = self.candidates.len();
    self.suppressor.suppress(&mut self.candidates);
    timing.suppress = decoded.elapsed();

    debug!(
      candidates = candidate_count,
      kept = self.candidates.len(),
      "后处理完成"
    );

    Ok(
      self
        .candidates
        .iter()
        .map(|c| Detection {
          bbox: c.bbox,
          class_index: c.class_index,
          label: labels.label(c.class_index).clone(),
          confidence: c.confidence,
        })
        .collect(),
    )
  }
}

/// 目标检测器。
///
/// 每帧依次执行：编码 → 推理 → 解码 → NMS。逐帧接口需要 `&mut self`，
/// 同一实例不能被并发调用；需要并行时每个线程使用一个实例。
pub struct Detector<R> {
  config: DetectorConfig,
  labels: LabelTable,
  engine: Option<Engine<R>>,
  load_error: Option<DetectorError>,
  stats: DetectorStats,
  last_timing: FrameTiming,
}

impl<R: Runtime> Detector<R> {
  /// 使用已加载的运行时构造检测器
  pub fn from_runtime(
    mut runtime: R,
    labels: LabelTable,
    config: DetectorConfig,
  ) -> Result<Self, DetectorError> {
    config.validate()?;

    let input = runtime
      .input_tensor()
      .ok_or(DetectorError::MissingTensor("输入"))?;
    let output = runtime
      .output_tensor()
      .ok_or(DetectorError::MissingTensor("输出"))?;
    let layout = ModelLayout::inspect(&input, &output, config.input_size as usize)?;

    runtime
      .prepare(&layout, config.input_size)
      .map_err(|e| DetectorError::Runtime(Box::new(e)))?;

    if !labels.is_empty() && labels.len() != layout.class_count() {
      warn!(
        "标签数量 {} 与模型类别数 {} 不一致",
        labels.len(),
        layout.class_count()
      );
    }

    let engine = Engine {
      encoder: FrameEncoder::new(&layout, config.input_size),
      decoder: DetectionDecoder::new(config.input_size, config.confidence_threshold),
      suppressor: Suppressor::with_capacity(config.iou_threshold, layout.output_anchor_count),
      output: vec![0f32; layout.output_len()].into_boxed_slice(),
      candidates: Vec::with_capacity(layout.output_anchor_count),
      layout,
      runtime,
    };

    info!(
      input_size = config.input_size,
      classes = layout.class_count(),
      anchors = layout.output_anchor_count,
      "检测器就绪"
    );

    Ok(Self {
      config,
      labels,
      engine: Some(engine),
      load_error: None,
      stats: DetectorStats::default(),
      last_timing: FrameTiming::default(),
    })
  }

  /// 检测一帧图像，返回错误以便调用方上报
  pub fn try_detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
    let engine = self.engine.as_mut().ok_or(DetectorError::Disabled)?;

    let mut timing = FrameTiming::default();
    let result = engine.run_frame(image, &self.labels, &mut timing);

    self.stats.frames += 1;
    self.last_timing = timing;
    match &result {
      Ok(detections) => {
        self.stats.detections += detections.len() as u64;
        debug!(
          frame = self.stats.frames,
          detections = detections.len(),
          elapsed_us = timing.total().as_micros() as u64,
          "帧检测完成"
        );
      }
      Err(_) => self.stats.failed_frames += 1,
    }

    result
  }

  /// 检测一帧图像；任何失败都视为本帧没有检测结果
  pub fn detect(&mut self, image: &RgbImage) -> Vec<Detection> {
    match self.try_detect(image) {
      Ok(detections) => detections,
      Err(DetectorError::Disabled) => Vec::new(),
      Err(e) => {
        warn!(error = %e, "推理失败，本帧无检测结果");
        Vec::new()
      }
    }
  }
}

impl<R> Detector<R> {
  /// 构造失败后的不可用实例，`detect` 始终返回空结果
  pub fn disabled(config: DetectorConfig, error: DetectorError) -> Self {
    Self {
      config,
      labels: LabelTable::default(),
      engine: None,
      load_error: Some(error),
      stats: DetectorStats::default(),
      last_timing: FrameTiming::default(),
    }
  }

  pub fn is_enabled(&self) -> bool {
    self.engine.is_some()
  }

  pub fn load_error(&self) -> Option<&DetectorError> {
    self.load_error.as_ref()
  }

  pub fn layout(&self) -> Option<&ModelLayout> {
    self.engine.as_ref().map(|engine| &engine.layout)
  }

  pub fn runtime(&self) -> Option<&R> {
    self.engine.as_ref().map(|engine| &engine.runtime)
  }

  pub fn labels(&self) -> &LabelTable {
    &self.labels
  }

  pub fn config(&self) -> &DetectorConfig {
    &self.config
  }

  pub fn stats(&self) -> DetectorStats {
    self.stats
  }

  pub fn last_timing(&self) -> FrameTiming {
    self.last_timing
  }

  /// 释放运行时与缓冲区，可重复调用
  pub fn release(&mut self) {
    if self.engine.take().is_some() {
      info!("检测器已释放");
    }
  }
}

impl<R: Runtime> Model for Detector<R> {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = DetectorError;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.try_detect(input).map(DetectResult::from)
  }

  fn stage_timing(&self) -> Option<FrameTiming> {
    Some(self.last_timing)
  }
}

pub struct DetectorBuilder {
  model_path: PathBuf,
  labels_path: Option<PathBuf>,
  config: DetectorConfig,
}

impl FromUrlWithScheme for DetectorBuilder {
  const SCHEME: &'static str = DETECTOR_SCHEME;
}

impl FromUrl for DetectorBuilder {
  type Error = DetectorError;

  /// `yolo:///path/model.onnx?labels=/path/labels.txt&size=640&threads=4`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DetectorError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut builder = DetectorBuilder::new(url_to_path(url));
    for (key, value) in url.query_pairs() {
      builder = match &*key {
        "labels" => builder.labels(value.into_owned()),
        "size" => builder.input_size(parse_query(&key, &value)?),
        "threads" => builder.threads(parse_query(&key, &value)?),
        "confidence" => builder.confidence_threshold(parse_query(&key, &value)?),
        "iou" => builder.iou_threshold(parse_query(&key, &value)?),
        other => {
          warn!("忽略未知模型参数: {}", other);
          builder
        }
      };
    }

    Ok(builder)
  }
}

fn parse_query<T: FromStr>(key: &str, value: &str) -> Result<T, DetectorError> {
  value
    .parse()
    .map_err(|_| DetectorError::ModelPathError(format!("参数 {} 的值无效: {}", key, value)))
}

impl DetectorBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      labels_path: None,
      config: DetectorConfig::default(),
    }
  }

  pub fn labels(mut self, labels_path: impl Into<PathBuf>) -> Self {
    self.labels_path = Some(labels_path.into());
    self
  }

  pub fn input_size(mut self, input_size: u32) -> Self {
    self.config.input_size = input_size;
    self
  }

  pub fn threads(mut self, threads: usize) -> Self {
    self.config.threads = threads;
    self
  }

  pub fn confidence_threshold(mut self, threshold: f32) -> Self {
    self.config.confidence_threshold = threshold;
    self
  }

  pub fn iou_threshold(mut self, threshold: f32) -> Self {
    self.config.iou_threshold = threshold;
    self
  }

  pub fn config(&self) -> &DetectorConfig {
    &self.config
  }

  pub fn build<R: Runtime>(self) -> Result<Detector<R>, DetectorError> {
    self.config.validate()?;

    info!("加载模型文件: {}", self.model_path.display());
    let model_data = std::fs::read(&self.model_path).map_err(|source| DetectorError::ModelLoad {
      path: self.model_path.clone(),
      source,
    })?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let labels = match &self.labels_path {
      Some(path) => LabelTable::from_file(path)?,
      None => {
        warn!("未指定标签文件，所有类别显示为 unknown");
        LabelTable::default()
      }
    };

    let options = RuntimeOptions {
      threads: self.config.threads,
    };
    let runtime = R::load(&model_data, &options).map_err(|e| DetectorError::Runtime(Box::new(e)))?;
    info!("模型加载完成");

    Detector::from_runtime(runtime, labels, self.config)
  }

  /// 加载失败时返回不可用的检测器而不是错误
  pub fn build_or_disabled<R: Runtime>(self) -> Detector<R> {
    let config = self.config;
    match self.build() {
      Ok(detector) => detector,
      Err(e) => {
        error!("模型加载失败: {}", e);
        Detector::disabled(config, e)
      }
    }
  }
}
