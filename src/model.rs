// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model.rs - 模型
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

use std::sync::Arc;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error>;

  /// 最近一次推理的分阶段耗时
  fn stage_timing(&self) -> Option<FrameTiming> {
    None
  }
}

/// 归一化到 [0,1] 的边界框
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
  pub left: f32,
  pub top: f32,
  pub right: f32,
  pub bottom: f32,
}

impl BoundingBox {
  pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
    Self {
      left,
      top,
      right,
      bottom,
    }
  }

  pub fn width(&self) -> f32 {
    self.right - self.left
  }

  pub fn height(&self) -> f32 {
    self.bottom - self.top
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  pub fn center(&self) -> (f32, f32) {
    (
      (self.left + self.right) / 2.0,
      (self.top + self.bottom) / 2.0,
    )
  }

  /// 四条边分别限制在 [0,1]
  pub fn clamped(self) -> Self {
    Self {
      left: self.left.clamp(0.0, 1.0),
      top: self.top.clamp(0.0, 1.0),
      right: self.right.clamp(0.0, 1.0),
      bottom: self.bottom.clamp(0.0, 1.0),
    }
  }

  /// 交并比，并集面积非正时为 0
  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let left = self.left.max(other.left);
    let top = self.top.max(other.top);
    let right = self.right.min(other.right);
    let bottom = self.bottom.min(other.bottom);

    let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub bbox: BoundingBox,
  pub class_index: usize,
  pub label: Arc<str>,
  pub confidence: f32,
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
}

impl From<Vec<Detection>> for DetectResult {
  fn from(items: Vec<Detection>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

mod decode;
mod detector;
mod nms;
#[cfg(feature = "onnx_runtime")]
mod onnx;
mod runtime;

pub use self::decode::{Candidate, DetectionDecoder};
pub use self::detector::{
  DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_INPUT_SIZE, DEFAULT_IOU_THRESHOLD, DEFAULT_THREADS,
  Detector, DetectorBuilder, DetectorConfig, DetectorError, DetectorStats, ErrorKind, FrameTiming,
};
pub use self::nms::Suppressor;
#[cfg(feature = "onnx_runtime")]
pub use self::onnx::{OnnxRuntime, OnnxRuntimeError};
pub use self::runtime::{Runtime, RuntimeOptions};
