// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/decode.rs - 输出张量解码
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

use crate::layout::{BOX_TERMS, ModelLayout};
use crate::model::BoundingBox;

/// 通过置信度阈值的候选框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
  pub bbox: BoundingBox,
  pub class_index: usize,
  pub confidence: f32,
  /// 锚点序号，NMS 同分时按它排序
  pub anchor: usize,
}

/// 按模型布局读取每个锚点的类别得分与框坐标
#[derive(Debug, Clone, Copy)]
pub struct DetectionDecoder {
  input_size: f32,
  confidence_threshold: f32,
}

impl DetectionDecoder {
  pub fn new(input_size: u32, confidence_threshold: f32) -> Self {
    Self {
      input_size: input_size as f32,
      confidence_threshold,
    }
  }

  /// 清空 `candidates` 并按锚点升序写入本帧候选框。
  ///
  /// `output` 长度必须等于 `layout.output_len()`。
  pub fn decode(&self, output: &[f32], layout: &ModelLayout, candidates: &mut Vec<Candidate>) {
    debug_assert_eq!(output.len(), layout.output_len());
    candidates.clear();

    let at = |anchor: usize, channel: usize| output[layout.offset(anchor, channel)];

    for anchor in 0..layout.output_anchor_count {
      let mut max_score = f32::NEG_INFINITY;
      let mut max_class = 0usize;
      for channel in BOX_TERMS..layout.output_channel_count {
        let score = at(anchor, channel);
        if score > max_score {
          max_score = score;
          max_class = channel - BOX_TERMS;
        }
      }

      if !(max_score > self.confidence_threshold) {
        continue;
      }

      let (mut cx, mut cy, mut w, mut h) = (
        at(anchor, 0),
        at(anchor, 1),
        at(anchor, 2),
        at(anchor, 3),
      );

      // 宽度不超过 1 视为归一化坐标，统一还原到像素
      if w <= 1.0 {
        cx *= self.input_size;
        cy *= self.input_size;
        w *= self.input_size;
        h *= self.input_size;
      }

      let bbox = BoundingBox::new(
        (cx - w / 2.0) / self.input_size,
        (cy - h / 2.0) / self.input_size,
        (cx + w / 2.0) / self.input_size,
        (cy + h / 2.0) / self.input_size,
      )
      .clamped();

      if bbox.width() > 0.0 && bbox.height() > 0.0 {
        candidates.push(Candidate {
          bbox,
          class_index: max_class,
          confidence: max_score,
          anchor,
        });
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const INPUT_SIZE: u32 = 640;

  fn layout(channels: usize, anchors: usize, transposed: bool) -> ModelLayout {
    ModelLayout {
      input_channel_first: true,
      input_quantized: false,
      output_channel_count: channels,
      output_anchor_count: anchors,
      output_transposed: transposed,
    }
  }

  fn write_anchor(output: &mut [f32], layout: &ModelLayout, anchor: usize, values: &[f32]) {
    for (channel, &value) in values.iter().enumerate() {
      output[layout.offset(anchor, channel)] = value;
    }
  }

  fn decode(output: &[f32], layout: &ModelLayout) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    DetectionDecoder::new(INPUT_SIZE, 0.5).decode(output, layout, &mut candidates);
    candidates
  }

  #[test]
  fn single_normalized_anchor_in_standard_layout() {
    let layout = layout(6, 8400, false);
    let mut output = vec![0f32; layout.output_len()];
    write_anchor(
      &mut output,
      &layout,
      1234,
      &[0.5, 0.5, 100.0 / 640.0, 100.0 / 640.0, 0.0, 0.9],
    );

    let candidates = decode(&output, &layout);
    assert_eq!(candidates.len(), 1);

    let candidate = candidates[0];
    assert_eq!(candidate.class_index, 1);
    assert_eq!(candidate.anchor, 1234);
    assert!((candidate.confidence - 0.9).abs() < 1e-6);

    let (cx, cy) = candidate.bbox.center();
    assert!((cx - 0.5).abs() < 1e-5);
    assert!((cy - 0.5).abs() < 1e-5);
    assert!((candidate.bbox.width() - 100.0 / 640.0).abs() < 1e-5);
  }

  #[test]
  fn pixel_space_boxes_are_divided_by_input_size() {
    let layout = layout(6, 4, false);
    let mut output = vec![0f32; layout.output_len()];
    write_anchor(&mut output, &layout, 2, &[320.0, 160.0, 64.0, 32.0, 0.8, 0.1]);

    let candidates = decode(&output, &layout);
    assert_eq!(candidates.len(), 1);

    let bbox = candidates[0].bbox;
    assert_eq!(candidates[0].class_index, 0);
    assert!((bbox.left - 288.0 / 640.0).abs() < 1e-6);
    assert!((bbox.top - 144.0 / 640.0).abs() < 1e-6);
    assert!((bbox.right - 352.0 / 640.0).abs() < 1e-6);
    assert!((bbox.bottom - 176.0 / 640.0).abs() < 1e-6);
  }

  #[test]
  fn transposed_and_standard_decode_identically() {
    let values = [0.25, 0.75, 0.2, 0.1, 0.05, 0.66, 0.7];
    let standard = layout(7, 5, false);
    let transposed = layout(7, 5, true);

    let mut a = vec![0f32; standard.output_len()];
    let mut b = vec![0f32; transposed.output_len()];
    write_anchor(&mut a, &standard, 3, &values);
    write_anchor(&mut b, &transposed, 3, &values);

    let from_standard = decode(&a, &standard);
    let from_transposed = decode(&b, &transposed);
    assert_eq!(from_standard.len(), 1);
    assert_eq!(from_standard, from_transposed);
    assert_eq!(from_standard[0].class_index, 2);
  }

  #[test]
  fn threshold_is_exclusive() {
    let layout = layout(5, 3, true);
    let mut output = vec![0f32; layout.output_len()];
    write_anchor(&mut output, &layout, 0, &[0.5, 0.5, 0.1, 0.1, 0.5]);
    write_anchor(&mut output, &layout, 1, &[0.5, 0.5, 0.1, 0.1, 0.51]);
    write_anchor(&mut output, &layout, 2, &[0.5, 0.5, 0.1, 0.1, f32::NAN]);

    let candidates = decode(&output, &layout);
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].anchor, 1);
  }

  #[test]
  fn coordinates_are_clamped_and_empty_boxes_dropped() {
    let layout = layout(5, 4, false);
    let mut output = vec![0f32; layout.output_len()];
    // 超出左上角
    write_anchor(&mut output, &layout, 0, &[10.0, 10.0, 100.0, 100.0, 0.9]);
    // 超出右下角
    write_anchor(&mut output, &layout, 1, &[630.0, 700.0, 100.0, 200.0, 0.9]);
    // 完全在画面外，限制后宽度为 0
    write_anchor(&mut output, &layout, 2, &[900.0, 900.0, 50.0, 50.0, 0.9]);
    // 高度为 0
    write_anchor(&mut output, &layout, 3, &[0.5, 0.5, 0.5, 0.0, 0.9]);

    let candidates = decode(&output, &layout);
    assert_eq!(candidates.len(), 2);
    for candidate in &candidates {
      let b = candidate.bbox;
      for v in [b.left, b.top, b.right, b.bottom] {
        assert!((0.0..=1.0).contains(&v));
      }
    }
    assert_eq!(candidates[0].bbox.left, 0.0);
    assert_eq!(candidates[1].bbox.bottom, 1.0);
  }

  #[test]
  fn candidates_follow_anchor_order() {
    let layout = layout(5, 6, true);
    let mut output = vec![0f32; layout.output_len()];
    for (anchor, score) in [(4, 0.6), (1, 0.99), (5, 0.7)] {
      write_anchor(&mut output, &layout, anchor, &[0.5, 0.5, 0.1, 0.1, score]);
    }

    let anchors: Vec<usize> = decode(&output, &layout).iter().map(|c| c.anchor).collect();
    assert_eq!(anchors, vec![1, 4, 5]);
  }
}
