// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/nms.rs - 非极大值抑制
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

use crate::model::Candidate;

/// 贪心 NMS，不区分类别
#[derive(Debug, Clone)]
pub struct Suppressor {
  iou_threshold: f32,
  suppressed: Vec<bool>,
}

impl Suppressor {
  pub fn new(iou_threshold: f32) -> Self {
    Self::with_capacity(iou_threshold, 0)
  }

  pub fn with_capacity(iou_threshold: f32, capacity: usize) -> Self {
    Self {
      iou_threshold,
      suppressed: Vec::with_capacity(capacity),
    }
  }

  pub fn iou_threshold(&self) -> f32 {
    self.iou_threshold
  }

  /// 原地保留未被抑制的候选框，结果按置信度降序排列。
  pub fn suppress(&mut self, candidates: &mut Vec<Candidate>) {
    // 同分按锚点序号排序，保证结果可复现
    candidates.sort_unstable_by(|a, b| {
      b.confidence
        .total_cmp(&a.confidence)
        .then(a.anchor.cmp(&b.anchor))
    });

    self.suppressed.clear();
    self.suppressed.resize(candidates.len(), false);

    for i in 0..candidates.len() {
      if self.suppressed[i] {
        continue;
      }
      let kept = candidates[i].bbox;
      for j in (i + 1)..candidates.len() {
        if !self.suppressed[j] && kept.iou(&candidates[j].bbox) > self.iou_threshold {
          self.suppressed[j] = true;
        }
      }
    }

    let suppressed = &self.suppressed;
    let mut index = 0;
    candidates.retain(|_| {
      let keep = !suppressed[index];
      index += 1;
      keep
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::BoundingBox;

  fn candidate(anchor: usize, confidence: f32, bbox: BoundingBox) -> Candidate {
    Candidate {
      bbox,
      class_index: anchor % 3,
      confidence,
      anchor,
    }
  }

  #[test]
  fn iou_of_disjoint_and_identical_boxes() {
    let a = BoundingBox::new(0.0, 0.0, 0.2, 0.2);
    let b = BoundingBox::new(0.5, 0.5, 0.9, 0.9);
    let touching = BoundingBox::new(0.2, 0.0, 0.4, 0.2);
    assert_eq!(a.iou(&b), 0.0);
    assert_eq!(a.iou(&touching), 0.0);
    assert_eq!(a.iou(&a), 1.0);
    assert_eq!(b.iou(&b), 1.0);
  }

  #[test]
  fn degenerate_boxes_have_zero_iou() {
    let point = BoundingBox::new(0.3, 0.3, 0.3, 0.3);
    let inverted = BoundingBox::new(0.5, 0.5, 0.1, 0.1);
    assert_eq!(point.iou(&point), 0.0);
    assert_eq!(inverted.iou(&inverted), 0.0);
  }

  #[test]
  fn overlapping_lower_confidence_is_removed() {
    // 两个 0.5x0.5 的框水平错开 0.125，IoU = 0.375 / 0.625 = 0.6
    let a = BoundingBox::new(0.0, 0.0, 0.5, 0.5);
    let b = BoundingBox::new(0.125, 0.0, 0.625, 0.5);
    assert!((a.iou(&b) - 0.6).abs() < 1e-6);

    let mut candidates = vec![candidate(0, 0.7, b), candidate(1, 0.9, a)];
    Suppressor::new(0.45).suppress(&mut candidates);

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].confidence, 0.9);
    assert_eq!(candidates[0].bbox, a);
  }

  #[test]
  fn suppression_crosses_class_labels() {
    let a = BoundingBox::new(0.1, 0.1, 0.5, 0.5);
    let mut candidates = vec![
      Candidate {
        class_index: 0,
        ..candidate(0, 0.8, a)
      },
      Candidate {
        class_index: 7,
        ..candidate(1, 0.6, a)
      },
    ];
    Suppressor::new(0.45).suppress(&mut candidates);
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].class_index, 0);
  }

  #[test]
  fn result_is_sorted_and_ties_keep_anchor_order() {
    let mut candidates = vec![
      candidate(5, 0.6, BoundingBox::new(0.0, 0.0, 0.1, 0.1)),
      candidate(2, 0.8, BoundingBox::new(0.2, 0.2, 0.3, 0.3)),
      candidate(9, 0.8, BoundingBox::new(0.4, 0.4, 0.5, 0.5)),
      candidate(1, 0.8, BoundingBox::new(0.6, 0.6, 0.7, 0.7)),
    ];
    Suppressor::new(0.45).suppress(&mut candidates);

    let anchors: Vec<usize> = candidates.iter().map(|c| c.anchor).collect();
    assert_eq!(anchors, vec![1, 2, 9, 5]);
  }

  #[test]
  fn kept_set_is_subset_with_bounded_overlap() {
    // 确定性的伪随机框
    let mut seed = 0x2545_f491_u32;
    let mut next = move || {
      seed ^= seed << 13;
      seed ^= seed >> 17;
      seed ^= seed << 5;
      (seed % 1000) as f32 / 1000.0
    };

    let input: Vec<Candidate> = (0..200)
      .map(|anchor| {
        let (x, y) = (next() * 0.8, next() * 0.8);
        let (w, h) = (0.05 + next() * 0.2, 0.05 + next() * 0.2);
        candidate(anchor, 0.5 + next() / 2.0, BoundingBox::new(x, y, x + w, y + h))
      })
      .collect();

    let threshold = 0.45;
    let mut kept = input.clone();
    let mut suppressor = Suppressor::with_capacity(threshold, input.len());
    suppressor.suppress(&mut kept);

    assert!(!kept.is_empty());
    assert!(kept.iter().all(|k| input.contains(k)));
    for (i, a) in kept.iter().enumerate() {
      for b in &kept[i + 1..] {
        assert!(a.bbox.iou(&b.bbox) <= threshold);
      }
    }

    // 复用同一个实例结果不变
    let mut again = input.clone();
    suppressor.suppress(&mut again);
    assert_eq!(kept, again);
  }

  #[test]
  fn empty_input_stays_empty() {
    let mut candidates = Vec::new();
    Suppressor::new(0.45).suppress(&mut candidates);
    assert!(candidates.is_empty());
  }
}
