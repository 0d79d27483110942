// 该文件是 Qianli （千里眼） 项目的一部分。
// src/layout.rs - 模型张量布局检查
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

use thiserror::Error;
use tracing::{debug, info};

/// 每个锚点前四个通道为 cx, cy, w, h
pub const BOX_TERMS: usize = 4;

const INPUT_RANK: usize = 4;
const OUTPUT_RANK: usize = 3;
const RGB_CHANNELS: i64 = 3;

/// 张量元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
  Float32,
  UInt8,
  Int8,
  Other,
}

impl ElementType {
  pub fn is_quantized(&self) -> bool {
    matches!(self, ElementType::UInt8 | ElementType::Int8)
  }
}

/// 模型声明的张量信息，维度小于等于 0 表示动态维度
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
  pub dims: Box<[i64]>,
  pub element: ElementType,
}

impl TensorInfo {
  pub fn new(dims: impl Into<Box<[i64]>>, element: ElementType) -> Self {
    Self {
      dims: dims.into(),
      element,
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
  #[error("输入张量必须是 4 维, 实际形状 {0:?}")]
  InputRank(Box<[i64]>),
  #[error("不支持的输入元素类型: {0:?}")]
  InputElement(ElementType),
  #[error("输出张量必须是 f32, 实际为 {0:?}")]
  OutputElement(ElementType),
  #[error("输入张量尺寸与配置不符: 期望 {expected}x{expected}, 实际形状 {dims:?}")]
  InputSize { expected: usize, dims: Box<[i64]> },
  #[error("输出张量必须是 3 维, 实际形状 {0:?}")]
  OutputRank(Box<[i64]>),
  #[error("输出张量包含动态维度: {0:?}")]
  OutputDynamic(Box<[i64]>),
  #[error("输出通道数过少: {0}, 至少需要 {min}", min = BOX_TERMS + 1)]
  TooFewChannels(usize),
}

/// 加载时推导出的模型布局，构造后不可变
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLayout {
  /// 输入为 NCHW（否则为 NHWC）
  pub input_channel_first: bool,
  /// 输入为 8 位整数（否则为 [0,1] 的 f32）
  pub input_quantized: bool,
  pub output_channel_count: usize,
  pub output_anchor_count: usize,
  /// 输出为 [1, 通道, 锚点]（否则为 [1, 锚点, 通道]）
  pub output_transposed: bool,
}

impl ModelLayout {
  /// 根据模型声明的输入输出张量推导布局
  pub fn inspect(
    input: &TensorInfo,
    output: &TensorInfo,
    input_size: usize,
  ) -> Result<Self, LayoutError> {
    info!(
      "模型输入: {:?} {:?}, 模型输出: {:?} {:?}",
      input.dims, input.element, output.dims, output.element
    );

    if input.dims.len() != INPUT_RANK {
      return Err(LayoutError::InputRank(input.dims.clone()));
    }
    if input.element == ElementType::Other {
      return Err(LayoutError::InputElement(input.element));
    }

    let input_channel_first = input.dims[1] == RGB_CHANNELS;
    let spatial = if input_channel_first {
      &input.dims[2..4]
    } else {
      &input.dims[1..3]
    };
    if spatial
      .iter()
      .any(|&d| d > 0 && d as usize != input_size)
    {
      return Err(LayoutError::InputSize {
        expected: input_size,
        dims: input.dims.clone(),
      });
    }

    if output.dims.len() != OUTPUT_RANK {
      return Err(LayoutError::OutputRank(output.dims.clone()));
    }
    if output.element != ElementType::Float32 {
      return Err(LayoutError::OutputElement(output.element));
    }

    let (a, b) = (output.dims[1], output.dims[2]);
    if a <= 0 || b <= 0 {
      return Err(LayoutError::OutputDynamic(output.dims.clone()));
    }

    let (a, b) = (a as usize, b as usize);
    let output_transposed = a < b;
    let (output_channel_count, output_anchor_count) = if output_transposed {
      (a, b)
    } else {
      (b, a)
    };

    if output_channel_count <= BOX_TERMS {
      return Err(LayoutError::TooFewChannels(output_channel_count));
    }

    let layout = ModelLayout {
      input_channel_first,
      input_quantized: input.element.is_quantized(),
      output_channel_count,
      output_anchor_count,
      output_transposed,
    };

    if layout.input_channel_first {
      debug!("检测到 NCHW 格式模型");
    }
    if layout.input_quantized {
      debug!("检测到量化模型 (Int8/UInt8)");
    }
    debug!(
      "输出布局: {} 通道, {} 锚点, 转置: {}",
      layout.output_channel_count, layout.output_anchor_count, layout.output_transposed
    );

    Ok(layout)
  }

  pub fn class_count(&self) -> usize {
    self.output_channel_count - BOX_TERMS
  }

  pub fn bytes_per_element(&self) -> usize {
    if self.input_quantized { 1 } else { 4 }
  }

  /// 输入缓冲区元素个数
  pub fn input_len(&self, input_size: usize) -> usize {
    input_size * input_size * RGB_CHANNELS as usize
  }

  /// 输出缓冲区元素个数
  pub fn output_len(&self) -> usize {
    self.output_channel_count * self.output_anchor_count
  }

  /// 锚点 `anchor` 的第 `channel` 个通道在输出缓冲区中的偏移
  #[inline]
  pub fn offset(&self, anchor: usize, channel: usize) -> usize {
    if self.output_transposed {
      channel * self.output_anchor_count + anchor
    } else {
      anchor * self.output_channel_count + channel
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn f32_tensor(dims: &[i64]) -> TensorInfo {
    TensorInfo::new(dims.to_vec(), ElementType::Float32)
  }

  #[test]
  fn nchw_float_with_transposed_output() {
    let layout = ModelLayout::inspect(
      &f32_tensor(&[1, 3, 640, 640]),
      &f32_tensor(&[1, 84, 8400]),
      640,
    )
    .unwrap();

    assert!(layout.input_channel_first);
    assert!(!layout.input_quantized);
    assert!(layout.output_transposed);
    assert_eq!(layout.output_channel_count, 84);
    assert_eq!(layout.output_anchor_count, 8400);
    assert_eq!(layout.class_count(), 80);
    assert_eq!(layout.bytes_per_element(), 4);
  }

  #[test]
  fn nhwc_quantized_with_standard_output() {
    for element in [ElementType::UInt8, ElementType::Int8] {
      let layout = ModelLayout::inspect(
        &TensorInfo::new(vec![1, 320, 320, 3], element),
        &f32_tensor(&[1, 2100, 6]),
        320,
      )
      .unwrap();

      assert!(!layout.input_channel_first);
      assert!(layout.input_quantized);
      assert!(!layout.output_transposed);
      assert_eq!(layout.output_channel_count, 6);
      assert_eq!(layout.output_anchor_count, 2100);
      assert_eq!(layout.bytes_per_element(), 1);
      assert_eq!(layout.input_len(320), 320 * 320 * 3);
    }
  }

  #[test]
  fn square_output_is_standard() {
    let layout =
      ModelLayout::inspect(&f32_tensor(&[1, 3, 64, 64]), &f32_tensor(&[1, 8, 8]), 64).unwrap();
    assert!(!layout.output_transposed);
  }

  #[test]
  fn dynamic_input_dims_are_accepted() {
    let layout = ModelLayout::inspect(
      &f32_tensor(&[-1, 3, -1, -1]),
      &f32_tensor(&[1, 84, 8400]),
      416,
    )
    .unwrap();
    assert!(layout.input_channel_first);
  }

  #[test]
  fn input_size_mismatch_is_rejected() {
    let err = ModelLayout::inspect(
      &f32_tensor(&[1, 3, 640, 640]),
      &f32_tensor(&[1, 84, 8400]),
      320,
    )
    .unwrap_err();
    assert!(matches!(err, LayoutError::InputSize { expected: 320, .. }));
  }

  #[test]
  fn unsupported_ranks_are_rejected() {
    let input = f32_tensor(&[1, 3, 640, 640]);

    let err = ModelLayout::inspect(&input, &f32_tensor(&[8400, 84]), 640).unwrap_err();
    assert!(matches!(err, LayoutError::OutputRank(_)));

    let err = ModelLayout::inspect(&input, &f32_tensor(&[1, 1, 84, 8400]), 640).unwrap_err();
    assert!(matches!(err, LayoutError::OutputRank(_)));

    let err =
      ModelLayout::inspect(&f32_tensor(&[3, 640, 640]), &f32_tensor(&[1, 84, 8400]), 640)
        .unwrap_err();
    assert!(matches!(err, LayoutError::InputRank(_)));
  }

  #[test]
  fn degenerate_outputs_are_rejected() {
    let input = f32_tensor(&[1, 3, 640, 640]);

    let err = ModelLayout::inspect(&input, &f32_tensor(&[1, -1, 84]), 640).unwrap_err();
    assert!(matches!(err, LayoutError::OutputDynamic(_)));

    let err = ModelLayout::inspect(&input, &f32_tensor(&[1, 4, 8400]), 640).unwrap_err();
    assert_eq!(err, LayoutError::TooFewChannels(4));
  }

  #[test]
  fn unsupported_element_types_are_rejected() {
    let err = ModelLayout::inspect(
      &TensorInfo::new(vec![1, 3, 64, 64], ElementType::Other),
      &f32_tensor(&[1, 6, 100]),
      64,
    )
    .unwrap_err();
    assert_eq!(err, LayoutError::InputElement(ElementType::Other));

    for element in [ElementType::Other, ElementType::UInt8, ElementType::Int8] {
      let err = ModelLayout::inspect(
        &f32_tensor(&[1, 3, 64, 64]),
        &TensorInfo::new(vec![1, 6, 100], element),
        64,
      )
      .unwrap_err();
      assert_eq!(err, LayoutError::OutputElement(element));
    }
  }

  #[test]
  fn offsets_follow_layout() {
    let mut layout = ModelLayout {
      input_channel_first: true,
      input_quantized: false,
      output_channel_count: 6,
      output_anchor_count: 10,
      output_transposed: true,
    };
    assert_eq!(layout.offset(3, 2), 2 * 10 + 3);

    layout.output_transposed = false;
    assert_eq!(layout.offset(3, 2), 3 * 6 + 2);
    assert_eq!(layout.output_len(), 60);
  }
}
