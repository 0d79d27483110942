// 该文件是 Qianli （千里眼） 项目的一部分。
// src/frame.rs - 帧编码：拉伸缩放并写入模型输入缓冲区
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

use fast_image_resize::{
  FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer,
  images::{Image, ImageRef},
};
use image::RgbImage;
use thiserror::Error;
use tracing::trace;

use crate::layout::ModelLayout;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum EncodeError {
  #[error("输入图像为空: {0}x{1}")]
  EmptyImage(u32, u32),
  #[error("图像缓冲区错误: {0}")]
  Buffer(#[from] fast_image_resize::ImageBufferError),
  #[error("图像缩放错误: {0}")]
  Resize(#[from] fast_image_resize::ResizeError),
}

/// 模型输入缓冲区，元素类型由模型布局决定
#[derive(Debug, Clone, PartialEq)]
pub enum InputTensor {
  /// [0,1] 归一化的 f32
  Float(Box<[f32]>),
  /// 0-255 原始像素值
  Quantized(Box<[u8]>),
}

impl InputTensor {
  pub fn zeroed(layout: &ModelLayout, input_size: usize) -> Self {
    let len = layout.input_len(input_size);
    if layout.input_quantized {
      InputTensor::Quantized(vec![0u8; len].into_boxed_slice())
    } else {
      InputTensor::Float(vec![0f32; len].into_boxed_slice())
    }
  }

  pub fn len(&self) -> usize {
    match self {
      InputTensor::Float(data) => data.len(),
      InputTensor::Quantized(data) => data.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn byte_len(&self) -> usize {
    match self {
      InputTensor::Float(data) => std::mem::size_of_val(&**data),
      InputTensor::Quantized(data) => data.len(),
    }
  }

  pub fn as_f32(&self) -> Option<&[f32]> {
    match self {
      InputTensor::Float(data) => Some(data),
      InputTensor::Quantized(_) => None,
    }
  }

  pub fn as_u8(&self) -> Option<&[u8]> {
    match self {
      InputTensor::Float(_) => None,
      InputTensor::Quantized(data) => Some(data),
    }
  }
}

/// 将任意尺寸的 RGB 图像拉伸到 `input_size x input_size` 并写入输入缓冲区。
///
/// 不做 letterbox：整幅画面都参与推理，解码时坐标只需除以 `input_size`。
/// 所有缓冲区在构造时一次性分配，之后每帧原地覆盖。
pub struct FrameEncoder {
  input_size: u32,
  channel_first: bool,
  resizer: Resizer,
  options: ResizeOptions,
  pixels: Vec<u8>,
  tensor: InputTensor,
}

impl FrameEncoder {
  pub fn new(layout: &ModelLayout, input_size: u32) -> Self {
    let plane = input_size as usize * input_size as usize;
    Self {
      input_size,
      channel_first: layout.input_channel_first,
      resizer: Resizer::new(),
      options: ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
      pixels: vec![0u8; plane * RGB_CHANNELS],
      tensor: InputTensor::zeroed(layout, input_size as usize),
    }
  }

  pub fn input_size(&self) -> u32 {
    self.input_size
  }

  pub fn tensor(&self) -> &InputTensor {
    &self.tensor
  }

  /// 最近一帧缩放后的 RGB 像素（NHWC）
  pub fn pixels(&self) -> &[u8] {
    &self.pixels
  }

  pub fn encode(&mut self, image: &RgbImage) -> Result<&InputTensor, EncodeError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
      return Err(EncodeError::EmptyImage(width, height));
    }

    trace!(width, height, size = self.input_size, "缩放输入帧");

    {
      let src = ImageRef::new(width, height, image.as_raw(), PixelType::U8x3)?;
      let mut dst = Image::from_slice_u8(
        self.input_size,
        self.input_size,
        &mut self.pixels,
        PixelType::U8x3,
      )?;
      self.resizer.resize(&src, &mut dst, &self.options)?;
    }

    fill_tensor(&self.pixels, self.channel_first, &mut self.tensor);
    Ok(&self.tensor)
  }
}

fn fill_tensor(pixels: &[u8], channel_first: bool, tensor: &mut InputTensor) {
  let plane = pixels.len() / RGB_CHANNELS;

  match tensor {
    InputTensor::Quantized(data) if channel_first => {
      for (i, px) in pixels.chunks_exact(RGB_CHANNELS).enumerate() {
        data[i] = px[0];
        data[plane + i] = px[1];
        data[2 * plane + i] = px[2];
      }
    }
    InputTensor::Quantized(data) => data.copy_from_slice(pixels),
    InputTensor::Float(data) if channel_first => {
      for (i, px) in pixels.chunks_exact(RGB_CHANNELS).enumerate() {
        data[i] = px[0] as f32 / 255.0;
        data[plane + i] = px[1] as f32 / 255.0;
        data[2 * plane + i] = px[2] as f32 / 255.0;
      }
    }
    InputTensor::Float(data) => {
      for (dst, &src) in data.iter_mut().zip(pixels) {
        *dst = src as f32 / 255.0;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  fn layout(channel_first: bool, quantized: bool) -> ModelLayout {
    ModelLayout {
      input_channel_first: channel_first,
      input_quantized: quantized,
      output_channel_count: 6,
      output_anchor_count: 10,
      output_transposed: false,
    }
  }

  #[test]
  fn black_image_encodes_to_zero() {
    let image = RgbImage::new(37, 21);

    let mut float = FrameEncoder::new(&layout(true, false), 8);
    let tensor = float.encode(&image).unwrap();
    assert_eq!(tensor.len(), 8 * 8 * 3);
    assert_eq!(tensor.byte_len(), 8 * 8 * 3 * 4);
    assert!(tensor.as_f32().unwrap().iter().all(|&v| v == 0.0));

    let mut quantized = FrameEncoder::new(&layout(false, true), 8);
    let tensor = quantized.encode(&image).unwrap();
    assert_eq!(tensor.byte_len(), 8 * 8 * 3);
    assert!(tensor.as_u8().unwrap().iter().all(|&v| v == 0));
  }

  #[test]
  fn channel_last_interleaves_rgb() {
    let image = RgbImage::from_pixel(4, 4, Rgb([10, 20, 30]));
    let mut encoder = FrameEncoder::new(&layout(false, true), 4);
    let data = encoder.encode(&image).unwrap().as_u8().unwrap().to_vec();

    for px in data.chunks_exact(3) {
      assert!(px[0].abs_diff(10) <= 1);
      assert!(px[1].abs_diff(20) <= 1);
      assert!(px[2].abs_diff(30) <= 1);
    }
  }

  #[test]
  fn channel_first_writes_planes() {
    let image = RgbImage::from_pixel(6, 3, Rgb([255, 0, 51]));
    let mut encoder = FrameEncoder::new(&layout(true, false), 4);
    let data = encoder.encode(&image).unwrap().as_f32().unwrap().to_vec();
    let plane = 4 * 4;

    assert_eq!(data.len(), 3 * plane);
    assert!(data[..plane].iter().all(|&v| (v - 1.0).abs() < 0.01));
    assert!(data[plane..2 * plane].iter().all(|&v| v.abs() < 0.01));
    assert!(data[2 * plane..].iter().all(|&v| (v - 0.2).abs() < 0.01));
  }

  #[test]
  fn frames_overwrite_previous_content() {
    let mut encoder = FrameEncoder::new(&layout(false, true), 4);
    encoder
      .encode(&RgbImage::from_pixel(4, 4, Rgb([200, 200, 200])))
      .unwrap();
    let data = encoder.encode(&RgbImage::new(9, 9)).unwrap();
    assert!(data.as_u8().unwrap().iter().all(|&v| v == 0));
    assert!(encoder.pixels().iter().all(|&v| v == 0));
  }

  #[test]
  fn empty_image_is_rejected() {
    let mut encoder = FrameEncoder::new(&layout(true, false), 4);
    let err = encoder.encode(&RgbImage::new(0, 5)).unwrap_err();
    assert!(matches!(err, EncodeError::EmptyImage(0, 5)));
  }
}
