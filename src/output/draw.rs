// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/draw.rs - 在图像上绘制检测框与标签
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

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::info;

use crate::model::{BoundingBox, Detection};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_TEXT_COLOR: [u8; 3] = [255, 255, 255];
const BOX_THICKNESS: i32 = 2;

/// 按类别轮换的边框颜色
const PALETTE: [[u8; 3]; 6] = [
  [0, 0, 255],
  [255, 56, 56],
  [72, 249, 10],
  [255, 157, 151],
  [0, 194, 255],
  [255, 178, 29],
];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("字体文件读取错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

/// 检测结果绘制器。没有字体时只画边框。
pub struct Draw {
  font: Option<FontVec>,
  font_size: f32,
  thickness: i32,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font: None,
      font_size: LABEL_FONT_SIZE,
      thickness: BOX_THICKNESS,
    }
  }
}

/// 把归一化边框换算为像素矩形，越界部分被裁掉，空矩形返回 `None`
pub fn pixel_rect(bbox: &BoundingBox, width: u32, height: u32) -> Option<Rect> {
  if width == 0 || height == 0 {
    return None;
  }
  let (w, h) = (width as f32, height as f32);

  let x_min = ((bbox.left * w).floor() as i32).clamp(0, width as i32 - 1);
  let y_min = ((bbox.top * h).floor() as i32).clamp(0, height as i32 - 1);
  let x_max = ((bbox.right * w).ceil() as i32).clamp(0, width as i32 - 1);
  let y_max = ((bbox.bottom * h).ceil() as i32).clamp(0, height as i32 - 1);

  if x_min >= x_max || y_min >= y_max {
    return None;
  }
  Some(Rect::at(x_min, y_min).of_size((x_max - x_min + 1) as u32, (y_max - y_min + 1) as u32))
}

impl Draw {
  pub fn with_font_file(path: &Path) -> Result<Self, DrawError> {
    let data = std::fs::read(path)?;
    let font = FontVec::try_from_vec(data)?;
    info!("加载标签字体: {}", path.display());
    Ok(Self {
      font: Some(font),
      ..Self::default()
    })
  }

  pub fn color_of(class_index: usize) -> Rgb<u8> {
    Rgb(PALETTE[class_index % PALETTE.len()])
  }

  pub fn draw_detections(&self, image: &mut RgbImage, detections: &[Detection]) {
    for detection in detections {
      self.draw_detection(image, detection);
    }
  }

  fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
    let Some(rect) = pixel_rect(&detection.bbox, image.width(), image.height()) else {
      return;
    };
    let color = Self::color_of(detection.class_index);

    // 向内收缩逐层描边
    for t in 0..self.thickness {
      let (w, h) = (
        rect.width() as i32 - 2 * t,
        rect.height() as i32 - 2 * t,
      );
      if w <= 0 || h <= 0 {
        break;
      }
      let inner = Rect::at(rect.left() + t, rect.top() + t).of_size(w as u32, h as u32);
      draw_hollow_rect_mut(image, inner, color);
    }

    if let Some(font) = &self.font {
      let label = format!("{} {:.2}", detection.label, detection.confidence);
      let scale = PxScale::from(self.font_size);
      let (text_width, text_height) = text_size(scale, font, &label);
      let label_height = text_height as i32 + 2 * LABEL_TEXT_VERTICAL_PADDING;

      // 标签放在边框上方，空间不足时贴着图像顶部
      let label_x = rect.left();
      let label_y = (rect.top() - label_height).max(0);
      let label_width = (text_width as i32).min(image.width() as i32 - label_x);

      if label_width > 0 && label_height > 0 {
        let background =
          Rect::at(label_x, label_y).of_size(label_width as u32, label_height as u32);
        draw_filled_rect_mut(image, background, color);
        draw_text_mut(
          image,
          Rgb(LABEL_TEXT_COLOR),
          label_x,
          label_y + LABEL_TEXT_VERTICAL_PADDING,
          scale,
          font,
          &label,
        );
      }
    }
  }
}
