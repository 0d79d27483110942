// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/save_image_file.rs - 保存绘制后的图像文件
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

use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::DetectResult,
  output::{
    Render,
    draw::{Draw, DrawError},
  },
  url_to_path,
};

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("绘制错误: {0}")]
  DrawError(#[from] DrawError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// `image:///path/out.png?font=/path/font.ttf`
///
/// 第一帧写入给定路径，之后的帧在文件名后追加帧序号。
pub struct SaveImageFileOutput {
  path: PathBuf,
  draw: Draw,
  frames: u64,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let draw = match uri.query_pairs().find(|(k, _)| k == "font") {
      Some((_, font)) => Draw::with_font_file(Path::new(font.as_ref()))?,
      None => Draw::default(),
    };

    Ok(SaveImageFileOutput {
      path: url_to_path(uri),
      draw,
      frames: 0,
    })
  }
}

impl SaveImageFileOutput {
  fn frame_path(&self) -> PathBuf {
    if self.frames == 0 {
      return self.path.clone();
    }
    let stem = self
      .path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_default();
    let name = match self.path.extension() {
      Some(ext) => format!("{}-{:06}.{}", stem, self.frames, ext.to_string_lossy()),
      None => format!("{}-{:06}", stem, self.frames),
    };
    self.path.with_file_name(name)
  }

  fn save_image(&mut self, image: &RgbImage) -> Result<(), SaveImageFileError> {
    let path = self.frame_path();
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save(&path)?;
    self.frames += 1;

    info!("保存图像到文件: {}", path.display());
    Ok(())
  }
}

impl Render<RgbImage, DetectResult> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(&mut self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    let mut image = frame.clone();
    self.draw.draw_detections(&mut image, &result.items);
    self.save_image(&image)
  }
}
