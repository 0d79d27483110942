// 该文件是 Qianli （千里眼） 项目的一部分。
// src/input/read_image_file.rs - 读取图像文件与图像目录
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

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, url_to_path};

const READ_IMAGE_FILE_SCHEME: &str = "image";
const READ_DIRECTORY_SCHEME: &str = "dir";
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("I/O 错误: {path}: {source}")]
  IoError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("图像加载错误: {path}: {source}")]
  ImageLoadError {
    path: PathBuf,
    #[source]
    source: image::ImageError,
  },
  #[error("目录中没有图像文件: {0}")]
  EmptyDirectory(PathBuf),
}

fn check_scheme(url: &Url, expected: &'static str) -> Result<(), ImageFileInputError> {
  if url.scheme() != expected {
    error!(
      "URI 方案不匹配: 期望 '{}', 实际 '{}'",
      expected,
      url.scheme()
    );
    return Err(ImageFileInputError::SchemeMismatch {
      expected,
      actual: url.scheme().to_string(),
    });
  }
  Ok(())
}

/// 解码图像文件并转换为 RGB，透明通道被丢弃
pub fn load_rgb_image(path: &Path) -> Result<RgbImage, ImageFileInputError> {
  let image = ImageReader::open(path)
    .map_err(|source| ImageFileInputError::IoError {
      path: path.to_path_buf(),
      source,
    })?
    .decode()
    .map_err(|source| ImageFileInputError::ImageLoadError {
      path: path.to_path_buf(),
      source,
    })?;
  debug!(
    "读取图像 {}: {}x{} {:?}",
    path.display(),
    image.width(),
    image.height(),
    image.color()
  );
  Ok(image.into_rgb8())
}

/// 单张图像，只产出一帧
pub struct ImageFileInput {
  image: Option<RgbImage>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = READ_IMAGE_FILE_SCHEME;
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_scheme(url, Self::SCHEME)?;
    let image = load_rgb_image(&url_to_path(url))?;
    Ok(ImageFileInput { image: Some(image) })
  }
}

impl Iterator for ImageFileInput {
  type Item = RgbImage;

  fn next(&mut self) -> Option<Self::Item> {
    self.image.take()
  }
}

/// 目录中的全部图像，按文件名字典序逐张读取
pub struct DirectoryInput {
  files: std::vec::IntoIter<PathBuf>,
}

impl FromUrlWithScheme for DirectoryInput {
  const SCHEME: &'static str = READ_DIRECTORY_SCHEME;
}

impl FromUrl for DirectoryInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_scheme(url, Self::SCHEME)?;
    DirectoryInput::open(&url_to_path(url))
  }
}

fn is_image_file(path: &Path) -> bool {
  path.is_file()
    && path
      .extension()
      .and_then(|ext| ext.to_str())
      .map(|ext| {
        IMAGE_EXTENSIONS
          .iter()
          .any(|known| ext.eq_ignore_ascii_case(known))
      })
      .unwrap_or(false)
}

impl DirectoryInput {
  pub fn open(directory: &Path) -> Result<Self, ImageFileInputError> {
    let io_error = |source| ImageFileInputError::IoError {
      path: directory.to_path_buf(),
      source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(directory).map_err(io_error)? {
      let path = entry.map_err(io_error)?.path();
      if is_image_file(&path) {
        files.push(path);
      }
    }

    if files.is_empty() {
      return Err(ImageFileInputError::EmptyDirectory(directory.to_path_buf()));
    }
    files.sort();

    info!("目录 {} 中共有 {} 张图像", directory.display(), files.len());
    Ok(DirectoryInput {
      files: files.into_iter(),
    })
  }
}

impl Iterator for DirectoryInput {
  type Item = RgbImage;

  fn next(&mut self) -> Option<Self::Item> {
    for path in self.files.by_ref() {
      match load_rgb_image(&path) {
        Ok(image) => return Some(image),
        Err(e) => warn!("跳过无法读取的图像: {}", e),
      }
    }
    None
  }
}
