// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output.rs - 检测结果输出
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

use image::RgbImage;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, model::DetectResult};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&mut self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

#[cfg(feature = "save_image_file")]
pub mod draw;

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "json_record")]
mod json_record;
#[cfg(feature = "json_record")]
pub use self::json_record::{JsonRecordError, JsonRecordOutput};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[cfg(feature = "json_record")]
  #[error("JSON 记录错误: {0}")]
  JsonRecordError(#[from] JsonRecordError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 只把检测结果写进日志
#[derive(Debug, Default)]
pub struct LogOutput {
  frames: u64,
}

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(LogOutput::default())
  }
}

impl Render<RgbImage, DetectResult> for LogOutput {
  type Error = OutputError;

  fn render_result(&mut self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    self.frames += 1;
    info!(
      frame = self.frames,
      width = frame.width(),
      height = frame.height(),
      detections = result.items.len(),
      "检测结果"
    );
    for item in result.items.iter() {
      let b = &item.bbox;
      info!(
        "  {} ({}) {:.2} [{:.4}, {:.4}, {:.4}, {:.4}]",
        item.label, item.class_index, item.confidence, b.left, b.top, b.right, b.bottom
      );
    }
    Ok(())
  }
}

pub enum OutputWrapper {
  #[cfg(feature = "save_image_file")]
  SaveImageFile(SaveImageFileOutput),
  #[cfg(feature = "json_record")]
  JsonRecord(JsonRecordOutput),
  Log(LogOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => Ok(OutputWrapper::SaveImageFile(
        SaveImageFileOutput::from_url(url)?,
      )),
      #[cfg(feature = "json_record")]
      JsonRecordOutput::SCHEME => Ok(OutputWrapper::JsonRecord(JsonRecordOutput::from_url(url)?)),
      LogOutput::SCHEME => Ok(OutputWrapper::Log(LogOutput::from_url(url)?)),
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Render<RgbImage, DetectResult> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&mut self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFile(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "json_record")]
      OutputWrapper::JsonRecord(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      OutputWrapper::Log(output) => output.render_result(frame, result),
    }
  }
}
