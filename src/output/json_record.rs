// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/json_record.rs - 以 JSON Lines 记录检测结果
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

use std::{
  fs::{File, OpenOptions},
  io::{BufWriter, Write},
  path::PathBuf,
};

use chrono::{SecondsFormat, Utc};
use image::RgbImage;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{DetectResult, Detection},
  output::Render,
  url_to_path,
};

#[derive(Error, Debug)]
pub enum JsonRecordError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// `json:///path/out.jsonl`，每帧追加一行
pub struct JsonRecordOutput {
  path: PathBuf,
  writer: BufWriter<File>,
  frames: u64,
}

impl FromUrlWithScheme for JsonRecordOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonRecordOutput {
  type Error = JsonRecordError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(JsonRecordError::SchemeMismatch(uri.scheme().to_string()));
    }

    let path = url_to_path(uri);
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    info!("检测结果记录到: {}", path.display());

    Ok(JsonRecordOutput {
      path,
      writer: BufWriter::new(file),
      frames: 0,
    })
  }
}

fn detection_record(detection: &Detection) -> Value {
  let b = &detection.bbox;
  json!({
    "label": &*detection.label,
    "class_index": detection.class_index,
    "confidence": detection.confidence,
    "bbox": [b.left, b.top, b.right, b.bottom],
  })
}

impl Render<RgbImage, DetectResult> for JsonRecordOutput {
  type Error = JsonRecordError;

  fn render_result(&mut self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    let record = json!({
      "frame": self.frames,
      "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
      "width": frame.width(),
      "height": frame.height(),
      "detections": result.items.iter().map(detection_record).collect::<Vec<_>>(),
    });

    serde_json::to_writer(&mut self.writer, &record)?;
    self.writer.write_all(b"\n")?;
    self.writer.flush()?;
    self.frames += 1;

    debug!("第 {} 帧结果写入 {}", self.frames, self.path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::BoundingBox;
  use std::sync::Arc;

  #[test]
  fn appends_one_object_per_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records").join("out.jsonl");
    let url = Url::parse(&format!("json://{}", path.display())).unwrap();
    let mut output = JsonRecordOutput::from_url(&url).unwrap();

    let result = DetectResult::from(vec![Detection {
      bbox: BoundingBox::new(0.25, 0.5, 0.75, 1.0),
      class_index: 3,
      label: Arc::from("car"),
      confidence: 0.5,
    }]);
    let frame = RgbImage::new(8, 6);
    output.render_result(&frame, &result).unwrap();
    output.render_result(&frame, &DetectResult::default()).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<Value> = text
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect();
    assert_eq!(lines.len(), 2);

    assert_eq!(lines[0]["frame"], 0);
    assert_eq!(lines[0]["width"], 8);
    assert!(lines[0]["timestamp"].is_string());
    let detection = &lines[0]["detections"][0];
    assert_eq!(detection["label"], "car");
    assert_eq!(detection["class_index"], 3);
    assert_eq!(detection["confidence"], 0.5);
    assert_eq!(detection["bbox"], json!([0.25, 0.5, 0.75, 1.0]));

    assert_eq!(lines[1]["frame"], 1);
    assert_eq!(lines[1]["detections"], json!([]));
  }
}
