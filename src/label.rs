// 该文件是 Qianli （千里眼） 项目的一部分。
// src/label.rs - 类别标签表
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
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

/// 越界类别索引对应的标签
pub const UNKNOWN_LABEL: &str = "unknown";

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("无法读取标签文件 {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("标签文件为空: {0}")]
  Empty(PathBuf),
}

/// 按行排列的类别名称，第 n 行对应类别 n
#[derive(Debug, Clone)]
pub struct LabelTable {
  labels: Box<[Arc<str>]>,
  unknown: Arc<str>,
}

impl Default for LabelTable {
  fn default() -> Self {
    Self {
      labels: Box::default(),
      unknown: Arc::from(UNKNOWN_LABEL),
    }
  }
}

impl<S: Into<Arc<str>>> FromIterator<S> for LabelTable {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Self {
      labels: iter.into_iter().map(Into::into).collect(),
      ..Self::default()
    }
  }
}

impl LabelTable {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| LabelError::Io {
      path: path.to_path_buf(),
      source,
    })?;

    let table = Self::parse(&text);
    if table.is_empty() {
      return Err(LabelError::Empty(path.to_path_buf()));
    }

    info!("标签加载成功: {} 个类别", table.len());
    Ok(table)
  }

  /// 每行一个类别名，兼容 CRLF 换行
  pub fn parse(text: &str) -> Self {
    text.lines().collect()
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn label(&self, index: usize) -> &Arc<str> {
    self.labels.get(index).unwrap_or(&self.unknown)
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.labels.iter().map(|label| &**label)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn lines_map_to_class_indices() {
    let table = LabelTable::parse("person\r\nbicycle\ncar\n");
    assert_eq!(table.len(), 3);
    assert_eq!(&**table.label(0), "person");
    assert_eq!(&**table.label(1), "bicycle");
    assert_eq!(&**table.label(2), "car");
  }

  #[test]
  fn out_of_range_is_unknown() {
    let table: LabelTable = ["cat", "dog"].into_iter().collect();
    assert_eq!(&**table.label(2), UNKNOWN_LABEL);
    assert_eq!(&**LabelTable::default().label(0), UNKNOWN_LABEL);
  }

  #[test]
  fn reads_label_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.txt");
    std::fs::write(&path, "person\nbag\n").unwrap();

    let table = LabelTable::from_file(&path).unwrap();
    assert_eq!(table.iter().collect::<Vec<_>>(), vec!["person", "bag"]);
  }

  #[test]
  fn missing_or_empty_file_fails() {
    let dir = tempfile::tempdir().unwrap();

    let err = LabelTable::from_file(dir.path().join("missing.txt")).unwrap_err();
    assert!(matches!(err, LabelError::Io { .. }));

    let path = dir.path().join("empty.txt");
    std::fs::write(&path, "").unwrap();
    let err = LabelTable::from_file(&path).unwrap_err();
    assert!(matches!(err, LabelError::Empty(_)));
  }
}
