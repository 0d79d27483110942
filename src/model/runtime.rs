// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/runtime.rs - 推理运行时接口
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

use crate::frame::InputTensor;
use crate::layout::{ModelLayout, TensorInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOptions {
  /// 推理线程数提示
  pub threads: usize,
}

/// 单输入单输出的同步推理运行时
pub trait Runtime: Sized {
  type Error: std::error::Error + Send + Sync + 'static;

  /// 从内存中的模型文件创建运行时
  fn load(model: &[u8], options: &RuntimeOptions) -> Result<Self, Self::Error>;

  /// 模型声明的第一个输入张量
  fn input_tensor(&self) -> Option<TensorInfo>;

  /// 模型声明的第一个输出张量
  fn output_tensor(&self) -> Option<TensorInfo>;

  /// 布局确定后调用一次，运行时可据此固定输入形状
  fn prepare(&mut self, _layout: &ModelLayout, _input_size: u32) -> Result<(), Self::Error> {
    Ok(())
  }

  /// 执行一次推理，把第一个输出完整写入 `output`
  fn run(&mut self, input: &InputTensor, output: &mut [f32]) -> Result<(), Self::Error>;
}
