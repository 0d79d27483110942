// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理后端
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

use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  tensor::TensorElementType,
  value::{TensorRef, ValueType},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  frame::InputTensor,
  layout::{ElementType, ModelLayout, TensorInfo},
  model::{Runtime, RuntimeOptions},
};

#[derive(Error, Debug)]
pub enum OnnxRuntimeError {
  #[error("ONNX Runtime 错误: {0}")]
  Ort(#[from] ort::Error),
  #[error("输入张量类型与模型不符: 模型为 {0:?}")]
  InputType(ElementType),
  #[error("输出大小不匹配: 期望 {expected}, 实际 {actual}")]
  OutputSize { expected: usize, actual: usize },
  #[error("运行前未调用 prepare")]
  NotPrepared,
}

pub struct OnnxRuntime {
  session: Session,
  input: Option<TensorInfo>,
  output: Option<TensorInfo>,
  input_shape: Option<[i64; 4]>,
  /// Int8 模型的输入按位重新解释
  signed: Vec<i8>,
}

fn element_type(ty: TensorElementType) -> ElementType {
  match ty {
    TensorElementType::Float32 => ElementType::Float32,
    TensorElementType::Uint8 => ElementType::UInt8,
    TensorElementType::Int8 => ElementType::Int8,
    _ => ElementType::Other,
  }
}

fn tensor_info(value_type: &ValueType) -> Option<TensorInfo> {
  match value_type {
    ValueType::Tensor { ty, shape, .. } => Some(TensorInfo::new(
      shape.iter().copied().collect::<Vec<i64>>(),
      element_type(*ty),
    )),
    _ => None,
  }
}

/// 批大小固定为 1
fn input_shape(layout: &ModelLayout, input_size: u32) -> [i64; 4] {
  let size = input_size as i64;
  if layout.input_channel_first {
    [1, 3, size, size]
  } else {
    [1, size, size, 3]
  }
}

impl Runtime for OnnxRuntime {
  type Error = OnnxRuntimeError;

  fn load(model: &[u8], options: &RuntimeOptions) -> Result<Self, Self::Error> {
    let session = Session::builder()?
      .with_optimization_level(GraphOptimizationLevel::Level3)?
      .with_intra_threads(options.threads)?
      .commit_from_memory(model)?;

    let input = session
      .inputs
      .first()
      .and_then(|input| tensor_info(&input.input_type));
    let output = session
      .outputs
      .first()
      .and_then(|output| tensor_info(&output.output_type));

    info!(
      inputs = session.inputs.len(),
      outputs = session.outputs.len(),
      threads = options.threads,
      "ONNX 会话已创建"
    );

    Ok(Self {
      session,
      input,
      output,
      input_shape: None,
      signed: Vec::new(),
    })
  }

  fn input_tensor(&self) -> Option<TensorInfo> {
    self.input.clone()
  }

  fn output_tensor(&self) -> Option<TensorInfo> {
    self.output.clone()
  }

  fn prepare(&mut self, layout: &ModelLayout, input_size: u32) -> Result<(), Self::Error> {
    let shape = input_shape(layout, input_size);
    debug!("输入形状固定为 {:?}", shape);
    self.input_shape = Some(shape);

    if self.input.as_ref().map(|info| info.element) == Some(ElementType::Int8) {
      self.signed = vec![0i8; layout.input_len(input_size as usize)];
    }
    Ok(())
  }

  fn run(&mut self, input: &InputTensor, output: &mut [f32]) -> Result<(), Self::Error> {
    let shape = self.input_shape.ok_or(OnnxRuntimeError::NotPrepared)?;
    let element = self
      .input
      .as_ref()
      .map(|info| info.element)
      .unwrap_or(ElementType::Other);

    let outputs = match (input, element) {
      (InputTensor::Float(data), ElementType::Float32) => self
        .session
        .run(ort::inputs![TensorRef::from_array_view((shape, &data[..]))?])?,
      (InputTensor::Quantized(data), ElementType::UInt8) => self
        .session
        .run(ort::inputs![TensorRef::from_array_view((shape, &data[..]))?])?,
      (InputTensor::Quantized(data), ElementType::Int8) => {
        for (dst, &src) in self.signed.iter_mut().zip(data.iter()) {
          *dst = src as i8;
        }
        self
          .session
          .run(ort::inputs![TensorRef::from_array_view((shape, &self.signed[..]))?])?
      }
      _ => return Err(OnnxRuntimeError::InputType(element)),
    };

    let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
    if data.len() != output.len() {
      return Err(OnnxRuntimeError::OutputSize {
        expected: output.len(),
        actual: data.len(),
      });
    }
    output.copy_from_slice(data);
    Ok(())
  }
}
