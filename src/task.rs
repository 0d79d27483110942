// 该文件是 Qianli （千里眼） 项目的一部分。
// src/task.rs - 任务执行
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
  thread,
  time::{Duration, Instant},
};
use tracing::{info, warn};

use crate::{
  model::{FrameTiming, Model},
  output::Render,
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

pub struct OneShotTask;

impl<
  F,
  D,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
> Task<I, M, O> for OneShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, mut model: M, mut output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!("输入帧获取成功，开始推理...");
    let now = Instant::now();
    let result = model.infer(&frame)?;
    let elapsed = now.elapsed();
    info!("推理完成，耗时: {:.2?}", elapsed);
    if let Some(timing) = model.stage_timing() {
      log_timing("本帧", &timing);
    }
    output.render_result(&frame, &result)?;
    info!("渲染完成，总耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

fn log_timing(prefix: &str, timing: &FrameTiming) {
  info!(
    "{}分阶段耗时: 编码 {:.2?}, 推理 {:.2?}, 解码 {:.2?}, NMS {:.2?}",
    prefix, timing.encode, timing.infer, timing.decode, timing.suppress
  );
}

/// 对同一帧重复推理，统计平均耗时；前 `warmup` 次不计入
#[derive(Debug, Clone, Copy)]
pub struct RepeatShotTask {
  pub repeat: usize,
  pub warmup: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self {
      repeat: 1000,
      warmup: 2,
    }
  }
}

/// 重复推理的统计结果
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RepeatShotReport {
  pub measured: usize,
  pub average: Duration,
  pub stages: Option<FrameTiming>,
}

impl RepeatShotTask {
  pub fn measure<F, D, ME, RE, M, O>(
    &self,
    frame: &F,
    model: &mut M,
    output: &mut O,
  ) -> anyhow::Result<RepeatShotReport>
  where
    ME: std::error::Error + Sync + Send + 'static,
    RE: std::error::Error + Sync + Send + 'static,
    M: Model<Input = F, Output = D, Error = ME>,
    O: Render<F, D, Error = RE>,
  {
    if self.repeat <= self.warmup {
      anyhow::bail!(
        "重复次数 {} 必须大于预热次数 {}",
        self.repeat,
        self.warmup
      );
    }

    let mut total = Duration::ZERO;
    let mut stages: Option<FrameTiming> = None;
    for i in 0..self.repeat {
      let now = Instant::now();
      let result = model.infer(frame)?;
      let elapsed = now.elapsed();
      info!("({})推理完成，耗时: {:.2?}", i, elapsed);
      output.render_result(frame, &result)?;

      if i < self.warmup {
        continue;
      }
      total += elapsed;
      if let Some(timing) = model.stage_timing() {
        let sum = stages.get_or_insert_with(FrameTiming::default);
        sum.encode += timing.encode;
        sum.infer += timing.infer;
        sum.decode += timing.decode;
        sum.suppress += timing.suppress;
      }
    }

    let measured = self.repeat - self.warmup;
    let divisor = measured as u32;
    Ok(RepeatShotReport {
      measured,
      average: total / divisor,
      stages: stages.map(|sum| FrameTiming {
        encode: sum.encode / divisor,
        infer: sum.infer / divisor,
        decode: sum.decode / divisor,
        suppress: sum.suppress / divisor,
      }),
    })
  }
}

impl<
  F,
  D,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
> Task<I, M, O> for RepeatShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, mut model: M, mut output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!(
      "输入帧获取成功，开始推理 {} 次 (预热 {} 次)...",
      self.repeat, self.warmup
    );

    let report = self.measure(&frame, &mut model, &mut output)?;
    warn!(
      "平均推理时间: {:.2?} ({} 次)",
      report.average, report.measured
    );
    if let Some(stages) = report.stages {
      log_timing("平均", &stages);
    }

    Ok(())
  }
}

/// 逐帧处理全部输入，单帧推理失败时跳过该帧
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }
}

impl<
  F,
  D,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
> Task<I, M, O> for ContinuousTask
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, mut model: M, mut output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let (tx, rx) = std::sync::mpsc::channel();

    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;

    let mut frame_index = 0usize;
    let mut failed = 0usize;
    let mut now = Instant::now();
    for frame in input {
      frame_index += 1;
      info!("处理第 {} 帧图像", frame_index);
      match model.infer(&frame) {
        Ok(result) => {
          let elapsed_a = now.elapsed();
          output.render_result(&frame, &result)?;
          let elapsed_b = now.elapsed();
          info!("推理完成，耗时: {:.2?} / {:.2?}", elapsed_a, elapsed_b);
        }
        Err(e) => {
          failed += 1;
          warn!("第 {} 帧推理失败，跳过: {}", frame_index, e);
        }
      }
      now = Instant::now();

      if self.frame_number.map(|n| frame_index >= n).unwrap_or(false) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    info!("任务完成，共 {} 帧，失败 {} 帧", frame_index, failed);
    Ok(())
  }
}
