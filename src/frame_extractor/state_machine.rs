use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 单个视频任务的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
    /// 没有任何合格候选帧，属于正常结果而不是故障
    NoFrames,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::NoFrames | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::NoFrames => "no-frames",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// 终态下建议给用户的重试方式
    pub fn suggested_retry(&self) -> Option<RetryAction> {
        match self {
            JobStatus::NoFrames => Some(RetryAction::RelaxSettingsAndRetry),
            JobStatus::Error | JobStatus::Cancelled => Some(RetryAction::Retry),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryAction {
    Retry,
    RelaxSettingsAndRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Start,
    Complete,
    Fail,
    Empty,
    Cancel,
    /// 工作线程在阶段边界上确认取消
    CancelAcknowledged,
    Retry,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Start => "start",
            JobEvent::Complete => "complete",
            JobEvent::Fail => "fail",
            JobEvent::Empty => "finish without frames",
            JobEvent::Cancel => "cancel",
            JobEvent::CancelAcknowledged => "acknowledge cancel",
            JobEvent::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    RunPipeline,
    /// 写入终态结果并释放工作槽
    Finalize,
    /// 从等待队列移除，不做任何流水线工作
    DropFromQueue,
    /// 置位取消标记，等工作线程在阶段边界退出
    SignalCancel,
    /// 清空缩略图与进度后重新排队
    ResetAndEnqueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {} while {}", .event.name(), .from)]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub event: JobEvent,
}

impl JobStatus {
    pub fn transition(&self, event: JobEvent) -> Result<(JobStatus, JobAction), InvalidTransition> {
        use JobAction::*;
        use JobEvent as E;
        use JobStatus as S;

        let next = match (self, event) {
            (S::Pending, E::Start) => (S::Processing, RunPipeline),
            (S::Pending, E::Cancel) => (S::Cancelled, DropFromQueue),

            (S::Processing, E::Complete) => (S::Completed, Finalize),
            (S::Processing, E::Fail) => (S::Error, Finalize),
            (S::Processing, E::Empty) => (S::NoFrames, Finalize),
            // 协作式：状态保持 processing，直到工作线程确认
            (S::Processing, E::Cancel) => (S::Processing, SignalCancel),
            (S::Processing, E::CancelAcknowledged) => (S::Cancelled, Finalize),

            (S::Error | S::NoFrames | S::Cancelled, E::Retry) => (S::Pending, ResetAndEnqueue),

            (from, event) => return Err(InvalidTransition { from: *from, event }),
        };
        Ok(next)
    }
}

/// 任务生命周期：状态 + 尝试次数 + 取消请求
#[derive(Debug, Clone)]
pub struct JobLifecycle {
    status: JobStatus,
    attempts: u32,
    cancel_requested: bool,
}

impl JobLifecycle {
    pub fn new() -> Self {
        Self {
            status: JobStatus::Pending,
            attempts: 0,
            cancel_requested: false,
        }
    }

    pub fn apply(&mut self, event: JobEvent) -> Result<JobAction, InvalidTransition> {
        let (status, action) = self.status.transition(event)?;
        match action {
            JobAction::RunPipeline => self.attempts += 1,
            JobAction::SignalCancel => self.cancel_requested = true,
            JobAction::ResetAndEnqueue => self.cancel_requested = false,
            _ => {}
        }
        self.status = status;
        Ok(action)
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }
}

impl Default for JobLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
