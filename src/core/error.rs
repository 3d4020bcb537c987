use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame_extractor::retry::Retryable;

/// 解码器/光栅化层错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("decoder unavailable: {0}")]
    Unavailable(String),
    #[error("seek to {0:.3}s timed out")]
    SeekTimeout(f64),
    #[error("seek to {time:.3}s failed: {reason}")]
    SeekFailed { time: f64, reason: String },
    #[error("rasterize at {time:.3}s failed: {reason}")]
    Rasterize { time: f64, reason: String },
    #[error("rasterization surface lost")]
    SurfaceLost,
    #[error("timestamp {0:.3}s is outside the playable range")]
    OutOfRange(f64),
}

impl SourceError {
    /// 解码器或渲染上下文不可用，整个任务必须终止
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Unavailable(_) | SourceError::SurfaceLost)
    }
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::SeekTimeout(_) | SourceError::SeekFailed { .. } | SourceError::Rasterize { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote analyzer returned status {0}")]
    Status(u16),
    #[error("remote analysis timed out")]
    Timeout,
    #[error("malformed remote response: {0}")]
    Malformed(String),
    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("image encode failed: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("pixel buffer does not match {width}x{height}")]
    InvalidBuffer { width: u32, height: u32 },
    #[error("encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings JSON invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// 任务诊断包：出错时附带足够信息，不必重跑即可排查
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDiagnostics {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub requested_timestamps: usize,
    pub succeeded_timestamps: usize,
    pub skipped_timestamps: usize,
    pub failed_timestamps: usize,
    pub degenerate_frames: usize,
    pub quick_rejected: usize,
    pub remote_attempted: usize,
    pub remote_analyzed: usize,
    pub error_samples: Vec<String>,
}

impl JobDiagnostics {
    pub const MAX_ERROR_SAMPLES: usize = 5;

    pub fn record_error(&mut self, message: impl Into<String>) {
        if self.error_samples.len() < Self::MAX_ERROR_SAMPLES {
            self.error_samples.push(message.into());
        }
    }
}

/// 单个任务的致命错误
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("video source failed: {source}")]
    Source {
        source: SourceError,
        diagnostics: Box<JobDiagnostics>,
    },
    #[error("invalid duration {0}")]
    InvalidDuration(f64),
    #[error("invalid resolution {0}x{1}")]
    InvalidResolution(u32, u32),
    #[error("video source was lost")]
    SourceMissing,
    #[error("job worker panicked")]
    Panicked,
    #[error("worker pool: {0}")]
    WorkerPool(String),
}

impl ExtractionError {
    pub fn diagnostics(&self) -> Option<&JobDiagnostics> {
        match self {
            ExtractionError::Source { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

impl Retryable for ExtractionError {
    fn is_retryable(&self) -> bool {
        matches!(self, ExtractionError::WorkerPool(_))
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum OrchestratorError {
    #[error("unknown job {0}")]
    UnknownJob(u64),
    #[error("job {id} cannot {action} while {status}")]
    InvalidState {
        id: u64,
        action: &'static str,
        status: String,
    },
    #[error("thumbnail index {0} out of range")]
    ThumbnailIndex(usize),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("orchestrator is shut down")]
    ShutDown,
    #[error("worker pool: {0}")]
    WorkerPool(String),
}
