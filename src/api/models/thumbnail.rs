use serde::{Deserialize, Serialize};

use crate::core::video::{FrameListSource, RawFrame};
use crate::frame_extractor::candidate::Thumbnail;
use crate::frame_extractor::orchestrator::VideoJob;
use crate::frame_extractor::state_machine::{JobStatus, RetryAction};

/// 平台解码器输出的一帧 YUV420
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedFrame {
    pub timestamp_secs: f64,
    pub y_plane: Vec<u8>,
    pub u_plane: Vec<u8>,
    pub v_plane: Vec<u8>,
}

/// 一个视频的解码结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedVideo {
    pub label: String,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub frames: Vec<DecodedFrame>,
}

impl From<DecodedVideo> for FrameListSource {
    fn from(video: DecodedVideo) -> Self {
        let (width, height) = (video.width, video.height);
        let frames = video
            .frames
            .into_iter()
            .map(|f| RawFrame {
                width,
                height,
                y_plane: f.y_plane,
                u_plane: f.u_plane,
                v_plane: f.v_plane,
                timestamp_secs: f.timestamp_secs,
            })
            .collect();
        FrameListSource::new(video.label, video.duration_secs, width, height, frames)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailDto {
    pub id: String,
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    pub timestamp_secs: f64,
    pub quality_score: f32,
    pub is_primary: bool,
    pub remote_analyzed: bool,
    /// 占位图时给出说明（“blank frame” / “render failed”）
    pub placeholder_label: Option<String>,
}

impl From<Thumbnail> for ThumbnailDto {
    fn from(t: Thumbnail) -> Self {
        Self {
            id: t.id,
            data: t.data,
            width: t.width,
            height: t.height,
            mime_type: t.format.mime_type().to_string(),
            timestamp_secs: t.timestamp_secs,
            quality_score: t.quality_score,
            is_primary: t.is_primary,
            remote_analyzed: t.remote_analyzed,
            placeholder_label: t.placeholder.map(|p| p.label().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: u64,
    pub label: String,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub thumbnails: Vec<ThumbnailDto>,
    pub selected_thumbnail_index: Option<u32>,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub retry_action: Option<RetryAction>,
    /// JobDiagnostics 的 JSON，便于原样上报
    pub diagnostics_json: Option<String>,
}

impl From<VideoJob> for JobSnapshot {
    fn from(job: VideoJob) -> Self {
        let (error_message, retry_action, diagnostics_json) = match job.terminal {
            Some(detail) => (
                detail.message,
                detail.retry_action,
                detail
                    .diagnostics
                    .and_then(|d| serde_json::to_string(&d).ok()),
            ),
            None => (None, None, None),
        };

        Self {
            id: job.id,
            label: job.label,
            duration_secs: job.duration_secs,
            width: job.width,
            height: job.height,
            status: job.status,
            progress_percent: job.progress_percent,
            thumbnails: job.thumbnails.into_iter().map(ThumbnailDto::from).collect(),
            selected_thumbnail_index: job.selected_thumbnail_index.map(|i| i as u32),
            attempts: job.attempts,
            error_message,
            retry_action,
            diagnostics_json,
        }
    }
}
