use serde::{Deserialize, Serialize};

use crate::core::video::Frame;
use crate::frame_extractor::analyzer::LocalAnalysis;
use crate::frame_extractor::remote::VisionVerdict;
use crate::frame_extractor::settings::OutputFormat;

/// 各项分数均在 [0,1]
///
/// 极性不对称：`subtitle_score` 是“没有字幕”的置信度（越高越干净），
/// `people_score` 是“有人物”的置信度。加权逻辑依赖这一约定。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSet {
    pub static_score: f32,
    pub subtitle_score: f32,
    pub people_score: f32,
    pub quality_score: f32,
    pub diversity_score: f32,
}

impl ScoreSet {
    /// 快速拒绝时的固定分数
    pub fn quick_reject() -> Self {
        Self {
            static_score: 0.1,
            subtitle_score: 1.0,
            people_score: 0.0,
            quality_score: 0.1,
            diversity_score: 0.0,
        }
    }

    pub fn clamped(self) -> Self {
        Self {
            static_score: self.static_score.clamp(0.0, 1.0),
            subtitle_score: self.subtitle_score.clamp(0.0, 1.0),
            people_score: self.people_score.clamp(0.0, 1.0),
            quality_score: self.quality_score.clamp(0.0, 1.0),
            diversity_score: self.diversity_score.clamp(0.0, 1.0),
        }
    }
}

/// 单个任务处理过程中的候选帧，处理结束即丢弃
#[derive(Debug, Clone)]
pub struct FrameCandidate {
    pub source_index: usize,
    pub time_secs: f64,
    /// 像素归候选独占，直到渲染成缩略图或被丢弃
    pub frame: Frame,
    pub local: LocalAnalysis,
    /// 本地分数与远程结论合并后的分数
    pub scores: ScoreSet,
    pub remote: Option<VisionVerdict>,
    pub weighted_score: f32,
}

impl FrameCandidate {
    pub fn new(frame: Frame, local: LocalAnalysis) -> Self {
        Self {
            source_index: frame.index,
            time_secs: frame.timestamp_secs,
            scores: local.scores,
            local,
            frame,
            remote: None,
            weighted_score: 0.0,
        }
    }

    /// 未被快速拒绝的候选才算合格
    pub fn is_qualifying(&self) -> bool {
        !self.local.quick_rejected
    }

    pub fn remotely_analyzed(&self) -> bool {
        self.remote.is_some()
    }
}

/// 占位图类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaceholderKind {
    /// 近全黑的帧
    Blank,
    /// 渲染内部失败
    RenderFailed,
}

impl PlaceholderKind {
    pub fn label(&self) -> &'static str {
        match self {
            PlaceholderKind::Blank => "blank frame",
            PlaceholderKind::RenderFailed => "render failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thumbnail {
    pub id: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub timestamp_secs: f64,
    pub quality_score: f32,
    pub weighted_score: f32,
    pub is_primary: bool,
    pub remote_analyzed: bool,
    pub placeholder: Option<PlaceholderKind>,
}
