//! 每批次的提取设置，由调用方保存/恢复，流水线内部只读

use serde::{Deserialize, Serialize};

use crate::core::error::SettingsError;

pub const DEFAULT_CONCURRENT_VIDEO_LIMIT: usize = 2;
pub const MAX_CONCURRENT_VIDEO_LIMIT: usize = 8;
pub const MAX_TARGET_THUMBNAIL_COUNT: usize = 100;
pub const MAX_SAMPLES_PER_THUMBNAIL: usize = 32;
const MAX_REMOTE_TOP_K_FACTOR: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameIntervalStrategy {
    Uniform,
    Random,
    /// 长视频默认：开头与高潮部分采样更密
    #[default]
    KeyframeWeighted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
    Bmp,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::Bmp => "bmp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Bmp => "image/bmp",
        }
    }
}

/// 用户偏好权重，0 表示不关心该项
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectionPreferences {
    pub prioritize_static: f32,
    pub avoid_subtitles: f32,
    pub prefer_people: f32,
    pub avoid_empty_frames: f32,
}

impl Default for SelectionPreferences {
    fn default() -> Self {
        Self {
            prioritize_static: 0.2,
            avoid_subtitles: 0.3,
            prefer_people: 0.2,
            avoid_empty_frames: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCredentials {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionSettings {
    pub start_time_secs: f64,
    pub concurrent_video_limit: usize,
    pub output_format: OutputFormat,
    pub target_thumbnail_count: usize,
    pub frame_interval_strategy: FrameIntervalStrategy,
    pub keep_original_resolution: bool,
    pub enable_remote_filter: bool,
    pub remote_filter_credentials: Option<RemoteCredentials>,
    pub preferences: SelectionPreferences,
    /// 相似度高于该值视为近重复
    pub diversity_threshold: f32,
    /// 每张目标缩略图采样的候选帧数
    pub samples_per_thumbnail: usize,
    pub output_max_width: u32,
    pub output_max_height: u32,
    pub output_quality: u8,
    /// 远程分析的候选数 = 目标数 × 该系数
    pub remote_top_k_factor: f32,
    /// 固定后 random/jitter 采样可复现
    pub random_seed: Option<u64>,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            start_time_secs: 0.0,
            concurrent_video_limit: DEFAULT_CONCURRENT_VIDEO_LIMIT,
            output_format: OutputFormat::Jpeg,
            target_thumbnail_count: 5,
            frame_interval_strategy: FrameIntervalStrategy::KeyframeWeighted,
            keep_original_resolution: false,
            enable_remote_filter: false,
            remote_filter_credentials: None,
            preferences: SelectionPreferences::default(),
            diversity_threshold: 0.8,
            samples_per_thumbnail: 4,
            output_max_width: 640,
            output_max_height: 360,
            output_quality: 85,
            remote_top_k_factor: 2.5,
            random_seed: None,
        }
    }
}

impl ExtractionSettings {
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let settings: ExtractionSettings = serde_json::from_str(json)?;
        settings.validate()
    }

    pub fn to_json(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 校验并钳制到合法范围
    pub fn validate(mut self) -> Result<Self, SettingsError> {
        if self.target_thumbnail_count == 0 {
            return Err(SettingsError::Invalid(
                "targetThumbnailCount must be at least 1".to_string(),
            ));
        }
        if self.target_thumbnail_count > MAX_TARGET_THUMBNAIL_COUNT {
            return Err(SettingsError::Invalid(format!(
                "targetThumbnailCount {} exceeds {}",
                self.target_thumbnail_count, MAX_TARGET_THUMBNAIL_COUNT
            )));
        }
        if !self.start_time_secs.is_finite() || self.start_time_secs < 0.0 {
            return Err(SettingsError::Invalid(format!(
                "startTimeSecs {} is not a valid offset",
                self.start_time_secs
            )));
        }
        if !(0.0..=1.0).contains(&self.diversity_threshold) {
            return Err(SettingsError::Invalid(format!(
                "diversityThreshold {} outside [0, 1]",
                self.diversity_threshold
            )));
        }
        if self.output_max_width == 0 || self.output_max_height == 0 {
            return Err(SettingsError::Invalid("output bounds must be non-zero".to_string()));
        }

        self.concurrent_video_limit = self
            .concurrent_video_limit
            .clamp(1, MAX_CONCURRENT_VIDEO_LIMIT);
        self.samples_per_thumbnail = self.samples_per_thumbnail.clamp(1, MAX_SAMPLES_PER_THUMBNAIL);
        self.output_quality = self.output_quality.clamp(1, 100);
        self.remote_top_k_factor = self.remote_top_k_factor.clamp(1.0, MAX_REMOTE_TOP_K_FACTOR);
        Ok(self)
    }

    /// 本次需要采样的时间点数
    pub fn requested_sample_count(&self) -> usize {
        self.target_thumbnail_count
            .saturating_mul(self.samples_per_thumbnail)
            .max(self.target_thumbnail_count)
    }

    /// 远程分析的 top-K
    pub fn remote_top_k(&self) -> usize {
        (self.target_thumbnail_count as f32 * self.remote_top_k_factor).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ExtractionSettings::default();
        assert_eq!(settings.concurrent_video_limit, 2);
        assert_eq!(settings.frame_interval_strategy, FrameIntervalStrategy::KeyframeWeighted);
        assert_eq!(settings.requested_sample_count(), 20);
        assert_eq!(settings.remote_top_k(), 13);
    }

    #[test]
    fn test_json_roundtrip_uses_camel_case() {
        let settings = ExtractionSettings {
            target_thumbnail_count: 3,
            frame_interval_strategy: FrameIntervalStrategy::Random,
            enable_remote_filter: true,
            remote_filter_credentials: Some(RemoteCredentials {
                endpoint: "https://vision.example/analyze".to_string(),
                api_key: None,
            }),
            ..Default::default()
        };

        let json = settings.to_json().unwrap();
        assert!(json.contains("\"targetThumbnailCount\": 3"));
        assert!(json.contains("\"random\""));

        let restored = ExtractionSettings::from_json(&json).unwrap();
        assert_eq!(restored, settings);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let restored = ExtractionSettings::from_json(
            r#"{"targetThumbnailCount": 4, "frameIntervalStrategy": "keyframe-weighted", "outputFormat": "png"}"#,
        )
        .unwrap();
        assert_eq!(restored.target_thumbnail_count, 4);
        assert_eq!(restored.output_format, OutputFormat::Png);
        assert_eq!(restored.diversity_threshold, 0.8);
    }

    #[test]
    fn test_validate_clamps_limit() {
        let settings = ExtractionSettings {
            concurrent_video_limit: 64,
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(settings.concurrent_video_limit, MAX_CONCURRENT_VIDEO_LIMIT);

        let zero = ExtractionSettings {
            concurrent_video_limit: 0,
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(zero.concurrent_video_limit, 1);
    }

    #[test]
    fn test_validate_rejects_zero_target() {
        let result = ExtractionSettings {
            target_thumbnail_count: 0,
            ..Default::default()
        }
        .validate();
        assert!(matches!(result, Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn test_oversized_counts_from_json() {
        let result = ExtractionSettings::from_json(r#"{"targetThumbnailCount": 9223372036854775807}"#);
        assert!(matches!(result, Err(SettingsError::Invalid(_))));

        let result = ExtractionSettings::from_json(r#"{"targetThumbnailCount": 1000000000}"#);
        assert!(matches!(result, Err(SettingsError::Invalid(_))));

        let settings = ExtractionSettings::from_json(
            r#"{"targetThumbnailCount": 100, "samplesPerThumbnail": 18446744073709551615, "remoteTopKFactor": 1e30}"#,
        )
        .unwrap();
        assert_eq!(settings.samples_per_thumbnail, MAX_SAMPLES_PER_THUMBNAIL);
        assert_eq!(settings.requested_sample_count(), 100 * MAX_SAMPLES_PER_THUMBNAIL);
        assert_eq!(settings.remote_top_k(), 1000);
    }

    #[test]
    fn test_requested_sample_count_saturates() {
        let settings = ExtractionSettings {
            target_thumbnail_count: usize::MAX,
            samples_per_thumbnail: 4,
            ..Default::default()
        };
        assert_eq!(settings.requested_sample_count(), usize::MAX);
    }
}
