//! 帧采样器 - 规划时间点，逐个 seek 并光栅化

use log::{debug, warn};
use rand::seq::index;
use rand::Rng;
use std::time::{Duration, Instant};

use crate::core::error::{JobDiagnostics, SourceError};
use crate::core::video::{Frame, VideoSource};
use crate::frame_extractor::analyzer::is_flat;
use crate::frame_extractor::pipeline::CancelToken;
use crate::frame_extractor::retry::RetryPolicy;
use crate::frame_extractor::settings::FrameIntervalStrategy;

/// 短视频上限（秒）
pub const SHORT_VIDEO_SECS: f64 = 30.0;
/// 中等长度上限（秒）
pub const MEDIUM_VIDEO_SECS: f64 = 300.0;

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub seek_timeout: Duration,
    /// keep_original_resolution=false 时的长边上限
    pub max_long_edge: u32,
    /// 末尾留出的安全距离，避免 seek 到最后一帧之后
    pub end_epsilon_secs: f64,
    /// 小于该间隔的时间点视为重复
    pub min_gap_secs: f64,
    pub uniform_jitter: f64,
    pub weighted_jitter: f64,
    /// 采样亮度极差不超过该值的帧视为退化（纯色/未绘制）
    pub degenerate_luma_range: u8,
    pub degenerate_stride: u32,
    pub max_medium_segments: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            seek_timeout: Duration::from_secs(5),
            max_long_edge: 1280,
            end_epsilon_secs: 0.05,
            min_gap_secs: 0.01,
            uniform_jitter: 0.3,
            weighted_jitter: 0.2,
            degenerate_luma_range: 3,
            degenerate_stride: 8,
            max_medium_segments: 6,
        }
    }
}

/// 计算 `[start, duration-ε)` 内排序去重后的采样时间点
pub fn plan_timestamps<R: Rng>(
    duration_secs: f64,
    start_secs: f64,
    count: usize,
    strategy: FrameIntervalStrategy,
    config: &SamplerConfig,
    rng: &mut R,
) -> Vec<f64> {
    let Some((from, to)) = usable_range(duration_secs, start_secs, config.end_epsilon_secs) else {
        return Vec::new();
    };
    if count == 0 {
        return Vec::new();
    }

    let mut points = Vec::with_capacity(count);
    match strategy {
        FrameIntervalStrategy::Uniform => {
            spread(from, to, count, config.uniform_jitter, rng, &mut points);
        }
        FrameIntervalStrategy::Random => {
            let segments = count * 2;
            let seg_len = (to - from) / segments as f64;
            for seg in index::sample(rng, segments, count).into_iter() {
                points.push(from + (seg as f64 + rng.gen::<f64>()) * seg_len);
            }
        }
        FrameIntervalStrategy::KeyframeWeighted => {
            plan_weighted(duration_secs, from, to, count, config, rng, &mut points);
        }
    }

    finalize(points, from, to, config.min_gap_secs)
}

/// 起始时间落在可用时长之外时返回 None，由调用方判为无帧
fn usable_range(duration_secs: f64, start_secs: f64, epsilon: f64) -> Option<(f64, f64)> {
    let to = duration_secs - epsilon;
    if !to.is_finite() || to <= 0.0 {
        return None;
    }
    let from = if start_secs.is_finite() { start_secs.max(0.0) } else { 0.0 };
    if from >= to {
        warn!(
            "⚠️ start time {:.2}s beyond usable duration {:.2}s, nothing to sample",
            start_secs, to
        );
        return None;
    }
    Some((from, to))
}

/// 在 `[from, to)` 内等距放置 n 个点，每点带 ±jitter/2 个间距的抖动
fn spread<R: Rng>(from: f64, to: f64, n: usize, jitter: f64, rng: &mut R, out: &mut Vec<f64>) {
    if n == 0 || to <= from {
        return;
    }
    let spacing = (to - from) / n as f64;
    for i in 0..n {
        let base = from + spacing * (i as f64 + 0.5);
        let offset = if jitter > 0.0 {
            rng.gen_range(-0.5..0.5) * jitter * spacing
        } else {
            0.0
        };
        out.push(base + offset);
    }
}

fn plan_weighted<R: Rng>(
    duration_secs: f64,
    from: f64,
    to: f64,
    count: usize,
    config: &SamplerConfig,
    rng: &mut R,
    out: &mut Vec<f64>,
) {
    let span = to - from;

    if duration_secs <= SHORT_VIDEO_SECS {
        spread(from, to, count, config.weighted_jitter * 0.5, rng, out);
    } else if duration_secs <= MEDIUM_VIDEO_SECS {
        let segments = count.clamp(1, config.max_medium_segments.max(1));
        let seg_len = span / segments as f64;
        for seg in 0..segments {
            let n = count / segments + usize::from(seg < count % segments);
            let seg_from = from + seg as f64 * seg_len;
            spread(seg_from, seg_from + seg_len, n, config.weighted_jitter, rng, out);
        }
    } else {
        // 40% 前四分之一，40% 中间一半，20% 最后四分之一
        let opening = ((count as f64) * 0.4).round() as usize;
        let middle = (((count as f64) * 0.4).round() as usize).min(count - opening);
        let closing = count - opening - middle;

        let q1 = from + span * 0.25;
        let q3 = from + span * 0.75;
        spread(from, q1, opening, config.weighted_jitter, rng, out);
        spread(q1, q3, middle, config.weighted_jitter, rng, out);
        spread(q3, to, closing, config.weighted_jitter, rng, out);
    }
}

fn finalize(mut points: Vec<f64>, from: f64, to: f64, min_gap: f64) -> Vec<f64> {
    points.retain(|t| t.is_finite() && *t >= from && *t < to);
    points.sort_by(|a, b| a.total_cmp(b));
    points.dedup_by(|b, a| (*b - *a).abs() < min_gap);
    points
}

/// 逐个时间点 seek + 光栅化（同一视频内严格串行）
pub struct FrameSampler<'a> {
    config: &'a SamplerConfig,
    retry: &'a RetryPolicy,
    keep_original_resolution: bool,
}

impl<'a> FrameSampler<'a> {
    pub fn new(config: &'a SamplerConfig, retry: &'a RetryPolicy, keep_original_resolution: bool) -> Self {
        Self {
            config,
            retry,
            keep_original_resolution,
        }
    }

    /// 单帧失败只跳过；致命错误（解码器/上下文不可用）直接返回 Err
    pub fn sample(
        &self,
        source: &mut dyn VideoSource,
        timestamps: &[f64],
        cancel: &CancelToken,
        diagnostics: &mut JobDiagnostics,
        mut on_progress: impl FnMut(usize, usize),
    ) -> Result<Vec<Frame>, SourceError> {
        let duration = source.duration_secs();
        let limit = duration - self.config.end_epsilon_secs;
        let mut frames = Vec::with_capacity(timestamps.len());
        diagnostics.requested_timestamps += timestamps.len();

        for (i, &t) in timestamps.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!("⏹️ sampling stopped at {}/{} (cancelled)", i, timestamps.len());
                break;
            }

            if !(0.0..limit).contains(&t) {
                diagnostics.skipped_timestamps += 1;
                diagnostics.record_error(SourceError::OutOfRange(t).to_string());
                continue;
            }

            let label = format!("capture@{:.2}s", t);
            match self.retry.run(&label, |_| self.capture(source, t)) {
                Ok(frame) => {
                    let mut frame = if self.keep_original_resolution {
                        frame
                    } else {
                        frame.cap_long_edge(self.config.max_long_edge)
                    };
                    frame.timestamp_secs = t;
                    frame.index = i;

                    if is_flat(&frame, self.config.degenerate_stride, self.config.degenerate_luma_range) {
                        debug!("⬛ degenerate frame at {:.2}s dropped", t);
                        diagnostics.degenerate_frames += 1;
                        diagnostics.skipped_timestamps += 1;
                    } else {
                        diagnostics.succeeded_timestamps += 1;
                        frames.push(frame);
                    }
                }
                Err(e) if e.is_fatal() => {
                    diagnostics.failed_timestamps += 1;
                    diagnostics.record_error(e.to_string());
                    return Err(e);
                }
                Err(e) => {
                    warn!("⚠️ skipping {:.2}s: {}", t, e);
                    diagnostics.failed_timestamps += 1;
                    diagnostics.record_error(e.to_string());
                }
            }

            on_progress(i + 1, timestamps.len());
        }

        Ok(frames)
    }

    fn capture(&self, source: &mut dyn VideoSource, t: f64) -> Result<Frame, SourceError> {
        let started = Instant::now();
        source.seek(t, self.config.seek_timeout)?;
        if started.elapsed() > self.config.seek_timeout {
            return Err(SourceError::SeekTimeout(t));
        }

        let frame = source.current_frame()?;
        if !frame.is_well_formed() {
            return Err(SourceError::Rasterize {
                time: t,
                reason: format!(
                    "buffer of {} bytes for {}x{}",
                    frame.data.len(),
                    frame.width,
                    frame.height
                ),
            });
        }
        Ok(frame)
    }
}
