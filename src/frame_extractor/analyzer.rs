//! 本地启发式分析 - 快速拒绝、字幕/人物/清晰度/画质信号
//!
//! 所有检测按固定步长采样，开销与采样点数成正比而不是与分辨率成正比。

use log::debug;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::core::video::{luma, Frame};
use crate::frame_extractor::candidate::{FrameCandidate, ScoreSet};
use crate::frame_extractor::similarity::SimilarityMatrix;
use crate::frame_extractor::text_detector::{BandTextDetector, TextDetector};

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub sample_stride: u32,
    /// 亮度标准差低于该值且边缘极少时判为近纯色
    pub uniform_luma_std: f32,
    pub edge_delta: u8,
    pub min_edge_ratio: f32,
    /// 皮肤像素占比达到该值时 people_score 饱和
    pub people_saturation_ratio: f32,
    /// 平均水平梯度达到该值时清晰度为 1
    pub sharpness_norm: f32,
    /// 边缘占比达到该值时该项为 1
    pub edge_norm: f32,
    /// 时间稳定性在 static_score 中的权重
    pub temporal_static_weight: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sample_stride: 4,
            uniform_luma_std: 6.0,
            edge_delta: 16,
            min_edge_ratio: 0.02,
            people_saturation_ratio: 0.2,
            sharpness_norm: 40.0,
            edge_norm: 0.3,
            temporal_static_weight: 0.5,
        }
    }
}

impl AnalyzerConfig {
    pub fn for_fast_preview() -> Self {
        Self {
            sample_stride: 8,
            ..Default::default()
        }
    }

    pub fn for_high_quality() -> Self {
        Self {
            sample_stride: 2,
            ..Default::default()
        }
    }
}

/// 快速拒绝的统计量
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuickCheck {
    pub mean_luma: f32,
    pub luma_std: f32,
    pub edge_ratio: f32,
    pub is_uniform: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalAnalysis {
    pub scores: ScoreSet,
    /// 平均亮度 0-1
    pub brightness: f32,
    pub sharpness: f32,
    pub edge_ratio: f32,
    pub subtitle_detected: bool,
    pub quick_rejected: bool,
}

pub struct LocalAnalyzer {
    config: AnalyzerConfig,
    text_detector: Box<dyn TextDetector>,
}

impl LocalAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let detector = BandTextDetector::new().with_stride((config.sample_stride / 2).max(1));
        Self::with_text_detector(config, Box::new(detector))
    }

    pub fn with_text_detector(config: AnalyzerConfig, text_detector: Box<dyn TextDetector>) -> Self {
        Self {
            config,
            text_detector,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// 缓冲与尺寸不符的帧按纯色处理，不读像素
    pub fn quick_check(&self, frame: &Frame) -> QuickCheck {
        if !frame.is_well_formed() {
            return QuickCheck {
                mean_luma: 0.0,
                luma_std: 0.0,
                edge_ratio: 0.0,
                is_uniform: true,
            };
        }
        let stride = self.config.sample_stride.max(1);
        let mut sum = 0u64;
        let mut sum_sq = 0u64;
        let mut count = 0u64;
        let mut edges = 0u32;
        let mut pairs = 0u32;

        for y in (0..frame.height).step_by(stride as usize) {
            for x in (0..frame.width).step_by(stride as usize) {
                let l = frame.luma_at(x, y) as u64;
                sum += l;
                sum_sq += l * l;
                count += 1;

                if x + stride < frame.width {
                    let next = frame.luma_at(x + stride, y) as i16;
                    if (l as i16 - next).unsigned_abs() > self.config.edge_delta as u16 {
                        edges += 1;
                    }
                    pairs += 1;
                }
            }
        }

        let mean = sum as f64 / count as f64;
        let variance = (sum_sq as f64 / count as f64 - mean * mean).max(0.0);
        let luma_std = variance.sqrt() as f32;
        let edge_ratio = if pairs == 0 {
            0.0
        } else {
            edges as f32 / pairs as f32
        };

        QuickCheck {
            mean_luma: mean as f32,
            luma_std,
            edge_ratio,
            is_uniform: luma_std < self.config.uniform_luma_std
                && edge_ratio < self.config.min_edge_ratio,
        }
    }

    pub fn analyze(&self, frame: &Frame) -> LocalAnalysis {
        let quick = self.quick_check(frame);
        let brightness = quick.mean_luma / 255.0;

        if quick.is_uniform {
            return LocalAnalysis {
                scores: ScoreSet::quick_reject(),
                brightness,
                sharpness: 0.0,
                edge_ratio: quick.edge_ratio,
                subtitle_detected: false,
                quick_rejected: true,
            };
        }

        let stride = self.config.sample_stride.max(1);
        let text = self.text_detector.detect(frame);
        let skin = skin_ratio(frame, stride);
        let sharpness = sharpness(frame, stride, self.config.sharpness_norm);

        let edge_term = (quick.edge_ratio / self.config.edge_norm).min(1.0);
        let quality = (0.6 * sharpness + 0.4 * edge_term) * exposure_factor(quick.mean_luma);

        let scores = ScoreSet {
            static_score: 0.2 + 0.8 * sharpness,
            subtitle_score: 1.0 - text.confidence,
            people_score: (skin / self.config.people_saturation_ratio).min(1.0),
            quality_score: quality,
            diversity_score: 0.0,
        }
        .clamped();

        LocalAnalysis {
            scores,
            brightness,
            sharpness,
            edge_ratio: quick.edge_ratio,
            subtitle_detected: text.has_text,
            quick_rejected: false,
        }
    }

    /// 在工作线程池里并行分析，输出顺序与输入一致
    pub fn analyze_all(&self, frames: Vec<Frame>, pool: &ThreadPool) -> Vec<FrameCandidate> {
        pool.install(|| {
            frames
                .into_par_iter()
                .map(|frame| {
                    let analysis = self.analyze(&frame);
                    debug!(
                        "🔍 frame@{:.2}s static={:.2} subtitle={:.2} people={:.2} quality={:.2}{}",
                        frame.timestamp_secs,
                        analysis.scores.static_score,
                        analysis.scores.subtitle_score,
                        analysis.scores.people_score,
                        analysis.scores.quality_score,
                        if analysis.quick_rejected { " (rejected)" } else { "" }
                    );
                    FrameCandidate::new(frame, analysis)
                })
                .collect()
        })
    }
}

/// 相邻候选帧越相似，说明镜头越稳定，static_score 越高
pub fn apply_temporal_stability(candidates: &mut [FrameCandidate], matrix: &SimilarityMatrix, weight: f32) {
    let n = candidates.len();
    if n < 2 {
        return;
    }
    let weight = weight.clamp(0.0, 1.0);

    for i in 0..n {
        if candidates[i].local.quick_rejected {
            continue;
        }
        let mut total = 0.0f32;
        let mut count = 0u32;
        if i > 0 {
            total += matrix.get(i, i - 1);
            count += 1;
        }
        if i + 1 < n {
            total += matrix.get(i, i + 1);
            count += 1;
        }
        let stability = total / count as f32;
        let scores = &mut candidates[i].scores;
        scores.static_score = ((1.0 - weight) * scores.static_score + weight * stability).clamp(0.0, 1.0);
    }
}

/// 采样亮度极差不超过 `max_range`：纯色/未绘制的画面
pub fn is_flat(frame: &Frame, stride: u32, max_range: u8) -> bool {
    if !frame.is_well_formed() {
        return true;
    }
    let stride = stride.max(1) as usize;
    let mut min = u8::MAX;
    let mut max = u8::MIN;
    for y in (0..frame.height).step_by(stride) {
        for x in (0..frame.width).step_by(stride) {
            let l = frame.luma_at(x, y);
            min = min.min(l);
            max = max.max(l);
        }
    }
    max.saturating_sub(min) <= max_range
}

/// 固定 RGB 肤色规则
#[inline]
pub fn is_skin([r, g, b]: [u8; 3]) -> bool {
    let (r, g, b) = (r as i16, g as i16, b as i16);
    r > 95 && g > 40 && b > 20 && r > g && r > b && (r - g.min(b)) > 15 && (r - g).abs() > 15
}

pub fn skin_ratio(frame: &Frame, stride: u32) -> f32 {
    let stride = stride.max(1) as usize;
    let mut skin = 0u32;
    let mut total = 0u32;
    for y in (0..frame.height).step_by(stride) {
        for x in (0..frame.width).step_by(stride) {
            if is_skin(frame.rgb_at(x, y)) {
                skin += 1;
            }
            total += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        skin as f32 / total as f32
    }
}

/// 粗网格上的平均水平亮度梯度，归一化到 0-1
pub fn sharpness(frame: &Frame, stride: u32, norm: f32) -> f32 {
    if frame.width < 2 {
        return 0.0;
    }
    let stride = stride.max(1) as usize;
    let mut total = 0u64;
    let mut count = 0u64;
    for y in (0..frame.height).step_by(stride) {
        for x in (0..frame.width - 1).step_by(stride) {
            let a = luma(frame.rgb_at(x, y)) as i16;
            let b = luma(frame.rgb_at(x + 1, y)) as i16;
            total += (a - b).unsigned_abs() as u64;
            count += 1;
        }
    }
    if count == 0 || norm <= 0.0 {
        return 0.0;
    }
    ((total as f32 / count as f32) / norm).min(1.0)
}

/// 过暗/过曝时降低画质分
fn exposure_factor(mean_luma: f32) -> f32 {
    const LOW: f32 = 30.0;
    const HIGH: f32 = 225.0;
    if mean_luma < LOW {
        0.5 + 0.5 * (mean_luma / LOW)
    } else if mean_luma > HIGH {
        0.5 + 0.5 * ((255.0 - mean_luma) / (255.0 - HIGH))
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_extractor::text_detector::MockTextDetector;

    fn checker(width: u32, height: u32, cell: u32, a: [u8; 3], b: [u8; 3]) -> Frame {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                let c = if ((x / cell) + (y / cell)) % 2 == 0 { a } else { b };
                data.extend_from_slice(&[c[0], c[1], c[2], 255]);
            }
        }
        Frame::new(width, height, data, 0.0, 0)
    }

    fn gradient(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..height {
            for x in 0..width {
                let v = (x * 255 / width.max(1)) as u8;
                data.extend_from_slice(&[v, v, v, 255]);
            }
        }
        Frame::new(width, height, data, 0.0, 0)
    }

    #[test]
    fn test_quick_reject_black_and_white() {
        let analyzer = LocalAnalyzer::new(AnalyzerConfig::default());
        for rgb in [[0, 0, 0], [255, 255, 255]] {
            let analysis = analyzer.analyze(&Frame::filled(128, 72, rgb));
            assert!(analysis.quick_rejected);
            assert!(analysis.scores.static_score <= 0.15);
            assert!(analysis.scores.quality_score <= 0.15);
            assert_eq!(analysis.scores.subtitle_score, 1.0);
            assert_eq!(analysis.scores.people_score, 0.0);
        }
    }

    #[test]
    fn test_malformed_buffer_is_rejected() {
        let analyzer = LocalAnalyzer::new(AnalyzerConfig::default());
        let short = Frame::new(128, 72, vec![200u8; 64], 0.0, 0);
        let analysis = analyzer.analyze(&short);
        assert!(analysis.quick_rejected);
        assert_eq!(analysis.scores, ScoreSet::quick_reject());

        let empty = Frame::new(0, 0, Vec::new(), 0.0, 0);
        assert!(analyzer.quick_check(&empty).is_uniform);
    }

    #[test]
    fn test_scores_are_deterministic() {
        let analyzer = LocalAnalyzer::new(AnalyzerConfig::default());
        let frame = checker(160, 90, 3, [200, 120, 90], [30, 40, 50]);
        let first = analyzer.analyze(&frame);
        for _ in 0..5 {
            let again = analyzer.analyze(&frame);
            assert_eq!(again.scores.static_score.to_bits(), first.scores.static_score.to_bits());
            assert_eq!(again.scores.subtitle_score.to_bits(), first.scores.subtitle_score.to_bits());
            assert_eq!(again.scores.people_score.to_bits(), first.scores.people_score.to_bits());
            assert_eq!(again.scores.quality_score.to_bits(), first.scores.quality_score.to_bits());
        }
    }

    #[test]
    fn test_scores_in_unit_range() {
        let analyzer = LocalAnalyzer::new(AnalyzerConfig::default());
        let frame = checker(160, 90, 1, [255, 255, 255], [0, 0, 0]);
        let s = analyzer.analyze(&frame).scores;
        for v in [s.static_score, s.subtitle_score, s.people_score, s.quality_score] {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_skin_rule() {
        assert!(is_skin([220, 170, 140]));
        assert!(!is_skin([120, 120, 120]));
        assert!(!is_skin([60, 40, 30]));
        assert!(!is_skin([230, 30, 30]));
    }

    #[test]
    fn test_people_score_from_skin_tones() {
        let analyzer = LocalAnalyzer::new(AnalyzerConfig::default());
        let skin = checker(128, 72, 8, [220, 170, 140], [40, 60, 90]);
        let no_skin = checker(128, 72, 8, [90, 120, 200], [40, 60, 90]);

        assert_eq!(analyzer.analyze(&skin).scores.people_score, 1.0);
        assert_eq!(analyzer.analyze(&no_skin).scores.people_score, 0.0);
    }

    #[test]
    fn test_sharp_beats_smooth() {
        let config = AnalyzerConfig::default();
        let sharp = checker(128, 72, 1, [255, 255, 255], [0, 0, 0]);
        let smooth = gradient(128, 72);

        let s_sharp = sharpness(&sharp, config.sample_stride, config.sharpness_norm);
        let s_smooth = sharpness(&smooth, config.sample_stride, config.sharpness_norm);
        assert!(s_sharp > s_smooth);
        assert_eq!(s_sharp, 1.0);

        let analyzer = LocalAnalyzer::new(config);
        let q_sharp = analyzer.analyze(&sharp).scores.quality_score;
        let q_smooth = analyzer.analyze(&smooth).scores.quality_score;
        assert!(q_sharp > q_smooth);
    }

    #[test]
    fn test_subtitle_polarity() {
        let analyzer = LocalAnalyzer::with_text_detector(
            AnalyzerConfig::default(),
            Box::new(MockTextDetector::with_fixed_frames(vec![1])),
        );
        let mut with_text = checker(64, 36, 4, [200, 200, 200], [20, 20, 20]);
        with_text.index = 1;
        let clean = checker(64, 36, 4, [200, 200, 200], [20, 20, 20]);

        let a = analyzer.analyze(&with_text);
        let b = analyzer.analyze(&clean);
        assert!(a.subtitle_detected);
        assert!(a.scores.subtitle_score < b.scores.subtitle_score);
        assert_eq!(b.scores.subtitle_score, 1.0);
    }

    #[test]
    fn test_is_flat() {
        assert!(is_flat(&Frame::filled(32, 32, [10, 10, 10]), 4, 3));
        assert!(!is_flat(&checker(32, 32, 3, [250, 250, 250], [0, 0, 0]), 4, 3));
        assert!(is_flat(&Frame::new(4, 4, vec![0; 3], 0.0, 0), 1, 3));
    }

    #[test]
    fn test_analyze_all_preserves_order() {
        let analyzer = LocalAnalyzer::new(AnalyzerConfig::default());
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let frames: Vec<Frame> = (0..6)
            .map(|i| {
                let mut f = checker(32, 18, 2, [200, 100, 50], [10, 20, 30]);
                f.timestamp_secs = i as f64;
                f.index = i;
                f
            })
            .collect();

        let candidates = analyzer.analyze_all(frames, &pool);
        let times: Vec<f64> = candidates.iter().map(|c| c.time_secs).collect();
        assert_eq!(times, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}
