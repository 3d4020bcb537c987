use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::ThreadPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::error::{ExtractionError, JobDiagnostics};
use crate::core::video::VideoSource;
use crate::frame_extractor::analyzer::{apply_temporal_stability, AnalyzerConfig, LocalAnalyzer};
use crate::frame_extractor::candidate::{FrameCandidate, Thumbnail};
use crate::frame_extractor::remote::{HttpVisionAnalyzer, RemoteConfig, RemoteRefiner, VisionAnalyzer};
use crate::frame_extractor::renderer::{RenderConfig, ThumbnailRenderer};
use crate::frame_extractor::retry::RetryPolicy;
use crate::frame_extractor::sampler::{plan_timestamps, FrameSampler, SamplerConfig};
use crate::frame_extractor::selector::{CandidateSelector, SelectorConfig};
use crate::frame_extractor::settings::ExtractionSettings;
use crate::frame_extractor::similarity::{SimilarityConfig, SimilarityEngine};

/// 进度里程碑（百分比）
pub const PROGRESS_SAMPLING_START: u8 = 5;
pub const PROGRESS_SAMPLING_DONE: u8 = 40;
pub const PROGRESS_ANALYSIS_DONE: u8 = 55;
pub const PROGRESS_SCORING_DONE: u8 = 70;
pub const PROGRESS_REMOTE_DONE: u8 = 80;
pub const PROGRESS_SELECTION_DONE: u8 = 85;
pub const PROGRESS_DONE: u8 = 100;

/// 协作式取消标记，在阶段边界检查
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 流水线各阶段的可调参数
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub sampler: SamplerConfig,
    pub analyzer: AnalyzerConfig,
    pub selector: SelectorConfig,
    pub remote: RemoteConfig,
    /// 单帧 seek/光栅化的重试
    pub frame_retry: RetryPolicy,
    /// 任务级自动重试（只针对可重试的任务错误）
    pub job_retry: RetryPolicy,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerConfig::default(),
            analyzer: AnalyzerConfig::default(),
            selector: SelectorConfig::default(),
            remote: RemoteConfig::default(),
            frame_retry: RetryPolicy::default(),
            job_retry: RetryPolicy::immediate(2),
        }
    }
}

impl ExtractionConfig {
    pub fn for_fast_preview() -> Self {
        Self {
            sampler: SamplerConfig {
                max_long_edge: 640,
                ..Default::default()
            },
            analyzer: AnalyzerConfig::for_fast_preview(),
            ..Default::default()
        }
    }

    pub fn for_high_quality() -> Self {
        Self {
            analyzer: AnalyzerConfig::for_high_quality(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed {
        thumbnails: Vec<Thumbnail>,
        diagnostics: JobDiagnostics,
    },
    NoFrames(JobDiagnostics),
    Cancelled,
}

/// 单个视频的完整处理流程：采样 → 本地分析 → 相似度/打分 → 远程精修 → 选择 → 渲染
///
/// 只有这里决定错误是否对任务致命，下层一律返回 Result。
pub struct ExtractionPipeline {
    config: ExtractionConfig,
    analyzer: LocalAnalyzer,
    pool: Arc<ThreadPool>,
    vision: Option<Arc<dyn VisionAnalyzer>>,
}

impl ExtractionPipeline {
    pub fn new(config: ExtractionConfig, pool: Arc<ThreadPool>) -> Self {
        let analyzer = LocalAnalyzer::new(config.analyzer.clone());
        Self {
            config,
            analyzer,
            pool,
            vision: None,
        }
    }

    pub fn with_analyzer(mut self, analyzer: LocalAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// 注入远程分析器；未注入时按设置里的凭据构造 HTTP 实现
    pub fn with_vision_analyzer(mut self, vision: Arc<dyn VisionAnalyzer>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub fn run(
        &self,
        source: &mut dyn VideoSource,
        settings: &ExtractionSettings,
        cancel: &CancelToken,
        mut progress: impl FnMut(u8),
    ) -> Result<JobOutcome, ExtractionError> {
        let label = source.label();
        let duration = source.duration_secs();
        let (width, height) = (source.width(), source.height());
        if !duration.is_finite() || duration <= 0.0 {
            return Err(ExtractionError::InvalidDuration(duration));
        }
        if width == 0 || height == 0 {
            return Err(ExtractionError::InvalidResolution(width, height));
        }

        let mut diagnostics = JobDiagnostics {
            duration_secs: duration,
            width,
            height,
            ..Default::default()
        };

        if cancel.is_cancelled() {
            return Ok(JobOutcome::Cancelled);
        }

        // 1. 采样
        let mut rng = match settings.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let timestamps = plan_timestamps(
            duration,
            settings.start_time_secs,
            settings.requested_sample_count(),
            settings.frame_interval_strategy,
            &self.config.sampler,
            &mut rng,
        );
        if timestamps.is_empty() {
            diagnostics.record_error(format!(
                "start time {:.2}s leaves nothing to sample in {:.2}s",
                settings.start_time_secs, duration
            ));
        }
        info!(
            "🎬 [{}] {:.1}s {}x{}, sampling {} timestamps ({:?})",
            label,
            duration,
            width,
            height,
            timestamps.len(),
            settings.frame_interval_strategy
        );
        progress(PROGRESS_SAMPLING_START);

        let sampler = FrameSampler::new(
            &self.config.sampler,
            &self.config.frame_retry,
            settings.keep_original_resolution,
        );
        let span = (PROGRESS_SAMPLING_DONE - PROGRESS_SAMPLING_START) as usize;
        let frames = sampler
            .sample(source, &timestamps, cancel, &mut diagnostics, |done, total| {
                progress(PROGRESS_SAMPLING_START + (span * done / total.max(1)) as u8);
            })
            .map_err(|e| {
                error!("❌ [{}] fatal source error: {}", label, e);
                ExtractionError::Source {
                    source: e,
                    diagnostics: Box::new(diagnostics.clone()),
                }
            })?;
        if cancel.is_cancelled() {
            return Ok(JobOutcome::Cancelled);
        }
        progress(PROGRESS_SAMPLING_DONE);

        // 2. 本地分析（并行）
        let mut candidates = self.analyzer.analyze_all(frames, &self.pool);
        diagnostics.quick_rejected = candidates.iter().filter(|c| !c.is_qualifying()).count();
        candidates.retain(FrameCandidate::is_qualifying);
        if cancel.is_cancelled() {
            return Ok(JobOutcome::Cancelled);
        }
        progress(PROGRESS_ANALYSIS_DONE);

        if candidates.is_empty() {
            info!(
                "⬛ [{}] no qualifying frames ({} sampled, {} degenerate, {} rejected)",
                label, diagnostics.succeeded_timestamps, diagnostics.degenerate_frames, diagnostics.quick_rejected
            );
            return Ok(JobOutcome::NoFrames(diagnostics));
        }

        // 3. 相似度 + 打分
        let engine = SimilarityEngine::new(SimilarityConfig::with_threshold(settings.diversity_threshold));
        let matrix = {
            let refs: Vec<_> = candidates.iter().map(|c| &c.frame).collect();
            engine.matrix(&refs, &self.pool)
        };
        apply_temporal_stability(&mut candidates, &matrix, self.config.analyzer.temporal_static_weight);

        let selector = CandidateSelector::new(self.config.selector.clone());
        selector.score_candidates(&mut candidates, &matrix, &settings.preferences);
        if cancel.is_cancelled() {
            return Ok(JobOutcome::Cancelled);
        }
        progress(PROGRESS_SCORING_DONE);

        // 4. 远程精修（可选）
        if settings.enable_remote_filter {
            if let Some(vision) = self.resolve_vision(settings) {
                let refiner = RemoteRefiner::new(vision, self.config.remote.clone());
                let stats = refiner.refine(&mut candidates, settings.remote_top_k(), cancel);
                diagnostics.remote_attempted = stats.attempted;
                diagnostics.remote_analyzed = stats.analyzed;
                selector.score_candidates(&mut candidates, &matrix, &settings.preferences);
            }
            if cancel.is_cancelled() {
                return Ok(JobOutcome::Cancelled);
            }
            progress(PROGRESS_REMOTE_DONE);
        }

        // 5. 选择
        let selection = selector.select(&candidates, &matrix, settings.target_thumbnail_count);
        if selection.is_empty() {
            return Ok(JobOutcome::NoFrames(diagnostics));
        }
        debug!(
            "🎯 [{}] selected {} of {} candidates ({} backfilled, {} swapped)",
            label,
            selection.len(),
            candidates.len(),
            selection.backfilled,
            selection.swaps
        );
        if cancel.is_cancelled() {
            return Ok(JobOutcome::Cancelled);
        }
        progress(PROGRESS_SELECTION_DONE);

        // 6. 渲染
        let renderer = ThumbnailRenderer::new(RenderConfig::from_settings(settings));
        let total = selection.len();
        let mut thumbnails = Vec::with_capacity(total);
        for (k, &idx) in selection.indices.iter().enumerate() {
            let candidate = &candidates[idx];
            let rendered = renderer.render(&candidate.frame);
            thumbnails.push(Thumbnail {
                id: format!("{}-{}", k, (candidate.time_secs * 1000.0).round() as u64),
                data: rendered.data,
                width: rendered.width,
                height: rendered.height,
                format: settings.output_format,
                timestamp_secs: candidate.time_secs,
                quality_score: candidate.scores.quality_score,
                weighted_score: selection.scores[k],
                is_primary: selection.primary == Some(k),
                remote_analyzed: candidate.remotely_analyzed(),
                placeholder: rendered.placeholder,
            });
            let step = (PROGRESS_DONE - PROGRESS_SELECTION_DONE) as usize * (k + 1) / total;
            progress(PROGRESS_SELECTION_DONE + step as u8);
        }

        info!("✅ [{}] {} thumbnails extracted", label, thumbnails.len());
        Ok(JobOutcome::Completed {
            thumbnails,
            diagnostics,
        })
    }

    fn resolve_vision(&self, settings: &ExtractionSettings) -> Option<Arc<dyn VisionAnalyzer>> {
        if let Some(vision) = &self.vision {
            return Some(Arc::clone(vision));
        }
        let credentials = settings.remote_filter_credentials.as_ref()?;
        match HttpVisionAnalyzer::new(credentials, self.config.remote.call_timeout) {
            Ok(http) => Some(Arc::new(http)),
            Err(e) => {
                warn!("⚠️ remote analyzer unavailable, using local scores only: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SourceError;
    use crate::core::video::{Scene, ScenePattern, SyntheticSource};
    use crate::frame_extractor::remote::{MockBehavior, MockVisionAnalyzer, VisionVerdict};
    use crate::frame_extractor::settings::FrameIntervalStrategy;
    use std::time::Duration;

    fn test_pool() -> Arc<ThreadPool> {
        Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap())
    }

    fn test_config() -> ExtractionConfig {
        ExtractionConfig {
            frame_retry: RetryPolicy::immediate(3),
            ..Default::default()
        }
    }

    /// 60 秒，三个场景：场景间对比强，场景内只有轻微亮度起伏
    fn three_scene_source() -> SyntheticSource {
        let stripes = |a, b| ScenePattern::VerticalStripes { a, b, period: 8 };
        SyntheticSource::new(
            60.0,
            160,
            90,
            vec![
                Scene {
                    until_secs: 20.0,
                    pattern: stripes([230, 30, 30], [120, 0, 0]),
                },
                Scene {
                    until_secs: 40.0,
                    pattern: stripes([30, 30, 230], [0, 0, 120]),
                },
                Scene {
                    until_secs: 60.0,
                    pattern: stripes([30, 230, 30], [0, 120, 0]),
                },
            ],
        )
    }

    fn settings(target: usize) -> ExtractionSettings {
        ExtractionSettings {
            target_thumbnail_count: target,
            frame_interval_strategy: FrameIntervalStrategy::Uniform,
            diversity_threshold: 0.8,
            random_seed: Some(42),
            ..Default::default()
        }
    }

    #[test]
    fn test_solid_clip_yields_no_frames() {
        let pipeline = ExtractionPipeline::new(test_config(), test_pool());
        let mut source = SyntheticSource::solid(10.0, 160, 90, [20, 90, 160]);

        let outcome = pipeline
            .run(&mut source, &settings(5), &CancelToken::new(), |_| {})
            .unwrap();
        match outcome {
            JobOutcome::NoFrames(diag) => {
                assert_eq!(diag.requested_timestamps, 20);
                assert_eq!(diag.duration_secs, 10.0);
            }
            other => panic!("expected no-frames, got {:?}", other),
        }
    }

    #[test]
    fn test_three_scenes_one_thumbnail_each() {
        let pipeline = ExtractionPipeline::new(test_config(), test_pool());
        let mut source = three_scene_source();
        let mut seen = Vec::new();

        let outcome = pipeline
            .run(&mut source, &settings(3), &CancelToken::new(), |p| seen.push(p))
            .unwrap();
        let JobOutcome::Completed { thumbnails, .. } = outcome else {
            panic!("expected completed");
        };

        assert_eq!(thumbnails.len(), 3);
        let scenes: Vec<usize> = thumbnails.iter().map(|t| (t.timestamp_secs / 20.0) as usize).collect();
        assert_eq!(scenes, vec![0, 1, 2]);
        assert_eq!(thumbnails.iter().filter(|t| t.is_primary).count(), 1);
        assert!(thumbnails.iter().all(|t| t.placeholder.is_none() && !t.data.is_empty()));

        // 进度单调递增，以 100 结束
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&PROGRESS_DONE));
    }

    #[test]
    fn test_remote_timeouts_fall_back_to_local() {
        let slow = VisionVerdict {
            has_subtitles: true,
            has_people: true,
            confidence: 1.0,
            subtitle_region_hint: None,
        };
        let config = ExtractionConfig {
            remote: RemoteConfig {
                call_timeout: Duration::from_millis(30),
                batch_pacing: Duration::ZERO,
                ..Default::default()
            },
            ..test_config()
        };
        let pipeline = ExtractionPipeline::new(config, test_pool()).with_vision_analyzer(Arc::new(
            MockVisionAnalyzer::new(MockBehavior::Slow(Duration::from_millis(300), slow)),
        ));
        let mut source = three_scene_source();
        let settings = ExtractionSettings {
            enable_remote_filter: true,
            ..settings(3)
        };

        let outcome = pipeline.run(&mut source, &settings, &CancelToken::new(), |_| {}).unwrap();
        let JobOutcome::Completed { thumbnails, diagnostics } = outcome else {
            panic!("expected completed");
        };
        assert_eq!(thumbnails.len(), 3);
        assert!(thumbnails.iter().all(|t| !t.remote_analyzed));
        assert_eq!(diagnostics.remote_analyzed, 0);
        assert!(diagnostics.remote_attempted > 0);
    }

    #[test]
    fn test_fatal_source_error_carries_diagnostics() {
        let pipeline = ExtractionPipeline::new(test_config(), test_pool());
        let mut source = three_scene_source().with_fatal_after(3);

        let err = pipeline
            .run(&mut source, &settings(3), &CancelToken::new(), |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::Source {
                source: SourceError::Unavailable(_),
                ..
            }
        ));
        let diag = err.diagnostics().unwrap();
        assert_eq!(diag.succeeded_timestamps, 3);
        assert_eq!(diag.failed_timestamps, 1);
        assert_eq!((diag.width, diag.height), (160, 90));
        assert!(diag.error_samples[0].contains("unavailable"));
    }

    #[test]
    fn test_failing_range_is_skipped_not_fatal() {
        let pipeline = ExtractionPipeline::new(test_config(), test_pool());
        let mut source = three_scene_source().with_failing_range(20.0, 40.0);

        let outcome = pipeline.run(&mut source, &settings(3), &CancelToken::new(), |_| {}).unwrap();
        let JobOutcome::Completed { thumbnails, diagnostics } = outcome else {
            panic!("expected completed");
        };
        assert!(diagnostics.failed_timestamps > 0);
        // 场景 2 整段不可用：只剩两张不重复的，第三张靠回填
        assert_eq!(thumbnails.len(), 3);
        assert!(thumbnails.iter().all(|t| !(20.0..40.0).contains(&t.timestamp_secs)));
    }

    #[test]
    fn test_start_beyond_duration_yields_no_frames() {
        let pipeline = ExtractionPipeline::new(test_config(), test_pool());
        let mut source = three_scene_source();
        let seeks = source.seek_counter();
        let settings = ExtractionSettings {
            start_time_secs: 90.0,
            ..settings(3)
        };

        let outcome = pipeline.run(&mut source, &settings, &CancelToken::new(), |_| {}).unwrap();
        let JobOutcome::NoFrames(diag) = outcome else {
            panic!("expected no-frames");
        };
        assert_eq!(diag.requested_timestamps, 0);
        assert!(diag.error_samples[0].contains("start time"));
        assert_eq!(seeks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_duration() {
        let pipeline = ExtractionPipeline::new(test_config(), test_pool());
        let mut source = SyntheticSource::solid(0.0, 160, 90, [0, 0, 0]);
        let err = pipeline
            .run(&mut source, &settings(3), &CancelToken::new(), |_| {})
            .unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidDuration(_)));
    }

    #[test]
    fn test_cancelled_before_start_does_no_work() {
        let pipeline = ExtractionPipeline::new(test_config(), test_pool());
        let mut source = three_scene_source();
        let seeks = source.seek_counter();
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = pipeline.run(&mut source, &settings(3), &cancel, |_| {}).unwrap();
        assert!(matches!(outcome, JobOutcome::Cancelled));
        assert_eq!(seeks.load(Ordering::SeqCst), 0);
    }
}
