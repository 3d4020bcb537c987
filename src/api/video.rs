//! 视频缩略图提取

use flutter_rust_bridge::frb;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::error::{OrchestratorError, SettingsError};
use crate::core::video::{FrameListSource, VideoSource};
use crate::frame_extractor::orchestrator::{BatchProgress, Orchestrator, ProgressEvent};
use crate::frame_extractor::pipeline::{ExtractionConfig, ExtractionPipeline};
use crate::frame_extractor::settings::ExtractionSettings;
use crate::api::models::thumbnail::{DecodedVideo, JobSnapshot};

/// FRB 友好的错误类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailApiError {
    pub error_type: String,
    pub message: String,
}

impl std::fmt::Display for ThumbnailApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)
    }
}

impl std::error::Error for ThumbnailApiError {}

impl From<OrchestratorError> for ThumbnailApiError {
    fn from(e: OrchestratorError) -> Self {
        let error_type = match &e {
            OrchestratorError::UnknownJob(_) => "UnknownJob",
            OrchestratorError::InvalidState { .. } => "InvalidState",
            OrchestratorError::ThumbnailIndex(_) => "ThumbnailIndex",
            OrchestratorError::InvalidSettings(_) => "InvalidSettings",
            OrchestratorError::ShutDown => "ShutDown",
            OrchestratorError::WorkerPool(_) => "WorkerPool",
        };
        Self {
            error_type: error_type.to_string(),
            message: e.to_string(),
        }
    }
}

impl From<SettingsError> for ThumbnailApiError {
    fn from(e: SettingsError) -> Self {
        Self {
            error_type: "InvalidSettings".to_string(),
            message: e.to_string(),
        }
    }
}

/// 缩略图提取器 - 调用方持有，显式 create / shutdown
///
/// ```dart
/// final extractor = ThumbnailExtractor.create();
/// final ids = await extractor.submitDecoded(videos: videos, settingsJson: json);
/// final events = extractor.pollProgress();
/// final job = extractor.job(jobId: ids.first);
/// await extractor.shutdown();
/// ```
#[frb(opaque)]
pub struct ThumbnailExtractor {
    orchestrator: Orchestrator,
    events: Mutex<Receiver<ProgressEvent>>,
}

impl ThumbnailExtractor {
    /// 创建提取器，分析线程数 = CPU 核数
    #[frb(sync)]
    pub fn create() -> Result<Self, ThumbnailApiError> {
        Self::with_config(ExtractionConfig::default())
    }

    #[frb(ignore)]
    pub fn with_config(config: ExtractionConfig) -> Result<Self, ThumbnailApiError> {
        let threads = num_cpus::get().max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("thumb-analysis-{}", i))
            .build()
            .map_err(|e| ThumbnailApiError::from(OrchestratorError::WorkerPool(e.to_string())))?;

        info!("🎬 ThumbnailExtractor: created ({} analysis threads)", threads);
        Ok(Self::with_pipeline(ExtractionPipeline::new(config, Arc::new(pool))))
    }

    #[frb(ignore)]
    pub fn with_pipeline(pipeline: ExtractionPipeline) -> Self {
        let orchestrator = Orchestrator::new(pipeline);
        let events = Mutex::new(orchestrator.subscribe());
        Self { orchestrator, events }
    }

    /// 默认设置（JSON），供 UI 初始化与持久化
    #[frb(sync)]
    pub fn default_settings_json() -> Result<String, ThumbnailApiError> {
        Ok(ExtractionSettings::default().to_json()?)
    }

    /// 提交一批已解码的视频
    #[frb]
    pub fn submit_decoded(
        &self,
        videos: Vec<DecodedVideo>,
        settings_json: String,
    ) -> Result<Vec<u64>, ThumbnailApiError> {
        let settings = ExtractionSettings::from_json(&settings_json)?;
        let sources: Vec<Box<dyn VideoSource>> = videos
            .into_iter()
            .map(|v| Box::new(FrameListSource::from(v)) as Box<dyn VideoSource>)
            .collect();
        self.submit_sources(sources, settings)
    }

    /// Rust 侧直接提交解码器实现
    #[frb(ignore)]
    pub fn submit_sources(
        &self,
        sources: Vec<Box<dyn VideoSource>>,
        settings: ExtractionSettings,
    ) -> Result<Vec<u64>, ThumbnailApiError> {
        Ok(self.orchestrator.submit_batch(sources, settings)?)
    }

    #[frb(sync)]
    pub fn cancel(&self, job_id: u64) -> Result<(), ThumbnailApiError> {
        self.orchestrator.cancel(job_id)?;
        Ok(())
    }

    #[frb(sync)]
    pub fn retry(&self, job_id: u64) -> Result<(), ThumbnailApiError> {
        Ok(self.orchestrator.retry(job_id)?)
    }

    #[frb(sync)]
    pub fn remove_job(&self, job_id: u64) -> Result<(), ThumbnailApiError> {
        self.orchestrator.remove_job(job_id)?;
        Ok(())
    }

    /// 用户改选主图
    #[frb(sync)]
    pub fn set_primary(&self, job_id: u64, thumbnail_index: u32) -> Result<(), ThumbnailApiError> {
        Ok(self.orchestrator.set_primary(job_id, thumbnail_index as usize)?)
    }

    #[frb(sync)]
    pub fn job(&self, job_id: u64) -> Option<JobSnapshot> {
        self.orchestrator.job(job_id).map(JobSnapshot::from)
    }

    #[frb(sync)]
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.orchestrator.jobs().into_iter().map(JobSnapshot::from).collect()
    }

    #[frb(sync, getter)]
    pub fn batch_progress(&self) -> BatchProgress {
        self.orchestrator.batch_progress()
    }

    /// 取走自上次调用以来的所有进度事件
    #[frb(sync)]
    pub fn poll_progress(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(rx) => rx.try_iter().collect(),
            Err(e) => {
                warn!("⚠️ progress channel poisoned: {}", e);
                Vec::new()
            }
        }
    }

    /// 等待所有任务结束
    #[frb]
    pub fn wait_idle(&self, timeout_ms: Option<u64>) -> bool {
        self.orchestrator.wait_idle(timeout_ms.map(Duration::from_millis))
    }

    /// 取消未完成任务并等待工作线程退出
    #[frb]
    pub fn shutdown(&self, timeout_ms: Option<u64>) -> bool {
        info!("🛑 ThumbnailExtractor: shutting down");
        self.orchestrator.shutdown(timeout_ms.map(Duration::from_millis))
    }
}

impl Drop for ThumbnailExtractor {
    fn drop(&mut self) {
        info!("🗑️ ThumbnailExtractor: released");
    }
}
