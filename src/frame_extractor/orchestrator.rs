//! 批量编排 - FIFO 等待队列 + 受限并发的任务工作线程
//!
//! 跨任务共享的可变状态只有队列、活跃数和任务表，全部在一把锁下。
//! 每个活跃任务一个具名工作线程；任务结束后立即尝试从队列补位。

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::core::error::{ExtractionError, JobDiagnostics, OrchestratorError};
use crate::core::video::VideoSource;
use crate::frame_extractor::candidate::Thumbnail;
use crate::frame_extractor::pipeline::{CancelToken, ExtractionPipeline, JobOutcome, PROGRESS_DONE};
use crate::frame_extractor::settings::{ExtractionSettings, DEFAULT_CONCURRENT_VIDEO_LIMIT};
use crate::frame_extractor::state_machine::{JobAction, JobEvent, JobLifecycle, JobStatus, RetryAction};

pub type JobId = u64;

/// 终态附带的结构化信息，供 UI 给出针对性的重试入口
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalDetail {
    pub status: JobStatus,
    pub message: Option<String>,
    pub diagnostics: Option<JobDiagnostics>,
    pub retry_action: Option<RetryAction>,
}

impl TerminalDetail {
    fn new(status: JobStatus, message: Option<String>, diagnostics: Option<JobDiagnostics>) -> Self {
        Self {
            status,
            message,
            diagnostics,
            retry_action: status.suggested_retry(),
        }
    }
}

/// 任务快照
#[derive(Debug, Clone)]
pub struct VideoJob {
    pub id: JobId,
    pub label: String,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub status: JobStatus,
    pub progress_percent: u8,
    /// 只有 completed 时非空
    pub thumbnails: Vec<Thumbnail>,
    pub selected_thumbnail_index: Option<usize>,
    pub attempts: u32,
    pub terminal: Option<TerminalDetail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub percent: u8,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub total: usize,
    pub terminal: usize,
    pub active: usize,
    pub pending: usize,
    /// 终态任务数 / 总任务数
    pub fraction: f32,
}

struct JobEntry {
    label: String,
    duration_secs: f64,
    width: u32,
    height: u32,
    lifecycle: JobLifecycle,
    progress: u8,
    thumbnails: Vec<Thumbnail>,
    selected: Option<usize>,
    terminal: Option<TerminalDetail>,
    settings: Arc<ExtractionSettings>,
    /// 处理期间由工作线程持有
    source: Option<Box<dyn VideoSource>>,
    cancel: CancelToken,
}

impl JobEntry {
    fn snapshot(&self, id: JobId) -> VideoJob {
        VideoJob {
            id,
            label: self.label.clone(),
            duration_secs: self.duration_secs,
            width: self.width,
            height: self.height,
            status: self.lifecycle.status(),
            progress_percent: self.progress,
            thumbnails: self.thumbnails.clone(),
            selected_thumbnail_index: self.selected,
            attempts: self.lifecycle.attempts(),
            terminal: self.terminal.clone(),
        }
    }
}

struct QueueState {
    jobs: BTreeMap<JobId, JobEntry>,
    queue: VecDeque<JobId>,
    active: usize,
    limit: usize,
    max_observed_active: usize,
    next_id: JobId,
    subscribers: Vec<Sender<ProgressEvent>>,
    shut_down: bool,
}

impl QueueState {
    fn emit(&mut self, job_id: JobId, percent: u8, status: JobStatus) {
        let event = ProgressEvent {
            job_id,
            percent,
            status,
        };
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }

    fn is_idle(&self) -> bool {
        self.active == 0 && self.queue.is_empty()
    }

    fn entry_mut(&mut self, id: JobId) -> Result<&mut JobEntry, OrchestratorError> {
        self.jobs.get_mut(&id).ok_or(OrchestratorError::UnknownJob(id))
    }
}

struct Shared {
    state: Mutex<QueueState>,
    idle: Condvar,
    pipeline: ExtractionPipeline,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn invalid_state(id: JobId, event: JobEvent, status: JobStatus) -> OrchestratorError {
    OrchestratorError::InvalidState {
        id,
        action: event.name(),
        status: status.to_string(),
    }
}

pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(pipeline: ExtractionPipeline) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    jobs: BTreeMap::new(),
                    queue: VecDeque::new(),
                    active: 0,
                    limit: DEFAULT_CONCURRENT_VIDEO_LIMIT,
                    max_observed_active: 0,
                    next_id: 1,
                    subscribers: Vec::new(),
                    shut_down: false,
                }),
                idle: Condvar::new(),
                pipeline,
            }),
        }
    }

    /// 订阅进度事件；接收端丢弃后自动退订
    pub fn subscribe(&self) -> Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel();
        self.shared.lock().subscribers.push(tx);
        rx
    }

    /// 一批视频共用一份设置；并发上限取最近一批的设置
    pub fn submit_batch(
        &self,
        sources: Vec<Box<dyn VideoSource>>,
        settings: ExtractionSettings,
    ) -> Result<Vec<JobId>, OrchestratorError> {
        let settings = Arc::new(
            settings
                .validate()
                .map_err(|e| OrchestratorError::InvalidSettings(e.to_string()))?,
        );

        let ids = {
            let mut st = self.shared.lock();
            if st.shut_down {
                return Err(OrchestratorError::ShutDown);
            }
            st.limit = settings.concurrent_video_limit;

            let mut ids = Vec::with_capacity(sources.len());
            for source in sources {
                let id = st.next_id;
                st.next_id += 1;
                st.jobs.insert(
                    id,
                    JobEntry {
                        label: source.label(),
                        duration_secs: source.duration_secs(),
                        width: source.width(),
                        height: source.height(),
                        lifecycle: JobLifecycle::new(),
                        progress: 0,
                        thumbnails: Vec::new(),
                        selected: None,
                        terminal: None,
                        settings: Arc::clone(&settings),
                        source: Some(source),
                        cancel: CancelToken::new(),
                    },
                );
                st.queue.push_back(id);
                st.emit(id, 0, JobStatus::Pending);
                ids.push(id);
            }
            info!("📥 queued {} jobs (limit {})", ids.len(), st.limit);
            ids
        };

        fill_slots(&self.shared);
        Ok(ids)
    }

    /// pending 立即取消；processing 置位取消标记，等阶段边界
    pub fn cancel(&self, id: JobId) -> Result<JobStatus, OrchestratorError> {
        let mut st = self.shared.lock();
        let entry = st.entry_mut(id)?;
        let before = entry.lifecycle.status();
        let action = entry
            .lifecycle
            .apply(JobEvent::Cancel)
            .map_err(|_| invalid_state(id, JobEvent::Cancel, before))?;

        match action {
            JobAction::DropFromQueue => {
                entry.terminal = Some(TerminalDetail::new(JobStatus::Cancelled, None, None));
                let percent = entry.progress;
                st.queue.retain(|&q| q != id);
                st.emit(id, percent, JobStatus::Cancelled);
                info!("⏹️ job {} cancelled before start", id);
                self.shared.idle.notify_all();
            }
            JobAction::SignalCancel => {
                entry.cancel.cancel();
                info!("⏹️ job {} cancel requested", id);
            }
            _ => {}
        }
        Ok(st.jobs.get(&id).map_or(JobStatus::Cancelled, |e| e.lifecycle.status()))
    }

    /// error / no-frames / cancelled 重新排队；清空上一次的结果
    pub fn retry(&self, id: JobId) -> Result<(), OrchestratorError> {
        {
            let mut st = self.shared.lock();
            if st.shut_down {
                return Err(OrchestratorError::ShutDown);
            }
            let entry = st.entry_mut(id)?;
            let before = entry.lifecycle.status();
            entry
                .lifecycle
                .apply(JobEvent::Retry)
                .map_err(|_| invalid_state(id, JobEvent::Retry, before))?;

            entry.thumbnails.clear();
            entry.selected = None;
            entry.progress = 0;
            entry.terminal = None;
            entry.cancel.reset();
            st.queue.push_back(id);
            st.emit(id, 0, JobStatus::Pending);
            info!("🔁 job {} requeued", id);
        }
        fill_slots(&self.shared);
        Ok(())
    }

    /// 删除非处理中的任务
    pub fn remove_job(&self, id: JobId) -> Result<VideoJob, OrchestratorError> {
        let mut st = self.shared.lock();
        let status = st.entry_mut(id)?.lifecycle.status();
        if status == JobStatus::Processing {
            return Err(OrchestratorError::InvalidState {
                id,
                action: "remove",
                status: status.to_string(),
            });
        }
        st.queue.retain(|&q| q != id);
        let entry = st.jobs.remove(&id).ok_or(OrchestratorError::UnknownJob(id))?;
        self.shared.idle.notify_all();
        Ok(entry.snapshot(id))
    }

    /// 完成后由用户改选主图
    pub fn set_primary(&self, id: JobId, thumbnail_index: usize) -> Result<(), OrchestratorError> {
        let mut st = self.shared.lock();
        let entry = st.entry_mut(id)?;
        let status = entry.lifecycle.status();
        if status != JobStatus::Completed {
            return Err(OrchestratorError::InvalidState {
                id,
                action: "set primary",
                status: status.to_string(),
            });
        }
        if thumbnail_index >= entry.thumbnails.len() {
            return Err(OrchestratorError::ThumbnailIndex(thumbnail_index));
        }
        for (i, thumb) in entry.thumbnails.iter_mut().enumerate() {
            thumb.is_primary = i == thumbnail_index;
        }
        entry.selected = Some(thumbnail_index);
        Ok(())
    }

    pub fn job(&self, id: JobId) -> Option<VideoJob> {
        self.shared.lock().jobs.get(&id).map(|e| e.snapshot(id))
    }

    pub fn jobs(&self) -> Vec<VideoJob> {
        self.shared
            .lock()
            .jobs
            .iter()
            .map(|(&id, e)| e.snapshot(id))
            .collect()
    }

    pub fn batch_progress(&self) -> BatchProgress {
        let st = self.shared.lock();
        let total = st.jobs.len();
        let terminal = st.jobs.values().filter(|e| e.lifecycle.status().is_terminal()).count();
        BatchProgress {
            total,
            terminal,
            active: st.active,
            pending: st.queue.len(),
            fraction: if total == 0 { 1.0 } else { terminal as f32 / total as f32 },
        }
    }

    pub fn active_count(&self) -> usize {
        self.shared.lock().active
    }

    /// 运行以来同时处于 processing 的最大任务数
    pub fn max_observed_active(&self) -> usize {
        self.shared.lock().max_observed_active
    }

    /// 等到队列排空且没有活跃任务；超时返回 false
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.shared.lock();
        while !st.is_idle() {
            st = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    self.shared
                        .idle
                        .wait_timeout(st, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.shared.idle.wait(st).unwrap_or_else(PoisonError::into_inner),
            };
        }
        true
    }

    /// 取消所有未完成任务并等待工作线程退出；之后不再接受提交
    pub fn shutdown(&self, timeout: Option<Duration>) -> bool {
        let ids: Vec<JobId> = {
            let mut st = self.shared.lock();
            st.shut_down = true;
            st.jobs
                .iter()
                .filter(|(_, e)| !e.lifecycle.status().is_terminal())
                .map(|(&id, _)| id)
                .collect()
        };
        for id in ids {
            if let Err(e) = self.cancel(id) {
                warn!("⚠️ shutdown could not cancel job {}: {}", id, e);
            }
        }
        self.wait_idle(timeout)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let mut st = self.shared.lock();
        st.shut_down = true;
        for entry in st.jobs.values() {
            entry.cancel.cancel();
        }
    }
}

/// 有空位就从队列头取任务启动
fn fill_slots(shared: &Arc<Shared>) {
    loop {
        let (id, source, settings, cancel) = {
            let mut st = shared.lock();
            if st.shut_down || st.active >= st.limit {
                return;
            }
            let Some(id) = st.queue.pop_front() else {
                return;
            };
            let Some(entry) = st.jobs.get_mut(&id) else {
                continue;
            };
            if entry.lifecycle.apply(JobEvent::Start).is_err() {
                continue;
            }
            let Some(source) = entry.source.take() else {
                // 上一轮工作线程未归还视频源
                entry.terminal = Some(TerminalDetail::new(
                    JobStatus::Error,
                    Some(ExtractionError::SourceMissing.to_string()),
                    None,
                ));
                let _ = entry.lifecycle.apply(JobEvent::Fail);
                st.emit(id, 0, JobStatus::Error);
                shared.idle.notify_all();
                continue;
            };
            let settings = Arc::clone(&entry.settings);
            let cancel = entry.cancel.clone();
            entry.progress = 0;

            st.active += 1;
            st.max_observed_active = st.max_observed_active.max(st.active);
            st.emit(id, 0, JobStatus::Processing);
            (id, source, settings, cancel)
        };

        let worker_shared = Arc::clone(shared);
        let spawned = std::thread::Builder::new()
            .name(format!("thumb-job-{}", id))
            .spawn(move || run_worker(worker_shared, id, source, settings, cancel));

        if let Err(e) = spawned {
            // source 已随闭包丢失，只能判为错误
            error!("❌ failed to spawn worker for job {}: {}", id, e);
            finish(
                shared,
                id,
                None,
                Err(ExtractionError::WorkerPool(e.to_string())),
            );
        }
    }
}

fn run_worker(
    shared: Arc<Shared>,
    id: JobId,
    mut source: Box<dyn VideoSource>,
    settings: Arc<ExtractionSettings>,
    cancel: CancelToken,
) {
    let label = format!("job {}", id);
    let result = shared.pipeline.config().job_retry.run(&label, |_| {
        let run = catch_unwind(AssertUnwindSafe(|| {
            shared
                .pipeline
                .run(source.as_mut(), &settings, &cancel, |p| report_progress(&shared, id, p))
        }));
        run.unwrap_or_else(|_| Err(ExtractionError::Panicked))
    });

    finish(&shared, id, Some(source), result);
}

fn report_progress(shared: &Shared, id: JobId, percent: u8) {
    let mut st = shared.lock();
    let Some(entry) = st.jobs.get_mut(&id) else {
        return;
    };
    if entry.lifecycle.status() != JobStatus::Processing || percent <= entry.progress {
        return;
    }
    entry.progress = percent;
    st.emit(id, percent, JobStatus::Processing);
}

fn finish(
    shared: &Arc<Shared>,
    id: JobId,
    source: Option<Box<dyn VideoSource>>,
    result: Result<JobOutcome, ExtractionError>,
) {
    {
        let mut st = shared.lock();
        st.active = st.active.saturating_sub(1);

        if let Some(entry) = st.jobs.get_mut(&id) {
            entry.source = source;

            let event = if entry.lifecycle.cancel_requested() {
                JobEvent::CancelAcknowledged
            } else {
                match &result {
                    Ok(JobOutcome::Completed { .. }) => JobEvent::Complete,
                    Ok(JobOutcome::NoFrames(_)) => JobEvent::Empty,
                    Ok(JobOutcome::Cancelled) => JobEvent::CancelAcknowledged,
                    Err(_) => JobEvent::Fail,
                }
            };
            // 非协作路径上的 Cancelled 也要走 Cancel -> Acknowledged
            if event == JobEvent::CancelAcknowledged && !entry.lifecycle.cancel_requested() {
                let _ = entry.lifecycle.apply(JobEvent::Cancel);
            }

            match entry.lifecycle.apply(event) {
                Ok(_) => {
                    let status = entry.lifecycle.status();
                    match (status, result) {
                        (JobStatus::Completed, Ok(JobOutcome::Completed { thumbnails, .. })) => {
                            entry.selected = thumbnails.iter().position(|t| t.is_primary);
                            entry.thumbnails = thumbnails;
                            entry.progress = PROGRESS_DONE;
                            entry.terminal = Some(TerminalDetail::new(status, None, None));
                            info!("✅ job {} completed with {} thumbnails", id, entry.thumbnails.len());
                        }
                        (JobStatus::NoFrames, Ok(JobOutcome::NoFrames(diagnostics))) => {
                            entry.terminal = Some(TerminalDetail::new(
                                status,
                                Some("no qualifying frames found".to_string()),
                                Some(diagnostics),
                            ));
                            info!("⬛ job {} finished without frames", id);
                        }
                        (JobStatus::Error, Err(e)) => {
                            error!("❌ job {} failed: {}", id, e);
                            let diagnostics = e.diagnostics().cloned().or_else(|| {
                                Some(JobDiagnostics {
                                    duration_secs: entry.duration_secs,
                                    width: entry.width,
                                    height: entry.height,
                                    error_samples: vec![e.to_string()],
                                    ..Default::default()
                                })
                            });
                            entry.terminal = Some(TerminalDetail::new(status, Some(e.to_string()), diagnostics));
                        }
                        (status, _) => {
                            entry.terminal = Some(TerminalDetail::new(status, None, None));
                            info!("⏹️ job {} {}", id, status);
                        }
                    }
                    let (percent, status) = (entry.progress, entry.lifecycle.status());
                    st.emit(id, percent, status);
                }
                Err(e) => warn!("⚠️ job {} finished in unexpected state: {}", id, e),
            }
        }
        shared.idle.notify_all();
    }

    fill_slots(shared);
}
