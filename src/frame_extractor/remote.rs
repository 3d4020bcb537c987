//! 远程视觉分析 - 只对本地排名靠前的少量候选调用，失败一律回退本地分数

use log::{debug, info, warn};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::core::error::RemoteError;
use crate::frame_extractor::candidate::{FrameCandidate, ScoreSet};
use crate::frame_extractor::pipeline::CancelToken;
use crate::frame_extractor::renderer::encode_frame;
use crate::frame_extractor::settings::{OutputFormat, RemoteCredentials};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionHint {
    Top,
    Middle,
    Bottom,
}

/// 远程分类结论
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionVerdict {
    pub has_subtitles: bool,
    pub has_people: bool,
    pub confidence: f32,
    #[serde(default)]
    pub subtitle_region_hint: Option<RegionHint>,
}

impl VisionVerdict {
    fn validate(self) -> Result<Self, RemoteError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(RemoteError::Malformed(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(self)
    }
}

/// 可插拔的外部分析：一张编码后的静态图 -> 结论
pub trait VisionAnalyzer: Send + Sync {
    fn analyze(&self, image: &[u8]) -> Result<VisionVerdict, RemoteError>;
}

/// 解析远程响应，容忍 markdown 代码块包裹
pub fn parse_verdict(body: &str) -> Result<VisionVerdict, RemoteError> {
    let trimmed = body.trim();
    let cleaned = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned).trim();

    let verdict: VisionVerdict = serde_json::from_str(cleaned)?;
    verdict.validate()
}

/// HTTP 实现：POST JPEG 原始字节，返回 JSON 结论
pub struct HttpVisionAnalyzer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpVisionAnalyzer {
    pub fn new(credentials: &RemoteCredentials, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("thumb_lib/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: credentials.endpoint.clone(),
            api_key: credentials.api_key.clone(),
        })
    }
}

impl VisionAnalyzer for HttpVisionAnalyzer {
    fn analyze(&self, image: &[u8]) -> Result<VisionVerdict, RemoteError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, OutputFormat::Jpeg.mime_type())
            .body(image.to_vec());
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout
            } else {
                RemoteError::Http(e)
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RemoteError::Status(status.as_u16()));
        }
        parse_verdict(&resp.text()?)
    }
}

pub enum MockBehavior {
    Fixed(VisionVerdict),
    /// 按调用序号（从 0 开始）返回
    Pattern(Box<dyn Fn(usize) -> Result<VisionVerdict, RemoteError> + Send + Sync>),
    Slow(Duration, VisionVerdict),
    Failing,
}

/// 测试用分析器，记录调用数与最大并发
pub struct MockVisionAnalyzer {
    behavior: MockBehavior,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockVisionAnalyzer {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl VisionAnalyzer for MockVisionAnalyzer {
    fn analyze(&self, _image: &[u8]) -> Result<VisionVerdict, RemoteError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = match &self.behavior {
            MockBehavior::Fixed(v) => Ok(*v),
            MockBehavior::Pattern(f) => f(call),
            MockBehavior::Slow(delay, v) => {
                std::thread::sleep(*delay);
                Ok(*v)
            }
            MockBehavior::Failing => Err(RemoteError::Status(503)),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// 每批并发请求数
    pub batch_size: usize,
    /// 批与批之间的间隔，照顾外部限流
    pub batch_pacing: Duration,
    pub call_timeout: Duration,
    /// 远程结论最多能把本地分数拉动的比例，<1 保证只合并不覆盖
    pub max_merge_weight: f32,
    pub upload_max_edge: u32,
    pub upload_quality: u8,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            batch_pacing: Duration::from_millis(500),
            call_timeout: Duration::from_secs(15),
            max_merge_weight: 0.6,
            upload_max_edge: 512,
            upload_quality: 80,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStats {
    pub attempted: usize,
    pub analyzed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// 远程结论按置信度把本地分数往结论方向拉，永不完全覆盖
pub fn merge_verdict(local: ScoreSet, verdict: &VisionVerdict, max_weight: f32) -> ScoreSet {
    let w = (verdict.confidence * max_weight).clamp(0.0, max_weight.clamp(0.0, 0.99));
    let subtitle_target = if verdict.has_subtitles { 0.0 } else { 1.0 };
    let people_target = if verdict.has_people { 1.0 } else { 0.0 };

    ScoreSet {
        subtitle_score: local.subtitle_score + (subtitle_target - local.subtitle_score) * w,
        people_score: local.people_score + (people_target - local.people_score) * w,
        ..local
    }
    .clamped()
}

/// 仍在执行的远程调用数；超时被放弃的调用在真正返回前一直占着名额
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    freed: Condvar,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightSlot {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightSlot(Arc::clone(self))
    }

    fn current(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 最多等 `timeout`，返回 `limit` 之内的空闲名额
    fn free_slots(&self, limit: usize, timeout: Duration) -> usize {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, _) = self
            .freed
            .wait_timeout_while(count, timeout, |n| *n >= limit)
            .unwrap_or_else(PoisonError::into_inner);
        limit.saturating_sub(*count)
    }
}

struct InFlightSlot(Arc<InFlight>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        self.0.freed.notify_all();
    }
}

pub struct RemoteRefiner {
    analyzer: Arc<dyn VisionAnalyzer>,
    config: RemoteConfig,
    in_flight: Arc<InFlight>,
}

impl RemoteRefiner {
    pub fn new(analyzer: Arc<dyn VisionAnalyzer>, config: RemoteConfig) -> Self {
        Self {
            analyzer,
            config,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// 对按 `weighted_score` 排名前 `top_k` 的合格候选做远程分析并合并分数
    pub fn refine(
        &self,
        candidates: &mut [FrameCandidate],
        top_k: usize,
        cancel: &CancelToken,
    ) -> RemoteStats {
        let mut order: Vec<usize> = (0..candidates.len())
            .filter(|&i| candidates[i].is_qualifying())
            .collect();
        order.sort_by(|&a, &b| {
            candidates[b]
                .weighted_score
                .total_cmp(&candidates[a].weighted_score)
                .then(a.cmp(&b))
        });
        order.truncate(top_k);

        let mut stats = RemoteStats::default();
        let batch_size = self.config.batch_size.max(1);
        let mut queue: &[usize] = &order;
        let mut n = 0;

        while !queue.is_empty() {
            if cancel.is_cancelled() {
                debug!("⏹️ skipping {} deferred remote calls (cancelled)", queue.len());
                stats.skipped += queue.len();
                break;
            }
            if n > 0 && !self.config.batch_pacing.is_zero() {
                std::thread::sleep(self.config.batch_pacing);
            }

            // 上一批超时的调用可能还没返回，同时在途的调用不超过 batch_size
            let free = self.in_flight.free_slots(batch_size, self.config.call_timeout);
            if free == 0 {
                warn!(
                    "⚠️ {} remote calls still running after {:?}, skipping {} deferred calls",
                    self.in_flight.current(),
                    self.config.call_timeout,
                    queue.len()
                );
                stats.skipped += queue.len();
                break;
            }

            let (batch, rest) = queue.split_at(free.min(queue.len()));
            queue = rest;
            n += 1;

            for (idx, result) in self.run_batch(candidates, batch) {
                stats.attempted += 1;
                let candidate = &mut candidates[idx];
                match result {
                    Ok(verdict) => {
                        candidate.scores = merge_verdict(candidate.scores, &verdict, self.config.max_merge_weight);
                        candidate.remote = Some(verdict);
                        stats.analyzed += 1;
                    }
                    Err(e) => {
                        warn!(
                            "⚠️ remote analysis for frame@{:.2}s failed, keeping local scores: {}",
                            candidate.time_secs, e
                        );
                        candidate.remote = None;
                        stats.failed += 1;
                    }
                }
            }
        }

        info!(
            "🌐 remote analysis: {}/{} analyzed, {} failed, {} skipped",
            stats.analyzed, stats.attempted, stats.failed, stats.skipped
        );
        stats
    }

    /// 同一批请求并发发出，整批共享一个截止时间；超时的请求按失败处理
    fn run_batch(
        &self,
        candidates: &[FrameCandidate],
        batch: &[usize],
    ) -> Vec<(usize, Result<VisionVerdict, RemoteError>)> {
        let (tx, rx) = mpsc::channel();
        let mut results: Vec<(usize, Result<VisionVerdict, RemoteError>)> = Vec::with_capacity(batch.len());
        let mut pending = Vec::with_capacity(batch.len());

        for &idx in batch {
            let frame = candidates[idx].frame.clone().cap_long_edge(self.config.upload_max_edge);
            let image = match encode_frame(&frame, OutputFormat::Jpeg, self.config.upload_quality) {
                Ok(bytes) => bytes,
                Err(e) => {
                    results.push((idx, Err(RemoteError::Encode(e.to_string()))));
                    continue;
                }
            };

            let analyzer = Arc::clone(&self.analyzer);
            let tx = tx.clone();
            let slot = self.in_flight.enter();
            let spawned = std::thread::Builder::new()
                .name("remote-vision".into())
                .spawn(move || {
                    let _slot = slot;
                    // 接收端可能已超时放弃
                    let _ = tx.send((idx, analyzer.analyze(&image)));
                });
            match spawned {
                Ok(_) => pending.push(idx),
                Err(e) => results.push((idx, Err(RemoteError::Malformed(format!("spawn failed: {}", e))))),
            }
        }
        drop(tx);

        let deadline = Instant::now() + self.config.call_timeout;
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((idx, result)) => {
                    pending.retain(|&p| p != idx);
                    results.push((idx, result));
                }
                Err(_) => break,
            }
        }
        for idx in pending {
            results.push((idx, Err(RemoteError::Timeout)));
        }

        results.sort_by_key(|(idx, _)| *idx);
        results
    }
}
