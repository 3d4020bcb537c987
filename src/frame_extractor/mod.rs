//! 视频缩略图提取 - 从一批视频中挑出清晰、不重复、少字幕的代表帧
//!
//! 流程：
//! 1. 采样 - 按时长规划时间点，逐点 seek + 光栅化
//! 2. 本地分析 - 快速拒绝纯色帧，计算清晰度/字幕/人物分
//! 3. 相似度 - 感知哈希 + 直方图，保证多样性
//! 4. 远程复核 - 可选，仅对 Top-K 候选调用视觉服务
//! 5. 选择与渲染 - 贪心 + 换帧 + 回填，编码输出

pub mod analyzer;
pub mod candidate;
pub mod orchestrator;
pub mod pipeline;
pub mod remote;
pub mod renderer;
pub mod retry;
pub mod sampler;
pub mod selector;
pub mod settings;
pub mod similarity;
pub mod state_machine;
pub mod text_detector;

pub use analyzer::{AnalyzerConfig, LocalAnalysis, LocalAnalyzer};
pub use candidate::{FrameCandidate, PlaceholderKind, ScoreSet, Thumbnail};
pub use orchestrator::{BatchProgress, JobId, Orchestrator, ProgressEvent, VideoJob};
pub use pipeline::{CancelToken, ExtractionConfig, ExtractionPipeline, JobOutcome};
pub use remote::{HttpVisionAnalyzer, MockVisionAnalyzer, RemoteRefiner, VisionAnalyzer, VisionVerdict};
pub use renderer::{RenderConfig, ThumbnailRenderer};
pub use selector::{CandidateSelector, Selection, SelectorConfig};
pub use settings::{ExtractionSettings, FrameIntervalStrategy, OutputFormat, SelectionPreferences};
pub use state_machine::{JobEvent, JobStatus, RetryAction};
pub use text_detector::{BandTextDetector, MockTextDetector, TextDetectionResult, TextDetector};
