//! 视频源抽象 - 外部解码能力的最小契约

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::error::SourceError;
use crate::core::video::frame::{Frame, RawFrame};

/// 外部解码器：报告时长/分辨率，接受 seek，并把当前解码帧暴露为像素缓冲
///
/// 同一个实例内 seek/光栅化是有状态、串行的，流水线不会并发调用。
pub trait VideoSource: Send {
    /// 便于日志与诊断的名字
    fn label(&self) -> String {
        "video".to_string()
    }

    fn duration_secs(&self) -> f64;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// 请求 seek 并等待完成；超过 `timeout` 仍未完成应返回 `SeekTimeout`
    fn seek(&mut self, time_secs: f64, timeout: Duration) -> Result<(), SourceError>;

    /// 把当前解码帧光栅化成 RGBA
    fn current_frame(&mut self) -> Result<Frame, SourceError>;
}

/// 合成视频的一段场景
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScenePattern {
    Solid([u8; 3]),
    VerticalStripes { a: [u8; 3], b: [u8; 3], period: u32 },
    HorizontalStripes { a: [u8; 3], b: [u8; 3], period: u32 },
    Checker { a: [u8; 3], b: [u8; 3], cell: u32 },
}

impl ScenePattern {
    fn color_at(&self, x: u32, y: u32) -> [u8; 3] {
        match *self {
            ScenePattern::Solid(c) => c,
            ScenePattern::VerticalStripes { a, b, period } => {
                if (x / period.max(1)) % 2 == 0 {
                    a
                } else {
                    b
                }
            }
            ScenePattern::HorizontalStripes { a, b, period } => {
                if (y / period.max(1)) % 2 == 0 {
                    a
                } else {
                    b
                }
            }
            ScenePattern::Checker { a, b, cell } => {
                let cell = cell.max(1);
                if ((x / cell) + (y / cell)) % 2 == 0 {
                    a
                } else {
                    b
                }
            }
        }
    }
}

/// 在 `until_secs` 之前生效的场景
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scene {
    pub until_secs: f64,
    pub pattern: ScenePattern,
}

/// 按脚本生成帧的视频源，用于测试和演示
///
/// 同一场景内随时间有 ±2 的轻微亮度起伏，模拟镜头内的低对比变化。
pub struct SyntheticSource {
    label: String,
    duration_secs: f64,
    width: u32,
    height: u32,
    scenes: Vec<Scene>,
    position: Option<f64>,
    seek_delay: Duration,
    failing_times: Vec<(f64, f64)>,
    fatal_after_seeks: Option<usize>,
    seek_count: Arc<AtomicUsize>,
}

impl SyntheticSource {
    pub fn new(duration_secs: f64, width: u32, height: u32, scenes: Vec<Scene>) -> Self {
        Self {
            label: "synthetic".to_string(),
            duration_secs,
            width,
            height,
            scenes,
            position: None,
            seek_delay: Duration::ZERO,
            failing_times: Vec::new(),
            fatal_after_seeks: None,
            seek_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn solid(duration_secs: f64, width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::new(
            duration_secs,
            width,
            height,
            vec![Scene {
                until_secs: f64::INFINITY,
                pattern: ScenePattern::Solid(rgb),
            }],
        )
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// 每次 seek 的模拟耗时
    pub fn with_seek_delay(mut self, delay: Duration) -> Self {
        self.seek_delay = delay;
        self
    }

    /// 在 `[from, to)` 区间内的 seek 一律失败
    pub fn with_failing_range(mut self, from: f64, to: f64) -> Self {
        self.failing_times.push((from, to));
        self
    }

    /// 第 n 次 seek 之后解码器失效
    pub fn with_fatal_after(mut self, seeks: usize) -> Self {
        self.fatal_after_seeks = Some(seeks);
        self
    }

    /// 共享的 seek 计数器，用于断言是否做过解码工作
    pub fn seek_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.seek_count)
    }

    fn scene_at(&self, time_secs: f64) -> ScenePattern {
        self.scenes
            .iter()
            .find(|s| time_secs < s.until_secs)
            .or_else(|| self.scenes.last())
            .map(|s| s.pattern)
            .unwrap_or(ScenePattern::Solid([0, 0, 0]))
    }
}

impl VideoSource for SyntheticSource {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn seek(&mut self, time_secs: f64, timeout: Duration) -> Result<(), SourceError> {
        let seeks = self.seek_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.fatal_after_seeks {
            if seeks > limit {
                return Err(SourceError::Unavailable("decoder context released".to_string()));
            }
        }

        let started = Instant::now();
        if !self.seek_delay.is_zero() {
            std::thread::sleep(self.seek_delay.min(timeout));
        }
        if self.seek_delay > timeout {
            return Err(SourceError::SeekTimeout(time_secs));
        }

        if self
            .failing_times
            .iter()
            .any(|&(from, to)| time_secs >= from && time_secs < to)
        {
            return Err(SourceError::SeekFailed {
                time: time_secs,
                reason: format!("no decodable frame ({:?})", started.elapsed()),
            });
        }

        self.position = Some(time_secs);
        Ok(())
    }

    fn current_frame(&mut self) -> Result<Frame, SourceError> {
        let time = self.position.ok_or_else(|| SourceError::Rasterize {
            time: 0.0,
            reason: "no frame decoded yet".to_string(),
        })?;

        let pattern = self.scene_at(time);
        // 场景内的轻微亮度起伏
        let wobble = ((time * 7.0).sin() * 2.0).round() as i16;

        let mut data = Vec::with_capacity((self.width * self.height * 4) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let c = pattern.color_at(x, y);
                let adjust = |v: u8| -> u8 {
                    if matches!(pattern, ScenePattern::Solid(_)) {
                        v
                    } else {
                        (v as i16 + wobble).clamp(0, 255) as u8
                    }
                };
                data.extend_from_slice(&[adjust(c[0]), adjust(c[1]), adjust(c[2]), 255]);
            }
        }

        Ok(Frame::new(self.width, self.height, data, time, 0))
    }
}

/// 调用方预先解码好的 YUV 帧序列；seek 取不晚于目标时间的最近一帧
pub struct FrameListSource {
    label: String,
    duration_secs: f64,
    width: u32,
    height: u32,
    frames: Vec<RawFrame>,
    position: Option<usize>,
}

impl FrameListSource {
    pub fn new(label: impl Into<String>, duration_secs: f64, width: u32, height: u32, mut frames: Vec<RawFrame>) -> Self {
        frames.sort_by(|a, b| a.timestamp_secs.total_cmp(&b.timestamp_secs));
        Self {
            label: label.into(),
            duration_secs,
            width,
            height,
            frames,
            position: None,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl VideoSource for FrameListSource {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn seek(&mut self, time_secs: f64, _timeout: Duration) -> Result<(), SourceError> {
        if self.frames.is_empty() {
            return Err(SourceError::Unavailable(format!("{} has no decoded frames", self.label)));
        }
        let after = self.frames.partition_point(|f| f.timestamp_secs <= time_secs);
        self.position = Some(after.saturating_sub(1));
        Ok(())
    }

    fn current_frame(&mut self) -> Result<Frame, SourceError> {
        let index = self.position.ok_or_else(|| SourceError::Rasterize {
            time: 0.0,
            reason: "no frame decoded yet".to_string(),
        })?;
        let raw = self.frames.get(index).ok_or(SourceError::SurfaceLost)?;
        let expected = (raw.width * raw.height) as usize;
        if raw.y_plane.len() < expected {
            return Err(SourceError::Rasterize {
                time: raw.timestamp_secs,
                reason: format!("Y plane has {} of {} bytes", raw.y_plane.len(), expected),
            });
        }
        Ok(raw.to_rgba(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_scenes() -> SyntheticSource {
        SyntheticSource::new(
            30.0,
            32,
            18,
            vec![
                Scene {
                    until_secs: 10.0,
                    pattern: ScenePattern::Solid([255, 0, 0]),
                },
                Scene {
                    until_secs: 20.0,
                    pattern: ScenePattern::Solid([0, 255, 0]),
                },
                Scene {
                    until_secs: 30.0,
                    pattern: ScenePattern::Solid([0, 0, 255]),
                },
            ],
        )
    }

    #[test]
    fn test_synthetic_scene_lookup() {
        let mut source = three_scenes();
        let timeout = Duration::from_secs(1);

        source.seek(5.0, timeout).unwrap();
        assert_eq!(source.current_frame().unwrap().rgb_at(0, 0), [255, 0, 0]);

        source.seek(15.0, timeout).unwrap();
        assert_eq!(source.current_frame().unwrap().rgb_at(0, 0), [0, 255, 0]);

        source.seek(29.0, timeout).unwrap();
        let frame = source.current_frame().unwrap();
        assert_eq!(frame.rgb_at(31, 17), [0, 0, 255]);
        assert_eq!(frame.timestamp_secs, 29.0);
    }

    #[test]
    fn test_frame_before_seek_fails() {
        let mut source = three_scenes();
        assert!(matches!(
            source.current_frame(),
            Err(SourceError::Rasterize { .. })
        ));
    }

    #[test]
    fn test_failure_injection() {
        let mut source = three_scenes()
            .with_failing_range(10.0, 12.0)
            .with_fatal_after(2);
        let timeout = Duration::from_secs(1);

        assert!(source.seek(11.0, timeout).is_err());
        assert!(source.seek(13.0, timeout).is_ok());
        let err = source.seek(14.0, timeout).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(source.seek_counter().load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_slow_seek_times_out() {
        let mut source = three_scenes().with_seek_delay(Duration::from_millis(30));
        let err = source.seek(1.0, Duration::from_millis(5)).unwrap_err();
        assert_eq!(err, SourceError::SeekTimeout(1.0));
    }

    fn gray_raw(luma: u8, timestamp_secs: f64) -> RawFrame {
        RawFrame {
            width: 8,
            height: 4,
            y_plane: vec![luma; 32],
            u_plane: vec![128; 8],
            v_plane: vec![128; 8],
            timestamp_secs,
        }
    }

    #[test]
    fn test_frame_list_seeks_to_nearest_earlier_frame() {
        let mut source = FrameListSource::new(
            "clip",
            3.0,
            8,
            4,
            vec![gray_raw(200, 2.0), gray_raw(10, 0.0), gray_raw(100, 1.0)],
        );
        let timeout = Duration::from_secs(1);

        source.seek(1.5, timeout).unwrap();
        assert_eq!(source.current_frame().unwrap().rgb_at(0, 0), [100, 100, 100]);

        source.seek(0.2, timeout).unwrap();
        assert_eq!(source.current_frame().unwrap().rgb_at(0, 0), [10, 10, 10]);

        source.seek(2.9, timeout).unwrap();
        let frame = source.current_frame().unwrap();
        assert_eq!(frame.timestamp_secs, 2.0);
        assert_eq!(frame.index, 2);
    }

    #[test]
    fn test_frame_list_empty_is_fatal() {
        let mut source = FrameListSource::new("empty", 3.0, 8, 4, Vec::new());
        let err = source.seek(1.0, Duration::from_secs(1)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_frame_list_short_plane_fails_rasterize() {
        let mut broken = gray_raw(50, 0.0);
        broken.y_plane.truncate(5);
        let mut source = FrameListSource::new("broken", 1.0, 8, 4, vec![broken]);
        source.seek(0.5, Duration::from_secs(1)).unwrap();
        assert!(matches!(source.current_frame(), Err(SourceError::Rasterize { .. })));
    }
}
