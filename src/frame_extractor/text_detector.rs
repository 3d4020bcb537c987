use crate::core::video::Frame;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextDetectionResult {
    pub has_text: bool,
    /// 有字幕的置信度 0-1
    pub confidence: f32,
    /// 检测区域内被判为文字行的采样行数
    pub text_rows: u32,
}

impl TextDetectionResult {
    pub fn none() -> Self {
        Self {
            has_text: false,
            confidence: 0.0,
            text_rows: 0,
        }
    }
}

/// 字幕检测器；必须是纯函数（同一缓冲结果完全一致）
pub trait TextDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> TextDetectionResult;
}

pub struct MockTextDetector {
    // 按帧序号模拟字幕
    text_frame_pattern: Option<Box<dyn Fn(usize) -> bool + Send + Sync>>,
}

impl MockTextDetector {
    pub fn new() -> Self {
        Self {
            text_frame_pattern: None,
        }
    }

    pub fn with_pattern<F>(pattern: F) -> Self
    where
        F: Fn(usize) -> bool + Send + Sync + 'static,
    {
        Self {
            text_frame_pattern: Some(Box::new(pattern)),
        }
    }

    pub fn with_fixed_frames(frames: Vec<usize>) -> Self {
        Self {
            text_frame_pattern: Some(Box::new(move |index| frames.contains(&index))),
        }
    }
}

impl Default for MockTextDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl TextDetector for MockTextDetector {
    fn detect(&self, frame: &Frame) -> TextDetectionResult {
        let has_text = self
            .text_frame_pattern
            .as_ref()
            .map(|p| p(frame.index))
            .unwrap_or(false);

        TextDetectionResult {
            has_text,
            confidence: if has_text { 0.9 } else { 0.0 },
            text_rows: if has_text { 2 } else { 0 },
        }
    }
}

/// 底部字幕带检测器
/// 针对烧录字幕的特点：
/// 1. 位于画面底部约 1/4
/// 2. 白字/黑边，极亮或极暗像素占比高
/// 3. 笔画之间有大量高对比水平跳变
pub struct BandTextDetector {
    pub region_ratio: f32,
    pub stride: u32,
    pub bright_luma: u8,
    pub dark_luma: u8,
    /// 相邻像素亮度差超过该值算一次笔画跳变
    pub contrast_jump: u8,
    /// 极值像素占比达到该值时该项置信度饱和
    pub extreme_saturation: f32,
    pub transition_saturation: f32,
    pub min_confidence: f32,
}

impl BandTextDetector {
    pub fn new() -> Self {
        Self {
            region_ratio: 0.25,
            stride: 2,
            bright_luma: 200,
            dark_luma: 40,
            contrast_jump: 60,
            extreme_saturation: 0.5,
            transition_saturation: 0.15,
            min_confidence: 0.35,
        }
    }

    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride.max(1);
        self
    }

    fn band_start(&self, height: u32) -> u32 {
        let band = ((height as f32) * self.region_ratio).ceil() as u32;
        height.saturating_sub(band.max(1))
    }
}

impl Default for BandTextDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl TextDetector for BandTextDetector {
    fn detect(&self, frame: &Frame) -> TextDetectionResult {
        if !frame.is_well_formed() || frame.width < 2 {
            return TextDetectionResult::none();
        }

        let w = frame.width;
        let stride = self.stride.max(1) as usize;
        let start_y = self.band_start(frame.height);

        let mut extremes = 0u32;
        let mut midtones = 0u32;
        let mut transitions = 0u32;
        let mut pairs = 0u32;
        let mut text_rows = 0u32;

        for y in (start_y..frame.height).step_by(stride) {
            let mut row_transitions = 0u32;
            let mut row_pairs = 0u32;

            for x in (0..w - 1).step_by(stride) {
                let l = frame.luma_at(x, y);
                if l >= self.bright_luma || l <= self.dark_luma {
                    extremes += 1;
                } else {
                    midtones += 1;
                }

                let next = frame.luma_at(x + 1, y);
                if (l as i16 - next as i16).unsigned_abs() > self.contrast_jump as u16 {
                    row_transitions += 1;
                }
                row_pairs += 1;
            }

            // 一行中超过 5% 的采样点是笔画跳变，视为文字行
            if row_pairs > 0 && row_transitions * 20 > row_pairs {
                text_rows += 1;
            }
            transitions += row_transitions;
            pairs += row_pairs;
        }

        let sampled = extremes + midtones;
        if sampled == 0 || pairs == 0 {
            return TextDetectionResult::none();
        }

        let extreme_ratio = extremes as f32 / sampled as f32;
        let transition_ratio = transitions as f32 / pairs as f32;

        let confidence = (extreme_ratio / self.extreme_saturation).min(1.0)
            * (transition_ratio / self.transition_saturation).min(1.0);

        TextDetectionResult {
            has_text: confidence >= self.min_confidence,
            confidence,
            text_rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_frame(width: u32, height: u32, fill: u8, index: usize) -> Frame {
        let mut frame = Frame::filled(width, height, [fill, fill, fill]);
        frame.index = index;
        frame
    }

    /// 底部 15% 画 1px 黑白交替的“字幕”
    fn with_subtitle(mut frame: Frame) -> Frame {
        let start = frame.height - frame.height * 15 / 100;
        for y in start..frame.height {
            for x in 0..frame.width {
                let v = if x % 2 == 0 { 255 } else { 0 };
                let idx = ((y * frame.width + x) * 4) as usize;
                frame.data[idx..idx + 3].copy_from_slice(&[v, v, v]);
            }
        }
        frame
    }

    #[test]
    fn test_mock_detector_with_pattern() {
        let detector = MockTextDetector::with_pattern(|n| n % 10 == 0);

        let result = detector.detect(&create_test_frame(100, 100, 128, 10));
        assert!(result.has_text);
        assert_eq!(result.text_rows, 2);

        let result = detector.detect(&create_test_frame(100, 100, 128, 5));
        assert!(!result.has_text);
        assert_eq!(result.text_rows, 0);
    }

    #[test]
    fn test_mock_detector_with_fixed_frames() {
        let detector = MockTextDetector::with_fixed_frames(vec![5, 10, 15]);

        assert!(detector.detect(&create_test_frame(10, 10, 128, 5)).has_text);
        assert!(detector.detect(&create_test_frame(10, 10, 128, 10)).has_text);
        assert!(!detector.detect(&create_test_frame(10, 10, 128, 7)).has_text);
    }

    #[test]
    fn test_band_detector_finds_subtitle() {
        let detector = BandTextDetector::new();
        let frame = with_subtitle(create_test_frame(200, 100, 128, 0));

        let result = detector.detect(&frame);
        assert!(result.has_text);
        assert!(result.confidence > 0.5);
        assert!(result.text_rows > 0);
    }

    #[test]
    fn test_band_detector_ignores_letterbox() {
        let detector = BandTextDetector::new();
        // 底部黑边：极暗但无跳变
        let mut frame = create_test_frame(200, 100, 128, 0);
        for y in 80..100u32 {
            for x in 0..200u32 {
                let idx = ((y * 200 + x) * 4) as usize;
                frame.data[idx..idx + 3].copy_from_slice(&[0, 0, 0]);
            }
        }

        let result = detector.detect(&frame);
        assert!(!result.has_text);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_band_detector_ignores_text_above_band() {
        let detector = BandTextDetector::new();
        let mut frame = with_subtitle(create_test_frame(200, 100, 128, 0));
        // 把字幕挪到顶部
        frame.data.rotate_left((200 * 85 * 4) as usize);

        let result = detector.detect(&frame);
        assert!(!result.has_text);
    }

    #[test]
    fn test_band_detector_uniform_frame() {
        let detector = BandTextDetector::new();
        assert!(!detector.detect(&create_test_frame(64, 64, 128, 0)).has_text);
        assert!(!detector.detect(&create_test_frame(64, 64, 0, 0)).has_text);
    }
}
