use image::imageops::FilterType;
use image::RgbaImage;

/// 帧数据结构（RGBA 像素缓冲）
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>, // RGBA 格式
    pub timestamp_secs: f64,
    pub index: usize,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>, timestamp_secs: f64, index: usize) -> Self {
        Self {
            width,
            height,
            data,
            timestamp_secs,
            index,
        }
    }

    /// 纯色帧，测试与占位图用
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .chain(std::iter::once(255))
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        Self::new(width, height, data, 0.0, 0)
    }

    pub fn pixel_count(&self) -> usize {
        (self.width * self.height) as usize
    }

    /// 缓冲长度与尺寸一致且非空
    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.pixel_count() * 4
    }

    pub fn same_dimensions(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height
    }

    #[inline]
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y * self.width + x) * 4) as usize;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    #[inline]
    pub fn luma_at(&self, x: u32, y: u32) -> u8 {
        luma(self.rgb_at(x, y))
    }

    pub fn long_edge(&self) -> u32 {
        self.width.max(self.height)
    }

    pub fn resize_to(&self, target_width: u32, target_height: u32) -> Option<Frame> {
        let img = RgbaImage::from_raw(self.width, self.height, self.data.clone())?;
        let resized = image::imageops::resize(&img, target_width, target_height, FilterType::Triangle);

        Some(Frame {
            width: target_width,
            height: target_height,
            data: resized.into_raw(),
            timestamp_secs: self.timestamp_secs,
            index: self.index,
        })
    }

    /// 长边超过 `max_edge` 时等比缩小，否则原样返回
    pub fn cap_long_edge(self, max_edge: u32) -> Frame {
        if max_edge == 0 || self.long_edge() <= max_edge {
            return self;
        }
        let scale = max_edge as f64 / self.long_edge() as f64;
        let w = ((self.width as f64 * scale).round() as u32).max(1);
        let h = ((self.height as f64 * scale).round() as u32).max(1);
        match self.resize_to(w, h) {
            Some(resized) => resized,
            None => self,
        }
    }
}

/// BT.601 亮度
#[inline]
pub fn luma(rgb: [u8; 3]) -> u8 {
    ((rgb[0] as u32 * 299 + rgb[1] as u32 * 587 + rgb[2] as u32 * 114) / 1000) as u8
}

/// 帧元数据（轻量级，用于传递信息）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub timestamp_secs: f64,
    pub index: usize,
}

impl FrameInfo {
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            timestamp_secs: frame.timestamp_secs,
            index: frame.index,
        }
    }
}

/// 解码器输出的 YUV420 平面帧
#[derive(Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub y_plane: Vec<u8>,
    pub u_plane: Vec<u8>,
    pub v_plane: Vec<u8>,
    pub timestamp_secs: f64,
}

impl RawFrame {
    pub fn to_rgba(&self, index: usize) -> Frame {
        let mut rgba_data = vec![0u8; (self.width * self.height * 4) as usize];
        let chroma_width = self.width.div_ceil(2);

        for y in 0..self.height {
            for x in 0..self.width {
                let y_idx = (y * self.width + x) as usize;
                let uv_idx = ((y / 2) * chroma_width + x / 2) as usize;

                let y_val = self.y_plane.get(y_idx).copied().unwrap_or(0) as f32;
                let u_val = self.u_plane.get(uv_idx).copied().unwrap_or(128) as f32 - 128.0;
                let v_val = self.v_plane.get(uv_idx).copied().unwrap_or(128) as f32 - 128.0;

                let r = (y_val + 1.402 * v_val).clamp(0.0, 255.0) as u8;
                let g = (y_val - 0.344136 * u_val - 0.714136 * v_val).clamp(0.0, 255.0) as u8;
                let b = (y_val + 1.772 * u_val).clamp(0.0, 255.0) as u8;

                let rgba_idx = y_idx * 4;
                rgba_data[rgba_idx] = r;
                rgba_data[rgba_idx + 1] = g;
                rgba_data[rgba_idx + 2] = b;
                rgba_data[rgba_idx + 3] = 255;
            }
        }

        Frame::new(self.width, self.height, rgba_data, self.timestamp_secs, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let data = vec![255u8; 100 * 100 * 4];
        let frame = Frame::new(100, 100, data, 1.5, 30);

        assert_eq!(frame.width, 100);
        assert_eq!(frame.height, 100);
        assert_eq!(frame.pixel_count(), 10000);
        assert_eq!(frame.timestamp_secs, 1.5);
        assert_eq!(frame.index, 30);
        assert!(frame.is_well_formed());
    }

    #[test]
    fn test_filled_frame_layout() {
        let frame = Frame::filled(4, 3, [10, 20, 30]);
        assert!(frame.is_well_formed());
        assert_eq!(frame.rgb_at(3, 2), [10, 20, 30]);
        assert_eq!(frame.data[3], 255);
    }

    #[test]
    fn test_frame_resize() {
        let frame = Frame::filled(100, 100, [255, 255, 255]);
        let resized = frame.resize_to(32, 32).unwrap();

        assert_eq!(resized.width, 32);
        assert_eq!(resized.height, 32);
        assert_eq!(resized.data.len(), 32 * 32 * 4);
    }

    #[test]
    fn test_cap_long_edge_keeps_aspect() {
        let frame = Frame::filled(2560, 1440, [1, 2, 3]);
        let capped = frame.cap_long_edge(1280);
        assert_eq!(capped.width, 1280);
        assert_eq!(capped.height, 720);

        let small = Frame::filled(640, 360, [1, 2, 3]).cap_long_edge(1280);
        assert_eq!(small.width, 640);
    }

    #[test]
    fn test_malformed_buffer_detected() {
        let frame = Frame::new(10, 10, vec![0u8; 12], 0.0, 0);
        assert!(!frame.is_well_formed());
        assert!(frame.resize_to(5, 5).is_none());
    }

    #[test]
    fn test_yuv_to_rgba() {
        let width = 64;
        let height = 64;
        let raw_frame = RawFrame {
            width,
            height,
            y_plane: vec![128u8; (width * height) as usize],
            u_plane: vec![128u8; (width * height / 4) as usize],
            v_plane: vec![128u8; (width * height / 4) as usize],
            timestamp_secs: 0.0,
        };

        let frame = raw_frame.to_rgba(0);
        assert_eq!(frame.width, width);
        assert_eq!(frame.height, height);
        assert_eq!(frame.data.len(), (width * height * 4) as usize);
        assert_eq!(frame.rgb_at(10, 10), [128, 128, 128]);
    }
}
