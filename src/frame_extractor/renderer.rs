//! 缩略图渲染 - 等比缩放、轻度调色、编码；任何失败都输出带标记的占位图

use image::{DynamicImage, ImageOutputFormat, RgbImage, RgbaImage};
use log::warn;
use std::io::Cursor;

use crate::core::error::RenderError;
use crate::core::video::Frame;
use crate::frame_extractor::candidate::PlaceholderKind;
use crate::frame_extractor::settings::{ExtractionSettings, OutputFormat};

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub format: OutputFormat,
    /// JPEG 质量 1-100，其他格式忽略
    pub quality: u8,
    pub contrast: f32,
    pub brightness: f32,
    /// 采样亮度最大值不超过该值判为近全黑
    pub blank_max_luma: u8,
    pub blank_stride: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_width: 640,
            max_height: 360,
            format: OutputFormat::Jpeg,
            quality: 85,
            contrast: 1.1,
            brightness: 5.0,
            blank_max_luma: 16,
            blank_stride: 8,
        }
    }
}

impl RenderConfig {
    pub fn from_settings(settings: &ExtractionSettings) -> Self {
        Self {
            max_width: settings.output_max_width,
            max_height: settings.output_max_height,
            format: settings.output_format,
            quality: settings.output_quality,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub placeholder: Option<PlaceholderKind>,
}

pub struct ThumbnailRenderer {
    config: RenderConfig,
}

impl ThumbnailRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// 永不失败：近全黑帧 -> Blank 占位，内部错误 -> RenderFailed 占位
    pub fn render(&self, frame: &Frame) -> RenderedImage {
        if frame.is_well_formed() && is_blank(frame, self.config.blank_stride, self.config.blank_max_luma) {
            warn!("⬛ frame@{:.2}s is blank, emitting placeholder", frame.timestamp_secs);
            return self.placeholder(PlaceholderKind::Blank, frame.width, frame.height);
        }

        match self.try_render(frame) {
            Ok(image) => image,
            Err(e) => {
                warn!("❌ render frame@{:.2}s failed: {}", frame.timestamp_secs, e);
                self.placeholder(PlaceholderKind::RenderFailed, frame.width, frame.height)
            }
        }
    }

    pub fn try_render(&self, frame: &Frame) -> Result<RenderedImage, RenderError> {
        let invalid = || RenderError::InvalidBuffer {
            width: frame.width,
            height: frame.height,
        };
        if !frame.is_well_formed() || frame.width == 0 || frame.height == 0 {
            return Err(invalid());
        }

        let (width, height) = fit_within(frame.width, frame.height, self.config.max_width, self.config.max_height);
        let mut scaled = if (width, height) == (frame.width, frame.height) {
            frame.clone()
        } else {
            frame.resize_to(width, height).ok_or_else(invalid)?
        };

        adjust(&mut scaled.data, self.config.contrast, self.config.brightness);
        let data = encode_frame(&scaled, self.config.format, self.config.quality)?;

        Ok(RenderedImage {
            data,
            width,
            height,
            placeholder: None,
        })
    }

    /// 按原帧比例生成占位图；Blank 为灰底斜纹，RenderFailed 为暗红底叉号
    pub fn placeholder(&self, kind: PlaceholderKind, source_width: u32, source_height: u32) -> RenderedImage {
        let (w, h) = if source_width == 0 || source_height == 0 {
            (self.config.max_width.max(1), self.config.max_height.max(1))
        } else {
            fit_within(source_width, source_height, self.config.max_width, self.config.max_height)
        };

        let mut img = RgbImage::new(w, h);
        for (x, y, px) in img.enumerate_pixels_mut() {
            *px = image::Rgb(match kind {
                PlaceholderKind::Blank => {
                    if (x + y) % 24 < 4 {
                        [96, 96, 96]
                    } else {
                        [48, 48, 48]
                    }
                }
                PlaceholderKind::RenderFailed => {
                    // 两条对角线
                    let on_diag = (x as u64 * h as u64).abs_diff(y as u64 * w as u64) < 3 * w.max(h) as u64
                        || ((w - 1 - x.min(w - 1)) as u64 * h as u64).abs_diff(y as u64 * w as u64)
                            < 3 * w.max(h) as u64;
                    if on_diag {
                        [230, 230, 230]
                    } else {
                        [120, 20, 20]
                    }
                }
            });
        }

        let data = encode_rgb(img, self.config.format, self.config.quality).unwrap_or_else(|e| {
            warn!("❌ placeholder encode failed: {}", e);
            Vec::new()
        });

        RenderedImage {
            data,
            width: w,
            height: h,
            placeholder: Some(kind),
        }
    }
}

/// 等比缩放到框内，只缩小不放大
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }
    let max_width = max_width.max(1);
    let max_height = max_height.max(1);
    if width <= max_width && height <= max_height {
        return (width, height);
    }
    let scale = (max_width as f64 / width as f64).min(max_height as f64 / height as f64);
    let w = ((width as f64 * scale).round() as u32).clamp(1, max_width);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max_height);
    (w, h)
}

pub fn is_blank(frame: &Frame, stride: u32, max_luma: u8) -> bool {
    let stride = stride.max(1) as usize;
    for y in (0..frame.height).step_by(stride) {
        for x in (0..frame.width).step_by(stride) {
            if frame.luma_at(x, y) > max_luma {
                return false;
            }
        }
    }
    true
}

/// (v - 128) × contrast + 128 + brightness，作用于 RGBA 的 RGB 通道
pub fn adjust(rgba: &mut [u8], contrast: f32, brightness: f32) {
    let mut lut = [0u8; 256];
    for (v, out) in lut.iter_mut().enumerate() {
        *out = ((v as f32 - 128.0) * contrast + 128.0 + brightness).round().clamp(0.0, 255.0) as u8;
    }
    for px in rgba.chunks_exact_mut(4) {
        px[0] = lut[px[0] as usize];
        px[1] = lut[px[1] as usize];
        px[2] = lut[px[2] as usize];
    }
}

pub fn encode_frame(frame: &Frame, format: OutputFormat, quality: u8) -> Result<Vec<u8>, RenderError> {
    let rgba = RgbaImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or(
        RenderError::InvalidBuffer {
            width: frame.width,
            height: frame.height,
        },
    )?;
    encode_rgb(DynamicImage::ImageRgba8(rgba).to_rgb8(), format, quality)
}

fn encode_rgb(img: RgbImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>, RenderError> {
    let output = match format {
        OutputFormat::Jpeg => ImageOutputFormat::Jpeg(quality.clamp(1, 100)),
        OutputFormat::Png => ImageOutputFormat::Png,
        OutputFormat::Bmp => ImageOutputFormat::Bmp,
    };
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img).write_to(&mut buffer, output)?;
    Ok(buffer.into_inner())
}
