//! Frame data model.
//!
//! - `Frame`: one decoded RGB frame from a camera, immutable once produced.
//! - `FrameRef`: shared handle passed through the pipeline. A frame is freed when the
//!   last track, candidate window or in-flight capture holding its handle lets go.
//!
//! Sources construct frames; every later stage only reads them. The grayscale plane
//! is derived lazily and cached because the gate, trigger, detector and recognizer
//! all consume it.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, RgbImage};
use std::sync::{Arc, OnceLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::tracker::BBox;

/// Shared, immutable frame handle.
pub type FrameRef = Arc<Frame>;

/// JPEG quality used for persisted captures.
pub const CAPTURE_JPEG_QUALITY: u8 = 90;

pub struct Frame {
    /// Camera this frame came from.
    pub camera_id: String,
    /// Per-source monotonic counter, starting at 1.
    pub sequence_no: u64,
    /// Monotonic capture instant. All pipeline timing uses this.
    pub captured_at: Instant,
    /// Wall-clock capture time in milliseconds since the epoch (capture metadata only).
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    image: RgbImage,
    gray: OnceLock<GrayImage>,
}

impl Frame {
    /// Build a frame from packed RGB24 bytes.
    pub fn new(
        camera_id: &str,
        sequence_no: u64,
        captured_at: Instant,
        timestamp_ms: u64,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer does not fit {}x{}", width, height))?;
        Ok(Self::from_image(
            camera_id,
            sequence_no,
            captured_at,
            timestamp_ms,
            image,
        ))
    }

    /// Build a frame around an already decoded image.
    pub fn from_image(
        camera_id: &str,
        sequence_no: u64,
        captured_at: Instant,
        timestamp_ms: u64,
        image: RgbImage,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            sequence_no,
            captured_at,
            timestamp_ms,
            width: image.width(),
            height: image.height(),
            image,
            gray: OnceLock::new(),
        }
    }

    pub fn into_ref(self) -> FrameRef {
        Arc::new(self)
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.image
    }

    /// Luma plane, computed on first use.
    pub fn gray(&self) -> &GrayImage {
        self.gray
            .get_or_init(|| image::imageops::grayscale(&self.image))
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Mean luma in 0..=255.
    pub fn mean_brightness(&self) -> f32 {
        let gray = self.gray();
        let count = gray.as_raw().len();
        if count == 0 {
            return 0.0;
        }
        let sum: u64 = gray.as_raw().iter().map(|&v| v as u64).sum();
        sum as f32 / count as f32
    }

    /// Crop a box (pixel coordinates) out of the frame, clamped to the frame bounds.
    /// Returns `None` when the clamped box is empty.
    pub fn crop(&self, bbox: &BBox) -> Option<RgbImage> {
        let (x, y, w, h) = bbox.clamped_pixels(self.width, self.height)?;
        Some(image::imageops::crop_imm(&self.image, x, y, w, h).to_image())
    }

    /// JPEG-encode the full frame for persistence.
    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        encode_jpeg(&self.image)
    }

    pub fn byte_len(&self) -> usize {
        self.image.as_raw().len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("camera_id", &self.camera_id)
            .field("sequence_no", &self.sequence_no)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, CAPTURE_JPEG_QUALITY);
    encoder
        .encode_image(image)
        .context("encode capture as JPEG")?;
    Ok(out)
}

/// Wall-clock milliseconds since the epoch.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Local sharpness of an image: variance of the 4-neighbour Laplacian of its luma.
pub fn laplacian_variance(gray: &GrayImage) -> f32 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let mut sum = 0f64;
    let mut sum_sq = 0f64;
    let mut n = 0f64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = gray.get_pixel(x, y)[0] as f64;
            let lap = gray.get_pixel(x - 1, y)[0] as f64
                + gray.get_pixel(x + 1, y)[0] as f64
                + gray.get_pixel(x, y - 1)[0] as f64
                + gray.get_pixel(x, y + 1)[0] as f64
                - 4.0 * c;
            sum += lap;
            sum_sq += lap * lap;
            n += 1.0;
        }
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(value: u8, width: u32, height: u32) -> Frame {
        let pixels = vec![value; (width * height * 3) as usize];
        Frame::new("cam-test", 1, Instant::now(), 0, width, height, pixels).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let result = Frame::new("cam", 1, Instant::now(), 0, 4, 4, vec![0u8; 10]);
        assert!(result.is_err());
    }

    #[test]
    fn gray_plane_is_cached_and_sized() {
        let frame = solid_frame(100, 8, 6);
        let first = frame.gray() as *const GrayImage;
        let second = frame.gray() as *const GrayImage;
        assert_eq!(first, second);
        assert_eq!(frame.gray().dimensions(), (8, 6));
        assert!((frame.mean_brightness() - 100.0).abs() < 1.0);
    }

    #[test]
    fn crop_is_clamped_to_frame() {
        let frame = solid_frame(10, 10, 10);
        let crop = frame.crop(&BBox::new(6.0, 6.0, 20.0, 20.0)).unwrap();
        assert_eq!(crop.dimensions(), (4, 4));
        assert!(frame.crop(&BBox::new(12.0, 12.0, 20.0, 20.0)).is_none());
    }

    #[test]
    fn flat_image_has_zero_sharpness() {
        let frame = solid_frame(128, 16, 16);
        assert_eq!(laplacian_variance(frame.gray()), 0.0);
    }

    #[test]
    fn checkerboard_is_sharp() {
        let mut img = GrayImage::new(16, 16);
        for (x, y, p) in img.enumerate_pixels_mut() {
            p[0] = if (x + y) % 2 == 0 { 0 } else { 255 };
        }
        assert!(laplacian_variance(&img) > 1000.0);
    }

    #[test]
    fn jpeg_encoding_produces_bytes() -> Result<()> {
        let frame = solid_frame(50, 16, 16);
        let bytes = frame.encode_jpeg()?;
        assert!(bytes.starts_with(&[0xFF, 0xD8]));
        Ok(())
    }
}
