use anyhow::Result;
use image::{GrayImage, RgbImage};

use crate::detect::backend::Recognizer;
use crate::detect::result::{PlateDetection, PlateRead};
use crate::frame::{laplacian_variance, Frame};
use crate::tracker::BBox;

#[derive(Clone, Debug)]
pub struct StubRecognizerConfig {
    /// Text returned for every readable plate.
    pub text: String,
    pub ocr_confidence: f32,
    /// Luma at or above which a pixel counts as plate background.
    pub bright_level: u8,
    /// Minimum bright pixels for a plate to be located.
    pub min_pixels: usize,
}

impl Default for StubRecognizerConfig {
    fn default() -> Self {
        Self {
            text: "AB1234".to_string(),
            ocr_confidence: 0.85,
            bright_level: 235,
            min_pixels: 12,
        }
    }
}

/// Deterministic recognizer for tests and the synthetic stream.
///
/// Plates are the bounding box of near-white pixels; detection confidence is how
/// densely the box is filled. A crop is "readable" when it contains both bright
/// background and some edge energy.
pub struct StubRecognizer {
    config: StubRecognizerConfig,
}

impl StubRecognizer {
    pub fn new(config: StubRecognizerConfig) -> Self {
        Self { config }
    }

    fn bright_box(&self, gray: &GrayImage) -> Option<(BBox, usize)> {
        let mut count = 0usize;
        let (mut x1, mut y1, mut x2, mut y2) = (u32::MAX, u32::MAX, 0u32, 0u32);
        for (x, y, p) in gray.enumerate_pixels() {
            if p[0] >= self.config.bright_level {
                count += 1;
                x1 = x1.min(x);
                y1 = y1.min(y);
                x2 = x2.max(x + 1);
                y2 = y2.max(y + 1);
            }
        }
        if count < self.config.min_pixels {
            return None;
        }
        Some((
            BBox::new(x1 as f32, y1 as f32, x2 as f32, y2 as f32),
            count,
        ))
    }
}

impl Default for StubRecognizer {
    fn default() -> Self {
        Self::new(StubRecognizerConfig::default())
    }
}

impl Recognizer for StubRecognizer {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect_plate(&mut self, frame: &Frame) -> Result<Option<PlateDetection>> {
        Ok(self.bright_box(frame.gray()).map(|(bbox, count)| {
            let fill = count as f32 / bbox.area().max(1.0);
            PlateDetection {
                bbox,
                confidence: (0.5 + fill * 0.5).min(1.0),
            }
        }))
    }

    fn recognize(&mut self, crop: &RgbImage) -> Result<Option<PlateRead>> {
        let gray = image::imageops::grayscale(crop);
        if self.bright_box(&gray).is_none() || laplacian_variance(&gray) <= 0.0 {
            return Ok(None);
        }
        Ok(Some(PlateRead {
            text: self.config.text.clone(),
            confidence: self.config.ocr_confidence,
        }))
    }
}
