//! Frame-difference motion primitives.
//!
//! Shared by the gate's motion check, the zone fill-ratio trigger and the
//! motion-blob vehicle detector. Each owner keeps its own previous frame.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;

use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct MotionConfig {
    pub enabled: bool,
    /// Gaussian sigma applied before differencing. 0 disables blurring.
    pub blur_sigma: f32,
    /// Per-pixel absolute luma change that counts as "changed".
    pub pixel_delta: u8,
    /// Changed-pixel percentage required during the day.
    pub day_changed_pct: f32,
    /// Changed-pixel percentage required at night (sensor noise is higher).
    pub night_changed_pct: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blur_sigma: 1.0,
            pixel_delta: 25,
            day_changed_pct: 0.5,
            night_changed_pct: 1.5,
        }
    }
}

pub fn blurred(gray: &GrayImage, sigma: f32) -> GrayImage {
    if sigma > 0.0 {
        imageproc::filter::gaussian_blur_f32(gray, sigma)
    } else {
        gray.clone()
    }
}

/// Binary mask (0/255) of pixels whose luma changed by more than `delta`.
pub fn diff_mask(prev: &GrayImage, cur: &GrayImage, delta: u8) -> GrayImage {
    let (w, h) = cur.dimensions();
    let mut mask = GrayImage::new(w, h);
    for ((out, a), b) in mask
        .pixels_mut()
        .zip(prev.pixels())
        .zip(cur.pixels())
    {
        if a[0].abs_diff(b[0]) > delta {
            *out = Luma([255]);
        }
    }
    mask
}

/// Morphological opening; removes speckle smaller than the structuring element.
pub fn open_mask(mask: &GrayImage, radius: u8) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    imageproc::morphology::open(mask, Norm::LInf, radius)
}

pub fn count_set(mask: &GrayImage) -> usize {
    mask.as_raw().iter().filter(|&&v| v > 0).count()
}

/// Result of one motion check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionCheck {
    pub has_motion: bool,
    /// Percentage of changed pixels; `None` on cold start.
    pub changed_pct: Option<f32>,
    pub threshold_pct: f32,
}

/// Gate-side motion check with a day/night adaptive threshold.
pub struct MotionDetector {
    config: MotionConfig,
    prev: Option<GrayImage>,
}

impl MotionDetector {
    pub fn new(config: MotionConfig) -> Self {
        Self { config, prev: None }
    }

    /// Compare `frame` against the previously checked frame and remember it.
    ///
    /// The first frame, and the first frame after a resolution change, always has
    /// motion.
    pub fn check(&mut self, frame: &Frame, is_night: bool) -> MotionCheck {
        let threshold_pct = if is_night {
            self.config.night_changed_pct
        } else {
            self.config.day_changed_pct
        };
        let cur = blurred(frame.gray(), self.config.blur_sigma);
        let changed_pct = match self.prev.as_ref() {
            Some(prev) if prev.dimensions() == cur.dimensions() => {
                let mask = diff_mask(prev, &cur, self.config.pixel_delta);
                let total = mask.as_raw().len().max(1);
                Some(count_set(&mask) as f32 * 100.0 / total as f32)
            }
            _ => None,
        };
        self.prev = Some(cur);

        MotionCheck {
            has_motion: changed_pct.map_or(true, |pct| pct > threshold_pct),
            changed_pct,
            threshold_pct,
        }
    }

    pub fn reset(&mut self) {
        self.prev = None;
    }
}

/// Produces an opened motion mask per frame, relative to the previous call.
pub struct MotionMasker {
    blur_sigma: f32,
    pixel_delta: u8,
    open_radius: u8,
    prev: Option<GrayImage>,
}

impl MotionMasker {
    pub fn new(blur_sigma: f32, pixel_delta: u8, open_radius: u8) -> Self {
        Self {
            blur_sigma,
            pixel_delta,
            open_radius,
            prev: None,
        }
    }

    /// `None` on the first frame or after a resolution change.
    pub fn next_mask(&mut self, gray: &GrayImage) -> Option<GrayImage> {
        let cur = blurred(gray, self.blur_sigma);
        let mask = match self.prev.as_ref() {
            Some(prev) if prev.dimensions() == cur.dimensions() => {
                let raw = diff_mask(prev, &cur, self.pixel_delta);
                Some(open_mask(&raw, self.open_radius))
            }
            _ => None,
        };
        self.prev = Some(cur);
        mask
    }
}

impl Default for MotionMasker {
    fn default() -> Self {
        Self::new(1.0, 25, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn frame_with_block(x0: u32, bg: u8, fg: u8) -> Frame {
        let (w, h) = (40u32, 30u32);
        let mut pixels = vec![bg; (w * h * 3) as usize];
        for y in 10..20 {
            for x in x0..(x0 + 10).min(w) {
                let i = ((y * w + x) * 3) as usize;
                pixels[i..i + 3].fill(fg);
            }
        }
        Frame::new("cam-test", 1, Instant::now(), 0, w, h, pixels).unwrap()
    }

    #[test]
    fn first_frame_always_has_motion() {
        let mut det = MotionDetector::new(MotionConfig::default());
        let check = det.check(&frame_with_block(0, 100, 20), false);
        assert!(check.has_motion);
        assert!(check.changed_pct.is_none());
    }

    #[test]
    fn static_scene_has_no_motion() {
        let mut det = MotionDetector::new(MotionConfig::default());
        det.check(&frame_with_block(0, 100, 20), false);
        let check = det.check(&frame_with_block(0, 100, 20), false);
        assert!(!check.has_motion);
        assert_eq!(check.changed_pct, Some(0.0));
    }

    #[test]
    fn moving_block_has_motion() {
        let mut det = MotionDetector::new(MotionConfig::default());
        det.check(&frame_with_block(0, 100, 20), false);
        let check = det.check(&frame_with_block(20, 100, 20), false);
        assert!(check.has_motion);
    }

    #[test]
    fn night_threshold_is_stricter() {
        let config = MotionConfig {
            blur_sigma: 0.0,
            day_changed_pct: 1.0,
            night_changed_pct: 20.0,
            ..MotionConfig::default()
        };
        // 10x10 block moving 2px changes 2 * 10 * 2 = 40 of 1200 px (3.3%).
        let mut day = MotionDetector::new(config.clone());
        day.check(&frame_with_block(5, 100, 20), false);
        assert!(day.check(&frame_with_block(7, 100, 20), false).has_motion);

        let mut night = MotionDetector::new(config);
        night.check(&frame_with_block(5, 100, 20), true);
        assert!(!night.check(&frame_with_block(7, 100, 20), true).has_motion);
    }

    #[test]
    fn opening_removes_speckle() {
        let mut mask = GrayImage::new(20, 20);
        mask.put_pixel(3, 3, Luma([255]));
        for y in 8..16 {
            for x in 8..16 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let opened = open_mask(&mask, 1);
        assert_eq!(opened.get_pixel(3, 3)[0], 0);
        assert_eq!(opened.get_pixel(12, 12)[0], 255);
    }

    #[test]
    fn masker_skips_first_frame() {
        let mut masker = MotionMasker::default();
        let a = frame_with_block(0, 100, 20);
        let b = frame_with_block(20, 100, 20);
        assert!(masker.next_mask(a.gray()).is_none());
        let mask = masker.next_mask(b.gray()).unwrap();
        assert!(count_set(&mask) > 100);
    }
}
