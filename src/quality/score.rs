//! 0-100 frame quality score with day and night profiles.

use image::GrayImage;

use crate::frame::laplacian_variance;

const SHARPNESS_WEIGHT: f32 = 0.40;
const BRIGHTNESS_WEIGHT: f32 = 0.25;
const CONTRAST_WEIGHT: f32 = 0.25;

/// Luma levels outside the ideal band over which brightness fitness falls to zero.
const BRIGHTNESS_FALLOFF: f32 = 80.0;
/// Luma standard deviation treated as full contrast.
const CONTRAST_REF: f32 = 64.0;

#[derive(Clone, Debug)]
pub struct QualityConfig {
    pub enabled: bool,
    /// Minimum acceptable score during the day.
    pub min_score_day: f32,
    /// Night minimum is `min_score_day * night_factor`.
    pub night_factor: f32,
    /// Laplacian variance treated as fully sharp.
    pub sharpness_ref: f32,
    pub day_band: (f32, f32),
    pub night_band: (f32, f32),
    /// Luma at or above which a pixel counts as glare.
    pub glare_level: u8,
    /// Score points removed per unit glare fraction.
    pub glare_penalty: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_score_day: 40.0,
            night_factor: 0.85,
            sharpness_ref: 300.0,
            day_band: (80.0, 180.0),
            night_band: (40.0, 140.0),
            glare_level: 250,
            glare_penalty: 50.0,
        }
    }
}

impl QualityConfig {
    pub fn min_score(&self, is_night: bool) -> f32 {
        if is_night {
            self.min_score_day * self.night_factor
        } else {
            self.min_score_day
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QualityScore {
    /// Combined score, 0..=100.
    pub score: f32,
    pub sharpness: f32,
    pub brightness: f32,
    pub contrast: f32,
    pub glare_fraction: f32,
    pub mean_luma: f32,
    pub is_night: bool,
}

pub fn score_gray(gray: &GrayImage, is_night: bool, config: &QualityConfig) -> QualityScore {
    let raw = gray.as_raw();
    let n = raw.len().max(1) as f32;

    let mean = raw.iter().map(|&v| v as f32).sum::<f32>() / n;
    let variance = raw
        .iter()
        .map(|&v| {
            let d = v as f32 - mean;
            d * d
        })
        .sum::<f32>()
        / n;
    let glare = raw.iter().filter(|&&v| v >= config.glare_level).count() as f32 / n;

    let sharpness = (laplacian_variance(gray) / config.sharpness_ref).min(1.0) * 100.0;
    let (lo, hi) = if is_night {
        config.night_band
    } else {
        config.day_band
    };
    let brightness = brightness_fitness(mean, lo, hi);
    let contrast = (variance.sqrt() / CONTRAST_REF).min(1.0) * 100.0;

    let score = (SHARPNESS_WEIGHT * sharpness
        + BRIGHTNESS_WEIGHT * brightness
        + CONTRAST_WEIGHT * contrast
        - config.glare_penalty * glare)
        .clamp(0.0, 100.0);

    QualityScore {
        score,
        sharpness,
        brightness,
        contrast,
        glare_fraction: glare,
        mean_luma: mean,
        is_night,
    }
}

fn brightness_fitness(mean: f32, lo: f32, hi: f32) -> f32 {
    let distance = if mean < lo {
        lo - mean
    } else if mean > hi {
        mean - hi
    } else {
        0.0
    };
    (100.0 - distance * 100.0 / BRIGHTNESS_FALLOFF).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn flat(value: u8) -> GrayImage {
        GrayImage::from_pixel(32, 32, Luma([value]))
    }

    fn checker(lo: u8, hi: u8) -> GrayImage {
        let mut img = GrayImage::new(32, 32);
        for (x, y, p) in img.enumerate_pixels_mut() {
            p[0] = if (x + y) % 2 == 0 { lo } else { hi };
        }
        img
    }

    #[test]
    fn flat_gray_scores_brightness_only() {
        let q = score_gray(&flat(128), false, &QualityConfig::default());
        assert_eq!(q.sharpness, 0.0);
        assert_eq!(q.contrast, 0.0);
        assert_eq!(q.brightness, 100.0);
        assert!((q.score - 25.0).abs() < 1e-3);
    }

    #[test]
    fn textured_frame_beats_flat_frame() {
        let cfg = QualityConfig::default();
        let textured = score_gray(&checker(60, 190), false, &cfg);
        let flat_q = score_gray(&flat(128), false, &cfg);
        assert!(textured.score > flat_q.score);
        assert!(textured.score >= cfg.min_score(false));
    }

    #[test]
    fn glare_is_penalised() {
        let cfg = QualityConfig::default();
        let clean = score_gray(&checker(60, 190), false, &cfg);
        let glare = score_gray(&checker(60, 255), false, &cfg);
        assert!(glare.glare_fraction > 0.4);
        assert!(glare.score < clean.score);
    }

    #[test]
    fn night_band_accepts_darker_scenes() {
        let cfg = QualityConfig::default();
        let day = score_gray(&flat(50), false, &cfg);
        let night = score_gray(&flat(50), true, &cfg);
        assert!(night.brightness > day.brightness);
        assert!(cfg.min_score(true) < cfg.min_score(false));
    }
}
