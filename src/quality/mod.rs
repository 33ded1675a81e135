//! Frame quality gate.
//!
//! Three independently toggleable checks run in a fixed order: motion, quality
//! score, perceptual-hash dedup. The first failing check decides the drop reason and
//! later checks do not run for that frame.

pub mod motion;
pub mod phash;
pub mod score;

pub use motion::{MotionCheck, MotionConfig, MotionDetector, MotionMasker};
pub use phash::{PerceptualHash, RecentHashes};
pub use score::{QualityConfig, QualityScore};

use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct DedupHashConfig {
    pub enabled: bool,
    pub ring_size: usize,
    pub hamming_threshold: u32,
}

impl Default for DedupHashConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ring_size: phash::DEFAULT_RING_SIZE,
            hamming_threshold: phash::DEFAULT_HAMMING_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GateConfig {
    /// Mean luma below which the scene is treated as night.
    pub night_brightness: f32,
    pub motion: MotionConfig,
    pub quality: QualityConfig,
    pub dedup: DedupHashConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            night_brightness: 60.0,
            motion: MotionConfig::default(),
            quality: QualityConfig::default(),
            dedup: DedupHashConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    NoMotion,
    LowQuality,
    Duplicate,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::NoMotion => "no_motion",
            DropReason::LowQuality => "low_quality",
            DropReason::Duplicate => "duplicate",
        }
    }
}

/// Measurements for a frame that passed every enabled check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateReport {
    pub is_night: bool,
    pub mean_luma: f32,
    pub motion_pct: Option<f32>,
    /// Quality score when the check ran; passes through as 100 otherwise.
    pub quality: f32,
    pub hash: Option<PerceptualHash>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GateVerdict {
    Pass(GateReport),
    Drop(DropReason),
}

impl GateVerdict {
    pub fn passed(&self) -> Option<&GateReport> {
        match self {
            GateVerdict::Pass(report) => Some(report),
            GateVerdict::Drop(_) => None,
        }
    }
}

pub struct FrameQualityGate {
    config: GateConfig,
    motion: MotionDetector,
    recent: RecentHashes,
}

impl FrameQualityGate {
    pub fn new(config: GateConfig) -> Self {
        let motion = MotionDetector::new(config.motion.clone());
        let recent = RecentHashes::new(config.dedup.ring_size, config.dedup.hamming_threshold);
        Self {
            config,
            motion,
            recent,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn is_night(&self, frame: &Frame) -> bool {
        frame.mean_brightness() < self.config.night_brightness
    }

    pub fn evaluate(&mut self, frame: &Frame) -> GateVerdict {
        let mean_luma = frame.mean_brightness();
        let is_night = mean_luma < self.config.night_brightness;

        let mut motion_pct = None;
        if self.config.motion.enabled {
            let check = self.motion.check(frame, is_night);
            if !check.has_motion {
                return GateVerdict::Drop(DropReason::NoMotion);
            }
            motion_pct = check.changed_pct;
        }

        let mut quality = 100.0;
        if self.config.quality.enabled {
            let q = score::score_gray(frame.gray(), is_night, &self.config.quality);
            if q.score < self.config.quality.min_score(is_night) {
                log::trace!(
                    "[{}] frame {} below quality floor ({:.1})",
                    frame.camera_id,
                    frame.sequence_no,
                    q.score
                );
                return GateVerdict::Drop(DropReason::LowQuality);
            }
            quality = q.score;
        }

        let mut hash = None;
        if self.config.dedup.enabled {
            let h = PerceptualHash::of_gray(frame.gray());
            if self.recent.check_and_insert(h) {
                return GateVerdict::Drop(DropReason::Duplicate);
            }
            hash = Some(h);
        }

        GateVerdict::Pass(GateReport {
            is_night,
            mean_luma,
            motion_pct,
            quality,
            hash,
        })
    }

    /// Forget the previous frame and the hash ring, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.motion.reset();
        self.recent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn textured(shift: u32, seq: u64) -> Frame {
        let (w, h) = (48u32, 32u32);
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                let v = if ((x + shift) / 4 + y / 4) % 2 == 0 { 60 } else { 190 };
                pixels.extend_from_slice(&[v, v, v]);
            }
        }
        Frame::new("cam-test", seq, Instant::now(), 0, w, h, pixels).unwrap()
    }

    fn flat(value: u8, seq: u64) -> Frame {
        Frame::new("cam-test", seq, Instant::now(), 0, 48, 32, vec![value; 48 * 32 * 3]).unwrap()
    }

    #[test]
    fn identical_second_frame_drops_for_no_motion() {
        let mut gate = FrameQualityGate::new(GateConfig::default());
        assert!(gate.evaluate(&textured(0, 1)).passed().is_some());
        assert_eq!(
            gate.evaluate(&textured(0, 2)),
            GateVerdict::Drop(DropReason::NoMotion)
        );
    }

    #[test]
    fn identical_frame_is_duplicate_when_motion_disabled() {
        let mut config = GateConfig::default();
        config.motion.enabled = false;
        let mut gate = FrameQualityGate::new(config);
        assert!(gate.evaluate(&textured(0, 1)).passed().is_some());
        assert_eq!(
            gate.evaluate(&textured(0, 2)),
            GateVerdict::Drop(DropReason::Duplicate)
        );
    }

    #[test]
    fn flat_frame_fails_quality_before_dedup() {
        let mut config = GateConfig::default();
        config.motion.enabled = false;
        let mut gate = FrameQualityGate::new(config);
        assert_eq!(
            gate.evaluate(&flat(128, 1)),
            GateVerdict::Drop(DropReason::LowQuality)
        );
        // The rejected frame never reached the hash ring.
        gate.config.quality.enabled = false;
        assert!(gate.evaluate(&flat(128, 2)).passed().is_some());
    }

    #[test]
    fn dark_scene_is_night() {
        let gate = FrameQualityGate::new(GateConfig::default());
        assert!(gate.is_night(&flat(30, 1)));
        assert!(!gate.is_night(&flat(120, 1)));
    }

    #[test]
    fn all_checks_disabled_passes_everything() {
        let config = GateConfig {
            motion: MotionConfig {
                enabled: false,
                ..MotionConfig::default()
            },
            quality: QualityConfig {
                enabled: false,
                ..QualityConfig::default()
            },
            dedup: DedupHashConfig {
                enabled: false,
                ..DedupHashConfig::default()
            },
            ..GateConfig::default()
        };
        let mut gate = FrameQualityGate::new(config);
        for seq in 1..5 {
            let verdict = gate.evaluate(&flat(128, seq));
            assert_eq!(verdict.passed().map(|r| r.quality), Some(100.0));
        }
    }
}
