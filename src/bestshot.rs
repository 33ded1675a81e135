//! Best-shot selection.
//!
//! At most one window is open at a time per selector. Every input goes through a
//! single transition function over `WindowState`; within one update the candidate
//! is merged first and then at most one close decision is taken, so a window is
//! never finalized twice.

use std::time::{Duration, Instant};

use crate::frame::FrameRef;
use crate::tracker::{BBox, TrackId};

pub const OCR_WEIGHT: f32 = 0.55;
pub const DET_WEIGHT: f32 = 0.15;
pub const SHARPNESS_WEIGHT: f32 = 0.15;
pub const QUALITY_WEIGHT: f32 = 0.10;
pub const AREA_WEIGHT: f32 = 0.05;

#[derive(Clone, Debug)]
pub struct BestShotConfig {
    /// Candidates with OCR confidence below this never touch a window.
    pub ocr_floor: f32,
    /// OCR confidence at or above which a window closes immediately.
    pub fast_path: f32,
    pub window: Duration,
    pub gap: Duration,
}

impl Default for BestShotConfig {
    fn default() -> Self {
        Self {
            ocr_floor: 0.70,
            fast_path: 0.95,
            window: Duration::from_millis(2500),
            gap: Duration::from_millis(1000),
        }
    }
}

/// Per-candidate inputs, each in 0..=1.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ComponentScores {
    pub ocr_conf: f32,
    pub det_conf: f32,
    pub sharpness: f32,
    pub frame_quality: f32,
    pub area_ratio: f32,
}

impl ComponentScores {
    pub fn combined(&self) -> f32 {
        OCR_WEIGHT * self.ocr_conf.clamp(0.0, 1.0)
            + DET_WEIGHT * self.det_conf.clamp(0.0, 1.0)
            + SHARPNESS_WEIGHT * self.sharpness.clamp(0.0, 1.0)
            + QUALITY_WEIGHT * self.frame_quality.clamp(0.0, 1.0)
            + AREA_WEIGHT * self.area_ratio.clamp(0.0, 1.0)
    }
}

#[derive(Clone, Debug)]
pub struct CaptureCandidate {
    pub frame: FrameRef,
    /// Normalized plate text, or `track:{id}` when no text was read.
    pub vehicle_key: String,
    pub track_id: Option<TrackId>,
    pub zone: Option<String>,
    pub plate_text: Option<String>,
    pub plate_bbox: Option<BBox>,
    pub scores: ComponentScores,
    pub combined_score: f32,
    /// Set by the selector from its fast-path bar.
    pub is_fast_path: bool,
}

impl CaptureCandidate {
    pub fn new(frame: FrameRef, vehicle_key: impl Into<String>, scores: ComponentScores) -> Self {
        Self {
            frame,
            vehicle_key: vehicle_key.into(),
            track_id: None,
            zone: None,
            plate_text: None,
            plate_bbox: None,
            combined_score: scores.combined(),
            scores,
            is_fast_path: false,
        }
    }

    pub fn with_track(mut self, track_id: Option<TrackId>) -> Self {
        self.track_id = track_id;
        self
    }

    pub fn with_zone(mut self, zone: Option<String>) -> Self {
        self.zone = zone;
        self
    }

    pub fn with_plate(mut self, text: Option<String>, bbox: Option<BBox>) -> Self {
        self.plate_text = text;
        self.plate_bbox = bbox;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizeReason {
    FastPath,
    WindowElapsed,
    KeyChanged,
    Gap,
    Forced,
}

impl FinalizeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizeReason::FastPath => "fast_path",
            FinalizeReason::WindowElapsed => "window_elapsed",
            FinalizeReason::KeyChanged => "key_changed",
            FinalizeReason::Gap => "gap",
            FinalizeReason::Forced => "forced",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Finalized {
    pub candidate: CaptureCandidate,
    pub reason: FinalizeReason,
    pub opened_at: Instant,
    pub closed_at: Instant,
    /// Accepted candidates merged into the window.
    pub updates: u32,
}

#[derive(Debug)]
struct Window {
    key: String,
    opened_at: Instant,
    last_update: Instant,
    best: CaptureCandidate,
    updates: u32,
}

#[derive(Debug, Default)]
enum WindowState {
    #[default]
    Idle,
    Open(Window),
}

enum Input {
    Candidate(CaptureCandidate),
    Tick,
    Flush,
}

pub struct BestShotSelector {
    config: BestShotConfig,
    state: WindowState,
}

impl BestShotSelector {
    pub fn new(config: BestShotConfig) -> Self {
        Self {
            config,
            state: WindowState::Idle,
        }
    }

    pub fn config(&self) -> &BestShotConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, WindowState::Open(_))
    }

    pub fn open_key(&self) -> Option<&str> {
        match &self.state {
            WindowState::Open(w) => Some(w.key.as_str()),
            WindowState::Idle => None,
        }
    }

    pub fn best_score(&self) -> Option<f32> {
        match &self.state {
            WindowState::Open(w) => Some(w.best.combined_score),
            WindowState::Idle => None,
        }
    }

    /// Offer a candidate. Returns the windows finalized by this call: the previous
    /// key's window when the key changed, and/or this key's window when it closed.
    pub fn update(&mut self, now: Instant, candidate: CaptureCandidate) -> Vec<Finalized> {
        self.transition(now, Input::Candidate(candidate))
    }

    /// Close the open window when nothing has been merged for `gap`. Call once per
    /// loop iteration whether or not a frame passed the gate.
    pub fn flush_if_gap(&mut self, now: Instant) -> Option<Finalized> {
        self.transition(now, Input::Tick).pop()
    }

    /// Close the open window unconditionally (shutdown, end of stream).
    pub fn flush(&mut self, now: Instant) -> Option<Finalized> {
        self.transition(now, Input::Flush).pop()
    }

    fn transition(&mut self, now: Instant, input: Input) -> Vec<Finalized> {
        let mut out = Vec::new();
        let state = std::mem::take(&mut self.state);

        self.state = match (state, input) {
            (WindowState::Idle, Input::Tick | Input::Flush) => WindowState::Idle,

            (WindowState::Open(w), Input::Tick) => {
                if now.saturating_duration_since(w.last_update) >= self.config.gap {
                    out.push(close(w, now, FinalizeReason::Gap));
                    WindowState::Idle
                } else {
                    WindowState::Open(w)
                }
            }

            (WindowState::Open(w), Input::Flush) => {
                out.push(close(w, now, FinalizeReason::Forced));
                WindowState::Idle
            }

            (state, Input::Candidate(candidate))
                if candidate.scores.ocr_conf < self.config.ocr_floor =>
            {
                log::trace!(
                    "candidate {} below OCR floor ({:.2})",
                    candidate.vehicle_key,
                    candidate.scores.ocr_conf
                );
                state
            }

            (state, Input::Candidate(mut candidate)) => {
                candidate.is_fast_path = candidate.scores.ocr_conf >= self.config.fast_path;
                let fast = candidate.is_fast_path;

                // Merge first.
                let window = match state {
                    WindowState::Open(mut w) if w.key == candidate.vehicle_key => {
                        if candidate.combined_score > w.best.combined_score {
                            w.best = candidate;
                        }
                        w.updates += 1;
                        w.last_update = now;
                        w
                    }
                    other => {
                        if let WindowState::Open(previous) = other {
                            out.push(close(previous, now, FinalizeReason::KeyChanged));
                        }
                        Window {
                            key: candidate.vehicle_key.clone(),
                            opened_at: now,
                            last_update: now,
                            best: candidate,
                            updates: 1,
                        }
                    }
                };

                // Then one close decision.
                if fast {
                    out.push(close(window, now, FinalizeReason::FastPath));
                    WindowState::Idle
                } else if now.saturating_duration_since(window.opened_at) >= self.config.window {
                    out.push(close(window, now, FinalizeReason::WindowElapsed));
                    WindowState::Idle
                } else {
                    WindowState::Open(window)
                }
            }
        };
        out
    }
}

impl Default for BestShotSelector {
    fn default() -> Self {
        Self::new(BestShotConfig::default())
    }
}

fn close(window: Window, now: Instant, reason: FinalizeReason) -> Finalized {
    log::debug!(
        "best shot for {} finalized ({:?}, {} updates, score {:.3})",
        window.key,
        reason,
        window.updates,
        window.best.combined_score
    );
    Finalized {
        candidate: window.best,
        reason,
        opened_at: window.opened_at,
        closed_at: now,
        updates: window.updates,
    }
}
