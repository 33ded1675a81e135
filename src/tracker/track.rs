use image::RgbImage;
use std::collections::VecDeque;
use std::time::Instant;

use super::BBox;

/// Camera-scoped, monotonically assigned track identifier.
pub type TrackId = u64;

/// Maximum number of centroid points kept per track.
pub const MAX_TRAJECTORY: usize = 30;

/// Number of trailing points used for the velocity estimate.
pub const VELOCITY_WINDOW: usize = 5;

/// Lifecycle of a tracked vehicle.
///
/// `New -> Active` once the track has enough hits. `Captured` and `Expired` are
/// terminal: a captured track never returns to `Active`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TrackState {
    #[default]
    New,
    Active,
    Captured,
    Expired,
}

/// Best crop seen so far for a track.
#[derive(Clone)]
pub struct BestCrop {
    pub image: RgbImage,
    pub bbox: BBox,
    pub score: f32,
    pub seen_at: Instant,
}

#[derive(Clone)]
pub struct Track {
    pub id: TrackId,
    pub bbox: BBox,
    pub state: TrackState,
    /// Centroid history, oldest first. Never longer than `MAX_TRAJECTORY`.
    trajectory: VecDeque<(f32, f32)>,
    /// Total matched frames.
    pub hit_count: u32,
    /// Consecutive matched frames; reset on a miss.
    pub consecutive_hits: u32,
    /// Frames since the track was born.
    pub age: u32,
    /// Frames since the last matched detection.
    pub time_since_update: u32,
    pub confidence: f32,
    best_crop: Option<BestCrop>,
    best_crop_score: f32,
    pub born_at: Instant,
    pub last_seen: Instant,
    /// Set when a recent capture footprint overlaps this track's birth position.
    pub capture_blocked_until: Option<Instant>,
}

impl Track {
    pub(crate) fn new(id: TrackId, bbox: BBox, confidence: f32, now: Instant) -> Self {
        let mut trajectory = VecDeque::with_capacity(MAX_TRAJECTORY);
        trajectory.push_back(bbox.centroid());
        Self {
            id,
            bbox,
            state: TrackState::New,
            trajectory,
            hit_count: 1,
            consecutive_hits: 1,
            age: 0,
            time_since_update: 0,
            confidence,
            best_crop: None,
            best_crop_score: 0.0,
            born_at: now,
            last_seen: now,
            capture_blocked_until: None,
        }
    }

    pub(crate) fn mark_hit(&mut self, bbox: BBox, confidence: f32, now: Instant) {
        self.bbox = bbox;
        self.confidence = confidence;
        self.hit_count += 1;
        self.consecutive_hits += 1;
        self.time_since_update = 0;
        self.last_seen = now;
        self.push_centroid(bbox.centroid());
    }

    pub(crate) fn mark_missed(&mut self) {
        self.consecutive_hits = 0;
        self.time_since_update += 1;
    }

    fn push_centroid(&mut self, point: (f32, f32)) {
        if self.trajectory.len() >= MAX_TRAJECTORY {
            self.trajectory.pop_front();
        }
        self.trajectory.push_back(point);
    }

    pub fn trajectory(&self) -> &VecDeque<(f32, f32)> {
        &self.trajectory
    }

    /// The two most recent centroids, oldest first.
    pub fn last_two_points(&self) -> Option<((f32, f32), (f32, f32))> {
        let n = self.trajectory.len();
        if n < 2 {
            return None;
        }
        Some((self.trajectory[n - 2], self.trajectory[n - 1]))
    }

    /// Mean per-frame displacement over the last `VELOCITY_WINDOW` points.
    /// Logged when a track expires; matching does not use it.
    pub fn velocity(&self) -> (f32, f32) {
        let n = self.trajectory.len();
        if n < 2 {
            return (0.0, 0.0);
        }
        let start = n.saturating_sub(VELOCITY_WINDOW);
        let first = self.trajectory[start];
        let last = self.trajectory[n - 1];
        let steps = (n - 1 - start) as f32;
        ((last.0 - first.0) / steps, (last.1 - first.1) / steps)
    }

    pub fn best_crop(&self) -> Option<&BestCrop> {
        self.best_crop.as_ref()
    }

    pub fn best_crop_score(&self) -> f32 {
        self.best_crop_score
    }

    /// Keep `crop` if it beats the current best. The score never decreases.
    pub(crate) fn offer_crop(&mut self, crop: RgbImage, score: f32, now: Instant) -> bool {
        if score <= self.best_crop_score && self.best_crop.is_some() {
            return false;
        }
        self.best_crop_score = score.max(self.best_crop_score);
        self.best_crop = Some(BestCrop {
            image: crop,
            bbox: self.bbox,
            score,
            seen_at: now,
        });
        true
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("bbox", &self.bbox)
            .field("state", &self.state)
            .field("hit_count", &self.hit_count)
            .field("age", &self.age)
            .field("time_since_update", &self.time_since_update)
            .field("best_crop_score", &self.best_crop_score)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trajectory_is_bounded() {
        let now = Instant::now();
        let mut track = Track::new(1, BBox::new(0.0, 0.0, 10.0, 10.0), 0.9, now);
        for i in 0..(MAX_TRAJECTORY * 3) {
            let x = i as f32;
            track.mark_hit(BBox::new(x, 0.0, x + 10.0, 10.0), 0.9, now);
            assert!(track.trajectory().len() <= MAX_TRAJECTORY);
        }
        assert_eq!(track.trajectory().len(), MAX_TRAJECTORY);
    }

    #[test]
    fn velocity_uses_recent_window() {
        let now = Instant::now();
        let mut track = Track::new(1, BBox::new(0.0, 0.0, 10.0, 10.0), 0.9, now);
        for i in 1..10 {
            let x = i as f32 * 2.0;
            track.mark_hit(BBox::new(x, 0.0, x + 10.0, 10.0), 0.9, now);
        }
        let (vx, vy) = track.velocity();
        assert!((vx - 2.0).abs() < 1e-5);
        assert_eq!(vy, 0.0);
    }

    #[test]
    fn best_crop_score_never_decreases() {
        let now = Instant::now();
        let mut track = Track::new(1, BBox::new(0.0, 0.0, 4.0, 4.0), 0.9, now);
        assert!(track.offer_crop(RgbImage::new(4, 4), 0.5, now));
        assert!(!track.offer_crop(RgbImage::new(4, 4), 0.3, now));
        assert_eq!(track.best_crop_score(), 0.5);
        assert!(track.offer_crop(RgbImage::new(4, 4), 0.8, now));
        assert_eq!(track.best_crop_score(), 0.8);
    }
}
