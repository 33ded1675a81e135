//! Per-camera vehicle tracking.
//!
//! `VehicleTracker` associates detections with tracks by greedy IoU, drives the
//! `New -> Active -> {Captured, Expired}` lifecycle and keeps each track's bounded
//! trajectory. The line-crossing trigger reads the same trajectory buffer.
//!
//! Tracks live in a slot arena: an expired track's slot goes on a free list and is
//! reused by the next birth, so a long-running camera does not grow its table.

mod bbox;
mod track;

pub use bbox::BBox;
pub use track::{BestCrop, Track, TrackId, TrackState, MAX_TRAJECTORY, VELOCITY_WINDOW};

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::detect::Detection;
use crate::frame::{laplacian_variance, Frame};

/// Sharpness (Laplacian variance) treated as "fully sharp" when scoring crops.
const CROP_SHARPNESS_REF: f32 = 500.0;

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection to continue a track.
    pub iou_threshold: f32,
    /// Hits needed before a track becomes `Active`.
    pub min_hits: u32,
    /// A track expires once `time_since_update` exceeds this many frames.
    pub max_age: u32,
    /// How long a captured footprint blocks recapture of a stationary vehicle.
    pub capture_cooldown: Duration,
    /// IoU against a captured footprint that counts as "same parked vehicle".
    pub footprint_iou: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            min_hits: 3,
            max_age: 10,
            capture_cooldown: Duration::from_secs(30),
            footprint_iou: 0.5,
        }
    }
}

/// What changed during one `update` call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackerUpdate {
    /// `(track_id, detection_index)` pairs continued this frame.
    pub matched: Vec<(TrackId, usize)>,
    /// Tracks born this frame, with the detection index that spawned them.
    pub born: Vec<(TrackId, usize)>,
    /// Tracks promoted to `Active` this frame.
    pub activated: Vec<TrackId>,
    /// Tracks removed this frame.
    pub expired: Vec<TrackId>,
}

pub struct VehicleTracker {
    camera_id: String,
    config: TrackerConfig,
    slots: Vec<Option<Track>>,
    free: Vec<usize>,
    next_id: TrackId,
    footprints: VecDeque<(BBox, Instant)>,
}

impl VehicleTracker {
    pub fn new(camera_id: &str, config: TrackerConfig) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            config,
            slots: Vec::new(),
            free: Vec::new(),
            next_id: 1,
            footprints: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Advance the tracker by one frame.
    ///
    /// Association is greedy: live tracks are scanned in ascending id order and each
    /// takes the unmatched detection with the highest IoU at or above the threshold.
    /// On equal IoU the lower detection index wins, and a detection claimed by an
    /// earlier-scanned track is unavailable to later ones.
    pub fn update(
        &mut self,
        detections: &[Detection],
        frame: Option<&Frame>,
        now: Instant,
    ) -> TrackerUpdate {
        let mut result = TrackerUpdate::default();
        let mut used = vec![false; detections.len()];

        for slot in self.ordered_slots() {
            let Some(track) = self.slots[slot].as_mut() else {
                continue;
            };
            track.age += 1;

            let mut best: Option<(usize, f32)> = None;
            for (di, det) in detections.iter().enumerate() {
                if used[di] {
                    continue;
                }
                let iou = track.bbox.iou(&det.bbox);
                if iou < self.config.iou_threshold {
                    continue;
                }
                if best.map_or(true, |(_, b)| iou > b) {
                    best = Some((di, iou));
                }
            }

            match best {
                Some((di, _)) => {
                    used[di] = true;
                    let det = &detections[di];
                    track.mark_hit(det.bbox, det.confidence, now);
                    if track.state == TrackState::New && track.hit_count >= self.config.min_hits {
                        track.state = TrackState::Active;
                        result.activated.push(track.id);
                    }
                    result.matched.push((track.id, di));
                }
                None => track.mark_missed(),
            }
        }

        for (di, det) in detections.iter().enumerate() {
            if used[di] {
                continue;
            }
            let id = self.spawn(det, now);
            result.born.push((id, di));
        }

        if let Some(frame) = frame {
            let touched: Vec<(TrackId, usize)> = result
                .matched
                .iter()
                .chain(result.born.iter())
                .copied()
                .collect();
            for (id, di) in touched {
                self.score_crop(id, &detections[di].bbox, frame, now);
            }
        }

        result.expired = self.expire();
        self.prune_footprints(now);
        result
    }

    fn ordered_slots(&self) -> Vec<usize> {
        let mut order: Vec<(TrackId, usize)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (t.id, i)))
            .collect();
        order.sort_unstable();
        order.into_iter().map(|(_, i)| i).collect()
    }

    fn spawn(&mut self, det: &Detection, now: Instant) -> TrackId {
        let id = self.next_id;
        self.next_id += 1;

        let mut track = Track::new(id, det.bbox, det.confidence, now);
        if self.config.min_hits <= 1 {
            track.state = TrackState::Active;
        }
        track.capture_blocked_until = self
            .footprints
            .iter()
            .filter(|(bbox, _)| bbox.iou(&det.bbox) >= self.config.footprint_iou)
            .map(|(_, at)| *at + self.config.capture_cooldown)
            .max()
            .filter(|until| *until > now);
        if track.capture_blocked_until.is_some() {
            log::debug!(
                "[{}] track {} born on a recently captured footprint",
                self.camera_id,
                id
            );
        }

        match self.free.pop() {
            Some(slot) => self.slots[slot] = Some(track),
            None => self.slots.push(Some(track)),
        }
        id
    }

    fn expire(&mut self) -> Vec<TrackId> {
        let mut expired = Vec::new();
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            let stale = entry
                .as_ref()
                .is_some_and(|t| t.time_since_update > self.config.max_age);
            if stale {
                if let Some(mut track) = entry.take() {
                    track.state = TrackState::Expired;
                    let (vx, vy) = track.velocity();
                    log::debug!(
                        "[{}] track {} expired (hits={}, velocity={:.1},{:.1})",
                        self.camera_id,
                        track.id,
                        track.hit_count,
                        vx,
                        vy
                    );
                    expired.push(track.id);
                }
                self.free.push(slot);
            }
        }
        expired
    }

    fn score_crop(&mut self, id: TrackId, bbox: &BBox, frame: &Frame, now: Instant) {
        let Some(crop) = frame.crop(bbox) else {
            return;
        };
        let gray = image::imageops::grayscale(&crop);
        let sharp = (laplacian_variance(&gray) / CROP_SHARPNESS_REF).min(1.0);
        let area_ratio = (bbox.area() / frame.pixel_count().max(1) as f32).min(1.0);
        let score = sharp * 0.7 + area_ratio.sqrt() * 0.3;
        let camera_id = self.camera_id.clone();
        match self.get_mut(id) {
            Some(track) => {
                track.offer_crop(crop, score, now);
            }
            None => {
                debug_assert!(false, "track {} matched this frame but is not in the arena", id);
                log::error!("[{}] track {} missing from arena after update", camera_id, id);
            }
        }
    }

    fn prune_footprints(&mut self, now: Instant) {
        let cooldown = self.config.capture_cooldown;
        self.footprints
            .retain(|(_, at)| now.saturating_duration_since(*at) < cooldown);
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.slots.iter().flatten().find(|t| t.id == id)
    }

    fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.slots.iter_mut().flatten().find(|t| t.id == id)
    }

    /// Live tracks in ascending id order.
    pub fn tracks(&self) -> Vec<&Track> {
        let mut tracks: Vec<&Track> = self.slots.iter().flatten().collect();
        tracks.sort_unstable_by_key(|t| t.id);
        tracks
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arena size, including free slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Whether a capture may still be attributed to this track.
    pub fn can_capture(&self, id: TrackId, now: Instant) -> bool {
        let Some(track) = self.get(id) else {
            return false;
        };
        if matches!(track.state, TrackState::Captured | TrackState::Expired) {
            return false;
        }
        track.capture_blocked_until.map_or(true, |until| now >= until)
    }

    /// Record that a capture was emitted for this track. Allowed at most once per track.
    pub fn mark_captured(&mut self, id: TrackId, now: Instant) -> bool {
        if !self.can_capture(id, now) {
            return false;
        }
        let Some(track) = self.get_mut(id) else {
            return false;
        };
        track.state = TrackState::Captured;
        let footprint = track.bbox;
        self.footprints.push_back((footprint, now));
        log::debug!("[{}] track {} captured", self.camera_id, id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ObjectClass;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            bbox: BBox::new(x1, y1, x2, y2),
            confidence: 0.9,
            class: ObjectClass::Vehicle,
        }
    }

    fn tracker(min_hits: u32, max_age: u32) -> VehicleTracker {
        VehicleTracker::new(
            "cam-test",
            TrackerConfig {
                min_hits,
                max_age,
                ..TrackerConfig::default()
            },
        )
    }

    #[test]
    fn track_becomes_active_after_min_hits() {
        let mut t = tracker(3, 5);
        let now = Instant::now();
        let up = t.update(&[det(0.0, 0.0, 10.0, 10.0)], None, now);
        assert_eq!(up.born.len(), 1);
        let id = up.born[0].0;
        assert_eq!(t.get(id).unwrap().state, TrackState::New);

        t.update(&[det(1.0, 0.0, 11.0, 10.0)], None, now);
        assert_eq!(t.get(id).unwrap().state, TrackState::New);
        let up = t.update(&[det(2.0, 0.0, 12.0, 10.0)], None, now);
        assert_eq!(up.activated, vec![id]);
        assert_eq!(t.get(id).unwrap().state, TrackState::Active);
    }

    #[test]
    fn greedy_assignment_prefers_high_iou_pair() {
        let mut t = tracker(1, 5);
        let now = Instant::now();
        // Track 1 around x=0, track 2 around x=100.
        t.update(
            &[det(0.0, 0.0, 10.0, 10.0), det(100.0, 0.0, 110.0, 10.0)],
            None,
            now,
        );

        // det A: IoU ~0.9 with track 1. det B: IoU ~0.9 with track 2.
        let a = det(0.5, 0.0, 10.5, 10.0);
        let b = det(100.5, 0.0, 110.5, 10.0);
        let up = t.update(&[b.clone(), a.clone()], None, now);
        assert_eq!(up.matched, vec![(1, 1), (2, 0)]);
        assert!(up.born.is_empty());
    }

    #[test]
    fn tie_goes_to_first_scanned_track() {
        let mut t = tracker(1, 5);
        let now = Instant::now();
        // Two identical tracks.
        t.update(
            &[det(0.0, 0.0, 10.0, 10.0), det(0.0, 0.0, 10.0, 10.0)],
            None,
            now,
        );
        let up = t.update(&[det(0.0, 0.0, 10.0, 10.0)], None, now);
        assert_eq!(up.matched, vec![(1, 0)]);
        assert_eq!(t.get(2).unwrap().time_since_update, 1);
    }

    #[test]
    fn low_iou_detection_spawns_new_track() {
        let mut t = tracker(1, 5);
        let now = Instant::now();
        t.update(&[det(0.0, 0.0, 10.0, 10.0)], None, now);
        // IoU ~0.1 with track 1, below 0.3.
        let up = t.update(&[det(8.2, 0.0, 18.2, 10.0)], None, now);
        assert!(up.matched.is_empty());
        assert_eq!(up.born.len(), 1);
    }

    #[test]
    fn missed_tracks_expire_and_slots_are_reused() {
        let mut t = tracker(1, 2);
        let now = Instant::now();
        t.update(&[det(0.0, 0.0, 10.0, 10.0)], None, now);
        for _ in 0..2 {
            let up = t.update(&[], None, now);
            assert!(up.expired.is_empty());
        }
        let up = t.update(&[], None, now);
        assert_eq!(up.expired, vec![1]);
        assert!(t.is_empty());

        let up = t.update(&[det(50.0, 50.0, 60.0, 60.0)], None, now);
        assert_eq!(up.born[0].0, 2, "ids stay monotonic");
        assert_eq!(t.capacity(), 1, "freed slot was reused");
    }

    #[test]
    fn captured_track_never_returns_to_active() {
        let mut t = tracker(1, 5);
        let now = Instant::now();
        t.update(&[det(0.0, 0.0, 10.0, 10.0)], None, now);
        assert!(t.mark_captured(1, now));
        assert!(!t.mark_captured(1, now), "second capture refused");
        for i in 0..5 {
            let x = i as f32;
            t.update(&[det(x, 0.0, x + 10.0, 10.0)], None, now);
            assert_eq!(t.get(1).unwrap().state, TrackState::Captured);
        }
    }

    #[test]
    fn stationary_vehicle_is_not_recaptured_within_cooldown() {
        let mut t = tracker(1, 0);
        let now = Instant::now();
        t.update(&[det(0.0, 0.0, 10.0, 10.0)], None, now);
        assert!(t.mark_captured(1, now));

        // Track flickers out and is reborn at the same spot.
        t.update(&[], None, now);
        assert!(t.is_empty());
        let later = now + Duration::from_secs(5);
        let up = t.update(&[det(0.0, 0.0, 10.0, 10.0)], None, later);
        let reborn = up.born[0].0;
        assert!(!t.can_capture(reborn, later));
        assert!(t.can_capture(reborn, now + Duration::from_secs(31)));
    }

    #[test]
    fn matched_tracks_collect_best_crop() -> anyhow::Result<()> {
        let mut t = tracker(1, 5);
        let now = Instant::now();
        let mut pixels = vec![0u8; 32 * 32 * 3];
        for (i, p) in pixels.iter_mut().enumerate() {
            *p = if (i / 3) % 2 == 0 { 0 } else { 255 };
        }
        let frame = Frame::new("cam-test", 1, now, 0, 32, 32, pixels)?;
        t.update(&[det(4.0, 4.0, 20.0, 20.0)], Some(&frame), now);
        let track = t.get(1).unwrap();
        assert!(track.best_crop().is_some());
        assert!(track.best_crop_score() > 0.0);
        Ok(())
    }
}
