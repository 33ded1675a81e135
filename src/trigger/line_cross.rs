use std::time::Instant;

use super::geometry::{projection_along, segment_length, signed_distance};
use super::{Cooldown, CrossingDirection, LineConfig, TriggeredZones};
use crate::frame::Frame;
use crate::tracker::Track;

/// Virtual line crossing over the tracker's trajectories.
///
/// A track crosses when the signed distance of its last two centroids changes
/// sign, the interpolated crossing point lies on the segment (extended by the
/// tolerance band), and the direction is allowed. One global cooldown covers
/// the whole line.
pub struct LineCrossTrigger {
    camera_id: String,
    line: LineConfig,
    cooldown: Cooldown,
}

/// Sign change of the signed distance between two consecutive points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Crossing {
    /// From the negative to the positive side.
    Forward,
    Backward,
}

impl LineCrossTrigger {
    pub fn new(camera_id: &str, line: LineConfig) -> Self {
        let cooldown = Cooldown::from_secs(line.cooldown_secs);
        Self {
            camera_id: camera_id.to_string(),
            line,
            cooldown,
        }
    }

    fn endpoints(&self, frame: &Frame) -> ((f32, f32), (f32, f32)) {
        let (w, h) = (frame.width as f32, frame.height as f32);
        (
            (self.line.start.0 * w, self.line.start.1 * h),
            (self.line.end.0 * w, self.line.end.1 * h),
        )
    }

    fn crossing(&self, p0: (f32, f32), p1: (f32, f32), a: (f32, f32), b: (f32, f32)) -> Option<Crossing> {
        let d0 = signed_distance(p0, a, b);
        let d1 = signed_distance(p1, a, b);
        let direction = if d0 < 0.0 && d1 >= 0.0 {
            Crossing::Forward
        } else if d0 > 0.0 && d1 <= 0.0 {
            Crossing::Backward
        } else {
            return None;
        };

        let t = d0 / (d0 - d1);
        let at = (p0.0 + (p1.0 - p0.0) * t, p0.1 + (p1.1 - p0.1) * t);
        let along = projection_along(at, a, b);
        let tol = self.line.tolerance_px;
        if along < -tol || along > segment_length(a, b) + tol {
            return None;
        }

        let allowed = match self.line.direction {
            CrossingDirection::Both => true,
            CrossingDirection::Forward => direction == Crossing::Forward,
            CrossingDirection::Backward => direction == Crossing::Backward,
        };
        allowed.then_some(direction)
    }

    pub fn evaluate(&mut self, frame: &Frame, tracks: &[&Track]) -> TriggeredZones {
        let mut fired = TriggeredZones::default();
        let now: Instant = frame.captured_at;
        let (a, b) = self.endpoints(frame);

        for track in tracks.iter().filter(|t| t.time_since_update == 0) {
            let Some((p0, p1)) = track.last_two_points() else {
                continue;
            };
            let Some(direction) = self.crossing(p0, p1, a, b) else {
                continue;
            };
            if !self.cooldown.ready(now) {
                log::debug!(
                    "[{}] track {} crossed {} during cooldown",
                    self.camera_id,
                    track.id,
                    self.line.name
                );
                continue;
            }
            self.cooldown.fire(now);
            log::info!(
                "[{}] track {} crossed {} ({:?})",
                self.camera_id,
                track.id,
                self.line.name,
                direction
            );
            fired.push(&self.line.name, Some(track.id), Some(track.bbox));
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detection;
    use crate::tracker::{BBox, TrackerConfig, VehicleTracker};
    use std::time::Duration;

    fn frame(at: Instant) -> Frame {
        Frame::new("cam-test", 1, at, 0, 100, 100, vec![0u8; 100 * 100 * 3]).unwrap()
    }

    /// Horizontal line at y=50, from x=20 to x=80.
    fn line(direction: CrossingDirection, cooldown: f64) -> LineConfig {
        LineConfig {
            name: "gate".to_string(),
            start: (0.2, 0.5),
            end: (0.8, 0.5),
            direction,
            tolerance_px: 5.0,
            cooldown_secs: cooldown,
        }
    }

    /// Drive one track through centroids with the given centre x / y.
    fn run(trigger: &mut LineCrossTrigger, path: &[(f32, f32)], t0: Instant) -> Vec<usize> {
        let mut tracker = VehicleTracker::new(
            "cam-test",
            TrackerConfig {
                iou_threshold: 0.05,
                min_hits: 1,
                ..TrackerConfig::default()
            },
        );
        let mut fired_at = Vec::new();
        for (i, &(cx, cy)) in path.iter().enumerate() {
            let now = t0 + Duration::from_millis(100 * i as u64);
            let det = Detection::vehicle(BBox::new(cx - 10.0, cy - 10.0, cx + 10.0, cy + 10.0), 0.9);
            tracker.update(&[det], None, now);
            let tracks = tracker.tracks();
            if !trigger.evaluate(&frame(now), &tracks).is_empty() {
                fired_at.push(i);
            }
        }
        fired_at
    }

    #[test]
    fn downward_crossing_fires_once() {
        let mut trigger = LineCrossTrigger::new("cam-test", line(CrossingDirection::Both, 10.0));
        let fired = run(&mut trigger, &[(50.0, 40.0), (50.0, 46.0), (50.0, 53.0), (50.0, 58.0)], Instant::now());
        assert_eq!(fired, vec![2]);
    }

    #[test]
    fn direction_filter() {
        // In image coordinates moving down (y increasing) across a left-to-right
        // line goes from the negative to the positive side.
        let down = [(50.0, 40.0), (50.0, 47.0), (50.0, 54.0)];
        let up = [(50.0, 60.0), (50.0, 53.0), (50.0, 46.0)];

        let mut fwd = LineCrossTrigger::new("cam-test", line(CrossingDirection::Forward, 0.0));
        assert_eq!(run(&mut fwd, &down, Instant::now()), vec![2]);
        let mut fwd = LineCrossTrigger::new("cam-test", line(CrossingDirection::Forward, 0.0));
        assert!(run(&mut fwd, &up, Instant::now()).is_empty());

        let mut back = LineCrossTrigger::new("cam-test", line(CrossingDirection::Backward, 0.0));
        assert_eq!(run(&mut back, &up, Instant::now()), vec![2]);
    }

    #[test]
    fn crossing_beyond_segment_is_ignored() {
        let mut trigger = LineCrossTrigger::new("cam-test", line(CrossingDirection::Both, 0.0));
        // x=95 is 15px past the end, outside the 5px tolerance.
        let fired = run(&mut trigger, &[(95.0, 45.0), (95.0, 48.0), (95.0, 55.0)], Instant::now());
        assert!(fired.is_empty());
        // x=83 is within tolerance.
        let fired = run(&mut trigger, &[(83.0, 45.0), (83.0, 48.0), (83.0, 55.0)], Instant::now());
        assert_eq!(fired, vec![2]);
    }

    #[test]
    fn global_cooldown_suppresses_back_and_forth() {
        let mut trigger = LineCrossTrigger::new("cam-test", line(CrossingDirection::Both, 10.0));
        let fired = run(
            &mut trigger,
            &[(50.0, 45.0), (50.0, 48.0), (50.0, 55.0), (50.0, 48.0), (50.0, 55.0)],
            Instant::now(),
        );
        assert_eq!(fired, vec![2]);
    }
}
