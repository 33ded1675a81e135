use anyhow::Result;
use std::time::Instant;

use super::geometry::{self, count_in_box, MaskCache, NormPoint};
use super::{Cooldown, TriggeredZones, ZoneConfig};
use crate::frame::Frame;
use crate::tracker::{BBox, Track, TrackId};

struct OverlapZone {
    name: String,
    polygon: Vec<NormPoint>,
    cooldown: Cooldown,
}

/// Assigns each detector box seen this frame to the zone covering the largest
/// share of the box. A zone fires when it holds at least one box whose overlap
/// exceeds `min_overlap` and its cooldown has elapsed.
pub struct DetectorZoneTrigger {
    camera_id: String,
    zones: Vec<OverlapZone>,
    min_overlap: f32,
    masks: Option<MaskCache>,
}

impl DetectorZoneTrigger {
    pub fn new(camera_id: &str, zones: &[ZoneConfig], min_overlap: f32) -> Result<Self> {
        let zones = zones
            .iter()
            .map(|z| {
                Ok(OverlapZone {
                    name: z.name.clone(),
                    polygon: geometry::validate_polygon(&z.polygon)?,
                    cooldown: Cooldown::from_secs(z.cooldown_secs),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            camera_id: camera_id.to_string(),
            zones,
            min_overlap,
            masks: None,
        })
    }

    /// Best zone for one box: `(zone index, mask pixels inside box / box area)`.
    fn assign(&self, masks: &MaskCache, bbox: &BBox) -> Option<(usize, f32)> {
        let area = bbox.area();
        if area <= 0.0 {
            return None;
        }
        let mut best: Option<(usize, f32)> = None;
        for i in 0..self.zones.len() {
            let Some(mask) = masks.mask(i) else {
                continue;
            };
            let overlap = count_in_box(mask, bbox) as f32 / area;
            if best.map_or(true, |(_, b)| overlap > b) {
                best = Some((i, overlap));
            }
        }
        best.filter(|&(_, overlap)| overlap > self.min_overlap)
    }

    pub fn evaluate(&mut self, frame: &Frame, tracks: &[&Track]) -> TriggeredZones {
        let mut fired = TriggeredZones::default();
        if !self
            .masks
            .as_ref()
            .is_some_and(|m| m.fits(frame.width, frame.height))
        {
            let polygons: Vec<Vec<NormPoint>> =
                self.zones.iter().map(|z| z.polygon.clone()).collect();
            self.masks = Some(MaskCache::build(&polygons, frame.width, frame.height));
        }
        let Some(masks) = self.masks.take() else {
            return fired;
        };

        // Per zone: the assigned box with the largest overlap.
        let mut assigned: Vec<Option<(TrackId, BBox, f32)>> = vec![None; self.zones.len()];
        for track in tracks.iter().filter(|t| t.time_since_update == 0) {
            let Some((zone, overlap)) = self.assign(&masks, &track.bbox) else {
                continue;
            };
            let slot = &mut assigned[zone];
            if slot.map_or(true, |(_, _, o)| overlap > o) {
                *slot = Some((track.id, track.bbox, overlap));
            }
        }
        self.masks = Some(masks);

        let now: Instant = frame.captured_at;
        for (zone, hit) in self.zones.iter_mut().zip(assigned) {
            let Some((track_id, bbox, overlap)) = hit else {
                continue;
            };
            if !zone.cooldown.ready(now) {
                continue;
            }
            zone.cooldown.fire(now);
            log::info!(
                "[{}] zone {} triggered by track {} (overlap {:.2})",
                self.camera_id,
                zone.name,
                track_id,
                overlap
            );
            fired.push(&zone.name, Some(track_id), Some(bbox));
        }
        fired
    }
}
