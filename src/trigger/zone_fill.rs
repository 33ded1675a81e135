use anyhow::Result;
use std::time::Instant;

use super::geometry::{self, MaskCache, NormPoint};
use super::{Cooldown, TriggeredZones, ZoneConfig};
use crate::frame::Frame;
use crate::quality::MotionMasker;
use crate::tracker::Track;

struct FillZone {
    name: String,
    polygon: Vec<NormPoint>,
    min_fill_ratio: f32,
    cooldown: Cooldown,
}

/// Fires a zone when the opened motion mask covers at least `min_fill_ratio` of
/// the zone polygon and that zone's own cooldown has elapsed.
pub struct ZoneFillTrigger {
    camera_id: String,
    zones: Vec<FillZone>,
    masker: MotionMasker,
    masks: Option<MaskCache>,
}

impl ZoneFillTrigger {
    pub fn new(camera_id: &str, zones: &[ZoneConfig]) -> Result<Self> {
        let zones = zones
            .iter()
            .map(|z| {
                Ok(FillZone {
                    name: z.name.clone(),
                    polygon: geometry::validate_polygon(&z.polygon)?,
                    min_fill_ratio: z.min_fill_ratio,
                    cooldown: Cooldown::from_secs(z.cooldown_secs),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            camera_id: camera_id.to_string(),
            zones,
            masker: MotionMasker::default(),
            masks: None,
        })
    }

    /// Motion-pixel share of each zone for a precomputed motion mask.
    fn fill_ratios(&mut self, motion: &image::GrayImage) -> Vec<f32> {
        let (w, h) = motion.dimensions();
        if !self.masks.as_ref().is_some_and(|m| m.fits(w, h)) {
            let polygons: Vec<Vec<NormPoint>> =
                self.zones.iter().map(|z| z.polygon.clone()).collect();
            self.masks = Some(MaskCache::build(&polygons, w, h));
        }
        let Some(masks) = self.masks.as_ref() else {
            return vec![0.0; self.zones.len()];
        };

        (0..self.zones.len())
            .map(|i| {
                let area = masks.area(i);
                let Some(zone_mask) = masks.mask(i) else {
                    return 0.0;
                };
                if area == 0 {
                    return 0.0;
                }
                let hits = zone_mask
                    .as_raw()
                    .iter()
                    .zip(motion.as_raw())
                    .filter(|&(&z, &m)| z > 0 && m > 0)
                    .count();
                hits as f32 / area as f32
            })
            .collect()
    }

    pub fn evaluate(&mut self, frame: &Frame, tracks: &[&Track]) -> TriggeredZones {
        let mut fired = TriggeredZones::default();
        let Some(motion) = self.masker.next_mask(frame.gray()) else {
            return fired;
        };
        let ratios = self.fill_ratios(&motion);
        let now: Instant = frame.captured_at;

        for (i, ratio) in ratios.into_iter().enumerate() {
            let zone = &mut self.zones[i];
            if ratio < zone.min_fill_ratio {
                continue;
            }
            if !zone.cooldown.ready(now) {
                log::trace!(
                    "[{}] zone {} filled {:.2} but cooling down",
                    self.camera_id,
                    zone.name,
                    ratio
                );
                continue;
            }
            zone.cooldown.fire(now);

            // Attribute to the live track whose centre lies inside the zone, if any.
            let owner = self.masks.as_ref().and_then(|m| m.mask(i)).and_then(|mask| {
                tracks
                    .iter()
                    .filter(|t| t.time_since_update == 0)
                    .find(|t| {
                        let (cx, cy) = t.bbox.centroid();
                        cx >= 0.0
                            && cy >= 0.0
                            && (cx as u32) < mask.width()
                            && (cy as u32) < mask.height()
                            && mask.get_pixel(cx as u32, cy as u32)[0] > 0
                    })
            });
            log::info!(
                "[{}] zone {} triggered (fill {:.2})",
                self.camera_id,
                zone.name,
                ratio
            );
            fired.push(&zone.name, owner.map(|t| t.id), owner.map(|t| t.bbox));
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const W: u32 = 40;
    const H: u32 = 40;

    fn zone(cooldown: f64) -> ZoneConfig {
        ZoneConfig {
            name: "lane".to_string(),
            polygon: vec![(0.25, 0.25), (0.75, 0.25), (0.75, 0.75), (0.25, 0.75)],
            min_fill_ratio: 0.3,
            cooldown_secs: cooldown,
        }
    }

    /// Frame with a dark block covering `[x0, x1) x [y0, y1)`.
    fn frame(at: Instant, block: Option<(u32, u32, u32, u32)>) -> Frame {
        let mut pixels = vec![120u8; (W * H * 3) as usize];
        if let Some((x0, y0, x1, y1)) = block {
            for y in y0..y1 {
                for x in x0..x1 {
                    let i = ((y * W + x) * 3) as usize;
                    pixels[i..i + 3].fill(20);
                }
            }
        }
        Frame::new("cam-test", 1, at, 0, W, H, pixels).unwrap()
    }

    #[test]
    fn motion_outside_zone_never_triggers() -> Result<()> {
        let t0 = Instant::now();
        let mut trigger = ZoneFillTrigger::new("cam-test", &[zone(0.0)])?;
        trigger.evaluate(&frame(t0, None), &[]);
        // Left strip only, zone starts at x=10.
        let fired = trigger.evaluate(&frame(t0, Some((0, 0, 8, 40))), &[]);
        assert!(fired.is_empty());
        let fired = trigger.evaluate(&frame(t0, None), &[]);
        assert!(fired.is_empty());
        Ok(())
    }

    #[test]
    fn filled_zone_triggers_once_then_cools_down() -> Result<()> {
        let t0 = Instant::now();
        let mut trigger = ZoneFillTrigger::new("cam-test", &[zone(5.0)])?;
        trigger.evaluate(&frame(t0, None), &[]);

        let fired = trigger.evaluate(&frame(t0, Some((10, 10, 30, 30))), &[]);
        assert_eq!(fired.names(), vec!["lane"]);

        // Block disappears: motion fills the zone again, but cooldown holds.
        let t1 = t0 + Duration::from_secs(1);
        assert!(trigger.evaluate(&frame(t1, None), &[]).is_empty());

        let t2 = t0 + Duration::from_secs(6);
        let fired = trigger.evaluate(&frame(t2, Some((10, 10, 30, 30))), &[]);
        assert_eq!(fired.len(), 1);
        Ok(())
    }

    #[test]
    fn small_motion_inside_zone_is_below_ratio() -> Result<()> {
        let t0 = Instant::now();
        let mut trigger = ZoneFillTrigger::new("cam-test", &[zone(0.0)])?;
        trigger.evaluate(&frame(t0, None), &[]);
        // 6x6 block = 36 of 400 zone pixels.
        let fired = trigger.evaluate(&frame(t0, Some((16, 16, 22, 22))), &[]);
        assert!(fired.is_empty());
        Ok(())
    }
}
