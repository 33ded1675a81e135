//! Spatial triggers.
//!
//! A camera uses exactly one strategy, chosen at construction time from its
//! configuration: polygon fill-ratio, virtual line crossing, or detector-box /
//! zone overlap. Every strategy answers the same question per frame through
//! `SpatialTrigger::evaluate(frame, tracks)`.
//!
//! Zone geometry is normalized (0..1) and rasterized per frame size. Cooldown
//! clocks are owned by the strategy instance and read the frame's monotonic
//! capture instant.

pub mod detector_zone;
pub mod geometry;
pub mod line_cross;
pub mod roi;
pub mod zone_fill;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::tracker::{BBox, Track, TrackId};

pub use detector_zone::DetectorZoneTrigger;
pub use geometry::NormPoint;
pub use line_cross::LineCrossTrigger;
pub use roi::{RoiProvider, RoiRect, RoiResolver, RoiSource, SqliteRoiStore, StaticRoiProvider};
pub use zone_fill::ZoneFillTrigger;

pub const DEFAULT_MIN_OVERLAP: f32 = 0.20;
pub const DEFAULT_LINE_TOLERANCE_PX: f32 = 20.0;

fn default_fill_ratio() -> f32 {
    0.2
}

fn default_cooldown_secs() -> f64 {
    5.0
}

fn default_min_overlap() -> f32 {
    DEFAULT_MIN_OVERLAP
}

fn default_tolerance() -> f32 {
    DEFAULT_LINE_TOLERANCE_PX
}

/// Polygon zone. Used by the fill-ratio and detector-overlap strategies.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ZoneConfig {
    pub name: String,
    pub polygon: Vec<NormPoint>,
    #[serde(default = "default_fill_ratio")]
    pub min_fill_ratio: f32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: f64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CrossingDirection {
    /// From the negative to the positive side of `start -> end`. For a line
    /// drawn left to right this is downward motion in the image.
    Forward,
    Backward,
    #[default]
    Both,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LineConfig {
    pub name: String,
    pub start: NormPoint,
    pub end: NormPoint,
    #[serde(default)]
    pub direction: CrossingDirection,
    #[serde(default = "default_tolerance")]
    pub tolerance_px: f32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: f64,
}

/// Per-camera trigger strategy selection.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum TriggerConfig {
    ZoneFill {
        zones: Vec<ZoneConfig>,
    },
    LineCross {
        line: LineConfig,
    },
    DetectorZone {
        zones: Vec<ZoneConfig>,
        #[serde(default = "default_min_overlap")]
        min_overlap: f32,
    },
}

impl Default for TriggerConfig {
    /// One full-frame fill zone.
    fn default() -> Self {
        TriggerConfig::ZoneFill {
            zones: vec![ZoneConfig {
                name: "full_frame".to_string(),
                polygon: vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)],
                min_fill_ratio: 0.02,
                cooldown_secs: default_cooldown_secs(),
            }],
        }
    }
}

impl TriggerConfig {
    pub fn strategy_name(&self) -> &'static str {
        match self {
            TriggerConfig::ZoneFill { .. } => "zone_fill",
            TriggerConfig::LineCross { .. } => "line_cross",
            TriggerConfig::DetectorZone { .. } => "detector_zone",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            TriggerConfig::ZoneFill { zones } => {
                validate_zones(zones)?;
                for zone in zones {
                    if !(zone.min_fill_ratio > 0.0 && zone.min_fill_ratio <= 1.0) {
                        return Err(anyhow!(
                            "zone {}: min_fill_ratio must be in (0, 1]",
                            zone.name
                        ));
                    }
                }
                Ok(())
            }
            TriggerConfig::LineCross { line } => {
                geometry::validate_zone_name(&line.name)?;
                geometry::validate_segment(line.start, line.end)?;
                if !(line.tolerance_px >= 0.0) {
                    return Err(anyhow!("line {}: tolerance_px must be >= 0", line.name));
                }
                validate_cooldown(&line.name, line.cooldown_secs)
            }
            TriggerConfig::DetectorZone { zones, min_overlap } => {
                validate_zones(zones)?;
                if !(*min_overlap >= 0.0 && *min_overlap < 1.0) {
                    return Err(anyhow!("min_overlap must be in [0, 1)"));
                }
                Ok(())
            }
        }
    }
}

fn validate_cooldown(name: &str, secs: f64) -> Result<()> {
    if !(secs.is_finite() && secs >= 0.0) {
        return Err(anyhow!("{}: cooldown_secs must be >= 0", name));
    }
    Ok(())
}

fn validate_zones(zones: &[ZoneConfig]) -> Result<()> {
    if zones.is_empty() {
        return Err(anyhow!("at least one zone is required"));
    }
    let mut seen = HashSet::new();
    for zone in zones {
        geometry::validate_zone_name(&zone.name)?;
        if !seen.insert(zone.name.as_str()) {
            return Err(anyhow!("duplicate zone name {}", zone.name));
        }
        geometry::validate_polygon(&zone.polygon)
            .map_err(|e| anyhow!("zone {}: {}", zone.name, e))?;
        validate_cooldown(&zone.name, zone.cooldown_secs)?;
    }
    Ok(())
}

/// One zone that fired this frame.
#[derive(Clone, Debug, PartialEq)]
pub struct TriggeredZone {
    pub name: String,
    /// Track responsible for the trigger, when the strategy can attribute one.
    pub track_id: Option<TrackId>,
    pub bbox: Option<BBox>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriggeredZones {
    pub zones: Vec<TriggeredZone>,
}

impl TriggeredZones {
    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.zones.iter().map(|z| z.name.as_str()).collect()
    }

    pub fn first(&self) -> Option<&TriggeredZone> {
        self.zones.first()
    }

    pub(crate) fn push(&mut self, name: &str, track_id: Option<TrackId>, bbox: Option<BBox>) {
        self.zones.push(TriggeredZone {
            name: name.to_string(),
            track_id,
            bbox,
        });
    }
}

/// Independent cooldown clock.
#[derive(Clone, Debug)]
pub(crate) struct Cooldown {
    period: Duration,
    last_fire: Option<Instant>,
}

impl Cooldown {
    pub(crate) fn from_secs(secs: f64) -> Self {
        Self {
            period: Duration::from_secs_f64(secs.max(0.0)),
            last_fire: None,
        }
    }

    pub(crate) fn ready(&self, now: Instant) -> bool {
        self.last_fire
            .map_or(true, |at| now.saturating_duration_since(at) >= self.period)
    }

    pub(crate) fn fire(&mut self, now: Instant) {
        self.last_fire = Some(now);
    }
}

pub enum SpatialTrigger {
    ZoneFill(ZoneFillTrigger),
    LineCross(LineCrossTrigger),
    DetectorZone(DetectorZoneTrigger),
}

impl SpatialTrigger {
    pub fn from_config(camera_id: &str, config: &TriggerConfig) -> Result<Self> {
        config.validate()?;
        Ok(match config {
            TriggerConfig::ZoneFill { zones } => {
                SpatialTrigger::ZoneFill(ZoneFillTrigger::new(camera_id, zones)?)
            }
            TriggerConfig::LineCross { line } => {
                SpatialTrigger::LineCross(LineCrossTrigger::new(camera_id, line.clone()))
            }
            TriggerConfig::DetectorZone { zones, min_overlap } => SpatialTrigger::DetectorZone(
                DetectorZoneTrigger::new(camera_id, zones, *min_overlap)?,
            ),
        })
    }

    pub fn strategy_name(&self) -> &'static str {
        match self {
            SpatialTrigger::ZoneFill(_) => "zone_fill",
            SpatialTrigger::LineCross(_) => "line_cross",
            SpatialTrigger::DetectorZone(_) => "detector_zone",
        }
    }

    /// Zones that fire on this frame. `tracks` are the tracker's live tracks after
    /// this frame's update.
    pub fn evaluate(&mut self, frame: &Frame, tracks: &[&Track]) -> TriggeredZones {
        match self {
            SpatialTrigger::ZoneFill(t) => t.evaluate(frame, tracks),
            SpatialTrigger::LineCross(t) => t.evaluate(frame, tracks),
            SpatialTrigger::DetectorZone(t) => t.evaluate(frame, tracks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_is_tagged_in_config() -> Result<()> {
        let cfg: TriggerConfig = serde_json::from_str(
            r#"{"strategy": "line_cross",
                "line": {"name": "gate", "start": [0.0, 0.5], "end": [1.0, 0.5],
                         "direction": "forward"}}"#,
        )?;
        match &cfg {
            TriggerConfig::LineCross { line } => {
                assert_eq!(line.direction, CrossingDirection::Forward);
                assert_eq!(line.tolerance_px, DEFAULT_LINE_TOLERANCE_PX);
            }
            other => panic!("unexpected strategy {:?}", other),
        }
        cfg.validate()?;
        let trigger = SpatialTrigger::from_config("cam-1", &cfg)?;
        assert_eq!(trigger.strategy_name(), "line_cross");
        Ok(())
    }

    #[test]
    fn duplicate_zone_names_are_rejected() {
        let zone = ZoneConfig {
            name: "lane".to_string(),
            polygon: vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)],
            min_fill_ratio: 0.2,
            cooldown_secs: 1.0,
        };
        let cfg = TriggerConfig::ZoneFill {
            zones: vec![zone.clone(), zone],
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(TriggerConfig::default().validate().is_ok());
    }

    #[test]
    fn cooldown_clock() {
        let now = Instant::now();
        let mut c = Cooldown::from_secs(2.0);
        assert!(c.ready(now));
        c.fire(now);
        assert!(!c.ready(now + Duration::from_secs(1)));
        assert!(c.ready(now + Duration::from_secs(2)));
    }
}
