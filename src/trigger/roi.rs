//! Region-of-interest resolution.
//!
//! Providers are tried in order: TTL cache, shared SQLite store, static
//! configuration / environment, then a full-frame default. A provider that errors
//! or returns nothing falls through to the next; a value that fails validation is
//! logged once and never used.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::frame::now_epoch_ms;
use crate::storage::open_db_connection;
use crate::tracker::BBox;

pub const ROI_MIN_AREA: f32 = 0.05;
pub const ROI_MAX_AREA: f32 = 1.0;
pub const DEFAULT_ROI_CACHE_TTL: Duration = Duration::from_secs(2);

/// Axis-aligned region in normalized frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoiRect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl RoiRect {
    pub const FULL_FRAME: RoiRect = RoiRect {
        x1: 0.0,
        y1: 0.0,
        x2: 1.0,
        y2: 1.0,
    };

    /// Parse `x1,y1,x2,y2`. Does not validate.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<f32> = raw
            .split(',')
            .map(|p| p.trim().parse::<f32>())
            .collect::<std::result::Result<_, _>>()
            .with_context(|| format!("ROI {:?} is not four comma-separated numbers", raw))?;
        let &[x1, y1, x2, y2] = parts.as_slice() else {
            return Err(anyhow!("ROI {:?} must have exactly four values", raw));
        };
        Ok(Self { x1, y1, x2, y2 })
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn validate(&self) -> Result<()> {
        let coords = [self.x1, self.y1, self.x2, self.y2];
        if coords
            .iter()
            .any(|v| !v.is_finite() || !(0.0..=1.0).contains(v))
        {
            return Err(anyhow!("ROI {} has coordinates outside 0..1", self));
        }
        if self.x1 >= self.x2 || self.y1 >= self.y2 {
            return Err(anyhow!("ROI {} has inverted corners", self));
        }
        let area = self.area();
        if !(ROI_MIN_AREA..=ROI_MAX_AREA).contains(&area) {
            return Err(anyhow!(
                "ROI {} covers {:.1}% of the frame (allowed {:.0}-{:.0}%)",
                self,
                area * 100.0,
                ROI_MIN_AREA * 100.0,
                ROI_MAX_AREA * 100.0
            ));
        }
        Ok(())
    }

    pub fn to_pixels(&self, width: u32, height: u32) -> BBox {
        BBox::new(
            self.x1 * width as f32,
            self.y1 * height as f32,
            self.x2 * width as f32,
            self.y2 * height as f32,
        )
    }

    pub fn is_full_frame(&self) -> bool {
        *self == Self::FULL_FRAME
    }
}

impl std::fmt::Display for RoiRect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{},{}", self.x1, self.y1, self.x2, self.y2)
    }
}

/// One layer of the ROI fallback chain.
pub trait RoiProvider: Send {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means "nothing configured here"; errors fall through.
    fn get(&self, camera_id: &str) -> Result<Option<RoiRect>>;
}

/// Rows in the shared `roi_config` table. Safe to use from several processes.
pub struct SqliteRoiStore {
    conn: Connection,
}

impl SqliteRoiStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS roi_config (
              camera_id TEXT PRIMARY KEY,
              x1 REAL NOT NULL,
              y1 REAL NOT NULL,
              x2 REAL NOT NULL,
              y2 REAL NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Validates before writing.
    pub fn set(&self, camera_id: &str, roi: &RoiRect) -> Result<()> {
        roi.validate()?;
        self.conn.execute(
            r#"
            INSERT INTO roi_config(camera_id, x1, y1, x2, y2, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(camera_id) DO UPDATE SET
              x1 = excluded.x1, y1 = excluded.y1,
              x2 = excluded.x2, y2 = excluded.y2,
              updated_at_ms = excluded.updated_at_ms
            "#,
            params![
                camera_id,
                roi.x1 as f64,
                roi.y1 as f64,
                roi.x2 as f64,
                roi.y2 as f64,
                now_epoch_ms() as i64
            ],
        )?;
        Ok(())
    }

    pub fn clear(&self, camera_id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM roi_config WHERE camera_id = ?1", params![camera_id])?;
        Ok(n > 0)
    }

    pub fn list(&self) -> Result<Vec<(String, RoiRect)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT camera_id, x1, y1, x2, y2 FROM roi_config ORDER BY camera_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                RoiRect {
                    x1: row.get::<_, f64>(1)? as f32,
                    y1: row.get::<_, f64>(2)? as f32,
                    x2: row.get::<_, f64>(3)? as f32,
                    y2: row.get::<_, f64>(4)? as f32,
                },
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl RoiProvider for SqliteRoiStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, camera_id: &str) -> Result<Option<RoiRect>> {
        let roi = self
            .conn
            .query_row(
                "SELECT x1, y1, x2, y2 FROM roi_config WHERE camera_id = ?1",
                params![camera_id],
                |row| {
                    Ok(RoiRect {
                        x1: row.get::<_, f64>(0)? as f32,
                        y1: row.get::<_, f64>(1)? as f32,
                        x2: row.get::<_, f64>(2)? as f32,
                        y2: row.get::<_, f64>(3)? as f32,
                    })
                },
            )
            .optional()?;
        Ok(roi)
    }
}

/// Static regions from configuration or the environment, per camera with an
/// optional value for every camera. Values are raw strings and parsed per call
/// so a malformed entry falls through like any other provider failure.
#[derive(Clone, Debug, Default)]
pub struct StaticRoiProvider {
    per_camera: HashMap<String, String>,
    fallback: Option<String>,
}

impl StaticRoiProvider {
    pub fn new(per_camera: HashMap<String, String>, fallback: Option<String>) -> Self {
        Self {
            per_camera,
            fallback,
        }
    }
}

impl RoiProvider for StaticRoiProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    fn get(&self, camera_id: &str) -> Result<Option<RoiRect>> {
        let raw = self
            .per_camera
            .get(camera_id)
            .or(self.fallback.as_ref());
        raw.map(|r| RoiRect::parse(r)).transpose()
    }
}

/// Where the current region came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoiSource {
    Provider(&'static str),
    Default,
}

/// Ordered ROI fallback chain for one camera, fronted by a TTL cache.
pub struct RoiResolver {
    camera_id: String,
    providers: Vec<Box<dyn RoiProvider>>,
    ttl: Duration,
    cached: Option<(Instant, RoiRect, RoiSource)>,
    rejected: HashSet<String>,
}

impl RoiResolver {
    pub fn new(camera_id: &str, providers: Vec<Box<dyn RoiProvider>>, ttl: Duration) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            providers,
            ttl,
            cached: None,
            rejected: HashSet::new(),
        }
    }

    /// Full frame, no providers.
    pub fn full_frame(camera_id: &str) -> Self {
        Self::new(camera_id, Vec::new(), DEFAULT_ROI_CACHE_TTL)
    }

    pub fn resolve(&mut self, now: Instant) -> RoiRect {
        self.resolve_with_source(now).0
    }

    pub fn resolve_with_source(&mut self, now: Instant) -> (RoiRect, RoiSource) {
        if let Some((at, roi, source)) = self.cached {
            if now.saturating_duration_since(at) < self.ttl {
                return (roi, source);
            }
        }

        let mut resolved = (RoiRect::FULL_FRAME, RoiSource::Default);
        for provider in &self.providers {
            match provider.get(&self.camera_id) {
                Ok(Some(roi)) => match roi.validate() {
                    Ok(()) => {
                        resolved = (roi, RoiSource::Provider(provider.name()));
                        break;
                    }
                    Err(e) => {
                        let key = format!("{}:{}", provider.name(), roi);
                        if self.rejected.insert(key) {
                            log::warn!(
                                "[{}] ignoring {} ROI: {}",
                                self.camera_id,
                                provider.name(),
                                e
                            );
                        }
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    let key = format!("{}:err:{}", provider.name(), e);
                    if self.rejected.insert(key) {
                        log::warn!(
                            "[{}] {} ROI provider failed: {:#}",
                            self.camera_id,
                            provider.name(),
                            e
                        );
                    }
                }
            }
        }

        if self.cached.map(|(_, roi, _)| roi) != Some(resolved.0) {
            log::info!(
                "[{}] ROI {} from {:?}",
                self.camera_id,
                resolved.0,
                resolved.1
            );
        }
        self.cached = Some((now, resolved.0, resolved.1));
        resolved
    }
}
