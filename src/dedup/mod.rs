//! Cross-camera plate suppression.
//!
//! A plate seen recently suppresses further submissions until its record
//! expires. A later, more confident read replaces the record and resets the
//! expiry. Low-trust input (short text, low confidence) is never suppressed.

pub mod store;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::frame::now_epoch_ms;

pub use store::{DedupRecord, DedupStore, InMemoryDedupStore, SqliteDedupStore};

pub const KEY_PREFIX: &str = "plate_dedup";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    /// Normalized plates shorter than this are never deduplicated.
    pub min_len: usize,
    pub min_confidence: f32,
    /// Scope keys by camera. Off means one plate is suppressed across all cameras.
    pub per_camera: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 60,
            min_len: 4,
            min_confidence: 0.30,
            per_camera: false,
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.ttl_secs == 0 {
            return Err(anyhow!("dedup.ttl_secs must be > 0 when dedup is enabled"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(anyhow!("dedup.min_confidence must be in [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DedupOutcome {
    /// Not seen within the TTL, or dedup does not apply. Persist.
    New,
    /// Already captured with equal or better confidence. Do not persist.
    Skip { existing_capture_id: String },
    /// Seen before with lower confidence. Persist and prefer this capture.
    Update { previous_capture_id: String },
}

impl DedupOutcome {
    pub fn should_persist(&self) -> bool {
        !matches!(self, DedupOutcome::Skip { .. })
    }
}

/// Letters and digits only, ASCII upper-cased. Non-Latin plate letters
/// (Thai, Arabic) are kept as read.
pub fn normalize_plate(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

pub fn dedup_key(plate_norm: &str, camera_scope: Option<&str>) -> String {
    match camera_scope {
        Some(camera) => format!("{}:{}:{}", KEY_PREFIX, camera, plate_norm),
        None => format!("{}:{}", KEY_PREFIX, plate_norm),
    }
}

type SharedStore = Arc<Mutex<Box<dyn DedupStore>>>;

fn lock(store: &SharedStore) -> Result<MutexGuard<'_, Box<dyn DedupStore>>> {
    store
        .lock()
        .map_err(|_| anyhow!("dedup store lock poisoned"))
}

pub struct PlateDedup {
    config: DedupConfig,
    store: SharedStore,
    store_name: &'static str,
    store_errors: u64,
}

impl PlateDedup {
    pub fn new(config: DedupConfig, store: Box<dyn DedupStore>) -> Self {
        Self {
            config,
            store_name: store.name(),
            store: Arc::new(Mutex::new(store)),
            store_errors: 0,
        }
    }

    pub fn in_memory(config: DedupConfig) -> Self {
        Self::new(config, Box::new(InMemoryDedupStore::new()))
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Store failures seen so far. Each one degraded a check to `New`.
    pub fn store_errors(&self) -> u64 {
        self.store_errors
    }

    /// Handle for withdrawing records from another thread.
    pub fn release_handle(&self) -> DedupRelease {
        DedupRelease {
            store: self.store.clone(),
        }
    }

    /// Store key for this read, or `None` when dedup does not apply to it.
    pub fn key_for(&self, plate: &str, confidence: f32, camera_id: &str) -> Option<String> {
        let plate_norm = normalize_plate(plate);
        if !self.config.enabled
            || plate_norm.chars().count() < self.config.min_len
            || confidence < self.config.min_confidence
        {
            return None;
        }
        let scope = self.config.per_camera.then_some(camera_id);
        Some(dedup_key(&plate_norm, scope))
    }

    pub fn check(
        &mut self,
        plate: &str,
        confidence: f32,
        capture_id: &str,
        camera_id: &str,
    ) -> DedupOutcome {
        self.check_at(plate, confidence, capture_id, camera_id, now_epoch_ms())
    }

    pub fn check_at(
        &mut self,
        plate: &str,
        confidence: f32,
        capture_id: &str,
        camera_id: &str,
        now_ms: u64,
    ) -> DedupOutcome {
        let Some(key) = self.key_for(plate, confidence, camera_id) else {
            return DedupOutcome::New;
        };

        match self.try_check(&key, confidence, capture_id, now_ms) {
            Ok(outcome) => {
                log::debug!("[{}] dedup {} -> {:?}", camera_id, key, outcome);
                outcome
            }
            Err(e) => {
                self.store_errors += 1;
                log::warn!(
                    "[{}] dedup store {} unavailable, treating {} as new: {}",
                    camera_id,
                    self.store_name,
                    key,
                    e
                );
                DedupOutcome::New
            }
        }
    }

    fn try_check(
        &self,
        key: &str,
        confidence: f32,
        capture_id: &str,
        now_ms: u64,
    ) -> Result<DedupOutcome> {
        let store = lock(&self.store)?;
        let existing = store.get(key, now_ms)?;
        let outcome = match existing {
            Some(record) if confidence <= record.confidence => {
                return Ok(DedupOutcome::Skip {
                    existing_capture_id: record.capture_id,
                })
            }
            Some(record) => DedupOutcome::Update {
                previous_capture_id: record.capture_id,
            },
            None => DedupOutcome::New,
        };
        let ttl_ms = self.config.ttl_secs.saturating_mul(1000);
        store.put(&DedupRecord {
            plate_key: key.to_string(),
            capture_id: capture_id.to_string(),
            confidence,
            timestamp_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        })?;
        Ok(outcome)
    }

    pub fn record(&self, plate: &str, camera_id: &str, now_ms: u64) -> Result<Option<DedupRecord>> {
        let plate_norm = normalize_plate(plate);
        let scope = self.config.per_camera.then_some(camera_id);
        lock(&self.store)?.get(&dedup_key(&plate_norm, scope), now_ms)
    }

    /// Drops expired records from the store. Failures are counted, not raised.
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        match lock(&self.store).and_then(|store| store.purge_expired(now_ms)) {
            Ok(n) => n,
            Err(e) => {
                self.store_errors += 1;
                log::warn!("dedup store {} purge failed: {}", self.store_name, e);
                0
            }
        }
    }
}

/// Withdraws a record whose capture never reached storage, so later reads of
/// the plate are not suppressed in favour of a capture that does not exist.
#[derive(Clone)]
pub struct DedupRelease {
    store: SharedStore,
}

impl DedupRelease {
    pub fn release(&self, key: &str, capture_id: &str) -> Result<bool> {
        lock(&self.store)?.remove_if(key, capture_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl DedupStore for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn get(&self, _key: &str, _now_ms: u64) -> Result<Option<DedupRecord>> {
            Err(anyhow!("connection refused"))
        }

        fn put(&self, _record: &DedupRecord) -> Result<()> {
            Err(anyhow!("connection refused"))
        }

        fn remove_if(&self, _key: &str, _capture_id: &str) -> Result<bool> {
            Err(anyhow!("connection refused"))
        }

        fn purge_expired(&self, _now_ms: u64) -> Result<usize> {
            Err(anyhow!("connection refused"))
        }
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_plate(" ab-12 34 "), "AB1234");
        assert_eq!(normalize_plate("กข 1234"), "กข1234");
        assert_ne!(normalize_plate("กข 1234"), normalize_plate("ขค 1234"));
        assert_eq!(dedup_key("AB1234", Some("cam-1")), "plate_dedup:cam-1:AB1234");
        assert_eq!(dedup_key("AB1234", None), "plate_dedup:AB1234");
    }

    #[test]
    fn new_skip_update_sequence() -> Result<()> {
        let mut dedup = PlateDedup::in_memory(DedupConfig::default());
        let t0 = 1_000_000;

        assert_eq!(dedup.check_at("AB1234", 0.5, "cap1", "cam", t0), DedupOutcome::New);

        let skip = dedup.check_at("ab 1234", 0.4, "cap2", "cam", t0 + 1_000);
        assert_eq!(
            skip,
            DedupOutcome::Skip {
                existing_capture_id: "cap1".to_string()
            }
        );
        let rec = dedup.record("AB1234", "cam", t0 + 1_000)?;
        assert_eq!(rec.as_ref().map(|r| r.capture_id.as_str()), Some("cap1"));
        assert_eq!(rec.map(|r| r.confidence), Some(0.5));

        let update = dedup.check_at("AB1234", 0.9, "cap3", "cam", t0 + 2_000);
        assert_eq!(
            update,
            DedupOutcome::Update {
                previous_capture_id: "cap1".to_string()
            }
        );
        let rec = dedup.record("AB1234", "cam", t0 + 2_000)?;
        assert_eq!(rec.as_ref().map(|r| r.capture_id.as_str()), Some("cap3"));
        assert_eq!(rec.as_ref().map(|r| r.confidence), Some(0.9));
        assert_eq!(rec.map(|r| r.expires_at_ms), Some(t0 + 2_000 + 60_000));
        Ok(())
    }

    #[test]
    fn equal_confidence_is_skipped() {
        let mut dedup = PlateDedup::in_memory(DedupConfig::default());
        dedup.check_at("AB1234", 0.8, "cap1", "cam", 0);
        assert!(!dedup.check_at("AB1234", 0.8, "cap2", "cam", 10).should_persist());
    }

    #[test]
    fn ttl_counts_from_last_write() {
        let mut dedup = PlateDedup::in_memory(DedupConfig::default());
        dedup.check_at("AB1234", 0.5, "cap1", "cam", 0);
        dedup.check_at("AB1234", 0.6, "cap2", "cam", 50_000);
        // 70 s after first sight but 20 s after the last write.
        assert!(!dedup.check_at("AB1234", 0.4, "cap3", "cam", 70_000).should_persist());
        assert_eq!(
            dedup.check_at("AB1234", 0.4, "cap4", "cam", 110_000),
            DedupOutcome::New
        );
    }

    #[test]
    fn low_trust_input_is_always_new() {
        let mut dedup = PlateDedup::in_memory(DedupConfig::default());
        for _ in 0..3 {
            assert_eq!(dedup.check_at("AB1", 0.9, "c", "cam", 0), DedupOutcome::New);
            assert_eq!(dedup.check_at("AB1234", 0.2, "c", "cam", 0), DedupOutcome::New);
            assert_eq!(dedup.check_at("", 0.9, "c", "cam", 0), DedupOutcome::New);
        }
        let mut off = PlateDedup::in_memory(DedupConfig {
            enabled: false,
            ..DedupConfig::default()
        });
        off.check_at("AB1234", 0.9, "c1", "cam", 0);
        assert_eq!(off.check_at("AB1234", 0.9, "c2", "cam", 0), DedupOutcome::New);
    }

    #[test]
    fn camera_scope() {
        let store = InMemoryDedupStore::new();
        let mut global = PlateDedup::new(DedupConfig::default(), Box::new(store.clone()));
        global.check_at("AB1234", 0.8, "c1", "cam-a", 0);
        assert!(!global.check_at("AB1234", 0.7, "c2", "cam-b", 0).should_persist());

        let mut scoped = PlateDedup::in_memory(DedupConfig {
            per_camera: true,
            ..DedupConfig::default()
        });
        scoped.check_at("AB1234", 0.8, "c1", "cam-a", 0);
        assert_eq!(scoped.check_at("AB1234", 0.7, "c2", "cam-b", 0), DedupOutcome::New);
    }

    #[test]
    fn thai_plates_sharing_digits_stay_distinct() {
        let mut dedup = PlateDedup::in_memory(DedupConfig::default());
        assert_eq!(dedup.check_at("กข 1234", 0.9, "cap-a", "cam", 0), DedupOutcome::New);
        assert_eq!(dedup.check_at("ขค 1234", 0.8, "cap-b", "cam", 10), DedupOutcome::New);
        assert!(!dedup.check_at("กข1234", 0.8, "cap-c", "cam", 20).should_persist());
        // Four characters, twelve bytes: still long enough.
        assert_eq!(dedup.key_for("กข12", 0.9, "cam").as_deref(), Some("plate_dedup:กข12"));
        assert_eq!(dedup.key_for("กข1", 0.9, "cam"), None);
    }

    #[test]
    fn released_record_no_longer_suppresses() {
        let mut dedup = PlateDedup::in_memory(DedupConfig::default());
        let release = dedup.release_handle();
        assert_eq!(dedup.check_at("AB1234", 0.9, "cap1", "cam", 0), DedupOutcome::New);

        let key = dedup.key_for("AB1234", 0.9, "cam").unwrap();
        assert!(!release.release(&key, "someone-else").unwrap());
        assert!(release.release(&key, "cap1").unwrap());
        assert_eq!(dedup.check_at("AB1234", 0.5, "cap2", "cam", 10), DedupOutcome::New);
    }

    #[test]
    fn purge_drops_only_expired_records() -> Result<()> {
        let store = InMemoryDedupStore::new();
        let mut dedup = PlateDedup::new(DedupConfig::default(), Box::new(store.clone()));
        dedup.check_at("AB1234", 0.9, "cap1", "cam", 0);
        dedup.check_at("CD5678", 0.9, "cap2", "cam", 30_000);
        assert_eq!(dedup.purge_expired(60_000), 1);
        assert_eq!(store.len(), 1);
        assert!(dedup.record("CD5678", "cam", 60_000)?.is_some());
        Ok(())
    }

    #[test]
    fn store_failure_degrades_to_new() {
        let mut dedup = PlateDedup::new(DedupConfig::default(), Box::new(Broken));
        assert_eq!(dedup.check_at("AB1234", 0.9, "c1", "cam", 0), DedupOutcome::New);
        assert_eq!(dedup.check_at("AB1234", 0.9, "c2", "cam", 0), DedupOutcome::New);
        assert_eq!(dedup.purge_expired(0), 0);
        assert_eq!(dedup.store_errors(), 3);
    }
}
