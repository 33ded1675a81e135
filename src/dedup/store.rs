use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::storage::open_db_connection;

/// One remembered plate.
#[derive(Clone, Debug, PartialEq)]
pub struct DedupRecord {
    pub plate_key: String,
    pub capture_id: String,
    pub confidence: f32,
    pub timestamp_ms: u64,
    pub expires_at_ms: u64,
}

impl DedupRecord {
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }
}

/// Key-value store with per-key expiry. Implementations must make `put` a single
/// atomic write; readers never see a half-written record.
pub trait DedupStore: Send {
    fn name(&self) -> &'static str;

    /// Live record for `key` at `now_ms`. Expired records read as absent.
    fn get(&self, key: &str, now_ms: u64) -> Result<Option<DedupRecord>>;

    fn put(&self, record: &DedupRecord) -> Result<()>;

    /// Deletes `key` only while it still points at `capture_id`, so a newer
    /// record written by another camera survives. True when a row was removed.
    fn remove_if(&self, key: &str, capture_id: &str) -> Result<bool>;

    /// Deletes records expired at `now_ms`. Returns how many were removed.
    fn purge_expired(&self, now_ms: u64) -> Result<usize>;
}

/// Process-local store. Clones share the same map, so one instance can back
/// every camera in a process.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDedupStore {
    records: Arc<Mutex<HashMap<String, DedupRecord>>>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DedupStore for InMemoryDedupStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str, now_ms: u64) -> Result<Option<DedupRecord>> {
        let mut map = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("dedup map lock poisoned"))?;
        map.retain(|_, r| r.is_live(now_ms));
        Ok(map.get(key).cloned())
    }

    fn put(&self, record: &DedupRecord) -> Result<()> {
        let mut map = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("dedup map lock poisoned"))?;
        map.insert(record.plate_key.clone(), record.clone());
        Ok(())
    }

    fn remove_if(&self, key: &str, capture_id: &str) -> Result<bool> {
        let mut map = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("dedup map lock poisoned"))?;
        if map.get(key).is_some_and(|r| r.capture_id == capture_id) {
            map.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    fn purge_expired(&self, now_ms: u64) -> Result<usize> {
        let mut map = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("dedup map lock poisoned"))?;
        let before = map.len();
        map.retain(|_, r| r.is_live(now_ms));
        Ok(before - map.len())
    }
}

/// `plate_dedup` table in the shared database. Several processes may open the
/// same file; each write is one upsert statement.
pub struct SqliteDedupStore {
    conn: Connection,
}

impl SqliteDedupStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        conn.busy_timeout(Duration::from_secs(2))?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS plate_dedup (
              plate_key TEXT PRIMARY KEY,
              capture_id TEXT NOT NULL,
              confidence REAL NOT NULL,
              timestamp_ms INTEGER NOT NULL,
              expires_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_plate_dedup_expiry ON plate_dedup(expires_at_ms);
            "#,
        )?;
        Ok(())
    }

    pub fn record_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM plate_dedup", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl DedupStore for SqliteDedupStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, key: &str, now_ms: u64) -> Result<Option<DedupRecord>> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT plate_key, capture_id, confidence, timestamp_ms, expires_at_ms
                FROM plate_dedup WHERE plate_key = ?1 AND expires_at_ms > ?2
                "#,
                params![key, now_ms as i64],
                |row| {
                    Ok(DedupRecord {
                        plate_key: row.get(0)?,
                        capture_id: row.get(1)?,
                        confidence: row.get::<_, f64>(2)? as f32,
                        timestamp_ms: row.get::<_, i64>(3)? as u64,
                        expires_at_ms: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn put(&self, record: &DedupRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO plate_dedup(plate_key, capture_id, confidence, timestamp_ms, expires_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(plate_key) DO UPDATE SET
              capture_id = excluded.capture_id,
              confidence = excluded.confidence,
              timestamp_ms = excluded.timestamp_ms,
              expires_at_ms = excluded.expires_at_ms
            "#,
            params![
                record.plate_key,
                record.capture_id,
                record.confidence as f64,
                record.timestamp_ms as i64,
                record.expires_at_ms as i64
            ],
        )?;
        Ok(())
    }

    fn remove_if(&self, key: &str, capture_id: &str) -> Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM plate_dedup WHERE plate_key = ?1 AND capture_id = ?2",
            params![key, capture_id],
        )?;
        Ok(n > 0)
    }

    fn purge_expired(&self, now_ms: u64) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM plate_dedup WHERE expires_at_ms <= ?1",
            params![now_ms as i64],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::shared_memory_uri;

    fn record(key: &str, expires_at_ms: u64) -> DedupRecord {
        DedupRecord {
            plate_key: key.to_string(),
            capture_id: "cap".to_string(),
            confidence: 0.8,
            timestamp_ms: 0,
            expires_at_ms,
        }
    }

    #[test]
    fn sqlite_store_expires_and_upserts() -> Result<()> {
        let uri = shared_memory_uri();
        let store = SqliteDedupStore::open(&uri)?;
        store.put(&record("plate_dedup:AB1234", 1_000))?;
        assert!(store.get("plate_dedup:AB1234", 999)?.is_some());
        assert!(store.get("plate_dedup:AB1234", 1_000)?.is_none());

        let mut updated = record("plate_dedup:AB1234", 5_000);
        updated.capture_id = "cap2".to_string();
        store.put(&updated)?;
        let got = store.get("plate_dedup:AB1234", 2_000)?;
        assert_eq!(got.map(|r| r.capture_id), Some("cap2".to_string()));

        store.put(&record("plate_dedup:ZZ9999", 10))?;
        assert_eq!(store.purge_expired(2_000)?, 1);
        assert_eq!(store.record_count()?, 1);
        Ok(())
    }

    #[test]
    fn remove_if_only_matches_current_capture() -> Result<()> {
        let uri = shared_memory_uri();
        let store = SqliteDedupStore::open(&uri)?;
        store.put(&record("plate_dedup:AB1234", 1_000))?;
        assert!(!store.remove_if("plate_dedup:AB1234", "other")?);
        assert!(store.get("plate_dedup:AB1234", 0)?.is_some());
        assert!(store.remove_if("plate_dedup:AB1234", "cap")?);
        assert!(store.get("plate_dedup:AB1234", 0)?.is_none());

        let mem = InMemoryDedupStore::new();
        mem.put(&record("k", 1_000))?;
        assert!(!mem.remove_if("k", "other")?);
        assert!(mem.remove_if("k", "cap")?);
        assert!(mem.is_empty());
        Ok(())
    }

    #[test]
    fn memory_store_clones_share_records() -> Result<()> {
        let a = InMemoryDedupStore::new();
        let b = a.clone();
        a.put(&record("k", 100))?;
        assert!(b.get("k", 50)?.is_some());
        assert!(b.get("k", 100)?.is_none());
        assert!(a.is_empty());
        Ok(())
    }
}
