use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::frame::now_epoch_ms;

/// Private in-memory database shared by every connection that opens the same
/// URI. Used by tests that need several stores on one database.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:plate_capture_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Stable id for a finalized frame. Retrying the same frame yields the same id.
pub fn capture_id(camera_id: &str, sequence_no: u64, timestamp_ms: u64) -> String {
    let mut h = Sha256::new();
    h.update(camera_id.as_bytes());
    h.update(b"|");
    h.update(sequence_no.to_string().as_bytes());
    h.update(b"|");
    h.update(timestamp_ms.to_string().as_bytes());
    hex::encode(h.finalize())
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub capture_id: String,
    pub camera_id: String,
    pub sequence_no: u64,
    pub timestamp_ms: u64,
    pub zone: Option<String>,
    pub track_id: Option<u64>,
    pub plate_text: Option<String>,
    pub ocr_confidence: f32,
    pub det_confidence: f32,
    pub combined_score: f32,
    pub finalize_reason: String,
}

/// Durable persistence plus enqueue for asynchronous recognition.
pub trait CaptureSink: Send {
    /// Stores the image and queues it. Persisting the same `capture_id` twice is a
    /// no-op that returns the same id.
    fn persist_and_enqueue(&mut self, jpeg: &[u8], metadata: &CaptureMetadata) -> Result<String>;

    /// Records that `capture_id` has been replaced by a better read.
    fn mark_superseded(&mut self, capture_id: &str, superseded_by: &str) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueuedCapture {
    pub queue_id: i64,
    pub capture_id: String,
    pub camera_id: String,
    pub enqueued_at_ms: u64,
}

pub struct SqliteCaptureStore {
    conn: Connection,
}

impl SqliteCaptureStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS captures (
              capture_id TEXT PRIMARY KEY,
              camera_id TEXT NOT NULL,
              sequence_no INTEGER NOT NULL,
              timestamp_ms INTEGER NOT NULL,
              zone TEXT,
              track_id INTEGER,
              plate_text TEXT,
              ocr_confidence REAL NOT NULL,
              det_confidence REAL NOT NULL,
              combined_score REAL NOT NULL,
              finalize_reason TEXT NOT NULL,
              image_jpeg BLOB NOT NULL,
              superseded_by TEXT,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS capture_queue (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              capture_id TEXT NOT NULL UNIQUE,
              camera_id TEXT NOT NULL,
              enqueued_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_captures_camera_ts ON captures(camera_id, timestamp_ms);
            "#,
        )?;
        Ok(())
    }

    pub fn capture_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM captures", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn load_metadata(&self, capture_id: &str) -> Result<Option<CaptureMetadata>> {
        let meta = self
            .conn
            .query_row(
                r#"
                SELECT capture_id, camera_id, sequence_no, timestamp_ms, zone, track_id,
                       plate_text, ocr_confidence, det_confidence, combined_score, finalize_reason
                FROM captures WHERE capture_id = ?1
                "#,
                params![capture_id],
                |row| {
                    Ok(CaptureMetadata {
                        capture_id: row.get(0)?,
                        camera_id: row.get(1)?,
                        sequence_no: row.get::<_, i64>(2)? as u64,
                        timestamp_ms: row.get::<_, i64>(3)? as u64,
                        zone: row.get(4)?,
                        track_id: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
                        plate_text: row.get(6)?,
                        ocr_confidence: row.get::<_, f64>(7)? as f32,
                        det_confidence: row.get::<_, f64>(8)? as f32,
                        combined_score: row.get::<_, f64>(9)? as f32,
                        finalize_reason: row.get(10)?,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }

    pub fn superseded_by(&self, capture_id: &str) -> Result<Option<String>> {
        let v: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT superseded_by FROM captures WHERE capture_id = ?1",
                params![capture_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(v.flatten())
    }

    /// Oldest pending recognition work first.
    pub fn pending(&self, limit: usize) -> Result<Vec<QueuedCapture>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, capture_id, camera_id, enqueued_at_ms FROM capture_queue ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(QueuedCapture {
                queue_id: row.get(0)?,
                capture_id: row.get(1)?,
                camera_id: row.get(2)?,
                enqueued_at_ms: row.get::<_, i64>(3)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn ack(&self, queue_id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM capture_queue WHERE id = ?1", params![queue_id])?;
        Ok(n > 0)
    }
}

impl CaptureSink for SqliteCaptureStore {
    fn persist_and_enqueue(&mut self, jpeg: &[u8], metadata: &CaptureMetadata) -> Result<String> {
        if metadata.capture_id.is_empty() {
            return Err(anyhow!("capture metadata has no capture_id"));
        }
        let now = now_epoch_ms() as i64;
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT OR IGNORE INTO captures(
              capture_id, camera_id, sequence_no, timestamp_ms, zone, track_id, plate_text,
              ocr_confidence, det_confidence, combined_score, finalize_reason, image_jpeg,
              created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                metadata.capture_id,
                metadata.camera_id,
                metadata.sequence_no as i64,
                metadata.timestamp_ms as i64,
                metadata.zone,
                metadata.track_id.map(|v| v as i64),
                metadata.plate_text,
                metadata.ocr_confidence as f64,
                metadata.det_confidence as f64,
                metadata.combined_score as f64,
                metadata.finalize_reason,
                jpeg,
                now
            ],
        )?;
        tx.execute(
            r#"
            INSERT OR IGNORE INTO capture_queue(capture_id, camera_id, enqueued_at_ms)
            VALUES (?1, ?2, ?3)
            "#,
            params![metadata.capture_id, metadata.camera_id, now],
        )?;
        tx.commit()?;
        Ok(metadata.capture_id.clone())
    }

    fn mark_superseded(&mut self, capture_id: &str, superseded_by: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE captures SET superseded_by = ?2 WHERE capture_id = ?1",
            params![capture_id, superseded_by],
        )?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct StoredCapture {
    pub metadata: CaptureMetadata,
    pub jpeg: Vec<u8>,
    pub superseded_by: Option<String>,
}

/// Keeps captures in memory. Clones share storage so tests can hand one clone to
/// a pipeline and inspect another.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCaptureSink {
    captures: Arc<Mutex<Vec<StoredCapture>>>,
}

impl InMemoryCaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captures(&self) -> Vec<StoredCapture> {
        self.captures.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.captures.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CaptureSink for InMemoryCaptureSink {
    fn persist_and_enqueue(&mut self, jpeg: &[u8], metadata: &CaptureMetadata) -> Result<String> {
        let mut captures = self
            .captures
            .lock()
            .map_err(|_| anyhow!("capture sink lock poisoned"))?;
        if !captures
            .iter()
            .any(|c| c.metadata.capture_id == metadata.capture_id)
        {
            captures.push(StoredCapture {
                metadata: metadata.clone(),
                jpeg: jpeg.to_vec(),
                superseded_by: None,
            });
        }
        Ok(metadata.capture_id.clone())
    }

    fn mark_superseded(&mut self, capture_id: &str, superseded_by: &str) -> Result<()> {
        let mut captures = self
            .captures
            .lock()
            .map_err(|_| anyhow!("capture sink lock poisoned"))?;
        for c in captures.iter_mut().filter(|c| c.metadata.capture_id == capture_id) {
            c.superseded_by = Some(superseded_by.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str) -> CaptureMetadata {
        CaptureMetadata {
            capture_id: id.to_string(),
            camera_id: "cam-1".to_string(),
            sequence_no: 7,
            timestamp_ms: 1_700_000_000_000,
            zone: Some("lane".to_string()),
            track_id: Some(3),
            plate_text: Some("AB1234".to_string()),
            ocr_confidence: 0.9,
            det_confidence: 0.8,
            combined_score: 0.85,
            finalize_reason: "window_elapsed".to_string(),
        }
    }

    #[test]
    fn capture_id_is_stable() {
        let a = capture_id("cam-1", 7, 1000);
        assert_eq!(a, capture_id("cam-1", 7, 1000));
        assert_ne!(a, capture_id("cam-1", 8, 1000));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn persist_is_idempotent() -> Result<()> {
        let mut store = SqliteCaptureStore::open(&shared_memory_uri())?;
        let m = meta("abc");
        assert_eq!(store.persist_and_enqueue(b"jpeg", &m)?, "abc");
        assert_eq!(store.persist_and_enqueue(b"jpeg", &m)?, "abc");
        assert_eq!(store.capture_count()?, 1);
        assert_eq!(store.pending(10)?.len(), 1);
        assert_eq!(store.load_metadata("abc")?, Some(m));
        Ok(())
    }

    #[test]
    fn queue_ack_and_supersede() -> Result<()> {
        let mut store = SqliteCaptureStore::open(&shared_memory_uri())?;
        store.persist_and_enqueue(b"a", &meta("first"))?;
        store.persist_and_enqueue(b"b", &meta("second"))?;
        let pending = store.pending(10)?;
        assert_eq!(pending[0].capture_id, "first");
        assert!(store.ack(pending[0].queue_id)?);
        assert_eq!(store.pending(10)?.len(), 1);

        store.mark_superseded("first", "second")?;
        assert_eq!(store.superseded_by("first")?, Some("second".to_string()));
        assert_eq!(store.superseded_by("second")?, None);
        Ok(())
    }

    #[test]
    fn memory_sink_dedupes_by_id() -> Result<()> {
        let sink = InMemoryCaptureSink::new();
        let mut writer = sink.clone();
        writer.persist_and_enqueue(b"x", &meta("a"))?;
        writer.persist_and_enqueue(b"x", &meta("a"))?;
        writer.mark_superseded("a", "b")?;
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.captures()[0].superseded_by.as_deref(), Some("b"));
        Ok(())
    }
}
