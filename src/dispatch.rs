//! Hands finalized captures to a worker thread so the camera loop does not wait
//! on JPEG encoding, persistence or notification.
//!
//! The queue is bounded. When the worker falls a full queue behind, `submit`
//! counts a stall and blocks until a slot frees up: the camera loop slows down
//! instead of dropping finalized captures.
//!
//! A capture that fails to persist has its dedup record withdrawn, so the next
//! read of the plate is captured again.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::dedup::DedupRelease;
use crate::frame::FrameRef;
use crate::stats::PipelineStats;
use crate::storage::{CaptureMetadata, CaptureSink};
use crate::transport::{CaptureNotice, CaptureNotifier};

pub const DEFAULT_QUEUE_DEPTH: usize = 32;

pub struct DispatchJob {
    pub frame: FrameRef,
    pub metadata: CaptureMetadata,
    /// Capture this one replaces after a more confident read of the same plate.
    pub supersedes: Option<String>,
    /// Dedup record written for this capture, withdrawn if persisting fails.
    pub dedup_key: Option<String>,
}

pub struct Dispatcher {
    camera_id: String,
    tx: Option<SyncSender<DispatchJob>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    pub fn spawn(
        camera_id: &str,
        sink: Box<dyn CaptureSink>,
        notifier: Option<Box<dyn CaptureNotifier>>,
        dedup: Option<DedupRelease>,
        stats: Arc<PipelineStats>,
        queue_depth: usize,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(queue_depth.max(1));
        let worker = Worker {
            camera_id: camera_id.to_string(),
            sink,
            notifier,
            dedup,
            stats: stats.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("dispatch-{}", camera_id))
            .spawn(move || worker.run(rx))
            .map_err(|e| anyhow!("spawn dispatcher for {}: {}", camera_id, e))?;
        Ok(Self {
            camera_id: camera_id.to_string(),
            tx: Some(tx),
            handle: Some(handle),
            stats,
        })
    }

    /// Queues a capture. Blocks, counting a stall, when the queue is full.
    pub fn submit(&self, job: DispatchJob) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!("dispatcher for {} is shut down", self.camera_id))?;
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                PipelineStats::incr(&self.stats.dispatch_stalls);
                log::warn!("[{}] capture queue full, waiting for worker", self.camera_id);
                tx.send(job)
                    .map_err(|_| anyhow!("dispatcher for {} stopped", self.camera_id))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(anyhow!("dispatcher for {} stopped", self.camera_id))
            }
        }
    }

    /// Closes the queue, lets the worker drain it, and joins.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[{}] dispatcher thread panicked", self.camera_id);
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    camera_id: String,
    sink: Box<dyn CaptureSink>,
    notifier: Option<Box<dyn CaptureNotifier>>,
    dedup: Option<DedupRelease>,
    stats: Arc<PipelineStats>,
}

impl Worker {
    fn run(mut self, rx: Receiver<DispatchJob>) {
        for job in rx {
            if let Err(e) = self.handle(&job) {
                PipelineStats::incr(&self.stats.persist_errors);
                log::error!(
                    "[{}] failed to persist capture {}: {:#}",
                    self.camera_id,
                    job.metadata.capture_id,
                    e
                );
            }
        }
        if let Some(notifier) = self.notifier.as_mut() {
            if let Err(e) = notifier.close() {
                log::warn!("[{}] notifier close: {}", self.camera_id, e);
            }
        }
        log::debug!("[{}] dispatcher drained", self.camera_id);
    }

    fn handle(&mut self, job: &DispatchJob) -> Result<()> {
        let capture_id = match self.persist(job) {
            Ok(id) => id,
            Err(e) => {
                self.release_dedup(job);
                return Err(e);
            }
        };
        if let Some(previous) = job.supersedes.as_deref() {
            self.sink.mark_superseded(previous, &capture_id)?;
        }
        PipelineStats::incr(&self.stats.enqueued);
        log::info!(
            "[{}] capture {} enqueued (plate {}, score {:.2}, {})",
            self.camera_id,
            &capture_id[..capture_id.len().min(12)],
            job.metadata.plate_text.as_deref().unwrap_or("-"),
            job.metadata.combined_score,
            job.metadata.finalize_reason
        );

        if let Some(notifier) = self.notifier.as_mut() {
            let notice = CaptureNotice {
                capture_id: capture_id.clone(),
                camera_id: job.metadata.camera_id.clone(),
                plate: job.metadata.plate_text.clone(),
                confidence: job.metadata.ocr_confidence,
                timestamp_ms: job.metadata.timestamp_ms,
                supersedes: job.supersedes.clone(),
            };
            // Persistence already succeeded; a lost notice is not a lost capture.
            if let Err(e) = notifier.notify(&notice) {
                log::warn!("[{}] notify {}: {}", self.camera_id, capture_id, e);
            }
        }
        Ok(())
    }

    fn persist(&mut self, job: &DispatchJob) -> Result<String> {
        let jpeg = job.frame.encode_jpeg()?;
        self.sink.persist_and_enqueue(&jpeg, &job.metadata)
    }

    fn release_dedup(&self, job: &DispatchJob) {
        let (Some(dedup), Some(key)) = (self.dedup.as_ref(), job.dedup_key.as_deref()) else {
            return;
        };
        match dedup.release(key, &job.metadata.capture_id) {
            Ok(true) => log::info!("[{}] released dedup record {}", self.camera_id, key),
            Ok(false) => {}
            Err(e) => log::warn!("[{}] release dedup record {}: {}", self.camera_id, key, e),
        }
    }
}
