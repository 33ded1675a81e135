//! Frame ingestion.
//!
//! A backend (`StreamBackend`) only knows how to open a stream and decode the next
//! image. `StreamSource` wraps one backend per camera and owns everything around
//! it: sequence numbering and timestamps, the read-rate limit, and reconnection
//! with jittered backoff. Its `read()` never returns an error; failures surface as
//! `SourceRead::TransientError` and the caller keeps looping.
//!
//! Backends:
//! - `stub://...` synthetic scene with a passing vehicle (demos and tests)
//! - `rtsp://...` GStreamer decode (feature: rtsp-gstreamer)
//! - `file://<dir>` replay of a directory of PNG/JPEG frames
//!
//! Frames are never written to disk or logged by this layer.

pub mod file;
pub mod rtsp;
pub mod scripted;

use anyhow::{anyhow, Result};
use image::RgbImage;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::frame::{now_epoch_ms, Frame};
use crate::stats::PipelineStats;

pub use file::ImageSequenceSource;
pub use rtsp::{RtspConfig, RtspSource};
pub use scripted::ScriptedSource;

pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(2000);
const BACKOFF_JITTER: f64 = 0.10;
/// Longest single sleep while waiting out a backoff, so stop requests are seen.
const BACKOFF_POLL: Duration = Duration::from_millis(100);

/// Outcome of one read.
#[derive(Debug)]
pub enum SourceRead {
    Frame(Frame),
    /// A finite source has no more frames.
    Eof,
    /// Nothing this time; the source recovers on its own.
    TransientError(String),
}

/// What the camera loop reads from.
pub trait FrameSource: Send {
    fn describe(&self) -> String;

    fn read(&mut self) -> SourceRead;

    fn is_healthy(&self) -> bool {
        true
    }

    /// Release the underlying connection.
    fn close(&mut self) {}
}

/// One decoded-image producer.
pub trait StreamBackend: Send {
    fn name(&self) -> &'static str;

    fn connect(&mut self) -> Result<()>;

    /// `Ok(None)` marks the end of a finite stream.
    fn next_image(&mut self) -> Result<Option<RgbImage>>;

    fn disconnect(&mut self) {}

    fn is_healthy(&self) -> bool {
        true
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfig {
    /// 0 disables throttling.
    pub target_fps: u32,
    pub reconnect_backoff: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_fps: 10,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }
}

impl StreamConfig {
    pub fn min_interval(&self) -> Option<Duration> {
        (self.target_fps > 0).then(|| Duration::from_secs_f64(1.0 / self.target_fps as f64))
    }
}

/// Picks a backend from the URL scheme.
pub fn open_backend(url: &str, width: u32, height: u32) -> Result<Box<dyn StreamBackend>> {
    if let Some(dir) = url.strip_prefix("file://") {
        return Ok(Box::new(ImageSequenceSource::new(dir)?));
    }
    if url.starts_with("stub://") || url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        return Ok(Box::new(RtspSource::new(RtspConfig {
            url: url.to_string(),
            width,
            height,
        })?));
    }
    Err(anyhow!("unsupported stream URL scheme: {}", url))
}

/// Reconnecting, rate-limited source for one camera.
pub struct StreamSource {
    camera_id: String,
    url: String,
    backend: Box<dyn StreamBackend>,
    config: StreamConfig,
    connected: bool,
    retry_at: Option<Instant>,
    last_delivered: Option<Instant>,
    sequence_no: u64,
    stats: Option<Arc<PipelineStats>>,
}

impl StreamSource {
    pub fn new(
        camera_id: &str,
        url: &str,
        backend: Box<dyn StreamBackend>,
        config: StreamConfig,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            url: url.to_string(),
            backend,
            config,
            connected: false,
            retry_at: None,
            last_delivered: None,
            sequence_no: 0,
            stats: None,
        }
    }

    /// Backend chosen from the URL scheme.
    pub fn open(camera_id: &str, url: &str, width: u32, height: u32, config: StreamConfig) -> Result<Self> {
        let backend = open_backend(url, width, height)?;
        Ok(Self::new(camera_id, url, backend, config))
    }

    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn sequence_no(&self) -> u64 {
        self.sequence_no
    }

    /// Attempts a connection. On failure the next attempt is scheduled after the
    /// backoff.
    pub fn connect(&mut self) -> bool {
        match self.backend.connect() {
            Ok(()) => {
                log::info!(
                    "[{}] connected to {} ({})",
                    self.camera_id,
                    self.url,
                    self.backend.name()
                );
                self.connected = true;
                self.retry_at = None;
                true
            }
            Err(e) => {
                log::warn!("[{}] connect {} failed: {:#}", self.camera_id, self.url, e);
                self.schedule_retry(Instant::now());
                false
            }
        }
    }

    fn jittered_backoff(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(1.0 - BACKOFF_JITTER..=1.0 + BACKOFF_JITTER);
        self.config.reconnect_backoff.mul_f64(factor)
    }

    fn schedule_retry(&mut self, now: Instant) {
        self.retry_at = Some(now + self.jittered_backoff());
    }

    fn drop_connection(&mut self, reason: &str) {
        log::warn!(
            "[{}] stream error, reconnecting in ~{:?}: {}",
            self.camera_id,
            self.config.reconnect_backoff,
            reason
        );
        self.backend.disconnect();
        self.connected = false;
        self.schedule_retry(Instant::now());
        if let Some(stats) = &self.stats {
            PipelineStats::incr(&stats.reconnects);
        }
    }

    fn throttle(&self) {
        let (Some(interval), Some(last)) = (self.config.min_interval(), self.last_delivered) else {
            return;
        };
        let elapsed = last.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }
}

impl FrameSource for StreamSource {
    fn describe(&self) -> String {
        format!("{} ({})", self.url, self.backend.name())
    }

    fn read(&mut self) -> SourceRead {
        if !self.connected {
            if let Some(retry_at) = self.retry_at {
                let now = Instant::now();
                if now < retry_at {
                    std::thread::sleep((retry_at - now).min(BACKOFF_POLL));
                    return SourceRead::TransientError("waiting to reconnect".to_string());
                }
            }
            if !self.connect() {
                return SourceRead::TransientError("connect failed".to_string());
            }
        }

        self.throttle();
        match self.backend.next_image() {
            Ok(Some(image)) => {
                self.sequence_no += 1;
                let now = Instant::now();
                self.last_delivered = Some(now);
                SourceRead::Frame(Frame::from_image(
                    &self.camera_id,
                    self.sequence_no,
                    now,
                    now_epoch_ms(),
                    image,
                ))
            }
            Ok(None) => SourceRead::Eof,
            Err(e) => {
                let reason = format!("{:#}", e);
                self.drop_connection(&reason);
                SourceRead::TransientError(reason)
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.connected && self.backend.is_healthy()
    }

    fn close(&mut self) {
        if self.connected {
            self.backend.disconnect();
            self.connected = false;
            log::info!("[{}] released {}", self.camera_id, self.url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Backend driven by a shared script of outcomes.
    struct Flaky {
        script: Arc<Mutex<VecDeque<Result<Option<RgbImage>>>>>,
        connects: Arc<Mutex<u32>>,
    }

    impl StreamBackend for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn connect(&mut self) -> Result<()> {
            *self.connects.lock().unwrap() += 1;
            Ok(())
        }

        fn next_image(&mut self) -> Result<Option<RgbImage>> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(None))
        }
    }

    fn image() -> RgbImage {
        RgbImage::new(4, 4)
    }

    #[test]
    fn error_triggers_backoff_then_reconnect() {
        let script = Arc::new(Mutex::new(VecDeque::from(vec![
            Ok(Some(image())),
            Err(anyhow!("socket reset")),
            Ok(Some(image())),
        ])));
        let connects = Arc::new(Mutex::new(0));
        let stats = Arc::new(PipelineStats::default());
        let mut source = StreamSource::new(
            "cam-1",
            "stub://test",
            Box::new(Flaky {
                script: script.clone(),
                connects: connects.clone(),
            }),
            StreamConfig {
                target_fps: 0,
                reconnect_backoff: Duration::from_millis(20),
            },
        )
        .with_stats(stats.clone());

        assert!(matches!(source.read(), SourceRead::Frame(f) if f.sequence_no == 1));
        assert!(matches!(source.read(), SourceRead::TransientError(_)));
        assert!(!source.is_connected());

        // No frame until the backoff has passed, then the connection comes back.
        let mut frame = None;
        for _ in 0..50 {
            match source.read() {
                SourceRead::Frame(f) => {
                    frame = Some(f);
                    break;
                }
                SourceRead::TransientError(_) => continue,
                SourceRead::Eof => break,
            }
        }
        assert_eq!(frame.map(|f| f.sequence_no), Some(2));
        assert_eq!(*connects.lock().unwrap(), 2);
        assert_eq!(stats.snapshot().reconnects, 1);
        assert!(matches!(source.read(), SourceRead::Eof));
    }

    #[test]
    fn throttle_spaces_reads() {
        let script = Arc::new(Mutex::new(VecDeque::from(vec![
            Ok(Some(image())),
            Ok(Some(image())),
            Ok(Some(image())),
        ])));
        let mut source = StreamSource::new(
            "cam-1",
            "stub://test",
            Box::new(Flaky {
                script,
                connects: Arc::new(Mutex::new(0)),
            }),
            StreamConfig {
                target_fps: 20,
                reconnect_backoff: Duration::from_millis(20),
            },
        );
        let start = Instant::now();
        for _ in 0..3 {
            assert!(matches!(source.read(), SourceRead::Frame(_)));
        }
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(open_backend("http://camera/stream", 64, 48).is_err());
        assert!(open_backend("stub://scene", 64, 48).is_ok());
    }
}
