//! One camera, one sequential loop.
//!
//! read -> gap flush -> quality gate -> detector (ROI-filtered) -> tracker ->
//! spatial trigger -> plate detect + OCR -> best-shot window -> dedup -> dispatcher
//!
//! Frames are processed strictly in order; the next frame is read only after the
//! previous one has gone through the whole chain. Persistence runs on the
//! dispatcher thread, so the only blocking calls here are the source read, the
//! recognizer and the rate-limit sleep.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bestshot::{BestShotConfig, BestShotSelector, CaptureCandidate, ComponentScores, Finalized};
use crate::config::{CameraSettings, CapturedConfig};
use crate::dedup::{normalize_plate, DedupOutcome, PlateDedup, SqliteDedupStore};
use crate::detect::{BackendRegistry, Recognizer, VehicleDetector};
use crate::dispatch::{DispatchJob, Dispatcher, DEFAULT_QUEUE_DEPTH};
use crate::frame::{laplacian_variance, now_epoch_ms, Frame, FrameRef};
use crate::ingest::{FrameSource, SourceRead, StreamSource};
use crate::quality::{DropReason, FrameQualityGate, GateConfig, GateReport, GateVerdict};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::storage::{capture_id, CaptureMetadata, CaptureSink, SqliteCaptureStore};
use crate::tracker::{BBox, TrackId, TrackerConfig, VehicleTracker};
use crate::transport::{CaptureNotifier, MqttNotifier};
use crate::trigger::{RoiProvider, RoiResolver, SpatialTrigger, SqliteRoiStore, StaticRoiProvider, TriggerConfig};

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub gate: GateConfig,
    pub tracker: TrackerConfig,
    pub trigger: TriggerConfig,
    pub bestshot: BestShotConfig,
    pub health_interval: Duration,
    pub queue_depth: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            tracker: TrackerConfig::default(),
            trigger: TriggerConfig::default(),
            bestshot: BestShotConfig::default(),
            health_interval: Duration::from_secs(5),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(cfg: &CapturedConfig, camera: &CameraSettings) -> Self {
        Self {
            gate: cfg.gate.clone(),
            tracker: cfg.tracker.clone(),
            trigger: camera.trigger.clone(),
            bestshot: cfg.bestshot.clone(),
            health_interval: cfg.health_interval,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Collaborators a pipeline owns. Each camera gets its own instances.
pub struct PipelineParts {
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn VehicleDetector>,
    pub recognizer: Box<dyn Recognizer>,
    pub roi: RoiResolver,
    pub dedup: PlateDedup,
    pub sink: Box<dyn CaptureSink>,
    pub notifier: Option<Box<dyn CaptureNotifier>>,
}

/// What happened to one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Dropped(DropReason),
    Processed {
        triggered: usize,
        candidate: bool,
        finalized: usize,
    },
}

pub struct CameraPipeline {
    camera_id: String,
    source: Box<dyn FrameSource>,
    gate: FrameQualityGate,
    detector: Box<dyn VehicleDetector>,
    tracker: VehicleTracker,
    trigger: SpatialTrigger,
    roi: RoiResolver,
    recognizer: Box<dyn Recognizer>,
    selector: BestShotSelector,
    dedup: PlateDedup,
    dispatcher: Dispatcher,
    stats: Arc<PipelineStats>,
    sharpness_ref: f32,
    health_interval: Duration,
    active_zone: Option<String>,
    last_frame_at: Option<Instant>,
}

impl CameraPipeline {
    pub fn new(
        camera_id: &str,
        settings: PipelineSettings,
        parts: PipelineParts,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let trigger = SpatialTrigger::from_config(camera_id, &settings.trigger)?;
        let dispatcher = Dispatcher::spawn(
            camera_id,
            parts.sink,
            parts.notifier,
            Some(parts.dedup.release_handle()),
            stats.clone(),
            settings.queue_depth,
        )?;
        log::info!(
            "[{}] pipeline: source={} trigger={} detector={} recognizer={}",
            camera_id,
            parts.source.describe(),
            trigger.strategy_name(),
            parts.detector.name(),
            parts.recognizer.name()
        );
        Ok(Self {
            camera_id: camera_id.to_string(),
            source: parts.source,
            sharpness_ref: settings.gate.quality.sharpness_ref.max(1.0),
            gate: FrameQualityGate::new(settings.gate),
            detector: parts.detector,
            tracker: VehicleTracker::new(camera_id, settings.tracker),
            trigger,
            roi: parts.roi,
            recognizer: parts.recognizer,
            selector: BestShotSelector::new(settings.bestshot),
            dedup: parts.dedup,
            dispatcher,
            stats,
            health_interval: settings.health_interval,
            active_zone: None,
            last_frame_at: None,
        })
    }

    /// Production wiring: stream from the camera URL, shared SQLite stores for
    /// captures, dedup and ROI, MQTT when configured.
    pub fn from_config(
        cfg: &CapturedConfig,
        camera: &CameraSettings,
        registry: &BackendRegistry,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let source = StreamSource::open(
            &camera.id,
            &camera.url,
            camera.width,
            camera.height,
            camera.stream_config(),
        )?
        .with_stats(stats.clone());

        let mut providers: Vec<Box<dyn RoiProvider>> = Vec::new();
        match SqliteRoiStore::open(&cfg.db_path) {
            Ok(store) => providers.push(Box::new(store)),
            Err(e) => log::warn!(
                "[{}] ROI store unavailable, using static configuration: {}",
                camera.id,
                e
            ),
        }
        providers.push(Box::new(StaticRoiProvider::new(
            cfg.roi.per_camera.clone(),
            cfg.roi.default.clone(),
        )));
        let roi = RoiResolver::new(&camera.id, providers, cfg.roi.cache_ttl);

        let dedup = PlateDedup::new(
            cfg.dedup.clone(),
            Box::new(SqliteDedupStore::open(&cfg.db_path)?),
        );

        let notifier: Option<Box<dyn CaptureNotifier>> = match cfg.mqtt.addr {
            Some(_) => match MqttNotifier::connect(&cfg.mqtt) {
                Ok(n) => Some(Box::new(n)),
                Err(e) => {
                    log::warn!("[{}] MQTT notifications disabled: {}", camera.id, e);
                    None
                }
            },
            None => None,
        };

        let parts = PipelineParts {
            source: Box::new(source),
            detector: registry.build_detector(&cfg.detector)?,
            recognizer: registry.build_recognizer(&cfg.recognizer)?,
            roi,
            dedup,
            sink: Box::new(SqliteCaptureStore::open(&cfg.db_path)?),
            notifier,
        };
        Self::new(&camera.id, PipelineSettings::from_config(cfg, camera), parts, stats)
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn tracker(&self) -> &VehicleTracker {
        &self.tracker
    }

    pub fn selector(&self) -> &BestShotSelector {
        &self.selector
    }

    /// Reads until the stop flag is raised or the source ends, then flushes any
    /// open window, releases the source and drains the dispatcher.
    pub fn run(mut self, stop: Arc<AtomicBool>) -> StatsSnapshot {
        let mut last_health = Instant::now();
        loop {
            if stop.load(Ordering::SeqCst) {
                log::info!("[{}] stop requested", self.camera_id);
                break;
            }
            match self.source.read() {
                SourceRead::Frame(frame) => {
                    self.process_frame(frame);
                }
                SourceRead::Eof => {
                    log::info!("[{}] end of stream", self.camera_id);
                    break;
                }
                SourceRead::TransientError(reason) => {
                    PipelineStats::incr(&self.stats.read_errors);
                    log::debug!("[{}] no frame: {}", self.camera_id, reason);
                    let now = self.clock();
                    self.flush_gap(now);
                }
            }
            if last_health.elapsed() >= self.health_interval {
                self.purge_dedup();
                self.log_health();
                last_health = Instant::now();
            }
        }
        self.shutdown();
        let snapshot = self.stats.snapshot();
        log::info!("[{}] stopped: {}", self.camera_id, snapshot.summary());
        snapshot
    }

    fn log_health(&self) {
        log::info!(
            "[{}] health: source={} tracks={} window_open={} {}",
            self.camera_id,
            if self.source.is_healthy() { "ok" } else { "degraded" },
            self.tracker.len(),
            self.selector.is_open(),
            self.stats.snapshot().summary()
        );
    }

    fn purge_dedup(&mut self) {
        let purged = self.dedup.purge_expired(now_epoch_ms());
        if purged > 0 {
            log::debug!("[{}] purged {} expired dedup records", self.camera_id, purged);
        }
    }

    /// Latest known time: never earlier than the last frame seen.
    fn clock(&self) -> Instant {
        let now = Instant::now();
        self.last_frame_at.map_or(now, |t| t.max(now))
    }

    fn flush_gap(&mut self, now: Instant) {
        if let Some(done) = self.selector.flush_if_gap(now) {
            self.finalize(done);
        }
        if !self.selector.is_open() {
            self.active_zone = None;
        }
    }

    /// Runs one frame through the chain.
    pub fn process_frame(&mut self, frame: Frame) -> FrameOutcome {
        PipelineStats::incr(&self.stats.frames_read);
        let now = frame.captured_at;
        self.last_frame_at = Some(now);
        let finalized_before = self.stats.finalized.load(Ordering::Relaxed);
        self.flush_gap(now);

        let report = match self.gate.evaluate(&frame) {
            GateVerdict::Pass(report) => report,
            GateVerdict::Drop(reason) => {
                self.stats.record_drop(reason);
                log::trace!(
                    "[{}] frame {} dropped: {}",
                    self.camera_id,
                    frame.sequence_no,
                    reason.as_str()
                );
                return FrameOutcome::Dropped(reason);
            }
        };
        let frame = frame.into_ref();
        let roi = self.roi.resolve(now).to_pixels(frame.width, frame.height);

        let detections = match self.detector.detect(&frame) {
            Ok(dets) => dets,
            Err(e) => {
                log::debug!("[{}] detector {}: {}", self.camera_id, self.detector.name(), e);
                Vec::new()
            }
        };
        let detections: Vec<_> = detections
            .into_iter()
            .filter(|d| {
                let (cx, cy) = d.bbox.centroid();
                roi.contains_point(cx, cy)
            })
            .collect();
        self.tracker.update(&detections, Some(frame.as_ref()), now);

        let triggered = {
            let tracks = self.tracker.tracks();
            self.trigger.evaluate(&frame, &tracks)
        };
        let mut trigger_track = None;
        if let Some(first) = triggered.first() {
            PipelineStats::add(&self.stats.zone_triggers, triggered.len() as u64);
            self.active_zone = Some(first.name.clone());
            trigger_track = first.track_id;
        }

        let mut candidate = false;
        if !triggered.is_empty() || self.selector.is_open() {
            if let Some(c) = self.build_candidate(&frame, &report, trigger_track, &roi) {
                candidate = true;
                PipelineStats::incr(&self.stats.candidates);
                for done in self.selector.update(now, c) {
                    self.finalize(done);
                }
            }
        }
        if !self.selector.is_open() {
            self.active_zone = None;
        }

        FrameOutcome::Processed {
            triggered: triggered.len(),
            candidate,
            finalized: (self.stats.finalized.load(Ordering::Relaxed) - finalized_before) as usize,
        }
    }

    /// Plate detection, OCR and scoring for a frame worth looking at. Recognizer
    /// failures count as "no plate".
    fn build_candidate(
        &mut self,
        frame: &FrameRef,
        report: &GateReport,
        trigger_track: Option<TrackId>,
        roi: &BBox,
    ) -> Option<CaptureCandidate> {
        let plate = match self.recognizer.detect_plate(frame) {
            Ok(Some(plate)) => plate,
            Ok(None) => return None,
            Err(e) => {
                PipelineStats::incr(&self.stats.recognizer_errors);
                log::debug!("[{}] plate detection failed: {}", self.camera_id, e);
                return None;
            }
        };
        let (cx, cy) = plate.bbox.centroid();
        if !roi.contains_point(cx, cy) {
            PipelineStats::incr(&self.stats.dropped_roi);
            return None;
        }
        let crop = frame.crop(&plate.bbox)?;
        let read = match self.recognizer.recognize(&crop) {
            Ok(Some(read)) => read,
            Ok(None) => return None,
            Err(e) => {
                PipelineStats::incr(&self.stats.recognizer_errors);
                log::debug!("[{}] OCR failed: {}", self.camera_id, e);
                return None;
            }
        };

        let track_id = trigger_track.or_else(|| self.track_at(cx, cy));
        if let Some(id) = track_id {
            if self.tracker.get(id).is_some() && !self.tracker.can_capture(id, frame.captured_at) {
                PipelineStats::incr(&self.stats.skipped_recapture);
                return None;
            }
        }

        let plate_norm = normalize_plate(&read.text);
        let key = match (plate_norm.is_empty(), track_id) {
            (false, _) => plate_norm,
            (true, Some(id)) => format!("track:{}", id),
            (true, None) => format!("frame:{}", frame.sequence_no),
        };
        let crop_gray = image::imageops::grayscale(&crop);
        let frame_area = frame.pixel_count().max(1) as f32;
        let scores = ComponentScores {
            ocr_conf: read.confidence,
            det_conf: plate.confidence,
            sharpness: (laplacian_variance(&crop_gray) / self.sharpness_ref).clamp(0.0, 1.0),
            frame_quality: (report.quality / 100.0).clamp(0.0, 1.0),
            area_ratio: (plate.bbox.area() / frame_area).clamp(0.0, 1.0),
        };
        Some(
            CaptureCandidate::new(frame.clone(), key, scores)
                .with_track(track_id)
                .with_zone(self.active_zone.clone())
                .with_plate(Some(read.text), Some(plate.bbox)),
        )
    }

    /// Live track whose box contains the point.
    fn track_at(&self, x: f32, y: f32) -> Option<TrackId> {
        self.tracker
            .tracks()
            .into_iter()
            .filter(|t| t.time_since_update == 0)
            .find(|t| t.bbox.contains_point(x, y))
            .map(|t| t.id)
    }

    fn finalize(&mut self, done: Finalized) {
        PipelineStats::incr(&self.stats.finalized);
        let candidate = done.candidate;
        if let Some(id) = candidate.track_id {
            if self.tracker.get(id).is_some() && !self.tracker.mark_captured(id, done.closed_at) {
                PipelineStats::incr(&self.stats.skipped_recapture);
                log::debug!(
                    "[{}] track {} already captured, dropping window {}",
                    self.camera_id,
                    id,
                    candidate.vehicle_key
                );
                return;
            }
        }

        let frame = &candidate.frame;
        let id = capture_id(&frame.camera_id, frame.sequence_no, frame.timestamp_ms);
        let (outcome, dedup_key) = match candidate.plate_text.as_deref() {
            Some(text) => (
                self.dedup
                    .check(text, candidate.scores.ocr_conf, &id, &self.camera_id),
                self.dedup
                    .key_for(text, candidate.scores.ocr_conf, &self.camera_id),
            ),
            None => (DedupOutcome::New, None),
        };
        let supersedes = match outcome {
            DedupOutcome::New => None,
            DedupOutcome::Update {
                previous_capture_id,
            } => Some(previous_capture_id),
            DedupOutcome::Skip {
                existing_capture_id,
            } => {
                PipelineStats::incr(&self.stats.skipped_dedup);
                log::info!(
                    "[{}] plate {} already captured as {}",
                    self.camera_id,
                    candidate.vehicle_key,
                    &existing_capture_id[..existing_capture_id.len().min(12)]
                );
                return;
            }
        };

        log::info!(
            "[{}] best shot for {}: frame {} score {:.2} ({:?}, {} updates)",
            self.camera_id,
            candidate.vehicle_key,
            frame.sequence_no,
            candidate.combined_score,
            done.reason,
            done.updates
        );
        let submitted_id = id.clone();
        let metadata = CaptureMetadata {
            capture_id: id,
            camera_id: frame.camera_id.clone(),
            sequence_no: frame.sequence_no,
            timestamp_ms: frame.timestamp_ms,
            zone: candidate.zone.clone(),
            track_id: candidate.track_id,
            plate_text: candidate.plate_text.clone(),
            ocr_confidence: candidate.scores.ocr_conf,
            det_confidence: candidate.scores.det_conf,
            combined_score: candidate.combined_score,
            finalize_reason: done.reason.as_str().to_string(),
        };
        let job = DispatchJob {
            frame: candidate.frame.clone(),
            metadata,
            supersedes,
            dedup_key: dedup_key.clone(),
        };
        if let Err(e) = self.dispatcher.submit(job) {
            PipelineStats::incr(&self.stats.persist_errors);
            log::error!("[{}] capture dropped: {}", self.camera_id, e);
            if let Some(key) = dedup_key {
                if let Err(e) = self.dedup.release_handle().release(&key, &submitted_id) {
                    log::warn!("[{}] release dedup record {}: {}", self.camera_id, key, e);
                }
            }
        }
    }

    /// Forced flush of the open window, then release the source and drain the
    /// dispatcher. Safe to call more than once.
    pub fn shutdown(&mut self) {
        let now = self.clock();
        if let Some(done) = self.selector.flush(now) {
            self.finalize(done);
        }
        self.active_zone = None;
        self.source.close();
        self.dispatcher.shutdown();
    }
}
