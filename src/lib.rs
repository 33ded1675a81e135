//! Plate Capture
//!
//! Multi-camera licence-plate capture. Each camera runs one sequential loop that
//! reads frames, discards the uninteresting ones, waits for a vehicle to enter a
//! trigger zone, and keeps the single best frame per vehicle pass for storage.
//!
//! # Pipeline
//!
//! 1. **Ingest**: RTSP (GStreamer), image directories or the synthetic stream,
//!    with throttling and reconnect backoff.
//! 2. **Gate**: motion, quality score and perceptual-hash duplicate checks.
//! 3. **Track**: IoU vehicle tracker with per-track capture cooldown.
//! 4. **Trigger**: zone fill-ratio, line crossing or detector/zone overlap.
//! 5. **Best shot**: one rolling window per vehicle key, closed by fast path,
//!    window length, key change or inactivity gap.
//! 6. **Dedup**: TTL'd plate memory, shared through SQLite across processes.
//! 7. **Dispatch**: JPEG persistence and queueing off the capture thread, with
//!    optional MQTT notices.
//!
//! # Module Structure
//!
//! - `frame`: owned frames and image helpers
//! - `ingest`: frame sources
//! - `quality`: frame quality gate
//! - `detect`: vehicle detector and plate recognizer seams
//! - `tracker`, `trigger`, `bestshot`, `dedup`: per-camera decision state
//! - `storage`, `dispatch`, `transport`: persistence and notification
//! - `pipeline`: the per-camera loop

pub mod bestshot;
pub mod config;
pub mod dedup;
pub mod detect;
pub mod dispatch;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod quality;
pub mod stats;
pub mod storage;
pub mod tracker;
pub mod transport;
pub mod trigger;

pub use bestshot::{BestShotConfig, BestShotSelector, CaptureCandidate, FinalizeReason, Finalized};
pub use config::{CameraSettings, CapturedConfig};
pub use dedup::{DedupConfig, DedupOutcome, PlateDedup};
pub use frame::{Frame, FrameRef};
pub use ingest::{FrameSource, SourceRead, StreamSource};
pub use pipeline::{CameraPipeline, FrameOutcome, PipelineParts, PipelineSettings};
pub use quality::{DropReason, FrameQualityGate, GateConfig, GateVerdict};
pub use stats::{PipelineStats, StatsSnapshot};
pub use storage::{CaptureMetadata, CaptureSink, SqliteCaptureStore};
pub use tracker::{BBox, TrackerConfig, VehicleTracker};
pub use trigger::{SpatialTrigger, TriggerConfig};
