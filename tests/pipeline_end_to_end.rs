use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use image::{Rgb, RgbImage};

use plate_capture::dedup::{DedupConfig, PlateDedup};
use plate_capture::detect::{MotionBlobConfig, MotionBlobDetector, StubRecognizer};
use plate_capture::ingest::rtsp::draw_vehicle;
use plate_capture::ingest::{ScriptedSource, StreamConfig, StreamSource};
use plate_capture::storage::{InMemoryCaptureSink, SqliteCaptureStore};
use plate_capture::trigger::{RoiResolver, TriggerConfig, ZoneConfig};
use plate_capture::{CameraPipeline, Frame, PipelineParts, PipelineSettings, PipelineStats};

const W: u32 = 64;
const H: u32 = 48;

/// Horizontal gradient: textured enough for the motion and hash checks.
fn street() -> RgbImage {
    RgbImage::from_fn(W, H, |x, _| {
        let v = (60 + x * 2) as u8;
        Rgb([v, v, v])
    })
}

fn street_with_vehicle(left: i64) -> RgbImage {
    let mut image = street();
    draw_vehicle(&mut image, left, 14, 24, 20);
    image
}

/// One vehicle pass: enters, dwells, moves on, leaves. `None` is an empty street.
fn scene() -> Vec<Option<i64>> {
    let mut pass = vec![None, Some(4), Some(20), Some(20), Some(20), Some(20), Some(36)];
    pass.extend(std::iter::repeat(None).take(13));
    pass
}

fn settings() -> PipelineSettings {
    let mut settings = PipelineSettings {
        trigger: TriggerConfig::ZoneFill {
            zones: vec![ZoneConfig {
                name: "center".to_string(),
                polygon: vec![(0.25, 0.25), (0.75, 0.25), (0.75, 0.75), (0.25, 0.75)],
                min_fill_ratio: 0.2,
                cooldown_secs: 60.0,
            }],
        },
        ..PipelineSettings::default()
    };
    settings.gate.quality.enabled = false;
    settings
}

fn parts(source: Box<dyn plate_capture::FrameSource>, sink: Box<dyn plate_capture::CaptureSink>) -> PipelineParts {
    PipelineParts {
        source,
        detector: Box::new(MotionBlobDetector::new(MotionBlobConfig::default())),
        recognizer: Box::new(StubRecognizer::default()),
        roi: RoiResolver::full_frame("gate"),
        dedup: PlateDedup::in_memory(DedupConfig::default()),
        sink,
        notifier: None,
    }
}

fn frames(scene: Vec<Option<i64>>) -> Vec<Frame> {
    let t0 = Instant::now();
    scene
        .into_iter()
        .enumerate()
        .map(|(i, vehicle)| {
            let image = vehicle.map_or_else(street, street_with_vehicle);
            Frame::from_image(
                "gate",
                i as u64 + 1,
                t0 + Duration::from_millis(100 * i as u64),
                1_700_000_000_000 + 100 * i as u64,
                image,
            )
        })
        .collect()
}

#[test]
fn one_vehicle_pass_yields_one_capture() -> Result<()> {
    let frames = frames(scene());

    let sink = InMemoryCaptureSink::new();
    let stats = Arc::new(PipelineStats::default());
    let pipeline = CameraPipeline::new(
        "gate",
        settings(),
        parts(Box::new(ScriptedSource::from_frames(frames)), Box::new(sink.clone())),
        stats.clone(),
    )?;
    let snapshot = pipeline.run(Arc::new(AtomicBool::new(false)));

    assert_eq!(snapshot.frames_read, 20);
    assert_eq!(snapshot.zone_triggers, 1);
    assert!(snapshot.dropped_motion >= 3, "dwell frames carry no motion");
    assert_eq!(snapshot.finalized, 1);
    assert_eq!(snapshot.enqueued, 1);

    let captures = sink.captures();
    assert_eq!(captures.len(), 1);
    let meta = &captures[0].metadata;
    assert_eq!(meta.camera_id, "gate");
    assert_eq!(meta.plate_text.as_deref(), Some("AB1234"));
    assert_eq!(meta.zone.as_deref(), Some("center"));
    assert_eq!(meta.finalize_reason, "gap");
    assert!((2..=7).contains(&meta.sequence_no));
    assert!(captures[0].jpeg.starts_with(&[0xFF, 0xD8]));
    Ok(())
}

#[test]
fn ten_frame_dwell_is_one_trigger_cycle_and_one_capture() -> Result<()> {
    // Enters, dwells five frames inside the zone, leaves.
    let scene = vec![None, Some(4), Some(20), Some(20), Some(20), Some(20), Some(20), None, None, None];
    let sink = InMemoryCaptureSink::new();
    let stats = Arc::new(PipelineStats::default());
    let pipeline = CameraPipeline::new(
        "gate",
        settings(),
        parts(Box::new(ScriptedSource::from_frames(frames(scene))), Box::new(sink.clone())),
        stats.clone(),
    )?;
    let snapshot = pipeline.run(Arc::new(AtomicBool::new(false)));

    assert_eq!(snapshot.frames_read, 10);
    assert_eq!(snapshot.zone_triggers, 1);
    assert_eq!(snapshot.finalized, 1);
    let captures = sink.captures();
    assert_eq!(captures.len(), 1);
    // The stream ends before the inactivity gap, so shutdown closes the window.
    assert_eq!(captures[0].metadata.finalize_reason, "forced");
    Ok(())
}

#[test]
fn image_directory_replay_persists_to_sqlite() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for (i, vehicle) in [None, Some(4), Some(20), Some(36)].into_iter().enumerate() {
        let image = vehicle.map_or_else(street, street_with_vehicle);
        image.save(dir.path().join(format!("frame_{:03}.png", i)))?;
    }
    let db = tempfile::NamedTempFile::new()?;
    let db_path = db.path().to_string_lossy().to_string();

    let stats = Arc::new(PipelineStats::default());
    let source = StreamSource::open(
        "gate",
        &format!("file://{}", dir.path().display()),
        W,
        H,
        StreamConfig {
            target_fps: 0,
            ..StreamConfig::default()
        },
    )?
    .with_stats(stats.clone());
    let pipeline = CameraPipeline::new(
        "gate",
        settings(),
        parts(Box::new(source), Box::new(SqliteCaptureStore::open(&db_path)?)),
        stats.clone(),
    )?;
    let snapshot = pipeline.run(Arc::new(AtomicBool::new(false)));
    assert_eq!(snapshot.frames_read, 4);
    assert_eq!(snapshot.enqueued, 1);

    let store = SqliteCaptureStore::open(&db_path)?;
    assert_eq!(store.capture_count()?, 1);
    let pending = store.pending(10)?;
    assert_eq!(pending.len(), 1);
    let meta = store
        .load_metadata(&pending[0].capture_id)?
        .expect("queued capture has metadata");
    assert_eq!(meta.finalize_reason, "forced");
    assert_eq!(meta.plate_text.as_deref(), Some("AB1234"));
    Ok(())
}

#[test]
fn stop_flag_flushes_the_open_window() -> Result<()> {
    let mut frames = frames(scene());
    let rest = frames.split_off(3);
    let sink = InMemoryCaptureSink::new();
    let stats = Arc::new(PipelineStats::default());
    let mut pipeline = CameraPipeline::new(
        "gate",
        settings(),
        parts(Box::new(ScriptedSource::from_frames(rest)), Box::new(sink.clone())),
        stats.clone(),
    )?;
    for frame in frames {
        pipeline.process_frame(frame);
    }
    assert!(pipeline.selector().is_open());
    assert!(sink.is_empty());

    let snapshot = pipeline.run(Arc::new(AtomicBool::new(true)));

    // Stop is honoured before the next read; the open window still lands.
    assert_eq!(snapshot.frames_read, 3);
    assert_eq!(snapshot.finalized, 1);
    assert_eq!(snapshot.enqueued, 1);
    let captures = sink.captures();
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].metadata.finalize_reason, "forced");
    assert_eq!(captures[0].metadata.plate_text.as_deref(), Some("AB1234"));
    Ok(())
}
