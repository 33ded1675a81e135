//! captured - plate capture daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by PLATE_CAPTURE_CONFIG, then environment)
//! 2. Starts one capture pipeline thread per configured camera
//! 3. Persists best shots to the shared SQLite database and, optionally, notifies
//!    over MQTT
//! 4. On Ctrl-C, flushes open windows and drains pending captures before exiting

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use plate_capture::detect::BackendRegistry;
use plate_capture::{CameraPipeline, CapturedConfig, PipelineStats};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = CapturedConfig::load()?;
    let registry = BackendRegistry::with_builtin();

    log::info!(
        "captured {} running. writing to {}",
        env!("CARGO_PKG_VERSION"),
        config.db_path
    );
    log::info!(
        "detector={} recognizer={} dedup_ttl={}s mqtt={}",
        config.detector.backend,
        config.recognizer.backend,
        config.dedup.ttl_secs,
        config.mqtt.addr.as_deref().unwrap_or("off")
    );

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    // Build every pipeline before starting any, so a bad camera fails startup cleanly.
    let mut pipelines = Vec::new();
    for camera in &config.cameras {
        let stats = Arc::new(PipelineStats::default());
        pipelines.push(CameraPipeline::from_config(&config, camera, &registry, stats)?);
    }

    let mut workers = Vec::new();
    for pipeline in pipelines {
        let camera_id = pipeline.camera_id().to_string();
        let stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(format!("camera-{}", camera_id))
            .spawn(move || pipeline.run(stop))
            .map_err(|e| anyhow!("spawn camera {}: {}", camera_id, e))?;
        workers.push((camera_id, handle));
    }
    log::info!("{} camera pipeline(s) started; Ctrl-C to stop", workers.len());

    let mut failed = 0usize;
    for (camera_id, handle) in workers {
        match handle.join() {
            Ok(snapshot) => log::info!("[{}] final: {}", camera_id, snapshot.summary()),
            Err(_) => {
                failed += 1;
                log::error!("[{}] pipeline thread panicked", camera_id);
            }
        }
    }
    if failed > 0 {
        return Err(anyhow!("{} camera pipeline(s) failed", failed));
    }
    log::info!("captured stopped");
    Ok(())
}
