use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::bestshot::BestShotConfig;
use crate::dedup::DedupConfig;
use crate::detect::{DetectorConfig, RecognizerConfig};
use crate::ingest::StreamConfig;
use crate::quality::GateConfig;
use crate::tracker::TrackerConfig;
use crate::transport::MqttConfig;
use crate::trigger::roi::DEFAULT_ROI_CACHE_TTL;
use crate::trigger::TriggerConfig;

const DEFAULT_DB_PATH: &str = "plate_capture.db";
const DEFAULT_CAMERA_ID: &str = "front";
const DEFAULT_CAMERA_URL: &str = "stub://front_camera";
const DEFAULT_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_BACKOFF_MS: u64 = 2000;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 5;
const MAX_FPS: u32 = 120;

#[derive(Debug, Deserialize, Default)]
struct CapturedConfigFile {
    db_path: Option<String>,
    health_interval_secs: Option<u64>,
    cameras: Option<Vec<CameraConfigFile>>,
    quality: Option<QualityConfigFile>,
    tracker: Option<TrackerConfigFile>,
    bestshot: Option<BestShotConfigFile>,
    dedup: Option<DedupConfig>,
    detector: Option<DetectorConfig>,
    recognizer: Option<RecognizerConfig>,
    roi: Option<RoiConfigFile>,
    mqtt: Option<MqttConfig>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: String,
    url: String,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    reconnect_backoff_ms: Option<u64>,
    trigger: Option<TriggerConfig>,
    roi: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct QualityConfigFile {
    night_brightness: Option<f32>,
    motion_enabled: Option<bool>,
    motion_day_pct: Option<f32>,
    motion_night_pct: Option<f32>,
    motion_pixel_delta: Option<u8>,
    score_enabled: Option<bool>,
    min_score_day: Option<f32>,
    night_factor: Option<f32>,
    dedup_enabled: Option<bool>,
    dedup_ring_size: Option<usize>,
    dedup_hamming_threshold: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    iou_threshold: Option<f32>,
    min_hits: Option<u32>,
    max_age: Option<u32>,
    capture_cooldown_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BestShotConfigFile {
    ocr_floor: Option<f32>,
    fast_path: Option<f32>,
    window_ms: Option<u64>,
    gap_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RoiConfigFile {
    default: Option<String>,
    cache_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CapturedConfig {
    pub db_path: String,
    pub health_interval: Duration,
    pub cameras: Vec<CameraSettings>,
    pub gate: GateConfig,
    pub tracker: TrackerConfig,
    pub bestshot: BestShotConfig,
    pub dedup: DedupConfig,
    pub detector: DetectorConfig,
    pub recognizer: RecognizerConfig,
    pub roi: RoiSettings,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub id: String,
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub reconnect_backoff: Duration,
    pub trigger: TriggerConfig,
}

impl CameraSettings {
    pub fn new(id: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            url: url.to_string(),
            target_fps: DEFAULT_FPS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            reconnect_backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            trigger: TriggerConfig::default(),
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            target_fps: self.target_fps,
            reconnect_backoff: self.reconnect_backoff,
        }
    }
}

/// Static ROI layer: raw per-camera values from the camera sections and one
/// optional value for every camera. Values are validated when resolved, not here.
#[derive(Debug, Clone, Default)]
pub struct RoiSettings {
    pub default: Option<String>,
    pub per_camera: HashMap<String, String>,
    pub cache_ttl: Duration,
}

impl CapturedConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PLATE_CAPTURE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CapturedConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let health_interval = Duration::from_secs(
            file.health_interval_secs
                .unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
        );

        let mut per_camera_roi = HashMap::new();
        let cameras = match file.cameras {
            Some(cameras) => cameras
                .into_iter()
                .map(|cam| {
                    if let Some(roi) = cam.roi.clone() {
                        per_camera_roi.insert(cam.id.trim().to_lowercase(), roi);
                    }
                    let defaults = CameraSettings::new(&cam.id, &cam.url);
                    CameraSettings {
                        target_fps: cam.target_fps.unwrap_or(defaults.target_fps),
                        width: cam.width.unwrap_or(defaults.width),
                        height: cam.height.unwrap_or(defaults.height),
                        reconnect_backoff: cam
                            .reconnect_backoff_ms
                            .map(Duration::from_millis)
                            .unwrap_or(defaults.reconnect_backoff),
                        trigger: cam.trigger.unwrap_or(defaults.trigger),
                        ..defaults
                    }
                })
                .collect(),
            None => vec![CameraSettings::new(DEFAULT_CAMERA_ID, DEFAULT_CAMERA_URL)],
        };

        let mut gate = GateConfig::default();
        if let Some(q) = file.quality {
            if let Some(v) = q.night_brightness {
                gate.night_brightness = v;
            }
            if let Some(v) = q.motion_enabled {
                gate.motion.enabled = v;
            }
            if let Some(v) = q.motion_day_pct {
                gate.motion.day_changed_pct = v;
            }
            if let Some(v) = q.motion_night_pct {
                gate.motion.night_changed_pct = v;
            }
            if let Some(v) = q.motion_pixel_delta {
                gate.motion.pixel_delta = v;
            }
            if let Some(v) = q.score_enabled {
                gate.quality.enabled = v;
            }
            if let Some(v) = q.min_score_day {
                gate.quality.min_score_day = v;
            }
            if let Some(v) = q.night_factor {
                gate.quality.night_factor = v;
            }
            if let Some(v) = q.dedup_enabled {
                gate.dedup.enabled = v;
            }
            if let Some(v) = q.dedup_ring_size {
                gate.dedup.ring_size = v;
            }
            if let Some(v) = q.dedup_hamming_threshold {
                gate.dedup.hamming_threshold = v;
            }
        }

        let t = file.tracker.unwrap_or_default();
        let tracker_defaults = TrackerConfig::default();
        let tracker = TrackerConfig {
            iou_threshold: t.iou_threshold.unwrap_or(tracker_defaults.iou_threshold),
            min_hits: t.min_hits.unwrap_or(tracker_defaults.min_hits),
            max_age: t.max_age.unwrap_or(tracker_defaults.max_age),
            capture_cooldown: t
                .capture_cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(tracker_defaults.capture_cooldown),
            ..tracker_defaults
        };

        let b = file.bestshot.unwrap_or_default();
        let bestshot_defaults = BestShotConfig::default();
        let bestshot = BestShotConfig {
            ocr_floor: b.ocr_floor.unwrap_or(bestshot_defaults.ocr_floor),
            fast_path: b.fast_path.unwrap_or(bestshot_defaults.fast_path),
            window: b
                .window_ms
                .map(Duration::from_millis)
                .unwrap_or(bestshot_defaults.window),
            gap: b
                .gap_ms
                .map(Duration::from_millis)
                .unwrap_or(bestshot_defaults.gap),
        };

        let roi_file = file.roi.unwrap_or_default();
        let roi = RoiSettings {
            default: roi_file.default,
            per_camera: per_camera_roi,
            cache_ttl: roi_file
                .cache_ttl_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_ROI_CACHE_TTL),
        };

        Ok(Self {
            db_path,
            health_interval,
            cameras,
            gate,
            tracker,
            bestshot,
            dedup: file.dedup.unwrap_or_default(),
            detector: file.detector.unwrap_or_default(),
            recognizer: file.recognizer.unwrap_or_default(),
            roi,
            mqtt: file.mqtt.unwrap_or_default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("PLATE_CAPTURE_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(cameras) = std::env::var("PLATE_CAPTURE_CAMERAS") {
            let parsed = parse_camera_list(&cameras)?;
            if !parsed.is_empty() {
                self.cameras = parsed
                    .into_iter()
                    .map(|(id, url)| CameraSettings::new(&id, &url))
                    .collect();
            }
        }
        if let Ok(url) = std::env::var("PLATE_CAPTURE_RTSP_URL") {
            if !url.trim().is_empty() {
                if let Some(first) = self.cameras.first_mut() {
                    first.url = url;
                }
            }
        }
        if let Ok(ttl) = std::env::var("PLATE_CAPTURE_DEDUP_TTL_SECS") {
            self.dedup.ttl_secs = ttl.trim().parse().map_err(|_| {
                anyhow!("PLATE_CAPTURE_DEDUP_TTL_SECS must be an integer number of seconds")
            })?;
        }
        if let Ok(addr) = std::env::var("PLATE_CAPTURE_MQTT_ADDR") {
            if !addr.trim().is_empty() {
                self.mqtt.addr = Some(addr);
            }
        }
        if let Ok(roi) = std::env::var("PLATE_CAPTURE_ROI") {
            if !roi.trim().is_empty() {
                self.roi.default = Some(roi);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera is required"));
        }
        let mut seen = HashSet::new();
        for cam in &mut self.cameras {
            cam.id = cam.id.trim().to_lowercase();
            validate_camera_id(&cam.id)?;
            if !seen.insert(cam.id.clone()) {
                return Err(anyhow!("duplicate camera id {}", cam.id));
            }
            if cam.url.trim().is_empty() {
                return Err(anyhow!("camera {}: url must not be empty", cam.id));
            }
            if cam.width == 0 || cam.height == 0 {
                return Err(anyhow!("camera {}: width and height must be > 0", cam.id));
            }
            if cam.target_fps > MAX_FPS {
                return Err(anyhow!("camera {}: target_fps must be <= {}", cam.id, MAX_FPS));
            }
            if cam.reconnect_backoff.is_zero() {
                return Err(anyhow!("camera {}: reconnect_backoff_ms must be > 0", cam.id));
            }
            cam.trigger
                .validate()
                .with_context(|| format!("camera {}: invalid trigger", cam.id))?;
        }

        if !(0.0..=255.0).contains(&self.gate.night_brightness) {
            return Err(anyhow!("quality.night_brightness must be in 0..=255"));
        }
        if self.gate.dedup.ring_size == 0 {
            return Err(anyhow!("quality.dedup_ring_size must be > 0"));
        }
        if !(self.tracker.iou_threshold > 0.0 && self.tracker.iou_threshold <= 1.0) {
            return Err(anyhow!("tracker.iou_threshold must be in (0, 1]"));
        }
        if self.tracker.min_hits == 0 || self.tracker.max_age == 0 {
            return Err(anyhow!("tracker.min_hits and tracker.max_age must be > 0"));
        }
        let b = &self.bestshot;
        if !(0.0..=1.0).contains(&b.ocr_floor) || !(b.ocr_floor..=1.0).contains(&b.fast_path) {
            return Err(anyhow!(
                "bestshot thresholds must satisfy 0 <= ocr_floor <= fast_path <= 1"
            ));
        }
        if b.window.is_zero() || b.gap.is_zero() {
            return Err(anyhow!("bestshot.window_ms and bestshot.gap_ms must be > 0"));
        }
        self.dedup.validate()?;
        self.mqtt.validate()?;
        Ok(())
    }

    pub fn camera(&self, id: &str) -> Option<&CameraSettings> {
        self.cameras.iter().find(|c| c.id == id)
    }
}

/// Camera ids appear in keys, topics and log prefixes: `[a-z0-9_-]{1,64}`.
pub fn validate_camera_id(id: &str) -> Result<()> {
    let re = Regex::new(r"^[a-z0-9_-]{1,64}$")?;
    if !re.is_match(id) {
        return Err(anyhow!(
            "camera id {:?} must match ^[a-z0-9_-]{{1,64}}$",
            id
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<CapturedConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

/// `id=url` pairs, comma separated.
fn parse_camera_list(value: &str) -> Result<Vec<(String, String)>> {
    split_csv(value)
        .into_iter()
        .map(|entry| {
            let (id, url) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("PLATE_CAPTURE_CAMERAS entry {:?} is not id=url", entry))?;
            Ok((id.trim().to_string(), url.trim().to_string()))
        })
        .collect()
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
