use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use super::backend::{Recognizer, VehicleDetector};
use super::backends::{MotionBlobConfig, MotionBlobDetector, StubRecognizer, StubRecognizerConfig};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub backend: String,
    pub min_area_ratio: f32,
    pub merge_gap_px: f32,
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let blob = MotionBlobConfig::default();
        Self {
            backend: "motion".to_string(),
            min_area_ratio: blob.min_area_ratio,
            merge_gap_px: blob.merge_gap_px,
            model_path: None,
            input_width: 640,
            input_height: 640,
            confidence_threshold: 0.5,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    pub backend: String,
    pub stub_text: String,
    pub stub_confidence: f32,
    pub url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        let stub = StubRecognizerConfig::default();
        Self {
            backend: "stub".to_string(),
            stub_text: stub.text,
            stub_confidence: stub.ocr_confidence,
            url: None,
            timeout_ms: 1500,
        }
    }
}

type DetectorFactory = Box<dyn Fn(&DetectorConfig) -> Result<Box<dyn VehicleDetector>> + Send + Sync>;
type RecognizerFactory =
    Box<dyn Fn(&RecognizerConfig) -> Result<Box<dyn Recognizer>> + Send + Sync>;

/// Named backend factories.
///
/// Detectors and recognizers keep per-camera state, so the registry hands out a
/// fresh instance per `build_*` call rather than sharing one behind a lock.
pub struct BackendRegistry {
    detectors: HashMap<String, DetectorFactory>,
    recognizers: HashMap<String, RecognizerFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            detectors: HashMap::new(),
            recognizers: HashMap::new(),
        }
    }

    /// Registry with every backend compiled into this build.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_detector("motion", |cfg| {
            Ok(Box::new(MotionBlobDetector::new(MotionBlobConfig {
                min_area_ratio: cfg.min_area_ratio,
                merge_gap_px: cfg.merge_gap_px,
                ..MotionBlobConfig::default()
            })))
        });
        registry.register_recognizer("stub", |cfg| {
            Ok(Box::new(StubRecognizer::new(StubRecognizerConfig {
                text: cfg.stub_text.clone(),
                ocr_confidence: cfg.stub_confidence,
                ..StubRecognizerConfig::default()
            })))
        });

        #[cfg(feature = "backend-tract")]
        registry.register_detector("tract", |cfg| {
            let path = cfg
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("tract detector requires detector.model_path"))?;
            let det = super::backends::TractVehicleDetector::new(
                path,
                cfg.input_width,
                cfg.input_height,
            )?
            .with_threshold(cfg.confidence_threshold);
            Ok(Box::new(det))
        });

        #[cfg(feature = "recognizer-http")]
        registry.register_recognizer("http", |cfg| {
            let url = cfg
                .url
                .as_deref()
                .ok_or_else(|| anyhow!("http recognizer requires recognizer.url"))?;
            Ok(Box::new(super::backends::HttpRecognizer::new(
                url,
                std::time::Duration::from_millis(cfg.timeout_ms),
            )))
        });

        registry
    }

    pub fn register_detector<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DetectorConfig) -> Result<Box<dyn VehicleDetector>> + Send + Sync + 'static,
    {
        self.detectors.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_recognizer<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&RecognizerConfig) -> Result<Box<dyn Recognizer>> + Send + Sync + 'static,
    {
        self.recognizers.insert(name.to_string(), Box::new(factory));
    }

    pub fn build_detector(&self, config: &DetectorConfig) -> Result<Box<dyn VehicleDetector>> {
        let factory = self.detectors.get(&config.backend).ok_or_else(|| {
            anyhow!(
                "detector backend '{}' not available (have: {})",
                config.backend,
                self.detector_names().join(", ")
            )
        })?;
        let mut detector = factory(config)?;
        detector.warm_up()?;
        Ok(detector)
    }

    pub fn build_recognizer(&self, config: &RecognizerConfig) -> Result<Box<dyn Recognizer>> {
        let factory = self.recognizers.get(&config.backend).ok_or_else(|| {
            anyhow!(
                "recognizer backend '{}' not available (have: {})",
                config.backend,
                self.recognizer_names().join(", ")
            )
        })?;
        factory(config)
    }

    pub fn has_detector(&self, name: &str) -> bool {
        self.detectors.contains_key(name)
    }

    pub fn has_recognizer(&self, name: &str) -> bool {
        self.recognizers.contains_key(name)
    }

    /// Registered detector names, sorted.
    pub fn detector_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.detectors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn recognizer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.recognizers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_backends_are_registered() -> Result<()> {
        let registry = BackendRegistry::with_builtin();
        assert!(registry.has_detector("motion"));
        assert!(registry.has_recognizer("stub"));

        let det = registry.build_detector(&DetectorConfig::default())?;
        assert_eq!(det.name(), "motion");
        let rec = registry.build_recognizer(&RecognizerConfig::default())?;
        assert_eq!(rec.name(), "stub");
        Ok(())
    }

    #[test]
    fn unknown_backend_lists_alternatives() {
        let registry = BackendRegistry::with_builtin();
        let cfg = DetectorConfig {
            backend: "yolo9000".to_string(),
            ..DetectorConfig::default()
        };
        let err = registry.build_detector(&cfg).err().expect("unknown backend");
        assert!(err.to_string().contains("motion"));
    }

    #[test]
    fn custom_factory_can_be_registered() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register_recognizer("fixed", |_| {
            Ok(Box::new(StubRecognizer::new(StubRecognizerConfig {
                text: "ZZ9999".to_string(),
                ..StubRecognizerConfig::default()
            })))
        });
        let cfg = RecognizerConfig {
            backend: "fixed".to_string(),
            ..RecognizerConfig::default()
        };
        assert_eq!(registry.build_recognizer(&cfg)?.name(), "stub");
        assert_eq!(registry.recognizer_names(), vec!["fixed".to_string()]);
        Ok(())
    }
}
