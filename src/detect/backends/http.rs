#![cfg(feature = "recognizer-http")]

use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};
use image::RgbImage;
use serde::Deserialize;

use crate::detect::backend::Recognizer;
use crate::detect::result::{PlateDetection, PlateRead};
use crate::frame::{encode_jpeg, Frame};
use crate::tracker::BBox;

/// Recognizer backed by the downstream recognition service.
///
/// `POST {base}/detect` with a JPEG frame returns
/// `{"bbox": [x1, y1, x2, y2], "confidence": f}` or `{"bbox": null}`;
/// `POST {base}/recognize` with a JPEG crop returns `{"text": "...", "confidence": f}`.
pub struct HttpRecognizer {
    agent: ureq::Agent,
    base_url: String,
}

#[derive(Deserialize)]
struct DetectResponse {
    bbox: Option<[f32; 4]>,
    #[serde(default)]
    confidence: f32,
}

#[derive(Deserialize)]
struct RecognizeResponse {
    text: Option<String>,
    #[serde(default)]
    confidence: f32,
}

impl HttpRecognizer {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn post_jpeg(&self, path: &str, jpeg: &[u8]) -> Result<String> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "image/jpeg")
            .send_bytes(jpeg)
            .with_context(|| format!("POST {}", url))?;
        let mut body = String::new();
        response
            .into_reader()
            .take(64 * 1024)
            .read_to_string(&mut body)
            .context("read recognizer response")?;
        Ok(body)
    }
}

impl Recognizer for HttpRecognizer {
    fn name(&self) -> &'static str {
        "http"
    }

    fn detect_plate(&mut self, frame: &Frame) -> Result<Option<PlateDetection>> {
        let body = self.post_jpeg("detect", &frame.encode_jpeg()?)?;
        let parsed: DetectResponse =
            serde_json::from_str(&body).context("parse detect response")?;
        Ok(parsed.bbox.map(|[x1, y1, x2, y2]| PlateDetection {
            bbox: BBox::new(x1, y1, x2, y2),
            confidence: parsed.confidence,
        }))
    }

    fn recognize(&mut self, crop: &RgbImage) -> Result<Option<PlateRead>> {
        let body = self.post_jpeg("recognize", &encode_jpeg(crop)?)?;
        let parsed: RecognizeResponse =
            serde_json::from_str(&body).context("parse recognize response")?;
        match parsed.text {
            Some(text) if !text.trim().is_empty() => Ok(Some(PlateRead {
                text,
                confidence: parsed.confidence,
            })),
            Some(_) | None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_service_is_an_error_not_a_panic() {
        let mut rec = HttpRecognizer::new("http://127.0.0.1:9", Duration::from_millis(200));
        let crop = RgbImage::new(8, 8);
        assert!(rec.recognize(&crop).is_err());
    }

    #[test]
    fn null_bbox_parses_as_not_found() -> Result<()> {
        let parsed: DetectResponse = serde_json::from_str(r#"{"bbox": null}"#)?;
        assert!(parsed.bbox.is_none());
        let parsed: RecognizeResponse =
            serde_json::from_str(r#"{"text": "XY12", "confidence": 0.9}"#)?;
        assert_eq!(parsed.text.as_deref(), Some("XY12"));
        Ok(())
    }
}
