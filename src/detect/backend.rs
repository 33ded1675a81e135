use anyhow::Result;
use image::RgbImage;

use crate::frame::Frame;

use super::result::{Detection, PlateDetection, PlateRead};

/// Per-frame vehicle detector feeding the tracker and the detector-zone trigger.
///
/// Each camera pipeline owns its own instance; implementations may keep state
/// between calls (e.g. the previous frame).
pub trait VehicleDetector: Send {
    fn name(&self) -> &'static str;

    /// Vehicle boxes for this frame, in pixel coordinates.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Plate detection + OCR used synchronously for best-shot scoring.
///
/// Calls must have bounded latency. Errors are treated as "no detection" by the
/// caller; they never stop a pipeline.
pub trait Recognizer: Send {
    fn name(&self) -> &'static str;

    /// Locate the most likely plate in the frame.
    fn detect_plate(&mut self, frame: &Frame) -> Result<Option<PlateDetection>>;

    /// Read text from a plate crop.
    fn recognize(&mut self, crop: &RgbImage) -> Result<Option<PlateRead>>;
}
