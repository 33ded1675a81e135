//! Vehicle detection and plate recognition seams.
//!
//! `VehicleDetector` feeds the tracker and the detector-zone trigger.
//! `Recognizer` is the synchronous plate detect + OCR capability used for
//! best-shot scoring. Backends are built per camera through `BackendRegistry`.

mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{Recognizer, VehicleDetector};
pub use backends::{MotionBlobConfig, MotionBlobDetector, StubRecognizer, StubRecognizerConfig};
pub use registry::{BackendRegistry, DetectorConfig, RecognizerConfig};
pub use result::{Detection, ObjectClass, PlateDetection, PlateRead};

#[cfg(feature = "backend-tract")]
pub use backends::TractVehicleDetector;

#[cfg(feature = "recognizer-http")]
pub use backends::HttpRecognizer;
