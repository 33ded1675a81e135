pub mod motion;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

#[cfg(feature = "recognizer-http")]
pub mod http;

pub use motion::{MotionBlobConfig, MotionBlobDetector};
pub use stub::{StubRecognizer, StubRecognizerConfig};

#[cfg(feature = "backend-tract")]
pub use tract::TractVehicleDetector;

#[cfg(feature = "recognizer-http")]
pub use http::HttpRecognizer;
