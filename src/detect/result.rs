use serde::{Deserialize, Serialize};

use crate::tracker::BBox;

/// One object box from a vehicle detector, in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub class: ObjectClass,
}

impl Detection {
    pub fn vehicle(bbox: BBox, confidence: f32) -> Self {
        Self {
            bbox,
            confidence,
            class: ObjectClass::Vehicle,
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Vehicle,
    Person,
    Unknown,
}

impl ObjectClass {
    /// COCO-style class index used by exported detector models.
    pub fn from_model_index(index: i64) -> Self {
        match index {
            0 => ObjectClass::Person,
            2 | 3 | 5 | 7 => ObjectClass::Vehicle,
            _ => ObjectClass::Unknown,
        }
    }
}

/// Plate location returned by `Recognizer::detect_plate`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlateDetection {
    pub bbox: BBox,
    pub confidence: f32,
}

/// Text read from a plate crop.
#[derive(Clone, Debug, PartialEq)]
pub struct PlateRead {
    pub text: String,
    pub confidence: f32,
}
