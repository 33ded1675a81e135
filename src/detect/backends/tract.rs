#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::VehicleDetector;
use crate::detect::result::{Detection, ObjectClass};
use crate::frame::Frame;
use crate::tracker::BBox;

/// ONNX vehicle detector run through tract.
///
/// The model takes a `[1, 3, H, W]` f32 tensor in 0..1 and returns `[N, 6]` rows of
/// `x1, y1, x2, y2, score, class` in model-input pixels. Boxes are scaled back to
/// frame pixels; only vehicle classes above the threshold are kept.
pub struct TractVehicleDetector {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    confidence_threshold: f32,
}

impl TractVehicleDetector {
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            confidence_threshold: 0.5,
        })
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let resized = if frame.width == self.width && frame.height == self.height {
            frame.rgb().clone()
        } else {
            imageops::resize(frame.rgb(), self.width, self.height, FilterType::Triangle)
        };
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        input.into_tensor()
    }

    fn extract_detections(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let rows = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = rows.shape();
        if shape.last() != Some(&6) {
            return Err(anyhow!("expected [N, 6] detector output, got {:?}", shape));
        }
        let flat: Vec<f32> = rows.iter().copied().collect();
        let sx = frame.width as f32 / self.width as f32;
        let sy = frame.height as f32 / self.height as f32;

        Ok(flat
            .chunks_exact(6)
            .filter(|row| row[4].is_finite() && row[4] >= self.confidence_threshold)
            .filter(|row| ObjectClass::from_model_index(row[5] as i64) == ObjectClass::Vehicle)
            .map(|row| {
                Detection::vehicle(
                    BBox::new(row[0] * sx, row[1] * sy, row[2] * sx, row[3] * sy),
                    row[4],
                )
            })
            .collect())
    }
}

impl VehicleDetector for TractVehicleDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.extract_detections(outputs, frame)
    }
}
