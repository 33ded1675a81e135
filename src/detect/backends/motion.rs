use anyhow::Result;
use image::Luma;
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::detect::backend::VehicleDetector;
use crate::detect::result::Detection;
use crate::frame::Frame;
use crate::quality::MotionMasker;
use crate::tracker::BBox;

#[derive(Clone, Debug)]
pub struct MotionBlobConfig {
    /// Blobs whose box covers less than this share of the frame are ignored.
    pub min_area_ratio: f32,
    /// Boxes closer than this many pixels are merged into one vehicle.
    pub merge_gap_px: f32,
    pub blur_sigma: f32,
    pub pixel_delta: u8,
    pub open_radius: u8,
}

impl Default for MotionBlobConfig {
    fn default() -> Self {
        Self {
            min_area_ratio: 0.01,
            merge_gap_px: 8.0,
            blur_sigma: 1.0,
            pixel_delta: 25,
            open_radius: 1,
        }
    }
}

/// Vehicle detector built on the motion mask: connected components of changed
/// pixels, grouped and filtered by size. No model required.
pub struct MotionBlobDetector {
    config: MotionBlobConfig,
    masker: MotionMasker,
}

impl MotionBlobDetector {
    pub fn new(config: MotionBlobConfig) -> Self {
        let masker = MotionMasker::new(config.blur_sigma, config.pixel_delta, config.open_radius);
        Self { config, masker }
    }
}

impl Default for MotionBlobDetector {
    fn default() -> Self {
        Self::new(MotionBlobConfig::default())
    }
}

impl VehicleDetector for MotionBlobDetector {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let Some(mask) = self.masker.next_mask(frame.gray()) else {
            return Ok(Vec::new());
        };

        let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
        let mut blobs: Vec<(BBox, u32)> = Vec::new();
        let mut index: Vec<Option<usize>> = Vec::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label[0] as usize;
            if label == 0 {
                continue;
            }
            if index.len() <= label {
                index.resize(label + 1, None);
            }
            let (fx, fy) = (x as f32, y as f32);
            match index[label] {
                Some(i) => {
                    let (bbox, count) = &mut blobs[i];
                    bbox.x1 = bbox.x1.min(fx);
                    bbox.y1 = bbox.y1.min(fy);
                    bbox.x2 = bbox.x2.max(fx + 1.0);
                    bbox.y2 = bbox.y2.max(fy + 1.0);
                    *count += 1;
                }
                None => {
                    index[label] = Some(blobs.len());
                    blobs.push((BBox::new(fx, fy, fx + 1.0, fy + 1.0), 1));
                }
            }
        }

        let merged = merge_nearby(blobs, self.config.merge_gap_px);
        let min_area = self.config.min_area_ratio * frame.pixel_count() as f32;
        Ok(merged
            .into_iter()
            .filter(|(bbox, _)| bbox.area() >= min_area)
            .map(|(bbox, count)| {
                let density = count as f32 / bbox.area().max(1.0);
                Detection::vehicle(bbox, density.clamp(0.3, 1.0))
            })
            .collect())
    }
}

/// Union boxes whose gap-expanded extents intersect, until stable.
fn merge_nearby(mut blobs: Vec<(BBox, u32)>, gap: f32) -> Vec<(BBox, u32)> {
    loop {
        let mut merged_any = false;
        let mut i = 0;
        while i < blobs.len() {
            let mut j = i + 1;
            while j < blobs.len() {
                let a = blobs[i].0;
                let b = blobs[j].0;
                let near = a.x1 - gap <= b.x2
                    && b.x1 - gap <= a.x2
                    && a.y1 - gap <= b.y2
                    && b.y1 - gap <= a.y2;
                if near {
                    let (other, count) = blobs.swap_remove(j);
                    let (bbox, total) = &mut blobs[i];
                    *bbox = BBox::new(
                        bbox.x1.min(other.x1),
                        bbox.y1.min(other.y1),
                        bbox.x2.max(other.x2),
                        bbox.y2.max(other.y2),
                    );
                    *total += count;
                    merged_any = true;
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
        if !merged_any {
            return blobs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn scene(block_x: Option<u32>) -> Frame {
        let (w, h) = (64u32, 48u32);
        let mut pixels = vec![100u8; (w * h * 3) as usize];
        if let Some(x0) = block_x {
            for y in 16..32 {
                for x in x0..(x0 + 16).min(w) {
                    let i = ((y * w + x) * 3) as usize;
                    pixels[i..i + 3].fill(30);
                }
            }
        }
        Frame::new("cam-test", 1, Instant::now(), 0, w, h, pixels).unwrap()
    }

    #[test]
    fn first_frame_yields_nothing() -> Result<()> {
        let mut det = MotionBlobDetector::default();
        assert!(det.detect(&scene(Some(10)))?.is_empty());
        Ok(())
    }

    #[test]
    fn appearing_block_is_one_vehicle() -> Result<()> {
        let mut det = MotionBlobDetector::default();
        det.detect(&scene(None))?;
        let found = det.detect(&scene(Some(20)))?;
        assert_eq!(found.len(), 1);
        let bbox = found[0].bbox;
        assert!(bbox.x1 <= 21.0 && bbox.x2 >= 35.0, "{:?}", bbox);
        assert_eq!(found[0].class, crate::detect::ObjectClass::Vehicle);
        Ok(())
    }

    #[test]
    fn leading_and_trailing_edges_merge() -> Result<()> {
        let mut det = MotionBlobDetector::new(MotionBlobConfig {
            blur_sigma: 0.0,
            merge_gap_px: 16.0,
            ..MotionBlobConfig::default()
        });
        det.detect(&scene(Some(10)))?;
        // Shifting a uniform block changes two 4px strips, 12px apart.
        let found = det.detect(&scene(Some(14)))?;
        assert_eq!(found.len(), 1);
        Ok(())
    }

    #[test]
    fn distant_boxes_stay_separate() {
        let blobs = vec![
            (BBox::new(0.0, 0.0, 10.0, 10.0), 100),
            (BBox::new(40.0, 0.0, 50.0, 10.0), 100),
            (BBox::new(12.0, 0.0, 20.0, 10.0), 80),
        ];
        let merged = merge_nearby(blobs, 4.0);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|(b, c)| b.x2 == 20.0 && *c == 180));
    }
}
