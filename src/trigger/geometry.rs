//! Normalized zone geometry, rasterized to pixel masks per frame size.

use anyhow::{anyhow, Result};
use image::{GrayImage, Luma};
use regex::Regex;

use crate::tracker::BBox;

/// Point in normalized frame coordinates, both axes in 0..=1.
pub type NormPoint = (f32, f32);

/// Zone names are local identifiers: `[a-z0-9_-]{1,64}`.
pub fn validate_zone_name(name: &str) -> Result<()> {
    let re = Regex::new(r"^[a-z0-9_-]{1,64}$")?;
    if !re.is_match(name) {
        return Err(anyhow!(
            "zone name {:?} must match ^[a-z0-9_-]{{1,64}}$",
            name
        ));
    }
    Ok(())
}

fn validate_point(p: NormPoint) -> Result<()> {
    let ok = |v: f32| v.is_finite() && (0.0..=1.0).contains(&v);
    if !ok(p.0) || !ok(p.1) {
        return Err(anyhow!("point {:?} is outside normalized 0..1 bounds", p));
    }
    Ok(())
}

/// A polygon needs three distinct vertices inside the frame. A trailing vertex
/// equal to the first (explicitly closed ring) is tolerated and dropped.
pub fn validate_polygon(points: &[NormPoint]) -> Result<Vec<NormPoint>> {
    let mut ring: Vec<NormPoint> = points.to_vec();
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    if ring.len() < 3 {
        return Err(anyhow!("polygon needs at least 3 vertices, got {}", ring.len()));
    }
    for p in &ring {
        validate_point(*p)?;
    }
    if polygon_area(&ring) <= f32::EPSILON {
        return Err(anyhow!("polygon has zero area"));
    }
    Ok(ring)
}

pub fn validate_segment(start: NormPoint, end: NormPoint) -> Result<()> {
    validate_point(start)?;
    validate_point(end)?;
    if start == end {
        return Err(anyhow!("line endpoints must differ"));
    }
    Ok(())
}

/// Shoelace area in the points' own units.
pub fn polygon_area(points: &[NormPoint]) -> f32 {
    let n = points.len();
    let mut twice = 0.0f32;
    for i in 0..n {
        let (x0, y0) = points[i];
        let (x1, y1) = points[(i + 1) % n];
        twice += x0 * y1 - x1 * y0;
    }
    (twice * 0.5).abs()
}

/// Even-odd point-in-polygon test.
pub fn point_in_polygon(x: f32, y: f32, points: &[(f32, f32)]) -> bool {
    let n = points.len();
    let mut inside = false;
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let (xi, yi) = points[i];
        let (xj, yj) = points[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

pub fn scale_points(points: &[NormPoint], width: u32, height: u32) -> Vec<(f32, f32)> {
    points
        .iter()
        .map(|&(x, y)| (x * width as f32, y * height as f32))
        .collect()
}

/// Binary mask (0/255) of pixels whose centre lies inside the polygon.
pub fn rasterize(points: &[NormPoint], width: u32, height: u32) -> GrayImage {
    let px = scale_points(points, width, height);
    let mut mask = GrayImage::new(width, height);
    for (x, y, p) in mask.enumerate_pixels_mut() {
        if point_in_polygon(x as f32 + 0.5, y as f32 + 0.5, &px) {
            *p = Luma([255]);
        }
    }
    mask
}

/// Set pixels of `mask` inside `bbox`, clamped to the mask.
pub fn count_in_box(mask: &GrayImage, bbox: &BBox) -> usize {
    let Some((x0, y0, w, h)) = bbox.clamped_pixels(mask.width(), mask.height()) else {
        return 0;
    };
    let mut count = 0;
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            if mask.get_pixel(x, y)[0] > 0 {
                count += 1;
            }
        }
    }
    count
}

/// Signed perpendicular distance from `p` to the infinite line through `a`, `b`.
/// Positive below a left-to-right line in image coordinates (y down).
pub fn signed_distance(p: (f32, f32), a: (f32, f32), b: (f32, f32)) -> f32 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len = (dx * dx + dy * dy).sqrt();
    if len <= f32::EPSILON {
        return 0.0;
    }
    (dx * (p.1 - a.1) - dy * (p.0 - a.0)) / len
}

/// Position of `p` projected onto `a -> b`, in pixels from `a`.
pub fn projection_along(p: (f32, f32), a: (f32, f32), b: (f32, f32)) -> f32 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len = (dx * dx + dy * dy).sqrt();
    if len <= f32::EPSILON {
        return 0.0;
    }
    ((p.0 - a.0) * dx + (p.1 - a.1) * dy) / len
}

pub fn segment_length(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2)).sqrt()
}

/// Per-zone masks cached for one frame size.
pub struct MaskCache {
    size: (u32, u32),
    masks: Vec<GrayImage>,
    areas: Vec<usize>,
}

impl MaskCache {
    pub fn build(polygons: &[Vec<NormPoint>], width: u32, height: u32) -> Self {
        let masks: Vec<GrayImage> = polygons
            .iter()
            .map(|p| rasterize(p, width, height))
            .collect();
        let areas = masks
            .iter()
            .map(|m| m.as_raw().iter().filter(|&&v| v > 0).count())
            .collect();
        Self {
            size: (width, height),
            masks,
            areas,
        }
    }

    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.size == (width, height)
    }

    pub fn mask(&self, zone: usize) -> Option<&GrayImage> {
        self.masks.get(zone)
    }

    pub fn area(&self, zone: usize) -> usize {
        self.areas.get(zone).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: [NormPoint; 4] = [(0.25, 0.25), (0.75, 0.25), (0.75, 0.75), (0.25, 0.75)];

    #[test]
    fn square_rasterizes_to_quarter_of_frame() {
        let mask = rasterize(&SQUARE, 40, 40);
        let set = mask.as_raw().iter().filter(|&&v| v > 0).count();
        assert_eq!(set, 400);
        assert_eq!(mask.get_pixel(20, 20)[0], 255);
        assert_eq!(mask.get_pixel(2, 2)[0], 0);
    }

    #[test]
    fn polygon_validation() {
        assert!(validate_polygon(&SQUARE).is_ok());
        let mut closed = SQUARE.to_vec();
        closed.push(SQUARE[0]);
        assert_eq!(validate_polygon(&closed).unwrap().len(), 4);
        assert!(validate_polygon(&SQUARE[..2]).is_err());
        assert!(validate_polygon(&[(0.0, 0.0), (1.5, 0.0), (1.0, 1.0)]).is_err());
        assert!(validate_polygon(&[(0.0, 0.0), (0.5, 0.5), (1.0, 1.0)]).is_err());
    }

    #[test]
    fn zone_names_are_local_identifiers() {
        assert!(validate_zone_name("gate_in-1").is_ok());
        assert!(validate_zone_name("Gate In").is_err());
        assert!(validate_zone_name("").is_err());
    }

    #[test]
    fn signed_distance_changes_sign_across_line() {
        let a = (0.0, 10.0);
        let b = (100.0, 10.0);
        let above = signed_distance((50.0, 5.0), a, b);
        let below = signed_distance((50.0, 15.0), a, b);
        assert!(above < 0.0 && below > 0.0);
        assert!((below - 5.0).abs() < 1e-5);
        assert!((projection_along((30.0, 99.0), a, b) - 30.0).abs() < 1e-5);
    }

    #[test]
    fn box_count_is_clamped() {
        let mask = rasterize(&SQUARE, 40, 40);
        assert_eq!(count_in_box(&mask, &BBox::new(0.0, 0.0, 20.0, 20.0)), 100);
        assert_eq!(count_in_box(&mask, &BBox::new(30.0, 30.0, 80.0, 80.0)), 0);
    }
}
