//! Pixel-space geometry: points, boxes and polygon containment.
//!
//! Everything here is pure. Containment treats points lying on a polygon edge
//! or vertex as inside, so a foot point resting exactly on a zone boundary
//! always classifies the same way.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Distance under which a point counts as lying on an edge.
const EDGE_EPSILON: f64 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Axis-aligned box in pixel space. `(x, y)` is the top-left corner.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Build from corner coordinates (x1, y1, x2, y2).
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1.min(x2),
            y: y1.min(y2),
            w: (x2 - x1).abs(),
            h: (y2 - y1).abs(),
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.w.is_finite()
            && self.h.is_finite()
            && self.w >= 0.0
            && self.h >= 0.0
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Approximates the foot position of an upright person.
    pub fn bottom_center(&self) -> Point {
        Point::new(self.x + self.w / 2.0, self.bottom())
    }

    pub fn contains_point(&self, p: Point) -> bool {
        p.x >= self.x && p.x <= self.right() && p.y >= self.y && p.y <= self.bottom()
    }

    /// Top `ratio` of the box, e.g. the head band of a person box.
    pub fn upper_region(&self, ratio: f32) -> BBox {
        BBox::new(self.x, self.y, self.w, self.h * ratio.clamp(0.0, 1.0))
    }

    pub fn intersection(&self, other: &BBox) -> Option<BBox> {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        if x2 > x1 && y2 > y1 {
            Some(BBox::new(x1, y1, x2 - x1, y2 - y1))
        } else {
            None
        }
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        self.intersection(other).map(|b| b.area()).unwrap_or(0.0)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Grow by `pad` pixels per side and clip to `width` x `height`.
    pub fn padded_within(&self, pad: f32, width: u32, height: u32) -> BBox {
        let x1 = (self.x - pad).max(0.0);
        let y1 = (self.y - pad).max(0.0);
        let x2 = (self.right() + pad).min(width as f32);
        let y2 = (self.bottom() + pad).min(height as f32);
        BBox::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0))
    }
}

/// Simple polygon with at least three vertices. Validated on construction.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Polygon {
    vertices: Vec<Point>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point>) -> Result<Self> {
        if vertices.len() < 3 {
            return Err(PipelineError::config(format!(
                "polygon needs at least 3 vertices, got {}",
                vertices.len()
            )));
        }
        if let Some(bad) = vertices.iter().find(|p| !p.is_finite()) {
            return Err(PipelineError::config(format!(
                "polygon vertex ({}, {}) is not finite",
                bad.x, bad.y
            )));
        }
        Ok(Self { vertices })
    }

    pub fn from_pairs(pairs: &[[f32; 2]]) -> Result<Self> {
        Self::new(pairs.iter().map(|[x, y]| Point::new(*x, *y)).collect())
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    pub fn edges(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let n = self.vertices.len();
        (0..n).map(move |i| (self.vertices[i], self.vertices[(i + 1) % n]))
    }

    pub fn bounding_box(&self) -> BBox {
        let (mut x1, mut y1) = (f32::MAX, f32::MAX);
        let (mut x2, mut y2) = (f32::MIN, f32::MIN);
        for p in &self.vertices {
            x1 = x1.min(p.x);
            y1 = y1.min(p.y);
            x2 = x2.max(p.x);
            y2 = y2.max(p.y);
        }
        BBox::from_corners(x1, y1, x2, y2)
    }
}

/// Point-in-polygon by ray casting. Edge and vertex points are inside.
pub fn contains(polygon: &Polygon, point: Point) -> bool {
    let px = point.x as f64;
    let py = point.y as f64;

    if polygon
        .edges()
        .any(|(a, b)| on_segment(a, b, px, py))
    {
        return true;
    }

    let mut inside = false;
    for (a, b) in polygon.edges() {
        let (ax, ay) = (a.x as f64, a.y as f64);
        let (bx, by) = (b.x as f64, b.y as f64);
        // Half-open crossing rule: each vertex belongs to exactly one edge.
        if (ay > py) != (by > py) {
            let x_cross = ax + (py - ay) * (bx - ax) / (by - ay);
            if px < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

fn on_segment(a: Point, b: Point, px: f64, py: f64) -> bool {
    let (ax, ay) = (a.x as f64, a.y as f64);
    let (bx, by) = (b.x as f64, b.y as f64);
    let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
    let len = ((bx - ax).powi(2) + (by - ay).powi(2)).sqrt();
    if len == 0.0 {
        return (px - ax).abs() <= EDGE_EPSILON && (py - ay).abs() <= EDGE_EPSILON;
    }
    if (cross / len).abs() > EDGE_EPSILON {
        return false;
    }
    px >= ax.min(bx) - EDGE_EPSILON
        && px <= ax.max(bx) + EDGE_EPSILON
        && py >= ay.min(by) - EDGE_EPSILON
        && py <= ay.max(by) + EDGE_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Polygon {
        Polygon::from_pairs(&[[0.0, 0.0], [0.0, 10.0], [10.0, 10.0], [10.0, 0.0]]).unwrap()
    }

    fn concave() -> Polygon {
        // U shape opening upward; the notch spans x in (4, 6), y in [0, 6).
        Polygon::from_pairs(&[
            [0.0, 0.0],
            [4.0, 0.0],
            [4.0, 6.0],
            [6.0, 6.0],
            [6.0, 0.0],
            [10.0, 0.0],
            [10.0, 10.0],
            [0.0, 10.0],
        ])
        .unwrap()
    }

    #[test]
    fn strictly_inside_and_outside() {
        let sq = square();
        assert!(contains(&sq, Point::new(5.0, 5.0)));
        assert!(contains(&sq, Point::new(0.5, 9.5)));
        assert!(!contains(&sq, Point::new(50.0, 50.0)));
        assert!(!contains(&sq, Point::new(-0.1, 5.0)));
        assert!(!contains(&sq, Point::new(5.0, 10.1)));
    }

    #[test]
    fn boundary_points_are_inside_and_repeatable() {
        let sq = square();
        for p in [
            Point::new(0.0, 5.0),
            Point::new(10.0, 5.0),
            Point::new(5.0, 0.0),
            Point::new(5.0, 10.0),
            Point::new(0.0, 0.0),
            Point::new(10.0, 10.0),
        ] {
            let first = contains(&sq, p);
            assert!(first, "boundary point {:?} should be inside", p);
            for _ in 0..10 {
                assert_eq!(contains(&sq, p), first);
            }
        }
    }

    #[test]
    fn concave_notch_is_outside() {
        let u = concave();
        assert!(!contains(&u, Point::new(5.0, 3.0)));
        assert!(contains(&u, Point::new(2.0, 3.0)));
        assert!(contains(&u, Point::new(5.0, 8.0)));
        // Ray through a vertex at y = 6 must not double count.
        assert!(contains(&u, Point::new(2.0, 6.0)));
        assert!(!contains(&u, Point::new(-1.0, 6.0)));
    }

    #[test]
    fn polygon_rejects_degenerate_input() {
        assert!(Polygon::from_pairs(&[[0.0, 0.0], [1.0, 1.0]]).is_err());
        assert!(Polygon::from_pairs(&[[0.0, 0.0], [1.0, f32::NAN], [2.0, 0.0]]).is_err());
    }

    #[test]
    fn bbox_helpers() {
        let person = BBox::new(100.0, 50.0, 40.0, 120.0);
        assert_eq!(person.bottom_center(), Point::new(120.0, 170.0));
        assert!((person.upper_region(0.3).h - 36.0).abs() < 1e-4);

        let other = BBox::new(120.0, 50.0, 40.0, 120.0);
        assert_eq!(person.intersection_area(&other), 20.0 * 120.0);
        assert!((person.iou(&other) - (2400.0 / 7200.0)).abs() < 1e-6);
        assert_eq!(person.intersection_area(&BBox::new(0.0, 0.0, 10.0, 10.0)), 0.0);

        let padded = BBox::new(5.0, 5.0, 10.0, 10.0).padded_within(10.0, 20, 20);
        assert_eq!(padded, BBox::new(0.0, 0.0, 20.0, 20.0));
    }
}
