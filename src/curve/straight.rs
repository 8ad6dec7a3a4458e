use super::SegmentCurve;
use crate::math::{safe_normalize, Point3d, Vector3d};
use cgmath::prelude::*;

/// A straight line between two points.
#[derive(Clone, Copy, Debug)]
pub struct StraightLine {
    start: Point3d,
    tangent: Vector3d,
    length: f64,
}

impl StraightLine {
    pub fn new(start: Point3d, end: Point3d) -> Self {
        Self {
            start,
            tangent: safe_normalize(end - start),
            length: start.distance(end),
        }
    }
}

impl SegmentCurve for StraightLine {
    fn sample(&self, step: f64) -> (Point3d, Vector3d) {
        (self.start + self.tangent * step, self.tangent)
    }

    fn length(&self) -> f64 {
        self.length
    }

    fn curvature_at(&self, _step: f64) -> f64 {
        0.0
    }
}

/// A zero length curve at a single point.
#[derive(Clone, Copy, Debug)]
pub struct Singularity {
    position: Point3d,
    tangent: Vector3d,
}

impl Singularity {
    pub fn new(position: Point3d, tangent: Vector3d) -> Self {
        Self { position, tangent }
    }
}

impl SegmentCurve for Singularity {
    fn sample(&self, _step: f64) -> (Point3d, Vector3d) {
        (self.position, self.tangent)
    }

    fn length(&self) -> f64 {
        0.0
    }

    fn curvature_at(&self, _step: f64) -> f64 {
        0.0
    }
}
