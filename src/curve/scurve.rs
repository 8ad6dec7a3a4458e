use super::SegmentCurve;
use crate::math::{safe_normalize, Point3d, Vector3d};
use cgmath::prelude::*;
use cgmath::{Quaternion, Rad};
use log::{trace, warn};
use std::f64::consts::TAU;

/// How many times the first radius is halved looking for a valid solution.
const RADIUS_ATTEMPTS: usize = 8;

/// Sampled tangents must be this close to the requested tangents.
const TANGENT_TOLERANCE: f64 = 1e-6;

/// Two circular arcs bending in opposite directions, meeting at a point where
/// their tangents coincide.
#[derive(Clone, Copy, Debug)]
pub struct SCurve {
    start: Point3d,
    /// The first arc turns anticlockwise about this axis, the second clockwise.
    axis: Vector3d,
    pivot1: Point3d,
    pivot2: Point3d,
    radius1: f64,
    radius2: f64,
    /// Lengths of the first and second arcs.
    segments: [f64; 2],
}

/// The two circles of an S-curve, listed from the end they were solved from.
struct Circles {
    pivot1: Point3d,
    pivot2: Point3d,
    radius1: f64,
    radius2: f64,
}

/// Fits two externally tangent circles: the first touches `end1` with its centre
/// along `dir1` at distance `radius1`, the second touches `end2` with its centre
/// along `dir2`.
///
/// The tangency condition `|p1 - p2| = r1 + r2` with `p2 = end2 + dir2 * r2`
/// is linear in `r2` once `r1` is chosen.
fn solve_circles(
    end1: Point3d,
    end2: Point3d,
    dir1: Vector3d,
    dir2: Vector3d,
    radius1: f64,
) -> Option<Circles> {
    let pivot1 = end1 + dir1 * radius1;
    let k = pivot1 - end2;
    let denom = 2.0 * (radius1 + dir2.dot(k));
    let radius2 = (k.magnitude2() - radius1 * radius1) / denom;
    if !radius2.is_finite() || radius2 <= 0.0 {
        return None;
    }
    Some(Circles {
        pivot1,
        pivot2: end2 + dir2 * radius2,
        radius1,
        radius2,
    })
}

/// The angle turned anticlockwise about `axis` going from `from` to `to`, in `[0, 2π)`.
fn sweep(from: Vector3d, to: Vector3d, axis: Vector3d) -> f64 {
    let angle = from.cross(to).dot(axis).atan2(from.dot(to));
    if angle < -1e-6 {
        angle + TAU
    } else {
        angle.max(0.0)
    }
}

impl SCurve {
    /// Fits an S-curve between two oriented points.
    ///
    /// `start_dir` and `end_dir` point from each end towards the centre of the arc
    /// at that end. The first radius starts at half the distance between the ends
    /// and shrinks until the fitted curve reproduces both tangents. Returns `None`
    /// if no such curve is found, see [SCurve::with_equal_radii].
    pub fn new(
        start: Point3d,
        end: Point3d,
        start_tangent: Vector3d,
        end_tangent: Vector3d,
        start_dir: Vector3d,
        end_dir: Vector3d,
    ) -> Option<Self> {
        let axis = safe_normalize(start_tangent.cross(start_dir));
        let half = 0.5 * start.distance(end);
        let from_start_first = start_tangent.dot(end_dir) < end_tangent.dot(start_dir);

        for from_start in [from_start_first, !from_start_first] {
            let mut radius = half;
            for _ in 0..RADIUS_ATTEMPTS {
                let circles = if from_start {
                    solve_circles(start, end, start_dir, end_dir, radius)
                } else {
                    solve_circles(end, start, end_dir, start_dir, radius).map(|c| Circles {
                        pivot1: c.pivot2,
                        pivot2: c.pivot1,
                        radius1: c.radius2,
                        radius2: c.radius1,
                    })
                };
                if let Some(curve) = circles.map(|c| Self::from_circles(start, end, axis, c)) {
                    if curve.fits(end, start_tangent, end_tangent) {
                        return Some(curve);
                    }
                }
                radius *= 0.5;
            }
            trace!("S-curve solve from {} end failed", if from_start { "start" } else { "end" });
        }
        None
    }

    /// Fits an S-curve made of two arcs with the same radius.
    ///
    /// The radius is the positive root of `|p1 - p2| = 2r`, which exists whenever
    /// the ends need an inflection. If it somehow doesn't, a quarter of the
    /// distance between the ends is used and the tangents are not preserved.
    pub fn with_equal_radii(
        start: Point3d,
        end: Point3d,
        start_tangent: Vector3d,
        start_dir: Vector3d,
        end_dir: Vector3d,
    ) -> Self {
        let disp = end - start;
        let a = -2.0 * (1.0 + start_dir.dot(end_dir));
        let b = -2.0 * disp.dot(start_dir - end_dir);
        let c = disp.magnitude2();
        let root = if a.abs() > 1e-12 {
            (-b - (b * b - 4.0 * a * c).sqrt()) / (2.0 * a)
        } else {
            -c / b
        };
        let radius = if root.is_finite() && root > 0.0 {
            root
        } else {
            warn!("No equal radius S-curve between {:?} and {:?}", start, end);
            0.25 * disp.magnitude()
        };
        let circles = Circles {
            pivot1: start + start_dir * radius,
            pivot2: end + end_dir * radius,
            radius1: radius,
            radius2: radius,
        };
        Self::from_circles(start, end, safe_normalize(start_tangent.cross(start_dir)), circles)
    }

    fn from_circles(start: Point3d, end: Point3d, axis: Vector3d, c: Circles) -> Self {
        let junction = c.pivot1 + safe_normalize(c.pivot2 - c.pivot1) * c.radius1;
        let gamma1 = sweep(start - c.pivot1, junction - c.pivot1, axis);
        let gamma2 = sweep(junction - c.pivot2, end - c.pivot2, -axis);
        Self {
            start,
            axis,
            pivot1: c.pivot1,
            pivot2: c.pivot2,
            radius1: c.radius1,
            radius2: c.radius2,
            segments: [gamma1 * c.radius1, gamma2 * c.radius2],
        }
    }

    fn fits(&self, end: Point3d, start_tangent: Vector3d, end_tangent: Vector3d) -> bool {
        let (p0, t0) = self.sample(0.0);
        let (p1, t1) = self.sample(self.length());
        let scale = self.start.distance(end).max(1.0);
        p0.distance(self.start) < 1e-9 * scale
            && p1.distance(end) < 1e-6 * scale
            && t0.dot(start_tangent) > 1.0 - TANGENT_TOLERANCE
            && t1.dot(end_tangent) > 1.0 - TANGENT_TOLERANCE
    }

    /// The radii of the first and second arcs.
    pub fn radii(&self) -> (f64, f64) {
        (self.radius1, self.radius2)
    }
}

impl SegmentCurve for SCurve {
    fn sample(&self, step: f64) -> (Point3d, Vector3d) {
        if step < self.segments[0] {
            let shaft = self.start - self.pivot1;
            let rot = Quaternion::from_axis_angle(self.axis, Rad(step / self.radius1));
            let shaft = rot.rotate_vector(shaft);
            (self.pivot1 + shaft, safe_normalize(self.axis.cross(shaft)))
        } else {
            let shaft = safe_normalize(self.pivot1 - self.pivot2) * self.radius2;
            let along = (step - self.segments[0]).min(self.segments[1]);
            let rot = Quaternion::from_axis_angle(-self.axis, Rad(along / self.radius2));
            let shaft = rot.rotate_vector(shaft);
            (self.pivot2 + shaft, safe_normalize(self.axis.cross(-shaft)))
        }
    }

    fn length(&self) -> f64 {
        self.segments[0] + self.segments[1]
    }

    fn curvature_at(&self, step: f64) -> f64 {
        if step < self.segments[0] {
            1.0 / self.radius1
        } else {
            1.0 / self.radius2
        }
    }
}
