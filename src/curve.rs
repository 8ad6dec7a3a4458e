//! Smooth curves connecting consecutive points of a path.

use crate::math::{safe_normalize, Point3d, Vector3d};
use cgmath::prelude::*;
use log::warn;

pub use arc::SingleArc;
pub use scurve::SCurve;
pub use straight::{Singularity, StraightLine};

mod arc;
mod scurve;
mod straight;

/// Positions closer than this are considered coincident.
const COINCIDENT_EPSILON: f64 = 1e-4;

/// Tangents whose dot product magnitude exceeds this are considered parallel.
const PARALLEL_THRESHOLD: f64 = 0.9999;

/// A curve parameterised by arc length.
pub trait SegmentCurve {
    /// Samples the position and unit tangent `step` units along the curve.
    fn sample(&self, step: f64) -> (Point3d, Vector3d);

    /// The total length of the curve.
    fn length(&self) -> f64;

    /// The curvature (inverse turning radius) `step` units along the curve.
    ///
    /// The default implementation approximates the curvature by sampling
    /// two very nearby tangents along the curve.
    fn curvature_at(&self, step: f64) -> f64 {
        let length = self.length();
        if length <= 0.0 {
            return 0.0;
        }
        let delta = length * 0.0001;
        let (_, t1) = self.sample(step);
        let (_, t2) = self.sample(step + delta);
        t1.angle(t2).0 / delta
    }
}

/// One of the curve shapes produced by [Curve::between].
#[derive(Clone, Copy, Debug)]
pub enum Curve {
    Straight(StraightLine),
    SingleArc(SingleArc),
    SCurve(SCurve),
    Singularity(Singularity),
}

impl Curve {
    /// Creates a curve from `start` to `end` whose tangents at either end match
    /// `start_tangent` and `end_tangent`.
    ///
    /// Coincident positions give a [Singularity]. Tangents in line with the
    /// displacement give a [StraightLine]. Otherwise the curve turns in the plane
    /// containing both tangents: a [SingleArc] if it bends one way, or an [SCurve]
    /// if it needs an inflection. When `allow_s_curve` is false the inflection is
    /// replaced by a straight line, which does not preserve the tangents.
    pub fn between(
        start: Point3d,
        end: Point3d,
        start_tangent: Vector3d,
        end_tangent: Vector3d,
        allow_s_curve: bool,
    ) -> Curve {
        let disp = end - start;
        if disp.magnitude() < COINCIDENT_EPSILON {
            return Curve::Singularity(Singularity::new(start, start_tangent));
        }
        let st = safe_normalize(start_tangent);
        let et = safe_normalize(end_tangent);

        let normal = if st.dot(et).abs() > PARALLEL_THRESHOLD {
            if st.dot(disp.normalize()).abs() > PARALLEL_THRESHOLD {
                return Curve::Straight(StraightLine::new(start, end));
            }
            safe_normalize(st.cross(disp))
        } else {
            safe_normalize(st.cross(et))
        };

        // The direction the curve first bends in, towards the end point.
        let mut start_dir = safe_normalize(st.cross(normal));
        if start_dir.dot(disp) < 0.0 {
            start_dir = -start_dir;
        }
        let turn_axis = safe_normalize(st.cross(start_dir));

        // A single arc works if the end tangent turns further than the chord does.
        let chord_angle = signed_angle(st, disp.normalize(), turn_axis);
        let mut end_angle = signed_angle(st, et, turn_axis);
        if end_angle <= -std::f64::consts::PI + 1e-9 {
            end_angle = std::f64::consts::PI;
        }

        if chord_angle < end_angle {
            Curve::SingleArc(SingleArc::new(start, end, st, et, start_dir))
        } else if !allow_s_curve {
            Curve::Straight(StraightLine::new(start, end))
        } else {
            let end_dir = safe_normalize(et.cross(turn_axis));
            match SCurve::new(start, end, st, et, start_dir, end_dir) {
                Some(curve) => Curve::SCurve(curve),
                None => {
                    warn!("S-curve radii did not fit {:?} -> {:?}, using equal radii", start, end);
                    Curve::SCurve(SCurve::with_equal_radii(start, end, st, start_dir, end_dir))
                }
            }
        }
    }

    fn inner(&self) -> &dyn SegmentCurve {
        match self {
            Curve::Straight(c) => c,
            Curve::SingleArc(c) => c,
            Curve::SCurve(c) => c,
            Curve::Singularity(c) => c,
        }
    }
}

/// The angle from `from` to `to`, positive when turning anticlockwise about `axis`.
fn signed_angle(from: Vector3d, to: Vector3d, axis: Vector3d) -> f64 {
    from.cross(to).dot(axis).atan2(from.dot(to))
}

impl SegmentCurve for Curve {
    fn sample(&self, step: f64) -> (Point3d, Vector3d) {
        self.inner().sample(step)
    }

    fn length(&self) -> f64 {
        self.inner().length()
    }

    fn curvature_at(&self, step: f64) -> f64 {
        self.inner().curvature_at(step)
    }
}
