use super::SegmentCurve;
use crate::math::{safe_normalize, Point3d, Vector3d};
use cgmath::prelude::*;
use cgmath::{Quaternion, Rad};
use std::f64::consts::PI;

/// A circular arc between two straight segments.
///
/// The arc is the largest one which fits in the corner between the start and end
/// tangent lines without passing either end point. Whichever end is further from
/// the corner gets a straight segment.
#[derive(Clone, Copy, Debug)]
pub struct SingleArc {
    start: Point3d,
    start_tangent: Vector3d,
    end_tangent: Vector3d,
    start_anchor: Point3d,
    end_anchor: Point3d,
    pivot: Point3d,
    axis: Vector3d,
    radius: f64,
    /// Lengths of the lead-in straight, the arc and the lead-out straight.
    segments: [f64; 3],
}

impl SingleArc {
    /// Fits an arc between two oriented points. `start_dir` is perpendicular to
    /// `start_tangent`, pointing towards the centre of the turn.
    pub fn new(
        start: Point3d,
        end: Point3d,
        start_tangent: Vector3d,
        end_tangent: Vector3d,
        start_dir: Vector3d,
    ) -> Self {
        let disp = end - start;
        let a = disp.magnitude();
        let chord = safe_normalize(disp);
        let alpha = start_tangent.dot(-end_tangent).min(1.0).acos();

        let (lead_in, lead_out, radius, arc_angle) = if alpha.sin() < 1e-9 {
            // Opposing tangents: a half circle, plus whatever straight is needed
            // to line the ends up.
            let along = disp.dot(start_tangent);
            let radius = 0.5 * disp.dot(start_dir);
            (along.max(0.0), (-along).max(0.0), radius, PI)
        } else {
            let beta = end_tangent.dot(chord).min(1.0).acos();
            let gamma = start_tangent.dot(chord).min(1.0).acos();
            let b = a * beta.sin() / alpha.sin();
            let c = a * gamma.sin() / alpha.sin();
            let corner = b.min(c);
            let radius = (0.5 * alpha).tan() * corner;
            (b - corner, c - corner, radius, PI - alpha)
        };

        let start_anchor = start + start_tangent * lead_in;
        let end_anchor = end - end_tangent * lead_out;
        Self {
            start,
            start_tangent,
            end_tangent,
            start_anchor,
            end_anchor,
            pivot: start_anchor + start_dir * radius,
            axis: safe_normalize(start_tangent.cross(start_dir)),
            radius,
            segments: [lead_in, arc_angle * radius, lead_out],
        }
    }

    /// The radius of the arc.
    pub fn radius(&self) -> f64 {
        self.radius
    }
}

impl SegmentCurve for SingleArc {
    fn sample(&self, step: f64) -> (Point3d, Vector3d) {
        let [lead_in, arc, _] = self.segments;
        if step < lead_in {
            (self.start + self.start_tangent * step, self.start_tangent)
        } else if step < lead_in + arc {
            let shaft = self.start_anchor - self.pivot;
            let rot = Quaternion::from_axis_angle(self.axis, Rad((step - lead_in) / self.radius));
            let shaft = rot.rotate_vector(shaft);
            (self.pivot + shaft, safe_normalize(self.axis.cross(shaft)))
        } else {
            let along = step - lead_in - arc;
            (self.end_anchor + self.end_tangent * along, self.end_tangent)
        }
    }

    fn length(&self) -> f64 {
        self.segments.iter().sum()
    }

    fn curvature_at(&self, step: f64) -> f64 {
        let [lead_in, arc, _] = self.segments;
        if step >= lead_in && step < lead_in + arc && self.radius > 0.0 {
            1.0 / self.radius
        } else {
            0.0
        }
    }
}
