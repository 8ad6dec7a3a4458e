use super::KeypointGraph;
use crate::math::Point3d;
use cgmath::prelude::*;
use log::error;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Raw path values at or below this offset refer to custom points.
const CUSTOM_OFFSET: i32 = 8;

/// A point on a [KeypointPath].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PathPoint {
    /// A keypoint of the graph the path was generated from.
    Keypoint(usize),
    /// An index into the path's own custom points.
    Custom(usize),
}

impl PathPoint {
    /// Decodes a raw path value, where `-8 - k` refers to custom point `k`.
    /// Values between -7 and -1 are invalid.
    pub fn from_raw(raw: i32) -> Option<Self> {
        if raw >= 0 {
            Some(Self::Keypoint(raw as usize))
        } else if raw <= -CUSTOM_OFFSET {
            Some(Self::Custom((-CUSTOM_OFFSET - raw) as usize))
        } else {
            None
        }
    }

    /// Encodes the point as a raw path value.
    pub fn to_raw(self) -> i32 {
        match self {
            Self::Keypoint(i) => i as i32,
            Self::Custom(k) => -CUSTOM_OFFSET - k as i32,
        }
    }
}

/// An ordered traversal of keypoints, optionally mixed with injected custom points.
///
/// The path refers to keypoints by index and does not own the graph, so every
/// positional query takes the graph the path was generated from.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KeypointPath {
    points: Vec<PathPoint>,
    custom_points: Vec<Point3d>,
}

impl KeypointPath {
    /// Creates a path. Custom points referenced by `points` must exist in `custom_points`.
    pub fn new(points: Vec<PathPoint>, custom_points: Vec<Point3d>) -> Self {
        Self {
            points,
            custom_points,
        }
    }

    /// Creates a path consisting only of keypoints.
    pub fn from_keypoints(keypoints: impl IntoIterator<Item = usize>) -> Self {
        Self {
            points: keypoints.into_iter().map(PathPoint::Keypoint).collect(),
            custom_points: vec![],
        }
    }

    /// Creates a path from raw values. Invalid values are dropped with an error.
    pub fn from_raw(raw: &[i32], custom_points: Vec<Point3d>) -> Self {
        let points = raw
            .iter()
            .filter_map(|r| {
                let point = PathPoint::from_raw(*r);
                if point.is_none() {
                    error!("Invalid raw path value {}", r);
                }
                point
            })
            .collect();
        Self {
            points,
            custom_points,
        }
    }

    /// Encodes the path's points as raw values.
    pub fn to_raw(&self) -> Vec<i32> {
        self.points.iter().map(|p| p.to_raw()).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[PathPoint] {
        &self.points
    }

    pub fn custom_points(&self) -> &[Point3d] {
        &self.custom_points
    }

    pub fn get(&self, index: usize) -> Option<PathPoint> {
        self.points.get(index).copied()
    }

    /// The graph keypoints visited by the path, skipping custom points.
    pub fn keypoints(&self) -> impl Iterator<Item = usize> + '_ {
        self.points.iter().filter_map(|p| match p {
            PathPoint::Keypoint(i) => Some(*i),
            PathPoint::Custom(_) => None,
        })
    }

    /// The last point of the path if it is a keypoint.
    pub fn last_keypoint(&self) -> Option<usize> {
        match self.points.last() {
            Some(PathPoint::Keypoint(i)) => Some(*i),
            _ => None,
        }
    }

    /// The world position of a point on the path.
    ///
    /// Invalid indices are a data integrity error: they are logged and resolve to the origin.
    pub fn position(&self, index: usize, graph: &KeypointGraph) -> Point3d {
        let pos = match self.points.get(index) {
            Some(PathPoint::Keypoint(k)) => graph.position(*k),
            Some(PathPoint::Custom(k)) => self.custom_points.get(*k).copied(),
            None => None,
        };
        pos.unwrap_or_else(|| {
            error!("Bad path index {} (path has {} points)", index, self.len());
            Point3d::origin()
        })
    }

    /// Inserts a custom point at the given position in the path.
    pub fn insert_custom(&mut self, index: usize, position: Point3d) {
        let k = self.custom_points.len();
        self.custom_points.push(position);
        self.points.insert(index.min(self.points.len()), PathPoint::Custom(k));
    }

    /// Appends a custom point to the end of the path.
    pub fn push_custom(&mut self, position: Point3d) {
        self.insert_custom(self.points.len(), position);
    }

    /// Copies part of the path, keeping only the custom points it refers to.
    pub fn slice(&self, range: Range<usize>) -> KeypointPath {
        let range = range.start.min(self.len())..range.end.min(self.len());
        let mut out = KeypointPath::default();
        for point in &self.points[range] {
            match point {
                PathPoint::Keypoint(i) => out.points.push(PathPoint::Keypoint(*i)),
                PathPoint::Custom(k) => match self.custom_points.get(*k) {
                    Some(pos) => out.push_custom(*pos),
                    None => error!("Dangling custom point {} in path", k),
                },
            }
        }
        out
    }

    /// Appends another path, renumbering its custom points.
    pub fn append(&mut self, other: &KeypointPath) {
        let offset = self.custom_points.len();
        self.custom_points.extend_from_slice(&other.custom_points);
        self.points.extend(other.points.iter().map(|p| match p {
            PathPoint::Custom(k) => PathPoint::Custom(k + offset),
            keypoint => *keypoint,
        }));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::test::line_graph;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn raw_encoding() {
        assert_eq!(PathPoint::from_raw(5), Some(PathPoint::Keypoint(5)));
        assert_eq!(PathPoint::from_raw(-8), Some(PathPoint::Custom(0)));
        assert_eq!(PathPoint::from_raw(-11), Some(PathPoint::Custom(3)));
        assert_eq!(PathPoint::from_raw(-3), None);
        assert_eq!(PathPoint::Custom(2).to_raw(), -10);
    }

    #[test]
    fn positions_of_mixed_path() {
        let graph = line_graph(3);
        let path = KeypointPath::from_raw(&[-8, 1, 2, -4], vec![Point3d::new(7.0, 8.0, 9.0)]);
        assert_eq!(path.len(), 3);
        assert_approx_eq!(path.position(0, &graph).x, 7.0);
        assert_approx_eq!(path.position(1, &graph).x, 1000.0);
        assert_eq!(path.last_keypoint(), Some(2));
        assert_eq!(path.to_raw(), vec![-8, 1, 2]);
    }

    #[test]
    fn bad_index_resolves_to_origin() {
        let graph = line_graph(1);
        let path = KeypointPath::from_keypoints([4]);
        assert_eq!(path.position(0, &graph), Point3d::origin());
        assert_eq!(path.position(3, &graph), Point3d::origin());
    }

    #[test]
    fn slice_and_append_renumber_custom_points() {
        let mut path = KeypointPath::from_keypoints([0, 1, 2]);
        path.insert_custom(0, Point3d::new(1.0, 0.0, 0.0));
        path.insert_custom(2, Point3d::new(2.0, 0.0, 0.0));
        assert_eq!(path.to_raw(), vec![-8, 0, -9, 1, 2]);

        let mut head = path.slice(2..4);
        assert_eq!(head.to_raw(), vec![-8, 1]);
        assert_eq!(head.custom_points(), &[Point3d::new(2.0, 0.0, 0.0)]);

        head.append(&path);
        assert_eq!(head.to_raw(), vec![-8, 1, -9, 0, -10, 1, 2]);
        assert_eq!(head.custom_points()[1], Point3d::new(1.0, 0.0, 0.0));
    }
}
