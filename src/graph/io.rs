//! Plain text persistence of keypoint graphs.
//!
//! ```text
//! keypoints
//! 0:100,200,0
//! 1:300,200,0
//! links
//! 0,1
//! spawnpoints
//! 0
//! overtakelanes
//! 0,1;2,3
//! rules
//! 1:4
//! ```

use super::KeypointGraph;
use crate::math::Point3d;
use log::warn;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

const OVERTAKE_HEADER: &str = "overtakelanes ### format is \"rightLaneStart,rightLaneEnd;leftLaneStart,leftLaneEnd\" in keypoint indexes ###";

/// An error loading or saving a keypoint graph.
#[derive(Debug)]
pub enum GraphError {
    /// The graph file could not be read or written.
    Io(std::io::Error),
    /// A link or overtake lane refers to a keypoint which does not exist.
    InvalidLink { from: usize, to: usize },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "graph I/O error: {}", err),
            Self::InvalidLink { from, to } => {
                write!(f, "link {} -> {} refers to a missing keypoint", from, to)
            }
        }
    }
}

impl std::error::Error for GraphError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GraphError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Keypoints,
    Links,
    SpawnPoints,
    OvertakeLanes,
    Rules,
}

impl Section {
    fn from_header(line: &str) -> Option<Self> {
        [
            ("keypoints", Self::Keypoints),
            ("links", Self::Links),
            ("spawnpoints", Self::SpawnPoints),
            ("overtakelanes", Self::OvertakeLanes),
            ("rules", Self::Rules),
        ]
        .into_iter()
        .find(|(name, _)| line.starts_with(name))
        .map(|(_, section)| section)
    }
}

fn parse_pair<T: FromStr>(text: &str, sep: char) -> Option<(T, T)> {
    let (a, b) = text.split_once(sep)?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

fn parse_position(text: &str) -> Option<Point3d> {
    let values = text.split_once(':').map_or(text, |(_, v)| v);
    let mut coords = values.split(',').map(|v| v.trim().parse::<f64>());
    match (coords.next(), coords.next(), coords.next()) {
        (Some(Ok(x)), Some(Ok(y)), Some(Ok(z))) => Some(Point3d::new(x, y, z)),
        _ => None,
    }
}

impl KeypointGraph {
    /// Parses a graph from its text representation.
    ///
    /// Malformed lines are skipped with a warning. Lines before the first section
    /// header are read as keypoints.
    pub fn parse(text: &str) -> Result<Self, GraphError> {
        let mut graph = KeypointGraph::new();
        let mut section = Section::Keypoints;

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = Section::from_header(line) {
                section = header;
                continue;
            }
            let parsed = match section {
                Section::Keypoints => parse_position(line).map(|pos| {
                    graph.add_keypoint(pos);
                }),
                Section::Links => match parse_pair::<usize>(line, ',') {
                    Some((from, to)) => Some(graph.link_keypoints(from, to)?),
                    None => None,
                },
                Section::SpawnPoints => line
                    .parse::<usize>()
                    .ok()
                    .filter(|i| *i < graph.len())
                    .map(|i| graph.mark_spawn_point(i)),
                Section::OvertakeLanes => {
                    let lanes = line.split_once(';').and_then(|(right, left)| {
                        Some((parse_pair::<usize>(right, ',')?, parse_pair::<usize>(left, ',')?))
                    });
                    match lanes {
                        Some((right, left)) => {
                            for (from, to) in [right, left] {
                                if from >= graph.len() || to >= graph.len() {
                                    return Err(GraphError::InvalidLink { from, to });
                                }
                            }
                            Some(graph.add_overtake_lanes(right, left))
                        }
                        None => None,
                    }
                }
                Section::Rules => parse_pair::<u32>(line, ':')
                    .filter(|(i, _)| (*i as usize) < graph.len())
                    .map(|(i, rules)| graph.set_keypoint_rules(i as usize, rules)),
            };
            if parsed.is_none() {
                warn!("Skipping malformed graph line {}: {:?}", line_no + 1, line);
            }
        }

        graph.update_entry_points();
        Ok(graph)
    }

    /// Loads a graph from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Writes the text representation of the graph.
    pub fn write_to(&self, mut out: impl Write) -> Result<(), GraphError> {
        write!(out, "{}", self)?;
        out.flush()?;
        Ok(())
    }

    /// Saves the graph to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GraphError> {
        let file = std::fs::File::create(path)?;
        self.write_to(std::io::BufWriter::new(file))
    }
}

impl fmt::Display for KeypointGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "keypoints")?;
        for (i, kp) in self.keypoints.iter().enumerate() {
            let p = kp.position;
            writeln!(f, "{}:{},{},{}", i, p.x, p.y, p.z)?;
        }
        writeln!(f, "links")?;
        for (from, to) in &self.links {
            writeln!(f, "{},{}", from, to)?;
        }
        writeln!(f, "spawnpoints")?;
        for sp in &self.spawn_points {
            writeln!(f, "{}", sp)?;
        }
        writeln!(f, "{}", OVERTAKE_HEADER)?;
        for o in &self.overtake_lanes {
            writeln!(f, "{},{};{},{}", o.right.0, o.right.1, o.left.0, o.left.1)?;
        }
        writeln!(f, "rules")?;
        for (i, kp) in self.keypoints.iter().enumerate() {
            if kp.rules != 0 {
                writeln!(f, "{}:{}", i, kp.rules)?;
            }
        }
        Ok(())
    }
}
