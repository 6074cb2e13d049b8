use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinate2D {
    pub x: f64,
    pub y: f64,
}

/// On-disk landmark formats: a list of `{x, y}` objects, a `[[x, y], ...]`
/// matrix, or either of them wrapped in a `{"landmarks": ...}` object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum LandmarkMetadata {
    Points(Vec<Coordinate2D>),
    Matrix(Vec<[f64; 2]>),
    Wrapped { landmarks: Vec<Coordinate2D> },
    WrappedMatrix { landmarks: Vec<[f64; 2]> },
}

impl LandmarkMetadata {
    pub fn into_flat(self) -> Vec<f64> {
        match self {
            LandmarkMetadata::Points(points) | LandmarkMetadata::Wrapped { landmarks: points } => {
                points.into_iter().flat_map(|p| [p.x, p.y]).collect()
            }
            LandmarkMetadata::Matrix(rows) | LandmarkMetadata::WrappedMatrix { landmarks: rows } => {
                rows.into_iter().flatten().collect()
            }
        }
    }
}
