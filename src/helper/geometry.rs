//! Eye geometry derived from a 68-point landmark set.
//!
//! Points follow the iBUG 68 layout used by dlib and face-api style
//! detectors: the left eye (image left) is points 36-41 and the right eye is
//! points 42-47. Coordinates are source pixels with Y pointing down.

use std::f64::consts::PI;
use std::ops::Range;

use nalgebra::{Point2, Vector2};
use ndarray::{s, Array2, ArrayView2, Axis};

use crate::error::AlignError;

pub const NUM_LANDMARKS: usize = 68;
pub const LEFT_EYE: Range<usize> = 36..42;
pub const RIGHT_EYE: Range<usize> = 42..48;

/// An immutable 68 x 2 set of landmark points.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSet {
    points: Array2<f64>,
}

impl LandmarkSet {
    pub fn new(points: Array2<f64>) -> Result<Self, AlignError> {
        if points.dim() != (NUM_LANDMARKS, 2) {
            return Err(AlignError::DegenerateLandmarks(format!(
                "expected {NUM_LANDMARKS}x2 landmarks, got {:?}",
                points.dim()
            )));
        }
        if points.iter().any(|v| !v.is_finite()) {
            return Err(AlignError::DegenerateLandmarks(
                "landmarks contain non-finite coordinates".to_string(),
            ));
        }
        Ok(LandmarkSet { points })
    }

    /// from_flat builds a set from `[x0, y0, x1, y1, ...]`.
    pub fn from_flat(flat: Vec<f64>) -> Result<Self, AlignError> {
        let len = flat.len();
        let points = Array2::from_shape_vec((len / 2, 2), flat).map_err(|_| {
            AlignError::DegenerateLandmarks(format!("odd number of landmark coordinates: {len}"))
        })?;
        Self::new(points)
    }

    pub fn from_points(points: &[(f64, f64)]) -> Result<Self, AlignError> {
        Self::from_flat(points.iter().flat_map(|&(x, y)| [x, y]).collect())
    }

    pub fn points(&self) -> ArrayView2<'_, f64> {
        self.points.view()
    }

    pub fn point(&self, idx: usize) -> Point2<f64> {
        Point2::new(self.points[[idx, 0]], self.points[[idx, 1]])
    }

    pub fn group(&self, range: Range<usize>) -> ArrayView2<'_, f64> {
        self.points.slice(s![range, ..])
    }

    pub fn left_eye(&self) -> ArrayView2<'_, f64> {
        self.group(LEFT_EYE)
    }

    pub fn right_eye(&self) -> ArrayView2<'_, f64> {
        self.group(RIGHT_EYE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeMetrics {
    pub left_eye_center: Point2<f64>,
    pub right_eye_center: Point2<f64>,
    /// Source pixels, always > 0 for a constructed value.
    pub eye_distance: f64,
    /// Radians in (-pi, pi] of the left-to-right eye vector.
    pub angle: f64,
    pub center_point: Point2<f64>,
}

impl EyeMetrics {
    pub fn from_centers(left: Point2<f64>, right: Point2<f64>) -> Result<Self, AlignError> {
        if !(left.x.is_finite() && left.y.is_finite() && right.x.is_finite() && right.y.is_finite()) {
            return Err(AlignError::DegenerateLandmarks(
                "eye centers are not finite".to_string(),
            ));
        }
        let delta: Vector2<f64> = right - left;
        let eye_distance = delta.norm();
        if eye_distance == 0.0 {
            return Err(AlignError::DegenerateLandmarks(
                "eye centers coincide".to_string(),
            ));
        }
        Ok(EyeMetrics {
            left_eye_center: left,
            right_eye_center: right,
            eye_distance,
            angle: normalize_angle(delta.y.atan2(delta.x)),
            center_point: nalgebra::center(&left, &right),
        })
    }

    pub fn angle_degrees(&self) -> f64 {
        self.angle.to_degrees()
    }
}

/// compute_eye_metrics derives eye centers, separation and tilt from a landmark set.
///
/// # Arguments
/// * `landmarks` - 68-point iBUG landmarks in source pixels
///
/// # Returns
/// * `Result<EyeMetrics, AlignError>` - `DegenerateLandmarks` when the eye centers coincide
pub fn compute_eye_metrics(landmarks: &LandmarkSet) -> Result<EyeMetrics, AlignError> {
    let left = eye_center(landmarks.left_eye())
        .ok_or_else(|| AlignError::DegenerateLandmarks("left eye has no points".to_string()))?;
    let right = eye_center(landmarks.right_eye())
        .ok_or_else(|| AlignError::DegenerateLandmarks("right eye has no points".to_string()))?;
    EyeMetrics::from_centers(left, right)
}

/// Unweighted mean of the eye contour, `None` when the group is empty.
fn eye_center(eye: ArrayView2<'_, f64>) -> Option<Point2<f64>> {
    let mean = eye.mean_axis(Axis(0))?;
    Some(Point2::new(mean[0], mean[1]))
}

fn normalize_angle(angle: f64) -> f64 {
    if angle <= -PI {
        angle + 2.0 * PI
    } else {
        angle
    }
}
