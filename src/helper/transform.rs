//! Similarity transform from detected eye geometry to the canonical frame.

use nalgebra::{Matrix3, Point2};

use crate::config::config::ResolvedAlignment;
use crate::error::AlignError;
use crate::helper::geometry::EyeMetrics;

/// Rotation + uniform scale + translation, stored as one homogeneous matrix
/// `T_target * S * R * T_center_to_origin`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    rotation: f64,
    scale: f64,
    source_center: Point2<f64>,
    target_center: Point2<f64>,
    matrix: Matrix3<f64>,
}

impl SimilarityTransform {
    /// build maps `metrics.center_point` to `(canvas/2, target_eye_y)`, levels the
    /// eye line and sets the eye separation to `target_eye_distance * scale_factor`.
    ///
    /// # Arguments
    /// * `metrics` - eye geometry of the source photo
    /// * `alignment` - resolved canvas targets
    ///
    /// # Returns
    /// * `Result<SimilarityTransform, AlignError>`
    pub fn build(metrics: &EyeMetrics, alignment: &ResolvedAlignment) -> Result<Self, AlignError> {
        if !metrics.eye_distance.is_finite() || metrics.eye_distance <= 0.0 {
            return Err(AlignError::DegenerateLandmarks(format!(
                "eye distance {} cannot be scaled",
                metrics.eye_distance
            )));
        }
        let scale = (alignment.target_eye_distance / metrics.eye_distance) * alignment.scale_factor;
        let (tx, ty) = alignment.target_center();
        Self::from_parts(metrics.center_point, -metrics.angle, scale, Point2::new(tx, ty))
    }

    pub fn from_parts(
        source_center: Point2<f64>,
        rotation: f64,
        scale: f64,
        target_center: Point2<f64>,
    ) -> Result<Self, AlignError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(AlignError::DegenerateLandmarks(format!("scale {scale} is not usable")));
        }
        if !rotation.is_finite() {
            return Err(AlignError::DegenerateLandmarks(format!("rotation {rotation} is not finite")));
        }

        let to_origin = Matrix3::new_translation(&-source_center.coords);
        let rotate = Matrix3::new_rotation(rotation);
        let zoom = Matrix3::new_scaling(scale);
        let to_target = Matrix3::new_translation(&target_center.coords);
        let matrix = to_target * zoom * rotate * to_origin;

        Ok(SimilarityTransform {
            rotation,
            scale,
            source_center,
            target_center,
            matrix,
        })
    }

    pub fn rotation(&self) -> f64 {
        self.rotation
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn source_center(&self) -> Point2<f64> {
        self.source_center
    }

    pub fn target_center(&self) -> Point2<f64> {
        self.target_center
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Row-major 2x3 affine part.
    pub fn affine_2x3(&self) -> [[f64; 3]; 2] {
        let m = &self.matrix;
        [
            [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
            [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
        ]
    }

    /// Output-to-source mapping. Always exists because the scale is positive.
    pub fn inverse(&self) -> Matrix3<f64> {
        let back = Matrix3::new_translation(&self.source_center.coords);
        let unrotate = Matrix3::new_rotation(-self.rotation);
        let unzoom = Matrix3::new_scaling(1.0 / self.scale);
        let from_target = Matrix3::new_translation(&-self.target_center.coords);
        back * unrotate * unzoom * from_target
    }

    pub fn apply(&self, point: Point2<f64>) -> Point2<f64> {
        self.matrix.transform_point(&point)
    }

    /// map_metrics re-derives the eye metrics in output space.
    pub fn map_metrics(&self, metrics: &EyeMetrics) -> Result<EyeMetrics, AlignError> {
        EyeMetrics::from_centers(
            self.apply(metrics.left_eye_center),
            self.apply(metrics.right_eye_center),
        )
    }
}
