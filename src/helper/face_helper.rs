use image::{RgbImage, RgbaImage};
use tracing::debug;

use crate::config::config::AlignmentConfig;
use crate::error::AlignError;
use crate::helper::canvas::{draw_eye_metrics, render, OverlayStyle};
use crate::helper::geometry::{compute_eye_metrics, EyeMetrics, LandmarkSet};
use crate::helper::transform::SimilarityTransform;

/// One normalized face and the geometry that produced it.
#[derive(Debug, Clone)]
pub struct AlignedFace {
    pub raster: RgbImage,
    pub metrics: EyeMetrics,
    pub transform: SimilarityTransform,
}

#[derive(Debug, Clone, Default)]
pub struct FaceHelper {
    overlay: OverlayStyle,
}

impl FaceHelper {

    /// new initializes new instance of face helper module.
    pub fn new(overlay: Option<OverlayStyle>) -> Self {
        FaceHelper {
            overlay: overlay.unwrap_or_default(),
        }
    }

    /// align_face normalizes one face: eye metrics, similarity transform,
    /// then a single resampling pass onto a fresh canvas.
    ///
    /// The config is validated before any pixel work so an invalid config
    /// never produces a partially rendered frame.
    pub fn align_face(
        &self,
        source: &RgbaImage,
        landmarks: &LandmarkSet,
        config: &AlignmentConfig,
    ) -> Result<AlignedFace, AlignError> {
        let alignment = config.resolve()?;
        let metrics = compute_eye_metrics(landmarks)?;
        let transform = SimilarityTransform::build(&metrics, &alignment)?;

        debug!(
            angle_deg = metrics.angle_degrees(),
            eye_distance = metrics.eye_distance,
            scale = transform.scale(),
            canvas = alignment.canvas_size,
            "aligning face"
        );

        let mut raster = render(source, &transform, alignment.canvas_size, config.background)?;
        if config.debug_overlay {
            let placed = transform.map_metrics(&metrics)?;
            draw_eye_metrics(&mut raster, &placed, &metrics, &self.overlay);
        }

        Ok(AlignedFace {
            raster,
            metrics,
            transform,
        })
    }
}
