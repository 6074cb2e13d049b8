use thiserror::Error;

use crate::modules::animation_encoder::EncoderError;
use crate::modules::face_detection_client::DetectorError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignError {
    #[error("No face detected")]
    DetectionFailure,

    #[error("Degenerate landmarks: {0}")]
    DegenerateLandmarks(String),

    #[error("Invalid config: {field} = {value}")]
    InvalidConfig { field: &'static str, value: f64 },

    #[error("Encoder failure: {0}")]
    EncoderFailure(String),

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Frame {0} is not in the sequence")]
    FrameNotFound(u64),

    #[error("Frame index {index} is out of range for {len} frames")]
    FrameIndexOutOfRange { index: usize, len: usize },

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<EncoderError> for AlignError {
    fn from(err: EncoderError) -> Self {
        AlignError::EncoderFailure(err.to_string())
    }
}

impl From<DetectorError> for AlignError {
    fn from(err: DetectorError) -> Self {
        AlignError::Detector(err.to_string())
    }
}
