use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::config::FaceDetectionConfig;
use crate::error::AlignError;
use crate::helper::geometry::LandmarkSet;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectorError {
    #[error("detector model {0} failed to load: {1}")]
    Load(String, String),

    #[error("detection timed out after {0}s")]
    Timeout(u64),

    #[error("detector backend error: {0}")]
    Backend(String),
}

/// A single-face landmark detector.
///
/// `detect` returns the most confident face only, or `None` when the image
/// has no face.
pub trait FaceDetector: Send + Sync + 'static {
    /// Loads model weights. Called once by [`FaceDetectionClient::init`].
    fn load(&self, model_name: &str) -> impl Future<Output = Result<(), DetectorError>> + Send;

    fn detect(
        &self,
        image: &RgbaImage,
    ) -> impl Future<Output = Result<Option<LandmarkSet>, DetectorError>> + Send;
}

/// Handle to a loaded detector. The only way to get one is [`FaceDetectionClient::init`],
/// so holding it means the models are ready.
#[derive(Debug)]
pub struct FaceDetectionClient<D> {
    detector: Arc<D>,
    model_name: String,
    timeout: u64,
    max_concurrency: usize,
}

impl<D> Clone for FaceDetectionClient<D> {
    fn clone(&self) -> Self {
        FaceDetectionClient {
            detector: Arc::clone(&self.detector),
            model_name: self.model_name.clone(),
            timeout: self.timeout,
            max_concurrency: self.max_concurrency,
        }
    }
}

impl<D: FaceDetector> FaceDetectionClient<D> {
    /// init validates the config and loads the detector's model.
    ///
    /// # Arguments
    /// * `detector` - the detector backend
    /// * `config` - model name, timeout and concurrency limit
    ///
    /// # Returns
    /// * `Result<FaceDetectionClient<D>, AlignError>`
    pub async fn init(detector: D, config: FaceDetectionConfig) -> Result<Self, AlignError> {
        config.validate()?;
        detector.load(&config.model_name).await?;
        debug!(model = %config.model_name, "face detector loaded");
        Ok(FaceDetectionClient {
            detector: Arc::new(detector),
            model_name: config.model_name,
            timeout: config.timeout,
            max_concurrency: config.max_concurrency,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// detect runs one detection bounded by the configured timeout.
    pub async fn detect(&self, image: &RgbaImage) -> Result<Option<LandmarkSet>, DetectorError> {
        let limit = Duration::from_secs(self.timeout);
        match tokio::time::timeout(limit, self.detector.detect(image)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = self.timeout, "face detection timed out");
                Err(DetectorError::Timeout(self.timeout))
            }
        }
    }
}

/// Serves landmark sets detected earlier (for example loaded from sidecar
/// files). Images are matched by dimensions and a checksum of their pixels.
#[derive(Debug, Default, Clone)]
pub struct StaticLandmarkDetector {
    landmarks: HashMap<ImageKey, LandmarkSet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ImageKey {
    width: u32,
    height: u32,
    checksum: u64,
}

impl StaticLandmarkDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image: &RgbaImage, landmarks: LandmarkSet) {
        self.landmarks.insert(Self::key_for(image), landmarks);
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    fn key_for(image: &RgbaImage) -> ImageKey {
        // FNV-1a over the raw pixels
        let checksum = image
            .as_raw()
            .iter()
            .fold(0xcbf29ce484222325u64, |hash, &byte| {
                (hash ^ byte as u64).wrapping_mul(0x100000001b3)
            });
        ImageKey {
            width: image.width(),
            height: image.height(),
            checksum,
        }
    }
}

impl FaceDetector for StaticLandmarkDetector {
    async fn load(&self, _model_name: &str) -> Result<(), DetectorError> {
        Ok(())
    }

    async fn detect(&self, image: &RgbaImage) -> Result<Option<LandmarkSet>, DetectorError> {
        Ok(self.landmarks.get(&Self::key_for(image)).cloned())
    }
}
