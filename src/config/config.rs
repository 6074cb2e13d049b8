use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::AlignError;

pub const DEFAULT_CANVAS_SIZE: u32 = 500;
pub const DEFAULT_TARGET_EYE_DISTANCE: f64 = 140.0;
pub const DEFAULT_EYE_LINE_RATIO: f64 = 0.4;
pub const WHITE: [u8; 3] = [255, 255, 255];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlignmentConfig {
    pub canvas_size: u32,
    pub target_eye_distance: f64,
    /// Eye line distance from the top of the canvas. `None` means 40% of `canvas_size`.
    pub target_eye_y: Option<f64>,
    pub scale_factor: f64,
    pub background: [u8; 3],
    pub debug_overlay: bool,
}

impl AlignmentConfig {
    pub fn new() -> Self {
        AlignmentConfig {
            canvas_size: DEFAULT_CANVAS_SIZE,
            target_eye_distance: DEFAULT_TARGET_EYE_DISTANCE,
            target_eye_y: None,
            scale_factor: 1.0,
            background: WHITE,
            debug_overlay: false,
        }
    }

    pub fn with_scale_factor(mut self, scale_factor: f64) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    pub fn with_canvas_size(mut self, canvas_size: u32) -> Self {
        self.canvas_size = canvas_size;
        self
    }

    /// validate rejects non-positive or non-finite fields. Nothing is clamped.
    pub fn validate(&self) -> Result<(), AlignError> {
        check_nonzero("canvas_size", self.canvas_size as u64)?;
        check_positive("target_eye_distance", self.target_eye_distance)?;
        check_positive("scale_factor", self.scale_factor)?;
        if let Some(target_eye_y) = self.target_eye_y {
            check_positive("target_eye_y", target_eye_y)?;
        }
        Ok(())
    }

    /// resolve validates the config and fills in the derived eye line position.
    pub fn resolve(&self) -> Result<ResolvedAlignment, AlignError> {
        self.validate()?;
        let canvas_size = self.canvas_size;
        Ok(ResolvedAlignment {
            canvas_size,
            target_eye_distance: self.target_eye_distance,
            target_eye_y: self
                .target_eye_y
                .unwrap_or(DEFAULT_EYE_LINE_RATIO * canvas_size as f64),
            scale_factor: self.scale_factor,
        })
    }
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn check_positive(field: &'static str, value: f64) -> Result<(), AlignError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(AlignError::InvalidConfig { field, value });
    }
    Ok(())
}

fn check_nonzero(field: &'static str, value: u64) -> Result<(), AlignError> {
    if value == 0 {
        return Err(AlignError::InvalidConfig { field, value: 0.0 });
    }
    Ok(())
}

/// Alignment parameters with every default materialized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedAlignment {
    pub canvas_size: u32,
    pub target_eye_distance: f64,
    pub target_eye_y: f64,
    pub scale_factor: f64,
}

impl ResolvedAlignment {
    pub fn target_center(&self) -> (f64, f64) {
        (self.canvas_size as f64 / 2.0, self.target_eye_y)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FaceDetectionConfig {
    pub model_name: String,
    /// Seconds to wait for one detection before the frame is marked failed.
    pub timeout: u64,
    pub max_concurrency: usize,
}

impl FaceDetectionConfig {
    pub fn new() -> Self {
        FaceDetectionConfig {
            model_name: "face_landmark_68".to_string(),
            timeout: 20,
            max_concurrency: 4,
        }
    }

    /// validate rejects a zero timeout or a zero concurrency limit.
    pub fn validate(&self) -> Result<(), AlignError> {
        check_nonzero("timeout", self.timeout)?;
        check_nonzero("max_concurrency", self.max_concurrency as u64)
    }
}

impl Default for FaceDetectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AspectRatio {
    Square,
    Landscape16x9,
    Portrait9x16,
    Portrait4x5,
    Custom { width: u32, height: u32 },
}

impl AspectRatio {
    /// dimensions returns the output size whose longer side is `resolution`.
    /// Custom ratios ignore `resolution`.
    pub fn dimensions(&self, resolution: u32) -> (u32, u32) {
        let scaled = |num: u32, den: u32| -> u32 {
            (resolution as f64 * num as f64 / den as f64).round() as u32
        };
        match *self {
            AspectRatio::Square => (resolution, resolution),
            AspectRatio::Landscape16x9 => (resolution, scaled(9, 16)),
            AspectRatio::Portrait9x16 => (scaled(9, 16), resolution),
            AspectRatio::Portrait4x5 => (scaled(4, 5), resolution),
            AspectRatio::Custom { width, height } => (width, height),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Gif,
    Video,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExportConfig {
    pub format: ExportFormat,
    pub aspect: AspectRatio,
    pub resolution: u32,
    pub frame_duration_ms: u32,
    pub file_prefix: String,
    pub background: [u8; 3],
    /// Number of GIF loops; `None` loops forever.
    pub loop_count: Option<u16>,
    pub fps: u32,
}

impl ExportConfig {
    pub fn new() -> Self {
        ExportConfig {
            format: ExportFormat::Gif,
            aspect: AspectRatio::Square,
            resolution: DEFAULT_CANVAS_SIZE,
            frame_duration_ms: 500,
            file_prefix: "face-timelapse".to_string(),
            background: WHITE,
            loop_count: None,
            fps: 30,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.aspect.dimensions(self.resolution)
    }

    /// validate checks the output size, frame timing and frame rate before
    /// any export work starts.
    pub fn validate(&self) -> Result<(), AlignError> {
        match self.aspect {
            AspectRatio::Custom { width, height } => {
                check_nonzero("width", width as u64)?;
                check_nonzero("height", height as u64)?;
            }
            _ => check_nonzero("resolution", self.resolution as u64)?,
        }
        check_nonzero("frame_duration_ms", self.frame_duration_ms as u64)?;
        check_nonzero("fps", self.fps as u64)
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub alignment: AlignmentConfig,
    pub detection: FaceDetectionConfig,
    pub export: ExportConfig,
}

impl AppConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// apply_env_overrides reads `FACE_*` variables (after `.env` is loaded).
    pub fn apply_env_overrides(mut self) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        if let Some(value) = env_var::<u32>("FACE_CANVAS_SIZE")? {
            self.alignment.canvas_size = value;
        }
        if let Some(value) = env_var::<f64>("FACE_TARGET_EYE_DISTANCE")? {
            self.alignment.target_eye_distance = value;
        }
        if let Some(value) = env_var::<f64>("FACE_SCALE_FACTOR")? {
            self.alignment.scale_factor = value;
        }
        if let Some(value) = env_var::<u32>("FACE_FRAME_MS")? {
            self.export.frame_duration_ms = value;
        }
        Ok(self)
    }
}

fn env_var<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("{key} must be a number, got {raw:?}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}
