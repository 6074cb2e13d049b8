//! Face normalization for timelapses.
//!
//! Every photo is rotated, scaled and translated so the eyes land on the same
//! line at the same spacing, then the aligned frames are exported as an
//! animation.
//!
//! ```no_run
//! use rs_face_timelapse::config::config::{AlignmentConfig, ExportConfig, FaceDetectionConfig};
//! use rs_face_timelapse::helper::face_helper::FaceHelper;
//! use rs_face_timelapse::modules::animation_encoder::GifAnimationEncoder;
//! use rs_face_timelapse::modules::face_detection_client::{FaceDetectionClient, StaticLandmarkDetector};
//! use rs_face_timelapse::pipeline::pipeline::FramePipeline;
//!
//! # async fn run(images: Vec<(String, image::RgbaImage)>) -> anyhow::Result<()> {
//! let client = FaceDetectionClient::init(StaticLandmarkDetector::new(), FaceDetectionConfig::new()).await?;
//! let pipeline = FramePipeline::new(client, FaceHelper::default(), AlignmentConfig::new());
//! pipeline.add_images(images).await?;
//! let gif = pipeline.export(&GifAnimationEncoder::default(), &ExportConfig::new()).await?;
//! std::fs::write(&gif.file_name, &gif.bytes)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod helper;
pub mod modules;
pub mod pipeline;
pub mod utils;

pub use error::AlignError;
