use std::path::Path;

use anyhow::{Context, Error};
use image::RgbaImage;

use crate::helper::geometry::LandmarkSet;
use crate::utils::coordinate::LandmarkMetadata;

pub fn decode_image(im_bytes: &[u8]) -> Result<RgbaImage, Error> {
    let img = image::load_from_memory(im_bytes).context("decoding image bytes")?;
    Ok(img.to_rgba8())
}

pub fn load_image(path: &Path) -> Result<RgbaImage, Error> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    decode_image(&bytes).with_context(|| format!("decoding {}", path.display()))
}

pub fn convert_json_to_landmarks(raw: &str) -> Result<LandmarkSet, Error> {
    let metadata: LandmarkMetadata = serde_json::from_str(raw).context("parsing landmark json")?;
    let landmarks = LandmarkSet::from_flat(metadata.into_flat())?;
    Ok(landmarks)
}

pub fn load_landmarks(path: &Path) -> Result<LandmarkSet, Error> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    convert_json_to_landmarks(&raw).with_context(|| format!("loading landmarks {}", path.display()))
}

/// Sidecar path holding cached landmarks for an image: `<image>.landmarks.json`.
pub fn landmark_sidecar(image_path: &Path) -> std::path::PathBuf {
    let mut name = image_path.as_os_str().to_owned();
    name.push(".landmarks.json");
    name.into()
}
