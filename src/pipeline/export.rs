use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use tracing::{info, warn};

use crate::config::config::ExportConfig;
use crate::error::AlignError;
use crate::modules::animation_encoder::{wait_for_output, AnimationEncoder, EncodeJob, EncoderFrame};
use crate::modules::video_recorder::{record_frames, VideoRecorder};
use crate::pipeline::frames::FrameSequence;
use crate::utils::utils::{artifact_file_name, now_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportState {
    #[default]
    Idle,
    Encoding { progress: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub included: usize,
    pub skipped: usize,
    pub total_duration_ms: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub file_name: String,
    pub mime_type: &'static str,
    pub bytes: Vec<u8>,
    pub summary: ExportSummary,
}

/// fit_to_aspect scales `frame` to the largest size that fits `width` x
/// `height` and centers it on a `background` fill.
///
/// # Arguments
/// * `frame` - an aligned square raster
/// * `width`, `height` - export surface size
/// * `background` - fill for the letterbox or pillarbox bars
///
/// # Returns
/// * `RgbImage` - a `width` x `height` surface; empty when either side is zero
pub fn fit_to_aspect(frame: &RgbImage, width: u32, height: u32, background: [u8; 3]) -> RgbImage {
    let (fw, fh) = frame.dimensions();
    if (fw, fh) == (width, height) {
        return frame.clone();
    }
    let mut surface = RgbImage::from_pixel(width, height, Rgb(background));
    if fw == 0 || fh == 0 || width == 0 || height == 0 {
        return surface;
    }

    let scale = f64::min(width as f64 / fw as f64, height as f64 / fh as f64);
    let nw = ((fw as f64 * scale).round() as u32).clamp(1, width);
    let nh = ((fh as f64 * scale).round() as u32).clamp(1, height);
    let fitted = if (nw, nh) == (fw, fh) {
        frame.clone()
    } else {
        imageops::resize(frame, nw, nh, FilterType::Triangle)
    };
    let x = ((width - nw) / 2) as i64;
    let y = ((height - nh) / 2) as i64;
    imageops::replace(&mut surface, &fitted, x, y);
    surface
}

/// export_frames collects the successful frames in order, fitted to the
/// export dimensions. Failed frames are skipped.
pub fn export_frames(sequence: &FrameSequence, config: &ExportConfig) -> (Vec<EncoderFrame>, ExportSummary) {
    let (width, height) = config.dimensions();
    let frames: Vec<EncoderFrame> = sequence
        .successful()
        .filter_map(|entry| {
            let raster = entry.frame.raster()?;
            Some(EncoderFrame {
                raster: Arc::new(fit_to_aspect(raster, width, height, config.background)),
                duration_ms: entry.duration_ms,
            })
        })
        .collect();

    let summary = ExportSummary {
        included: frames.len(),
        skipped: sequence.len() - frames.len(),
        total_duration_ms: frames.iter().map(|f| f.duration_ms as u64).sum(),
        width,
        height,
    };
    (frames, summary)
}

fn ensure_frames(summary: &ExportSummary) -> Result<(), AlignError> {
    if summary.included == 0 {
        return Err(AlignError::EncoderFailure("no aligned frames to export".to_string()));
    }
    Ok(())
}

/// export_animation encodes the sequence's successful frames with `encoder`.
pub async fn export_animation<E, F>(
    sequence: &FrameSequence,
    encoder: &E,
    config: &ExportConfig,
    on_progress: F,
) -> Result<ExportArtifact, AlignError>
where
    E: AnimationEncoder + ?Sized,
    F: FnMut(u8),
{
    config.validate()?;
    let (frames, summary) = export_frames(sequence, config);
    ensure_frames(&summary)?;
    if summary.skipped > 0 {
        warn!(skipped = summary.skipped, "frames without a face are left out of the export");
    }

    let job = EncodeJob {
        frames,
        width: summary.width,
        height: summary.height,
    };
    let bytes = wait_for_output(encoder.start(job), on_progress).await?;

    let file_name = artifact_file_name(&config.file_prefix, now_millis(), encoder.extension());
    info!(file = %file_name, frames = summary.included, bytes = bytes.len(), "animation exported");
    Ok(ExportArtifact {
        file_name,
        mime_type: encoder.mime_type(),
        bytes,
        summary,
    })
}

/// record_video plays the sequence into `recorder` on a blocking thread and
/// hands the recorder back with the artifact.
pub async fn record_video<R, F>(
    sequence: &FrameSequence,
    mut recorder: R,
    config: &ExportConfig,
    on_progress: F,
) -> Result<(ExportArtifact, R), AlignError>
where
    R: VideoRecorder + 'static,
    F: FnMut(u8) + Send + 'static,
{
    config.validate()?;
    let (frames, summary) = export_frames(sequence, config);
    ensure_frames(&summary)?;

    let (width, height, fps) = (summary.width, summary.height, config.fps);
    let (bytes, recorder) = tokio::task::spawn_blocking(move || {
        let bytes = record_frames(&mut recorder, &frames, width, height, fps, on_progress);
        (bytes, recorder)
    })
    .await
    .map_err(|e| AlignError::Task(e.to_string()))?;
    let bytes = bytes?;

    let file_name = artifact_file_name(&config.file_prefix, now_millis(), recorder.extension());
    info!(file = %file_name, frames = summary.included, bytes = bytes.len(), "video recorded");
    let artifact = ExportArtifact {
        file_name,
        mime_type: recorder.mime_type(),
        bytes,
        summary,
    };
    Ok((artifact, recorder))
}
