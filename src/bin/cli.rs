//! Builds an aligned face timelapse from a folder of photos.
//!
//! Each image needs a `<image>.landmarks.json` sidecar with its 68 landmarks;
//! images without one are reported as "No face detected".
//!
//! Usage:
//!   face-timelapse <dir>                       # writes face-timelapse-<millis>.gif
//!   face-timelapse <dir> --frames out/         # also writes aligned PNG frames
//!   face-timelapse <dir> --config app.json --scale 1.2 --debug-overlay

use std::path::{Path, PathBuf};

use ab_glyph::FontArc;
use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use rs_face_timelapse::config::config::{AppConfig, ExportFormat};
use rs_face_timelapse::helper::canvas::OverlayStyle;
use rs_face_timelapse::helper::face_helper::FaceHelper;
use rs_face_timelapse::modules::animation_encoder::GifAnimationEncoder;
use rs_face_timelapse::modules::face_detection_client::{FaceDetectionClient, StaticLandmarkDetector};
use rs_face_timelapse::pipeline::pipeline::FramePipeline;
use rs_face_timelapse::utils::image::{landmark_sidecar, load_image, load_landmarks};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Parser, Debug)]
#[command(name = "face-timelapse")]
#[command(author, version, about = "Align faces and export a timelapse", long_about = None)]
struct Args {
    /// Directory of photos, processed in file name order
    #[arg(required = true)]
    input: PathBuf,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory for the animation
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Also write every aligned frame as PNG into this directory
    #[arg(long)]
    frames: Option<PathBuf>,

    /// Zoom multiplier applied on top of the target eye distance
    #[arg(long)]
    scale: Option<f64>,

    /// Milliseconds each frame stays on screen
    #[arg(long)]
    frame_ms: Option<u32>,

    /// Draw the eye line and metrics on each frame
    #[arg(long)]
    debug_overlay: bool,

    /// TTF/OTF font for overlay labels
    #[arg(long)]
    font: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rs_face_timelapse=info,face_timelapse=info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    config.alignment.validate()?;
    config.export.validate()?;
    config.detection.validate()?;
    if config.export.format != ExportFormat::Gif {
        bail!("only gif export is available from the command line");
    }

    let photos = list_photos(&args.input)?;
    if photos.is_empty() {
        bail!("no images found in {}", args.input.display());
    }

    let mut detector = StaticLandmarkDetector::new();
    let mut images = Vec::with_capacity(photos.len());
    for path in photos {
        let image = load_image(&path)?;
        let sidecar = landmark_sidecar(&path);
        if sidecar.exists() {
            match load_landmarks(&sidecar) {
                Ok(landmarks) => detector.insert(&image, landmarks),
                Err(e) => warn!(file = %sidecar.display(), error = %e, "ignoring unreadable landmarks"),
            }
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        images.push((name, image));
    }
    info!(images = images.len(), with_landmarks = detector.len(), "photos loaded");

    let overlay = match &args.font {
        Some(path) => {
            let bytes = std::fs::read(path).with_context(|| format!("reading font {}", path.display()))?;
            let font = FontArc::try_from_vec(bytes).with_context(|| format!("parsing font {}", path.display()))?;
            Some(OverlayStyle::default().with_font(font))
        }
        None => None,
    };

    let client = FaceDetectionClient::init(detector, config.detection.clone()).await?;
    let pipeline = FramePipeline::new(client, FaceHelper::new(overlay), config.alignment.clone())
        .with_frame_duration(config.export.frame_duration_ms)?;
    let sequence = pipeline.add_images(images).await?;

    for entry in sequence.failed() {
        if let Some(failure) = entry.frame.failure() {
            warn!(image = %entry.name, reason = %failure.reason(), "frame skipped");
        }
    }

    if let Some(dir) = &args.frames {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        for (idx, entry) in sequence.successful().enumerate() {
            if let Some(raster) = entry.frame.raster() {
                let path = dir.join(format!("{:04}.png", idx + 1));
                raster.save(&path).with_context(|| format!("writing {}", path.display()))?;
            }
        }
    }

    let encoder = GifAnimationEncoder::new(None, config.export.loop_count);
    let artifact = pipeline.export(&encoder, &config.export).await?;
    std::fs::create_dir_all(&args.output).with_context(|| format!("creating {}", args.output.display()))?;
    let path = args.output.join(&artifact.file_name);
    std::fs::write(&path, &artifact.bytes).with_context(|| format!("writing {}", path.display()))?;

    info!(
        file = %path.display(),
        included = artifact.summary.included,
        skipped = artifact.summary.skipped,
        duration_ms = artifact.summary.total_duration_ms,
        "timelapse written"
    );
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<AppConfig> {
    let config = match &args.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };
    let mut config = config.apply_env_overrides()?;
    if let Some(scale) = args.scale {
        config.alignment.scale_factor = scale;
    }
    if let Some(frame_ms) = args.frame_ms {
        config.export.frame_duration_ms = frame_ms;
    }
    if args.debug_overlay {
        config.alignment.debug_overlay = true;
    }
    Ok(config)
}

fn list_photos(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut photos: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    photos.sort();
    Ok(photos)
}
