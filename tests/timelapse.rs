use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::{Rgba, RgbaImage};
use rs_face_timelapse::config::config::{AlignmentConfig, ExportConfig, FaceDetectionConfig};
use rs_face_timelapse::helper::face_helper::FaceHelper;
use rs_face_timelapse::helper::geometry::{compute_eye_metrics, LandmarkSet};
use rs_face_timelapse::modules::animation_encoder::GifAnimationEncoder;
use rs_face_timelapse::modules::face_detection_client::{
    DetectorError, FaceDetectionClient, FaceDetector, StaticLandmarkDetector,
};
use rs_face_timelapse::pipeline::pipeline::{FramePipeline, ReconcileOutcome};
use rs_face_timelapse::utils::image::convert_json_to_landmarks;

/// Landmarks as a sidecar file would hold them: eye contours are squares of
/// half-width 4 around the given centers, everything else sits on the chin.
fn landmarks_json(left: (f64, f64), right: (f64, f64)) -> String {
    let offsets = [(-4.0, 0.0), (-2.0, -4.0), (2.0, -4.0), (4.0, 0.0), (2.0, 4.0), (-2.0, 4.0)];
    let chin = ((left.0 + right.0) / 2.0, left.1.max(right.1) + 60.0);
    let points: Vec<String> = (0..68)
        .map(|i| {
            let (x, y) = match i {
                36..=41 => (left.0 + offsets[i - 36].0, left.1 + offsets[i - 36].1),
                42..=47 => (right.0 + offsets[i - 42].0, right.1 + offsets[i - 42].1),
                _ => (chin.0, chin.1),
            };
            format!(r#"{{"x":{x},"y":{y}}}"#)
        })
        .collect();
    format!("[{}]", points.join(","))
}

fn photo(seed: u8) -> RgbaImage {
    RgbaImage::from_fn(320, 240, |x, y| {
        Rgba([(x as u8) ^ seed, (y as u8).wrapping_add(seed), seed.wrapping_mul(3), 255])
    })
}

fn face(seed: u8) -> (RgbaImage, LandmarkSet) {
    let tilt = seed as f64 * 2.0;
    let landmarks = convert_json_to_landmarks(&landmarks_json((120.0, 100.0), (190.0, 100.0 + tilt))).unwrap();
    (photo(seed), landmarks)
}

async fn pipeline_with(
    detector: StaticLandmarkDetector,
    config: AlignmentConfig,
) -> FramePipeline<StaticLandmarkDetector> {
    let client = FaceDetectionClient::init(detector, FaceDetectionConfig::new()).await.unwrap();
    FramePipeline::new(client, FaceHelper::default(), config)
}

/// Five photos where the third has no face.
fn batch_of_five(detector: &mut StaticLandmarkDetector) -> Vec<(String, RgbaImage)> {
    (1..=5u8)
        .map(|seed| {
            let (image, landmarks) = face(seed);
            if seed != 3 {
                detector.insert(&image, landmarks);
            }
            (format!("day-{seed}"), image)
        })
        .collect()
}

#[tokio::test]
async fn one_faceless_photo_does_not_sink_the_batch() {
    let mut detector = StaticLandmarkDetector::new();
    let images = batch_of_five(&mut detector);
    let pipeline = pipeline_with(detector, AlignmentConfig::new().with_canvas_size(120)).await;

    let sequence = pipeline.add_images(images).await.unwrap();
    let names: Vec<_> = sequence.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["day-1", "day-2", "day-3", "day-4", "day-5"]);
    assert_eq!(sequence.success_count(), 4);
    assert!(!sequence.entries()[2].frame.is_success());
    assert_eq!(sequence.entries()[2].frame.failure().unwrap().reason(), "No face detected");

    let artifact = pipeline
        .export(
            &GifAnimationEncoder::default(),
            &ExportConfig {
                resolution: 120,
                ..ExportConfig::new()
            },
        )
        .await
        .unwrap();
    assert_eq!(artifact.summary.included, 4);
    assert_eq!(artifact.summary.skipped, 1);
    assert_eq!(artifact.summary.total_duration_ms, 2000);
}

#[tokio::test]
async fn reprocessing_with_the_same_config_is_pixel_identical() {
    let mut detector = StaticLandmarkDetector::new();
    let images = batch_of_five(&mut detector);
    let config = AlignmentConfig::new().with_canvas_size(96);
    let pipeline = pipeline_with(detector, config.clone()).await;
    let first = pipeline.add_images(images).await.unwrap();

    let ReconcileOutcome::Published(second) = pipeline.reprocess(config).await.unwrap() else {
        panic!("a lone reconcile must publish");
    };
    for (a, b) in first.entries().iter().zip(second.entries()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.frame.raster().map(|r| r.as_raw()), b.frame.raster().map(|r| r.as_raw()));
    }
}

#[tokio::test]
async fn older_reconcile_never_overwrites_a_newer_one() {
    let mut detector = StaticLandmarkDetector::new();
    let images = batch_of_five(&mut detector);
    let pipeline = pipeline_with(detector, AlignmentConfig::new()).await;
    pipeline.add_images(images).await.unwrap();

    let slow = AlignmentConfig::new().with_scale_factor(1.1);
    let fast = AlignmentConfig::new().with_scale_factor(1.3);
    let (older, newer) = tokio::join!(pipeline.reprocess(slow), pipeline.reprocess(fast.clone()));

    assert!(matches!(older.unwrap(), ReconcileOutcome::Superseded));
    assert!(matches!(newer.unwrap(), ReconcileOutcome::Published(_)));
    let sequence = pipeline.snapshot();
    assert_eq!(sequence.processed_with(), &fast);
    assert!(!pipeline.is_stale());
    for entry in sequence.successful() {
        assert_eq!(entry.frame.rendered_with(), Some(&fast));
    }
}

#[tokio::test]
async fn stale_until_reconciled() {
    let mut detector = StaticLandmarkDetector::new();
    let images = batch_of_five(&mut detector);
    let pipeline = pipeline_with(detector, AlignmentConfig::new().with_canvas_size(80)).await;
    let sequence = pipeline.add_images(images).await.unwrap();

    let zoomed = AlignmentConfig::new().with_canvas_size(80).with_scale_factor(2.0);
    assert!(sequence.is_stale(&zoomed));
    assert!(!sequence.is_stale(&pipeline.config()));

    let err = pipeline
        .reprocess(AlignmentConfig::new().with_scale_factor(-1.0))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("scale_factor"));
    assert_eq!(pipeline.snapshot().revision(), sequence.revision());
}

/// Finds no face until switched on.
struct WarmingDetector {
    ready: Arc<AtomicBool>,
    landmarks: LandmarkSet,
}

impl FaceDetector for WarmingDetector {
    async fn load(&self, _model_name: &str) -> Result<(), DetectorError> {
        Ok(())
    }

    async fn detect(&self, _image: &RgbaImage) -> Result<Option<LandmarkSet>, DetectorError> {
        Ok(self.ready.load(Ordering::SeqCst).then(|| self.landmarks.clone()))
    }
}

#[tokio::test]
async fn redetect_recovers_failed_frames() {
    let ready = Arc::new(AtomicBool::new(false));
    let (image, landmarks) = face(1);
    let detector = WarmingDetector {
        ready: Arc::clone(&ready),
        landmarks,
    };
    let client = FaceDetectionClient::init(detector, FaceDetectionConfig::new()).await.unwrap();
    let pipeline = FramePipeline::new(client, FaceHelper::default(), AlignmentConfig::new().with_canvas_size(64));

    let sequence = pipeline.add_images(vec![("day-1".to_string(), image)]).await.unwrap();
    assert_eq!(sequence.success_count(), 0);

    ready.store(true, Ordering::SeqCst);
    let sequence = pipeline.redetect_failed().await.unwrap();
    assert_eq!(sequence.success_count(), 1);
    assert_eq!(sequence.entries()[0].frame.version, 1);
}

#[test]
fn sidecar_landmarks_land_on_the_eye_line() {
    let (image, landmarks) = face(5);
    let metrics = compute_eye_metrics(&landmarks).unwrap();
    assert!(metrics.angle_degrees() > 0.0);

    let aligned = FaceHelper::default()
        .align_face(&image, &landmarks, &AlignmentConfig::new())
        .unwrap();
    let out = aligned.transform.map_metrics(&aligned.metrics).unwrap();
    assert!((out.left_eye_center.y - 200.0).abs() < 0.5);
    assert!((out.right_eye_center.y - 200.0).abs() < 0.5);
    assert!((out.eye_distance - 140.0).abs() < 0.5);
    assert!(out.angle.abs() < 1e-6);
}
