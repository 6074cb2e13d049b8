use std::sync::{Arc, RwLock};

use image::RgbaImage;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::config::{AlignmentConfig, ExportConfig};
use crate::error::AlignError;
use crate::helper::face_helper::FaceHelper;
use crate::helper::geometry::LandmarkSet;
use crate::modules::animation_encoder::AnimationEncoder;
use crate::modules::face_detection_client::{FaceDetectionClient, FaceDetector};
use crate::modules::video_recorder::VideoRecorder;
use crate::pipeline::export::{export_animation, record_video, ExportArtifact, ExportState};
use crate::pipeline::frames::{
    align_frame, check_duration, reconcile, AlignedFrame, FrameEntry, FrameFailure, FrameSequence,
    PendingFrame, DEFAULT_FRAME_DURATION_MS,
};

/// Outcome of a reconcile request.
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    Published(Arc<FrameSequence>),
    /// A newer request started before this one finished; its result was dropped.
    Superseded,
}

/// The current alignment config and the reconcile request that set it.
/// Both fields change under one lock.
#[derive(Debug)]
struct ConfigSlot {
    request: u64,
    config: AlignmentConfig,
}

/// Puts the export state back to `Idle` when dropped, including on panic
/// or cancellation.
struct ExportGuard<'a> {
    state: &'a watch::Sender<ExportState>,
}

impl Drop for ExportGuard<'_> {
    fn drop(&mut self) {
        self.state.send_replace(ExportState::Idle);
    }
}

/// The timelapse pipeline: detection, alignment and export over one shared
/// frame sequence.
///
/// Readers subscribe to the sequence and always see a complete snapshot;
/// every mutation publishes a whole new sequence.
pub struct FramePipeline<D> {
    detector: FaceDetectionClient<D>,
    face_helper: FaceHelper,
    config: RwLock<ConfigSlot>,
    sequence: watch::Sender<Arc<FrameSequence>>,
    export_state: Arc<watch::Sender<ExportState>>,
    frame_duration_ms: u32,
}

impl<D: FaceDetector> FramePipeline<D> {

    /// new initializes new instance of the pipeline
    pub fn new(detector: FaceDetectionClient<D>, face_helper: FaceHelper, config: AlignmentConfig) -> Self {
        let (sequence, _) = watch::channel(Arc::new(FrameSequence::new(config.clone())));
        let (export_state, _) = watch::channel(ExportState::Idle);
        FramePipeline {
            detector,
            face_helper,
            config: RwLock::new(ConfigSlot { request: 0, config }),
            sequence,
            export_state: Arc::new(export_state),
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
        }
    }

    /// Duration given to newly added frames. Zero is rejected.
    pub fn with_frame_duration(mut self, duration_ms: u32) -> Result<Self, AlignError> {
        check_duration(duration_ms)?;
        self.frame_duration_ms = duration_ms;
        Ok(self)
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<FrameSequence>> {
        self.sequence.subscribe()
    }

    pub fn snapshot(&self) -> Arc<FrameSequence> {
        self.sequence.borrow().clone()
    }

    pub fn export_state(&self) -> watch::Receiver<ExportState> {
        self.export_state.subscribe()
    }

    pub fn config(&self) -> AlignmentConfig {
        match self.config.read() {
            Ok(slot) => slot.config.clone(),
            Err(poisoned) => poisoned.into_inner().config.clone(),
        }
    }

    fn latest_request(&self) -> u64 {
        match self.config.read() {
            Ok(slot) => slot.request,
            Err(poisoned) => poisoned.into_inner().request,
        }
    }

    /// Whether the published rasters lag behind the current config.
    pub fn is_stale(&self) -> bool {
        self.snapshot().is_stale(&self.config())
    }

    /// claim_request stores `config` and returns the id of the request that
    /// now owns it.
    fn claim_request(&self, config: AlignmentConfig) -> u64 {
        let mut slot = match self.config.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.request += 1;
        slot.config = config;
        slot.request
    }

    /// add_images detects and aligns a batch of images concurrently, then
    /// appends all of them to the sequence in one publish.
    ///
    /// Frames keep the order of `images`. A failure on one image marks that
    /// frame only; the rest of the batch goes on.
    ///
    /// # Arguments
    /// * `images` - `(name, image)` pairs in upload order
    ///
    /// # Returns
    /// * `Result<Arc<FrameSequence>, AlignError>` - the published sequence
    #[instrument(skip_all, fields(batch = images.len()))]
    pub async fn add_images(&self, images: Vec<(String, RgbaImage)>) -> Result<Arc<FrameSequence>, AlignError> {
        let config = self.config();
        config.validate()?;

        let pending = self.detect_and_align(images, &config).await?;
        let added = pending.len();
        let failed = pending.iter().filter(|p| !p.frame.is_success()).count();

        let duration_ms = self.frame_duration_ms;
        self.sequence
            .send_modify(|current| *current = Arc::new(current.with_appended(pending, duration_ms)));
        info!(added, failed, "batch processed");
        Ok(self.snapshot())
    }

    async fn detect_and_align(
        &self,
        images: Vec<(String, RgbaImage)>,
        config: &AlignmentConfig,
    ) -> Result<Vec<PendingFrame>, AlignError> {
        let permits = Arc::new(Semaphore::new(self.detector.max_concurrency()));
        let mut tasks = JoinSet::new();
        for (idx, (name, image)) in images.into_iter().enumerate() {
            let detector = self.detector.clone();
            let helper = self.face_helper.clone();
            let config = config.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let source = Arc::new(image);
                let pending = match detect_landmarks(&detector, &source, &name).await {
                    Ok(landmarks) => align_pending(helper, name, source, landmarks, config).await,
                    Err(err) => FrameFailure::try_from(err).map(|failure| PendingFrame {
                        name,
                        source,
                        landmarks: None,
                        frame: AlignedFrame::failed(failure, 0),
                    }),
                };
                (idx, pending)
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let (idx, pending) = joined.map_err(|e| AlignError::Task(e.to_string()))?;
            results.push((idx, pending?));
        }
        results.sort_by_key(|(idx, _)| *idx);
        Ok(results.into_iter().map(|(_, pending)| pending).collect())
    }

    /// reprocess switches to `config` and re-renders every frame that has
    /// landmarks, without detecting again.
    ///
    /// Only the newest request publishes. Anything that finishes after a
    /// newer request started is dropped and reported as `Superseded`.
    #[instrument(skip_all, fields(scale = config.scale_factor, canvas = config.canvas_size))]
    pub async fn reprocess(&self, config: AlignmentConfig) -> Result<ReconcileOutcome, AlignError> {
        config.validate()?;
        let request = self.claim_request(config.clone());

        let snapshot = self.snapshot();
        let helper = self.face_helper.clone();
        let base = Arc::clone(&snapshot);
        let target = config.clone();
        let reconciled = tokio::task::spawn_blocking(move || reconcile(&helper, &base, &target))
            .await
            .map_err(|e| AlignError::Task(e.to_string()))??;

        let published = self.sequence.send_if_modified(|current| {
            if self.latest_request() != request {
                return false;
            }
            let merged = current
                .merge_frames(&snapshot, reconciled.entries().to_vec())
                .with_processed_with(config.clone());
            *current = Arc::new(merged);
            true
        });

        if published {
            debug!(request, "reconcile published");
            Ok(ReconcileOutcome::Published(self.snapshot()))
        } else {
            debug!(request, "reconcile superseded");
            Ok(ReconcileOutcome::Superseded)
        }
    }

    /// redetect_failed runs detection again on frames that have no landmarks.
    #[instrument(skip_all)]
    pub async fn redetect_failed(&self) -> Result<Arc<FrameSequence>, AlignError> {
        let config = self.config();
        let snapshot = self.snapshot();
        let targets: Vec<FrameEntry> = snapshot.failed().filter(|e| e.landmarks.is_none()).cloned().collect();
        if targets.is_empty() {
            return Ok(snapshot);
        }

        let images = targets
            .iter()
            .map(|e| (e.name.clone(), e.source.as_ref().clone()))
            .collect();
        let pending = self.detect_and_align(images, &config).await?;
        let updates: Vec<FrameEntry> = targets
            .into_iter()
            .zip(pending)
            .map(|(entry, p)| FrameEntry {
                landmarks: p.landmarks,
                frame: Arc::new(AlignedFrame {
                    version: entry.frame.version + 1,
                    ..p.frame
                }),
                ..entry
            })
            .collect();
        let recovered = updates.iter().filter(|e| e.frame.is_success()).count();

        self.sequence
            .send_modify(|current| *current = Arc::new(current.merge_frames(&snapshot, updates)));
        info!(recovered, "failed frames re-detected");
        Ok(self.snapshot())
    }

    /// edit publishes the result of a structural edit on the current sequence.
    pub fn edit<F>(&self, change: F) -> Result<Arc<FrameSequence>, AlignError>
    where
        F: FnOnce(&FrameSequence) -> Result<FrameSequence, AlignError>,
    {
        let mut outcome = Ok(());
        self.sequence.send_if_modified(|current| match change(current) {
            Ok(next) => {
                *current = Arc::new(next);
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome.map(|_| self.snapshot())
    }

    pub fn move_frame(&self, from: usize, to: usize) -> Result<Arc<FrameSequence>, AlignError> {
        self.edit(|seq| seq.move_frame(from, to))
    }

    pub fn remove_frame(&self, id: u64) -> Result<Arc<FrameSequence>, AlignError> {
        self.edit(|seq| seq.remove(id).ok_or(AlignError::FrameNotFound(id)))
    }

    pub fn set_duration(&self, id: u64, duration_ms: u32) -> Result<Arc<FrameSequence>, AlignError> {
        self.edit(|seq| seq.set_duration(id, duration_ms))
    }

    pub fn set_all_durations(&self, duration_ms: u32) -> Result<Arc<FrameSequence>, AlignError> {
        self.edit(|seq| seq.set_all_durations(duration_ms))
    }

    /// export encodes the current successful frames. The export state goes
    /// back to `Idle` whether encoding succeeds, fails or panics.
    ///
    /// # Arguments
    /// * `encoder` - animation container encoder
    /// * `config` - export size, timing and file naming; validated first
    ///
    /// # Returns
    /// * `Result<ExportArtifact, AlignError>`
    #[instrument(skip_all, fields(format = ?config.format))]
    pub async fn export<E>(&self, encoder: &E, config: &ExportConfig) -> Result<ExportArtifact, AlignError>
    where
        E: AnimationEncoder + ?Sized,
    {
        config.validate()?;
        let _guard = self.begin_export()?;
        let sequence = self.snapshot();
        let state = Arc::clone(&self.export_state);
        let result = export_animation(&sequence, encoder, config, |progress| {
            state.send_replace(ExportState::Encoding { progress });
        })
        .await;
        log_failure(&result);
        result
    }

    #[instrument(skip_all, fields(fps = config.fps))]
    pub async fn record<R>(&self, recorder: R, config: &ExportConfig) -> Result<(ExportArtifact, R), AlignError>
    where
        R: VideoRecorder + 'static,
    {
        config.validate()?;
        let _guard = self.begin_export()?;
        let sequence = self.snapshot();
        let state = Arc::clone(&self.export_state);
        let result = record_video(&sequence, recorder, config, move |progress| {
            state.send_replace(ExportState::Encoding { progress });
        })
        .await;
        log_failure(&result);
        result
    }

    fn begin_export(&self) -> Result<ExportGuard<'_>, AlignError> {
        let started = self.export_state.send_if_modified(|state| match state {
            ExportState::Idle => {
                *state = ExportState::Encoding { progress: 0 };
                true
            }
            ExportState::Encoding { .. } => false,
        });
        if !started {
            return Err(AlignError::EncoderFailure("an export is already running".to_string()));
        }
        Ok(ExportGuard {
            state: &self.export_state,
        })
    }
}

fn log_failure<T>(result: &Result<T, AlignError>) {
    if let Err(e) = result {
        warn!(error = %e, "export failed");
    }
}

async fn detect_landmarks<D: FaceDetector>(
    detector: &FaceDetectionClient<D>,
    source: &RgbaImage,
    name: &str,
) -> Result<LandmarkSet, AlignError> {
    match detector.detect(source).await {
        Ok(Some(landmarks)) => Ok(landmarks),
        Ok(None) => {
            info!(image = name, "no face detected");
            Err(AlignError::DetectionFailure)
        }
        Err(e) => {
            warn!(image = name, error = %e, "face detection failed");
            Err(e.into())
        }
    }
}

async fn align_pending(
    helper: FaceHelper,
    name: String,
    source: Arc<RgbaImage>,
    landmarks: LandmarkSet,
    config: AlignmentConfig,
) -> Result<PendingFrame, AlignError> {
    tokio::task::spawn_blocking(move || {
        let frame = align_frame(&helper, &source, Some(&landmarks), &config, 0)?;
        Ok::<_, AlignError>(PendingFrame {
            name,
            source,
            landmarks: Some(Arc::new(landmarks)),
            frame,
        })
    })
    .await
    .map_err(|e| AlignError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::{AspectRatio, FaceDetectionConfig};
    use crate::helper::geometry::tests::synthetic_landmarks;
    use crate::modules::animation_encoder::{EncodeEvent, EncodeJob, GifAnimationEncoder};
    use crate::modules::face_detection_client::{DetectorError, StaticLandmarkDetector};
    use crate::modules::video_recorder::tests::TapeRecorder;
    use crate::pipeline::frames::tests::portrait;
    use tokio::sync::mpsc;

    async fn pipeline_with(faces: &[(u8, bool)]) -> (FramePipeline<StaticLandmarkDetector>, Vec<(String, RgbaImage)>) {
        let mut detector = StaticLandmarkDetector::new();
        let mut images = Vec::new();
        for (seed, has_face) in faces {
            let image = portrait(*seed);
            if *has_face {
                detector.insert(&image, synthetic_landmarks((60.0, 50.0), (100.0, 50.0), 4.0));
            }
            images.push((format!("img-{seed}"), image));
        }
        let client = FaceDetectionClient::init(detector, FaceDetectionConfig::new()).await.unwrap();
        let config = AlignmentConfig::new().with_canvas_size(48);
        (FramePipeline::new(client, FaceHelper::default(), config), images)
    }

    #[tokio::test]
    async fn add_images_isolates_failures() {
        let (pipeline, images) = pipeline_with(&[(1, true), (2, false), (3, true)]).await;
        let sequence = pipeline.add_images(images).await.unwrap();

        let names: Vec<_> = sequence.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["img-1", "img-2", "img-3"]);
        assert_eq!(sequence.success_count(), 2);
        assert_eq!(
            sequence.entries()[1].frame.failure().map(FrameFailure::reason).as_deref(),
            Some("No face detected")
        );
    }

    #[tokio::test]
    async fn add_images_rejects_invalid_config() {
        let (pipeline, images) = pipeline_with(&[(1, true)]).await;
        pipeline.claim_request(AlignmentConfig::new().with_canvas_size(0));
        let err = pipeline.add_images(images).await.unwrap_err();
        assert!(matches!(err, AlignError::InvalidConfig { .. }));
        assert!(pipeline.snapshot().is_empty());
    }

    #[tokio::test]
    async fn reprocess_publishes_and_clears_staleness() {
        let (pipeline, images) = pipeline_with(&[(1, true), (2, true)]).await;
        let mut updates = pipeline.subscribe();
        pipeline.add_images(images).await.unwrap();
        assert!(updates.has_changed().unwrap());
        updates.borrow_and_update();

        let zoomed = pipeline.config().with_scale_factor(1.25);
        let outcome = pipeline.reprocess(zoomed.clone()).await.unwrap();
        let ReconcileOutcome::Published(sequence) = outcome else {
            panic!("reconcile should publish");
        };
        assert!(updates.has_changed().unwrap());
        assert!(!pipeline.is_stale());
        assert_eq!(sequence.processed_with(), &zoomed);
        assert!(sequence.entries().iter().all(|e| e.frame.version == 1));
    }

    #[tokio::test]
    async fn edits_and_export_state() {
        let (pipeline, images) = pipeline_with(&[(1, true), (2, true)]).await;
        let sequence = pipeline.add_images(images).await.unwrap();
        let first = sequence.entries()[0].id;

        pipeline.set_duration(first, 800).unwrap();
        assert!(pipeline.set_duration(first, 0).is_err());
        pipeline.move_frame(0, 1).unwrap();
        assert_eq!(pipeline.snapshot().entries()[1].duration_ms, 800);

        let state = pipeline.export_state();
        let artifact = pipeline
            .export(&GifAnimationEncoder::default(), &ExportConfig { resolution: 48, ..ExportConfig::new() })
            .await
            .unwrap();
        assert_eq!(artifact.summary.included, 2);
        assert_eq!(artifact.summary.total_duration_ms, 1300);
        assert_eq!(*state.borrow(), ExportState::Idle);

        pipeline.remove_frame(first).unwrap();
        pipeline.remove_frame(sequence.entries()[1].id).unwrap();
        let err = pipeline
            .export(&GifAnimationEncoder::default(), &ExportConfig::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AlignError::EncoderFailure(_)));
        assert_eq!(*state.borrow(), ExportState::Idle);
    }

    #[tokio::test]
    async fn record_returns_recorder_and_resets_state() {
        let (pipeline, images) = pipeline_with(&[(4, true), (5, false)]).await;
        pipeline.add_images(images).await.unwrap();

        let config = ExportConfig {
            resolution: 48,
            fps: 4,
            ..ExportConfig::new()
        };
        let (artifact, recorder) = pipeline.record(TapeRecorder::default(), &config).await.unwrap();
        // one aligned frame held 500ms at 4fps
        assert_eq!(artifact.bytes.len(), 2);
        assert_eq!(artifact.summary.skipped, 1);
        assert_eq!(recorder.started, Some((48, 48, 4)));
        assert_eq!(*pipeline.export_state().borrow(), ExportState::Idle);
    }

    #[tokio::test]
    async fn zero_export_size_is_rejected_and_export_can_retry() {
        let (pipeline, images) = pipeline_with(&[(1, true)]).await;
        pipeline.add_images(images).await.unwrap();

        let invalid = [
            ExportConfig { resolution: 0, ..ExportConfig::new() },
            ExportConfig { aspect: AspectRatio::Custom { width: 0, height: 48 }, ..ExportConfig::new() },
            ExportConfig { aspect: AspectRatio::Custom { width: 48, height: 0 }, ..ExportConfig::new() },
        ];
        for config in &invalid {
            let err = pipeline.export(&GifAnimationEncoder::default(), config).await.unwrap_err();
            assert!(matches!(err, AlignError::InvalidConfig { .. }), "{config:?}: {err:?}");
            let err = pipeline.record(TapeRecorder::default(), config).await.unwrap_err();
            assert!(matches!(err, AlignError::InvalidConfig { .. }), "{config:?}: {err:?}");
            assert_eq!(*pipeline.export_state().borrow(), ExportState::Idle);
        }

        let valid = ExportConfig { resolution: 48, ..ExportConfig::new() };
        assert!(pipeline.export(&GifAnimationEncoder::default(), &valid).await.is_ok());
    }

    struct CrashingEncoder;

    impl AnimationEncoder for CrashingEncoder {
        fn extension(&self) -> &'static str {
            "gif"
        }

        fn mime_type(&self) -> &'static str {
            "image/gif"
        }

        fn start(&self, _job: EncodeJob) -> mpsc::Receiver<EncodeEvent> {
            panic!("encoder crashed");
        }
    }

    #[tokio::test]
    async fn export_state_resets_after_a_crashed_encoder() {
        let (pipeline, images) = pipeline_with(&[(1, true)]).await;
        pipeline.add_images(images).await.unwrap();
        let pipeline = Arc::new(pipeline);
        let config = ExportConfig { resolution: 48, ..ExportConfig::new() };

        let crashed = {
            let pipeline = Arc::clone(&pipeline);
            let config = config.clone();
            tokio::spawn(async move {
                let encoder = CrashingEncoder;
                pipeline.export(&encoder, &config).await
            })
        };
        assert!(crashed.await.unwrap_err().is_panic());
        assert_eq!(*pipeline.export_state().borrow(), ExportState::Idle);
        assert!(pipeline.export(&GifAnimationEncoder::default(), &config).await.is_ok());
    }

    #[tokio::test]
    async fn zero_frame_duration_is_rejected() {
        let (pipeline, _) = pipeline_with(&[]).await;
        assert!(matches!(
            pipeline.with_frame_duration(0),
            Err(AlignError::InvalidConfig { field: "duration_ms", .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stored_config_follows_the_newest_reconcile() {
        let (pipeline, images) = pipeline_with(&[(1, true), (2, true)]).await;
        pipeline.add_images(images).await.unwrap();
        let pipeline = Arc::new(pipeline);
        let base = pipeline.config();

        for round in 0..16u32 {
            let mut tasks = JoinSet::new();
            for i in 0..4u32 {
                let pipeline = Arc::clone(&pipeline);
                let config = base.clone().with_scale_factor(1.0 + (round * 4 + i) as f64 / 100.0);
                tasks.spawn(async move { pipeline.reprocess(config).await });
            }
            let mut published = 0;
            while let Some(joined) = tasks.join_next().await {
                if matches!(joined.unwrap().unwrap(), ReconcileOutcome::Published(_)) {
                    published += 1;
                }
            }
            assert!(published >= 1);
            assert_eq!(pipeline.snapshot().processed_with(), &pipeline.config());
            assert!(!pipeline.is_stale());
        }
    }

    #[tokio::test]
    async fn missing_frame_ids_are_reported() {
        let (pipeline, images) = pipeline_with(&[(1, true)]).await;
        pipeline.add_images(images).await.unwrap();
        assert_eq!(pipeline.remove_frame(42).unwrap_err(), AlignError::FrameNotFound(42));
        assert_eq!(pipeline.set_duration(42, 100).unwrap_err(), AlignError::FrameNotFound(42));
        assert_eq!(
            pipeline.move_frame(0, 5).unwrap_err(),
            AlignError::FrameIndexOutOfRange { index: 5, len: 1 }
        );
    }

    struct OfflineDetector;

    impl FaceDetector for OfflineDetector {
        async fn load(&self, _model_name: &str) -> Result<(), DetectorError> {
            Ok(())
        }

        async fn detect(&self, _image: &RgbaImage) -> Result<Option<LandmarkSet>, DetectorError> {
            Err(DetectorError::Backend("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn detector_errors_mark_the_frame() {
        let client = FaceDetectionClient::init(OfflineDetector, FaceDetectionConfig::new()).await.unwrap();
        let pipeline = FramePipeline::new(client, FaceHelper::default(), AlignmentConfig::new().with_canvas_size(48));
        let sequence = pipeline.add_images(vec![("img".to_string(), portrait(1))]).await.unwrap();
        assert!(matches!(
            sequence.entries()[0].frame.failure(),
            Some(FrameFailure::Detector(msg)) if msg.contains("connection refused")
        ));
    }
}
