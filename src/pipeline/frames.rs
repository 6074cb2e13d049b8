use std::collections::HashMap;
use std::sync::Arc;

use image::{RgbImage, RgbaImage};
use tracing::{debug, warn};

use crate::config::config::AlignmentConfig;
use crate::error::AlignError;
use crate::helper::face_helper::FaceHelper;
use crate::helper::geometry::{EyeMetrics, LandmarkSet};

pub const DEFAULT_FRAME_DURATION_MS: u32 = 500;

/// Why a frame has no aligned raster.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameFailure {
    NoFaceDetected,
    DegenerateLandmarks(String),
    Detector(String),
}

impl FrameFailure {
    /// Short marker shown in place of the raster.
    pub fn reason(&self) -> String {
        match self {
            FrameFailure::NoFaceDetected => "No face detected".to_string(),
            FrameFailure::DegenerateLandmarks(detail) => format!("Degenerate landmarks: {detail}"),
            FrameFailure::Detector(detail) => format!("Detector error: {detail}"),
        }
    }
}

impl TryFrom<AlignError> for FrameFailure {
    type Error = AlignError;

    /// Only per-frame errors convert; batch-level errors are handed back.
    fn try_from(err: AlignError) -> Result<Self, Self::Error> {
        match err {
            AlignError::DetectionFailure => Ok(FrameFailure::NoFaceDetected),
            AlignError::DegenerateLandmarks(detail) => Ok(FrameFailure::DegenerateLandmarks(detail)),
            AlignError::Detector(detail) => Ok(FrameFailure::Detector(detail)),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FrameStatus {
    Aligned {
        raster: Arc<RgbImage>,
        metrics: EyeMetrics,
        config: AlignmentConfig,
    },
    Failed(FrameFailure),
}

/// The output of one alignment attempt.
///
/// `version` grows every time the frame is re-rendered so consumers can tell
/// a fresh result from a cached one without comparing pixels.
#[derive(Debug, Clone)]
pub struct AlignedFrame {
    pub status: FrameStatus,
    pub version: u64,
}

impl AlignedFrame {
    pub fn aligned(raster: RgbImage, metrics: EyeMetrics, config: AlignmentConfig, version: u64) -> Self {
        AlignedFrame {
            status: FrameStatus::Aligned {
                raster: Arc::new(raster),
                metrics,
                config,
            },
            version,
        }
    }

    pub fn failed(failure: FrameFailure, version: u64) -> Self {
        AlignedFrame {
            status: FrameStatus::Failed(failure),
            version,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, FrameStatus::Aligned { .. })
    }

    pub fn raster(&self) -> Option<&Arc<RgbImage>> {
        match &self.status {
            FrameStatus::Aligned { raster, .. } => Some(raster),
            FrameStatus::Failed(_) => None,
        }
    }

    pub fn metrics(&self) -> Option<&EyeMetrics> {
        match &self.status {
            FrameStatus::Aligned { metrics, .. } => Some(metrics),
            FrameStatus::Failed(_) => None,
        }
    }

    /// Roll angle of the source face in degrees.
    pub fn angle_degrees(&self) -> Option<f64> {
        self.metrics().map(EyeMetrics::angle_degrees)
    }

    /// Config the raster was rendered with.
    pub fn rendered_with(&self) -> Option<&AlignmentConfig> {
        match &self.status {
            FrameStatus::Aligned { config, .. } => Some(config),
            FrameStatus::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FrameFailure> {
        match &self.status {
            FrameStatus::Failed(failure) => Some(failure),
            FrameStatus::Aligned { .. } => None,
        }
    }
}

/// align_frame turns a detection outcome into a frame. Per-frame errors
/// become failed frames; batch-level errors are returned.
pub fn align_frame(
    helper: &FaceHelper,
    source: &RgbaImage,
    landmarks: Option<&LandmarkSet>,
    config: &AlignmentConfig,
    version: u64,
) -> Result<AlignedFrame, AlignError> {
    let Some(landmarks) = landmarks else {
        return Ok(AlignedFrame::failed(FrameFailure::NoFaceDetected, version));
    };
    match helper.align_face(source, landmarks, config) {
        Ok(face) => Ok(AlignedFrame::aligned(face.raster, face.metrics, config.clone(), version)),
        Err(err) => {
            let failure = FrameFailure::try_from(err)?;
            warn!(reason = %failure.reason(), "frame failed to align");
            Ok(AlignedFrame::failed(failure, version))
        }
    }
}

/// One uploaded image and everything derived from it.
#[derive(Debug, Clone)]
pub struct FrameEntry {
    pub id: u64,
    pub name: String,
    pub source: Arc<RgbaImage>,
    /// `None` when detection found no face.
    pub landmarks: Option<Arc<LandmarkSet>>,
    pub frame: Arc<AlignedFrame>,
    pub duration_ms: u32,
}

/// Detection and alignment result for an image not yet in a sequence.
#[derive(Debug, Clone)]
pub struct PendingFrame {
    pub name: String,
    pub source: Arc<RgbaImage>,
    pub landmarks: Option<Arc<LandmarkSet>>,
    pub frame: AlignedFrame,
}

/// The ordered list of frames in a timelapse.
///
/// Sequences are immutable once published; every edit produces a new value.
#[derive(Debug, Clone)]
pub struct FrameSequence {
    entries: Vec<FrameEntry>,
    processed_with: AlignmentConfig,
    next_id: u64,
    revision: u64,
}

impl FrameSequence {
    pub fn new(config: AlignmentConfig) -> Self {
        FrameSequence {
            entries: Vec::new(),
            processed_with: config,
            next_id: 0,
            revision: 0,
        }
    }

    pub fn entries(&self) -> &[FrameEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&FrameEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn position(&self, id: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// Config of the most recent completed reconcile.
    pub fn processed_with(&self) -> &AlignmentConfig {
        &self.processed_with
    }

    /// Bumped on every change so subscribers can skip identical snapshots.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// is_stale reports whether any aligned raster was rendered with a config
    /// other than `current`.
    pub fn is_stale(&self, current: &AlignmentConfig) -> bool {
        if &self.processed_with != current {
            return true;
        }
        self.entries
            .iter()
            .filter_map(|e| e.frame.rendered_with())
            .any(|config| config != current)
    }

    /// Successfully aligned frames in sequence order.
    pub fn successful(&self) -> impl Iterator<Item = &FrameEntry> {
        self.entries.iter().filter(|e| e.frame.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &FrameEntry> {
        self.entries.iter().filter(|e| !e.frame.is_success())
    }

    pub fn success_count(&self) -> usize {
        self.successful().count()
    }

    pub fn failure_count(&self) -> usize {
        self.len() - self.success_count()
    }

    /// Playback length of the successful frames.
    pub fn total_duration_ms(&self) -> u64 {
        self.successful().map(|e| e.duration_ms as u64).sum()
    }

    /// Appends frames in the given order and assigns their ids.
    pub fn with_appended(&self, pending: Vec<PendingFrame>, duration_ms: u32) -> FrameSequence {
        let mut next = self.bumped();
        for p in pending {
            next.entries.push(FrameEntry {
                id: next.next_id,
                name: p.name,
                source: p.source,
                landmarks: p.landmarks,
                frame: Arc::new(p.frame),
                duration_ms,
            });
            next.next_id += 1;
        }
        next
    }

    /// move_frame moves the frame at `from` to index `to`, shifting the rest.
    pub fn move_frame(&self, from: usize, to: usize) -> Result<FrameSequence, AlignError> {
        if from >= self.len() || to >= self.len() {
            return Err(AlignError::FrameIndexOutOfRange {
                index: from.max(to),
                len: self.len(),
            });
        }
        let mut next = self.bumped();
        let entry = next.entries.remove(from);
        next.entries.insert(to, entry);
        Ok(next)
    }

    /// Removes a frame by id; `None` if it is not in the sequence.
    pub fn remove(&self, id: u64) -> Option<FrameSequence> {
        let idx = self.position(id)?;
        let mut next = self.bumped();
        next.entries.remove(idx);
        Some(next)
    }

    pub fn set_duration(&self, id: u64, duration_ms: u32) -> Result<FrameSequence, AlignError> {
        check_duration(duration_ms)?;
        let idx = self.position(id).ok_or(AlignError::FrameNotFound(id))?;
        let mut next = self.bumped();
        next.entries[idx].duration_ms = duration_ms;
        Ok(next)
    }

    pub fn set_all_durations(&self, duration_ms: u32) -> Result<FrameSequence, AlignError> {
        check_duration(duration_ms)?;
        let mut next = self.bumped();
        for entry in next.entries.iter_mut() {
            entry.duration_ms = duration_ms;
        }
        Ok(next)
    }

    /// merge_frames takes the frames computed from `snapshot` into `self`.
    ///
    /// An update applies only when the entry still exists and its frame is
    /// the one `snapshot` held, so edits made while the work ran are kept.
    pub fn merge_frames(&self, snapshot: &FrameSequence, updates: Vec<FrameEntry>) -> FrameSequence {
        let base: HashMap<u64, &Arc<AlignedFrame>> =
            snapshot.entries.iter().map(|e| (e.id, &e.frame)).collect();
        let mut updates: HashMap<u64, FrameEntry> = updates.into_iter().map(|e| (e.id, e)).collect();

        let mut next = self.bumped();
        for entry in next.entries.iter_mut() {
            let unchanged = base
                .get(&entry.id)
                .is_some_and(|frame| Arc::ptr_eq(frame, &entry.frame));
            if !unchanged {
                continue;
            }
            if let Some(update) = updates.remove(&entry.id) {
                entry.landmarks = update.landmarks;
                entry.frame = update.frame;
            }
        }
        next
    }

    pub(crate) fn with_processed_with(mut self, config: AlignmentConfig) -> FrameSequence {
        self.processed_with = config;
        self
    }

    fn bumped(&self) -> FrameSequence {
        let mut next = self.clone();
        next.revision += 1;
        next
    }
}

pub(crate) fn check_duration(duration_ms: u32) -> Result<(), AlignError> {
    if duration_ms == 0 {
        return Err(AlignError::InvalidConfig { field: "duration_ms", value: 0.0 });
    }
    Ok(())
}

/// reconcile re-renders every frame that has landmarks with `config`.
///
/// Frames whose detection failed pass through untouched. The input order is
/// kept and each re-rendered frame gets a new version. An invalid config
/// fails before any frame is touched.
///
/// # Arguments
/// * `helper` - face helper doing the per-frame alignment
/// * `sequence` - the published sequence to re-render
/// * `config` - the alignment config to render with
///
/// # Returns
/// * `Result<FrameSequence, AlignError>` - a new sequence with `processed_with == config`
pub fn reconcile(
    helper: &FaceHelper,
    sequence: &FrameSequence,
    config: &AlignmentConfig,
) -> Result<FrameSequence, AlignError> {
    config.validate()?;

    let mut updated = Vec::with_capacity(sequence.len());
    for entry in sequence.entries() {
        let Some(landmarks) = entry.landmarks.as_deref() else {
            updated.push(entry.clone());
            continue;
        };
        let frame = align_frame(helper, &entry.source, Some(landmarks), config, entry.frame.version + 1)?;
        updated.push(FrameEntry {
            frame: Arc::new(frame),
            ..entry.clone()
        });
    }
    debug!(frames = updated.len(), "sequence reconciled");

    let mut next = sequence.bumped();
    next.entries = updated;
    Ok(next.with_processed_with(config.clone()))
}
