use image::RgbImage;
use tracing::debug;

use crate::modules::animation_encoder::{EncoderError, EncoderFrame};
use crate::utils::utils::frames_for_duration;

/// A fixed frame-rate recorder that receives every drawn surface in order.
///
/// The exporter calls `begin` once, `draw` once per tick, then `finish`.
pub trait VideoRecorder: Send {
    fn extension(&self) -> &'static str;

    fn mime_type(&self) -> &'static str;

    fn begin(&mut self, width: u32, height: u32, fps: u32) -> Result<(), EncoderError>;

    fn draw(&mut self, surface: &RgbImage) -> Result<(), EncoderError>;

    fn finish(&mut self) -> Result<Vec<u8>, EncoderError>;
}

/// Which frame is on screen at every tick of a fixed frame-rate recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSchedule {
    ticks: Vec<usize>,
}

impl FrameSchedule {
    pub fn new(durations_ms: &[u32], fps: u32) -> Self {
        let ticks = durations_ms
            .iter()
            .enumerate()
            .flat_map(|(idx, &ms)| std::iter::repeat(idx).take(frames_for_duration(ms, fps) as usize))
            .collect();
        FrameSchedule { ticks }
    }

    pub fn ticks(&self) -> &[usize] {
        &self.ticks
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }
}

/// record_frames plays `frames` into the recorder at `fps`, holding each one
/// for its duration, and reports progress in percent after every tick.
pub fn record_frames<R, F>(
    recorder: &mut R,
    frames: &[EncoderFrame],
    width: u32,
    height: u32,
    fps: u32,
    mut on_progress: F,
) -> Result<Vec<u8>, EncoderError>
where
    R: VideoRecorder + ?Sized,
    F: FnMut(u8),
{
    if frames.is_empty() {
        return Err(EncoderError::NoFrames);
    }
    if fps == 0 {
        return Err(EncoderError::ZeroFrameRate);
    }
    if let Some((index, frame)) = frames
        .iter()
        .enumerate()
        .find(|(_, f)| f.raster.dimensions() != (width, height))
    {
        return Err(EncoderError::FrameSize {
            index,
            actual: frame.raster.dimensions(),
            expected: (width, height),
        });
    }

    let durations: Vec<u32> = frames.iter().map(|f| f.duration_ms).collect();
    let schedule = FrameSchedule::new(&durations, fps);
    debug!(ticks = schedule.len(), fps, "recording video");

    recorder.begin(width, height, fps)?;
    on_progress(0);
    let total = schedule.len();
    let mut last = 0u8;
    for (tick, &idx) in schedule.ticks().iter().enumerate() {
        recorder.draw(&frames[idx].raster)?;
        let percent = ((tick + 1) * 100 / total) as u8;
        if percent != last {
            on_progress(percent);
            last = percent;
        }
    }
    let bytes = recorder.finish()?;
    if bytes.is_empty() {
        return Err(EncoderError::EmptyOutput);
    }
    Ok(bytes)
}
