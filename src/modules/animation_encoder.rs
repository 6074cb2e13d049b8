use std::sync::Arc;

use image::buffer::ConvertBuffer;
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, RgbImage, RgbaImage};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

const EVENT_BUFFER: usize = 16;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncoderError {
    #[error("no frames to encode")]
    NoFrames,

    #[error("frame {index} is {actual:?}, expected {expected:?}")]
    FrameSize {
        index: usize,
        actual: (u32, u32),
        expected: (u32, u32),
    },

    #[error("encoder produced no output")]
    EmptyOutput,

    #[error("frame rate must be positive")]
    ZeroFrameRate,

    #[error("encoder stopped without finishing")]
    Aborted,

    #[error("{0}")]
    Encode(String),
}

/// One raster of the animation and how long it stays on screen.
#[derive(Debug, Clone)]
pub struct EncoderFrame {
    pub raster: Arc<RgbImage>,
    pub duration_ms: u32,
}

#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub frames: Vec<EncoderFrame>,
    pub width: u32,
    pub height: u32,
}

impl EncodeJob {
    fn check(&self) -> Result<(), EncoderError> {
        if self.frames.is_empty() {
            return Err(EncoderError::NoFrames);
        }
        let expected = (self.width, self.height);
        for (index, frame) in self.frames.iter().enumerate() {
            if frame.raster.dimensions() != expected {
                return Err(EncoderError::FrameSize {
                    index,
                    actual: frame.raster.dimensions(),
                    expected,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncodeEvent {
    /// Percentage in `0..=100`.
    Progress(u8),
    Finished(Vec<u8>),
    Failed(String),
}

/// An animation container encoder running in the background.
///
/// `start` returns immediately; the receiver yields progress events and ends
/// with exactly one `Finished` or `Failed`.
pub trait AnimationEncoder: Send + Sync {
    fn extension(&self) -> &'static str;

    fn mime_type(&self) -> &'static str;

    fn start(&self, job: EncodeJob) -> mpsc::Receiver<EncodeEvent>;
}

/// wait_for_output drains an encoder's events, forwarding progress, and
/// returns the finished byte stream.
pub async fn wait_for_output<F>(
    mut events: mpsc::Receiver<EncodeEvent>,
    mut on_progress: F,
) -> Result<Vec<u8>, EncoderError>
where
    F: FnMut(u8),
{
    while let Some(event) = events.recv().await {
        match event {
            EncodeEvent::Progress(percent) => on_progress(percent.min(100)),
            EncodeEvent::Finished(bytes) if bytes.is_empty() => return Err(EncoderError::EmptyOutput),
            EncodeEvent::Finished(bytes) => return Ok(bytes),
            EncodeEvent::Failed(reason) => return Err(EncoderError::Encode(reason)),
        }
    }
    Err(EncoderError::Aborted)
}

/// Looping GIF encoder on top of the `image` crate's GIF codec.
#[derive(Debug, Clone)]
pub struct GifAnimationEncoder {
    /// 1 (best quality) to 30 (fastest).
    speed: i32,
    /// `None` repeats forever.
    loop_count: Option<u16>,
}

impl GifAnimationEncoder {
    pub fn new(speed: Option<i32>, loop_count: Option<u16>) -> Self {
        GifAnimationEncoder {
            speed: speed.unwrap_or(10).clamp(1, 30),
            loop_count,
        }
    }

    fn encode(&self, job: &EncodeJob, events: &mpsc::Sender<EncodeEvent>) -> Result<Vec<u8>, EncoderError> {
        job.check()?;
        let total = job.frames.len();
        let mut bytes: Vec<u8> = Vec::new();
        {
            let mut encoder = GifEncoder::new_with_speed(&mut bytes, self.speed);
            let repeat = match self.loop_count {
                None => Repeat::Infinite,
                Some(n) => Repeat::Finite(n),
            };
            encoder.set_repeat(repeat).map_err(|e| EncoderError::Encode(e.to_string()))?;

            for (idx, frame) in job.frames.iter().enumerate() {
                let rgba: RgbaImage = frame.raster.as_ref().convert();
                let delay = Delay::from_numer_denom_ms(frame.duration_ms, 1);
                encoder
                    .encode_frame(Frame::from_parts(rgba, 0, 0, delay))
                    .map_err(|e| EncoderError::Encode(e.to_string()))?;

                let percent = ((idx + 1) * 100 / total) as u8;
                if events.blocking_send(EncodeEvent::Progress(percent)).is_err() {
                    return Err(EncoderError::Aborted);
                }
            }
        }
        Ok(bytes)
    }
}

impl Default for GifAnimationEncoder {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl AnimationEncoder for GifAnimationEncoder {
    fn extension(&self) -> &'static str {
        "gif"
    }

    fn mime_type(&self) -> &'static str {
        "image/gif"
    }

    fn start(&self, job: EncodeJob) -> mpsc::Receiver<EncodeEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let encoder = self.clone();
        tokio::task::spawn_blocking(move || {
            if tx.blocking_send(EncodeEvent::Progress(0)).is_err() {
                return;
            }
            let event = match encoder.encode(&job, &tx) {
                Ok(bytes) => {
                    debug!(frames = job.frames.len(), bytes = bytes.len(), "gif encoded");
                    EncodeEvent::Finished(bytes)
                }
                Err(EncoderError::Aborted) => return,
                Err(e) => {
                    error!(error = %e, "gif encoding failed");
                    EncodeEvent::Failed(e.to_string())
                }
            };
            let _ = tx.blocking_send(event);
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifDecoder;
    use image::{AnimationDecoder, Rgb};
    use std::io::Cursor;

    fn solid(width: u32, height: u32, value: u8) -> EncoderFrame {
        EncoderFrame {
            raster: Arc::new(RgbImage::from_pixel(width, height, Rgb([value, value, value]))),
            duration_ms: 200,
        }
    }

    #[tokio::test]
    async fn test_gif_encoder_reports_progress_and_finishes() {
        let job = EncodeJob {
            frames: vec![solid(16, 16, 0), solid(16, 16, 128), solid(16, 16, 255)],
            width: 16,
            height: 16,
        };
        let mut progress = Vec::new();
        let bytes = wait_for_output(GifAnimationEncoder::default().start(job), |p| progress.push(p))
            .await
            .unwrap();

        assert_eq!(&bytes[..6], b"GIF89a");
        assert_eq!(progress.first(), Some(&0));
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));

        let frames = GifDecoder::new(Cursor::new(bytes))
            .unwrap()
            .into_frames()
            .collect_frames()
            .unwrap();
        assert_eq!(frames.len(), 3);
        let (numer, denom) = frames[0].delay().numer_denom_ms();
        assert_eq!(numer / denom, 200);
    }

    #[tokio::test]
    async fn test_gif_encoder_rejects_mismatched_frames() {
        let job = EncodeJob {
            frames: vec![solid(16, 16, 0), solid(8, 16, 0)],
            width: 16,
            height: 16,
        };
        let err = wait_for_output(GifAnimationEncoder::default().start(job), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EncoderError::Encode(msg) if msg.contains("frame 1")));
    }

    #[tokio::test]
    async fn test_empty_job_fails() {
        let job = EncodeJob { frames: vec![], width: 4, height: 4 };
        let err = wait_for_output(GifAnimationEncoder::default().start(job), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, EncoderError::Encode(EncoderError::NoFrames.to_string()));
    }

    #[tokio::test]
    async fn test_wait_for_output_edge_cases() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(EncodeEvent::Finished(vec![])).await.unwrap();
        assert_eq!(wait_for_output(rx, |_| {}).await, Err(EncoderError::EmptyOutput));

        let (tx, rx) = mpsc::channel::<EncodeEvent>(4);
        drop(tx);
        assert_eq!(wait_for_output(rx, |_| {}).await, Err(EncoderError::Aborted));
    }
}
