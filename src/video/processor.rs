use std::sync::Arc;

use crate::detect::Detection;
use crate::error::{DetectError, DetectResult};
use crate::model::ModelType;
use crate::pipeline::DetectionPipeline;

use super::{CancelToken, FrameReader, FrameWriter, VideoInfo};

const PROGRESS_EVERY: u64 = 100;

/// Totals and aggregated detections for one finished video job.
#[derive(Clone, Debug)]
pub struct VideoOutcome {
    pub info: VideoInfo,
    pub frames_read: u64,
    /// Frames that went through the detector successfully.
    pub frames_processed: u64,
    /// Frames written through un-annotated after a detector failure.
    pub frames_skipped: u64,
    pub frames_written: u64,
    /// Unparsable detector rows dropped across all frames.
    pub rows_skipped: u64,
    /// Frame-ordered concatenation of every frame's detections.
    pub detections: Vec<Detection>,
}

/// Runs the detection pipeline over a video one frame at a time.
pub struct VideoProcessor {
    pipeline: Arc<DetectionPipeline>,
}

impl VideoProcessor {
    pub fn new(pipeline: Arc<DetectionPipeline>) -> Self {
        Self { pipeline }
    }

    /// Decode, detect, annotate and re-encode every frame of `reader`.
    ///
    /// The writer is opened from the stream info once the first frame has
    /// decoded, so a source with no decodable frames leaves no output.
    pub fn run<F>(
        &self,
        reader: &mut dyn FrameReader,
        open_writer: F,
        model: ModelType,
        cancel: &CancelToken,
    ) -> DetectResult<VideoOutcome>
    where
        F: FnOnce(VideoInfo) -> DetectResult<Box<dyn FrameWriter>>,
    {
        self.pipeline.registry().get(model)?;

        let info = reader.info();
        let first = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return Err(DetectError::UnsupportedCodec(
                    "no decodable frames in source".to_string(),
                ))
            }
            Err(e) => return Err(DetectError::UnsupportedCodec(format!("{:#}", e))),
        };
        let mut writer = open_writer(info)?;

        let mut outcome = VideoOutcome {
            info,
            frames_read: 0,
            frames_processed: 0,
            frames_skipped: 0,
            frames_written: 0,
            rows_skipped: 0,
            detections: Vec::new(),
        };

        let mut next = Some(first);
        let mut cancelled = false;
        while let Some(frame) = next.take() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let index = outcome.frames_read;
            outcome.frames_read += 1;

            match self.pipeline.process(&frame, model) {
                Ok(result) => {
                    write(writer.as_mut(), &result.annotated, index)?;
                    outcome.frames_processed += 1;
                    outcome.rows_skipped += result.skipped as u64;
                    outcome.detections.extend(result.detections);
                }
                Err(DetectError::DetectorFailure(msg)) => {
                    log::warn!("video: frame {} skipped: {}", index, msg);
                    write(writer.as_mut(), &frame, index)?;
                    outcome.frames_skipped += 1;
                }
                Err(e) => return Err(e),
            }
            drop(frame);

            if outcome.frames_read % PROGRESS_EVERY == 0 {
                log::debug!(
                    "video: {} frames read, {} detections so far",
                    outcome.frames_read,
                    outcome.detections.len()
                );
            }

            next = match reader.read_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!(
                        "video: read error after frame {}, ending stream: {:#}",
                        index,
                        e
                    );
                    None
                }
            };
        }

        writer
            .finish()
            .map_err(|e| DetectError::Io(format!("finalize output: {:#}", e)))?;
        outcome.frames_written = writer.frames_written();

        if cancelled {
            log::info!("video: cancelled after {} frames", outcome.frames_read);
            return Err(DetectError::Cancelled {
                frames: outcome.frames_read,
            });
        }
        if outcome.frames_processed == 0 {
            return Err(DetectError::DetectorFailure(format!(
                "detector failed on all {} frames",
                outcome.frames_read
            )));
        }

        log::info!(
            "video: {} frames processed, {} skipped, {} detections",
            outcome.frames_processed,
            outcome.frames_skipped,
            outcome.detections.len()
        );
        Ok(outcome)
    }
}

fn write(writer: &mut dyn FrameWriter, frame: &image::RgbImage, index: u64) -> DetectResult<()> {
    writer
        .write_frame(frame)
        .map_err(|e| DetectError::Io(format!("write frame {}: {:#}", index, e)))
}
