//! Orchestration entry point used by the HTTP layer and the CLI.
//!
//! Every successful unit of work publishes to the stats aggregator exactly
//! once, after processing and before returning. Failures never publish.

use std::sync::Arc;

use image::RgbImage;
use serde::Serialize;

use crate::annotate::Annotator;
use crate::detect::{BackendRegistry, Detection};
use crate::error::DetectResult;
use crate::model::ModelType;
use crate::pipeline::{decode_image, DetectionPipeline, FrameResult};
use crate::stats::{GeoPoint, LocationEvent, StatsAggregator, StatsSnapshot};
use crate::video::{open_reader, open_writer, CancelToken, VideoProcessor};

/// Result of one video job.
#[derive(Clone, Debug, Serialize)]
pub struct VideoSummary {
    pub output_path: String,
    pub frames_read: u64,
    pub frames_processed: u64,
    pub frames_written: u64,
    pub frames_skipped: u64,
    pub rows_skipped: u64,
    pub detections: Vec<Detection>,
}

pub struct DetectionService {
    pipeline: Arc<DetectionPipeline>,
    videos: VideoProcessor,
    stats: Arc<StatsAggregator>,
}

impl DetectionService {
    pub fn new(
        registry: Arc<BackendRegistry>,
        annotator: Arc<Annotator>,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        let pipeline = Arc::new(DetectionPipeline::new(registry, annotator));
        Self {
            videos: VideoProcessor::new(Arc::clone(&pipeline)),
            pipeline,
            stats,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        self.pipeline.registry()
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn handle_image(
        &self,
        image: &RgbImage,
        model: ModelType,
        location: Option<GeoPoint>,
    ) -> DetectResult<FrameResult> {
        let result = self.pipeline.process(image, model)?;
        self.stats.publish(model, &result.detections, location);
        log::info!(
            "service: image processed with {} ({} detections)",
            model,
            result.detections.len()
        );
        Ok(result)
    }

    /// Decode an encoded image, then handle it. An unregistered model fails
    /// before any decoding work.
    pub fn handle_image_bytes(
        &self,
        bytes: &[u8],
        model: ModelType,
        location: Option<GeoPoint>,
    ) -> DetectResult<FrameResult> {
        self.registry().get(model)?;
        let image = decode_image(bytes)?;
        self.handle_image(&image, model, location)
    }

    /// Process the video at `input` into `output`.
    pub fn handle_video(
        &self,
        input: &str,
        output: &str,
        model: ModelType,
        location: Option<GeoPoint>,
        cancel: &CancelToken,
    ) -> DetectResult<VideoSummary> {
        self.registry().get(model)?;
        let mut reader = open_reader(input)?;
        let outcome = self.videos.run(
            reader.as_mut(),
            |info| open_writer(output, info),
            model,
            cancel,
        )?;

        self.stats.publish(model, &outcome.detections, location);
        log::info!(
            "service: video {} -> {} with {} ({} detections)",
            input,
            output,
            model,
            outcome.detections.len()
        );
        Ok(VideoSummary {
            output_path: output.to_string(),
            frames_read: outcome.frames_read,
            frames_processed: outcome.frames_processed,
            frames_written: outcome.frames_written,
            frames_skipped: outcome.frames_skipped,
            rows_skipped: outcome.rows_skipped,
            detections: outcome.detections,
        })
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn locations(&self) -> Vec<LocationEvent> {
        self.stats.locations()
    }
}
