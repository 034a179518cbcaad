//! Single-image detection pipeline.
//!
//! Runs the registered backend for a model over one image, validates and
//! clamps the raw rows, maps labels, and draws the overlay onto a copy.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use image::RgbImage;

use crate::annotate::Annotator;
use crate::detect::{BackendRegistry, BoundingBox, Detection, RawDetection};
use crate::error::{DetectError, DetectResult};
use crate::labels::map_label;
use crate::model::ModelType;

/// Output of one pipeline run. Not retained past the caller.
#[derive(Clone, Debug)]
pub struct FrameResult {
    pub annotated: RgbImage,
    /// Detections in backend emission order.
    pub detections: Vec<Detection>,
    /// Raw rows dropped because they could not be parsed.
    pub skipped: usize,
}

pub struct DetectionPipeline {
    registry: Arc<BackendRegistry>,
    annotator: Arc<Annotator>,
}

impl DetectionPipeline {
    pub fn new(registry: Arc<BackendRegistry>, annotator: Arc<Annotator>) -> Self {
        Self {
            registry,
            annotator,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Process one decoded image.
    pub fn process(&self, image: &RgbImage, model: ModelType) -> DetectResult<FrameResult> {
        let backend = self.registry.get(model)?;
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectError::InvalidImage(format!(
                "zero-dimension image {}x{}",
                width, height
            )));
        }

        let rows = {
            // Poison only records an earlier panic; the backend is reused.
            let mut guard = backend
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let name = guard.name();
            match panic::catch_unwind(AssertUnwindSafe(|| guard.detect(image))) {
                Ok(Ok(rows)) => rows,
                Ok(Err(e)) => {
                    return Err(DetectError::DetectorFailure(format!("{}: {:#}", name, e)))
                }
                Err(payload) => {
                    return Err(DetectError::DetectorFailure(format!(
                        "{} panicked: {}",
                        name,
                        panic_message(payload.as_ref())
                    )))
                }
            }
        };

        let (detections, skipped) = normalize_rows(model, rows, width, height);
        if skipped > 0 {
            log::debug!("pipeline: {} skipped {} unparsable rows", model, skipped);
        }
        let annotated = self.annotator.annotate(image, &detections);

        Ok(FrameResult {
            annotated,
            detections,
            skipped,
        })
    }
}

/// Validate, clamp and label raw backend rows.
///
/// Returns the detections in input order and the number of rows dropped.
pub fn normalize_rows(
    model: ModelType,
    rows: Vec<RawDetection>,
    width: u32,
    height: u32,
) -> (Vec<Detection>, usize) {
    let total = rows.len();
    let detections: Vec<Detection> = rows
        .into_iter()
        .filter(RawDetection::is_parsable)
        .map(|row| Detection {
            category: map_label(model, &row.category),
            confidence: row.confidence,
            bbox: BoundingBox::clamped(row.bbox, width, height),
            model,
        })
        .collect();
    let skipped = total - detections.len();
    (detections, skipped)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

/// Decode an encoded image (JPEG, PNG, ...) into RGB.
pub fn decode_image(bytes: &[u8]) -> DetectResult<RgbImage> {
    if bytes.is_empty() {
        return Err(DetectError::InvalidImage("empty image buffer".to_string()));
    }
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| DetectError::InvalidImage(e.to_string()))?
        .to_rgb8();
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(DetectError::InvalidImage("zero-dimension image".to_string()));
    }
    Ok(decoded)
}
