#![cfg(feature = "backend-tract")]

use std::cmp::Ordering;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;

/// Tuning for a YOLO-style ONNX model.
#[derive(Clone, Debug)]
pub struct TractSettings {
    /// Square model input edge in pixels.
    pub input_size: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    /// Class names indexed by class id. Missing ids become `class_<id>`.
    pub labels: Vec<String>,
}

impl Default for TractSettings {
    fn default() -> Self {
        Self {
            input_size: 640,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 100,
            labels: Vec::new(),
        }
    }
}

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a single `[1, 4 + classes, candidates]` output with boxes as
/// center/size in model-input pixels. Loads the model once; performs no
/// I/O after construction.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    settings: TractSettings,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, settings: TractSettings) -> Result<Self> {
        let model_path = model_path.as_ref();
        let edge = settings.input_size as usize;
        if edge == 0 {
            return Err(anyhow!("model input size must be greater than zero"));
        }
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, edge, edge)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, settings })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let edge = self.settings.input_size;
        let resized = image::imageops::resize(image, edge, edge, FilterType::Triangle);
        let edge = edge as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, edge, edge), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        input.into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, width: u32, height: u32) -> Result<Vec<RawDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        if view.ndim() != 3 || view.shape()[0] != 1 || view.shape()[1] <= 4 {
            return Err(anyhow!("unexpected output shape {:?}", view.shape()));
        }
        let view = view
            .index_axis(tract_ndarray::Axis(0), 0)
            .into_dimensionality::<tract_ndarray::Ix2>()?;

        let classes = view.shape()[0] - 4;
        let candidates = view.shape()[1];
        let sx = width as f32 / self.settings.input_size as f32;
        let sy = height as f32 / self.settings.input_size as f32;

        let mut kept: Vec<(usize, RawDetection)> = Vec::new();
        for i in 0..candidates {
            let (class_id, score) = (0..classes)
                .map(|c| (c, view[[4 + c, i]]))
                .fold((0usize, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if !score.is_finite() || score < self.settings.conf_threshold {
                continue;
            }
            let (cx, cy, w, h) = (view[[0, i]], view[[1, i]], view[[2, i]], view[[3, i]]);
            let bbox = [
                (cx - w / 2.0) * sx,
                (cy - h / 2.0) * sy,
                (cx + w / 2.0) * sx,
                (cy + h / 2.0) * sy,
            ];
            kept.push((
                class_id,
                RawDetection::new(self.label_for(class_id), score, bbox),
            ));
        }

        kept.sort_by(|a, b| {
            b.1.confidence
                .partial_cmp(&a.1.confidence)
                .unwrap_or(Ordering::Equal)
        });
        Ok(non_max_suppression(
            kept,
            self.settings.iou_threshold,
            self.settings.max_detections,
        ))
    }

    fn label_for(&self, class_id: usize) -> String {
        self.settings
            .labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, image.width(), image.height())
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.settings.input_size, self.settings.input_size);
        self.detect(&blank).map(|_| ())
    }
}

/// Greedy per-class NMS over confidence-sorted candidates.
fn non_max_suppression(
    sorted: Vec<(usize, RawDetection)>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<RawDetection> {
    let mut keep: Vec<(usize, RawDetection)> = Vec::new();
    for (class_id, candidate) in sorted {
        if keep.len() >= max_detections {
            break;
        }
        let overlaps = keep.iter().any(|(kept_class, kept)| {
            *kept_class == class_id && iou(&kept.bbox, &candidate.bbox) > iou_threshold
        });
        if !overlaps {
            keep.push((class_id, candidate));
        }
    }
    keep.into_iter().map(|(_, det)| det).collect()
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= f32::EPSILON {
        0.0
    } else {
        inter / union
    }
}
