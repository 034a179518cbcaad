use serde::Serialize;

use crate::model::ModelType;

/// One row as emitted by a detector backend, before validation.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub category: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in source pixel coordinates.
    pub bbox: [f32; 4],
}

impl RawDetection {
    pub fn new(category: impl Into<String>, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            category: category.into(),
            confidence,
            bbox,
        }
    }

    /// Rows with a non-finite box or a confidence outside `[0, 1]` cannot be
    /// turned into a `Detection`.
    pub fn is_parsable(&self) -> bool {
        self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
            && self.bbox.iter().all(|v| v.is_finite())
    }
}

/// Integer pixel box with `x1 <= x2 <= width` and `y1 <= y2 <= height`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    /// Clip a raw box to the image extent.
    ///
    /// Out-of-range coordinates are clamped rather than rejected, and
    /// swapped corners are re-ordered. Callers must pass finite values.
    pub fn clamped(raw: [f32; 4], width: u32, height: u32) -> Self {
        let clamp = |v: f32, max: u32| -> u32 { v.round().clamp(0.0, max as f32) as u32 };
        let (ax, bx) = (clamp(raw[0], width), clamp(raw[2], width));
        let (ay, by) = (clamp(raw[1], height), clamp(raw[3], height));
        Self {
            x1: ax.min(bx),
            y1: ay.min(by),
            x2: ax.max(bx),
            y2: ay.max(by),
        }
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn to_array(self) -> [u32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// A validated, label-mapped detection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub category: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub model: ModelType,
}
