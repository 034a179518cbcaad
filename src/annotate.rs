//! Box and label overlays for processed frames.

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detect::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TAB_COLOR: Rgb<u8> = Rgb([0, 96, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const DEFAULT_FONT_PX: f32 = 16.0;
/// Tab width per character when no font is loaded.
const FALLBACK_CHAR_PX: u32 = 7;

/// Draws detection boxes and `"<category> <confidence>"` labels.
///
/// Without a font the label tab is drawn but left blank.
pub struct Annotator {
    font: Option<FontVec>,
    scale: PxScale,
    thickness: u32,
}

impl Annotator {
    pub fn new() -> Self {
        Self {
            font: None,
            scale: PxScale::from(DEFAULT_FONT_PX),
            thickness: 2,
        }
    }

    /// Load a TTF/OTF font for label text.
    pub fn with_font_file(mut self, path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|_| anyhow!("invalid font file {}", path.display()))?;
        self.font = Some(font);
        Ok(self)
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Return an annotated copy of `image`. The input is not modified.
    pub fn annotate(&self, image: &RgbImage, detections: &[Detection]) -> RgbImage {
        let mut canvas = image.clone();
        for det in detections {
            self.draw_box(&mut canvas, det);
            self.draw_label(&mut canvas, det);
        }
        canvas
    }

    fn draw_box(&self, canvas: &mut RgbImage, det: &Detection) {
        let bbox = det.bbox;
        for t in 0..self.thickness {
            let w = bbox.width().saturating_sub(2 * t);
            let h = bbox.height().saturating_sub(2 * t);
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at((bbox.x1 + t) as i32, (bbox.y1 + t) as i32).of_size(w, h);
            draw_hollow_rect_mut(canvas, rect, BOX_COLOR);
        }
    }

    fn draw_label(&self, canvas: &mut RgbImage, det: &Detection) {
        let text = format!("{} {:.2}", det.category, det.confidence);
        let (text_w, text_h) = match &self.font {
            Some(font) => text_size(self.scale, font, &text),
            None => (
                text.chars().count() as u32 * FALLBACK_CHAR_PX,
                DEFAULT_FONT_PX as u32,
            ),
        };
        let tab_w = text_w + 4;
        let tab_h = text_h + 4;

        // above the box when there is room, otherwise just inside it
        let x = det.bbox.x1 as i32;
        let y = if det.bbox.y1 >= tab_h {
            (det.bbox.y1 - tab_h) as i32
        } else {
            (det.bbox.y1 + self.thickness) as i32
        };

        draw_filled_rect_mut(canvas, Rect::at(x, y).of_size(tab_w, tab_h), TAB_COLOR);
        if let Some(font) = &self.font {
            draw_text_mut(canvas, TEXT_COLOR, x + 2, y + 2, self.scale, font, &text);
        }
    }
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new()
    }
}
