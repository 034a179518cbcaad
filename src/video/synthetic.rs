//! Synthetic frame source and counting sink for tests and demos.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};

use super::{FrameRate, FrameReader, FrameWriter, VideoInfo};
use crate::error::{DetectError, DetectResult};

const SYNTHETIC_WIDTH: u32 = 64;
const SYNTHETIC_HEIGHT: u32 = 48;
const SYNTHETIC_RATE: FrameRate = FrameRate::per_second(10);

/// Generates a fixed number of gradient frames.
pub struct SyntheticReader {
    info: VideoInfo,
    total: u64,
    produced: u64,
    read_error_at: Option<u64>,
}

impl SyntheticReader {
    pub fn new(total: u64, width: u32, height: u32, frame_rate: FrameRate) -> Self {
        Self {
            info: VideoInfo {
                width,
                height,
                frame_rate,
            },
            total,
            produced: 0,
            read_error_at: None,
        }
    }

    /// Parse the part after `stub://`: a frame count.
    pub fn from_spec(spec: &str) -> DetectResult<Self> {
        let total: u64 = spec.trim().parse().map_err(|_| {
            DetectError::SourceNotFound(format!("stub://{} (expected stub://<frames>)", spec))
        })?;
        Ok(Self::new(
            total,
            SYNTHETIC_WIDTH,
            SYNTHETIC_HEIGHT,
            SYNTHETIC_RATE,
        ))
    }

    /// Fail the read of the frame with this zero-based index.
    pub fn with_read_error_at(mut self, index: u64) -> Self {
        self.read_error_at = Some(index);
        self
    }

    fn render(&self, index: u64) -> RgbImage {
        RgbImage::from_fn(self.info.width, self.info.height, |x, y| {
            let v = ((x as u64 + y as u64 + index * 7) % 256) as u8;
            Rgb([v, v.wrapping_add(85), v.wrapping_add(170)])
        })
    }
}

impl FrameReader for SyntheticReader {
    fn info(&self) -> VideoInfo {
        self.info
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.read_error_at == Some(self.produced) {
            return Err(anyhow!("synthetic read error at frame {}", self.produced));
        }
        if self.produced >= self.total {
            return Ok(None);
        }
        let frame = self.render(self.produced);
        self.produced += 1;
        Ok(Some(frame))
    }
}

/// Sink that validates frame geometry and counts frames.
pub struct CountingWriter {
    info: VideoInfo,
    written: u64,
    finished: bool,
}

impl CountingWriter {
    pub fn new(info: VideoInfo) -> Self {
        Self {
            info,
            written: 0,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl FrameWriter for CountingWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        if self.finished {
            return Err(anyhow!("write after finish"));
        }
        if frame.dimensions() != (self.info.width, self.info.height) {
            return Err(anyhow!(
                "frame size {}x{} does not match stream {}x{}",
                frame.width(),
                frame.height(),
                self.info.width,
                self.info.height
            ));
        }
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.written
    }
}
