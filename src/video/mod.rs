//! Sequential video decode/encode and the per-frame processing loop.
//!
//! Sources and sinks work one frame at a time:
//! - Local video files (feature: video-ffmpeg)
//! - Synthetic `stub://<frames>` sources for tests and demos
//!
//! Nothing in this module buffers a whole video. A reader yields one decoded
//! frame per call and a writer encodes one frame per call.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;

use crate::error::{DetectError, DetectResult};

#[cfg(feature = "video-ffmpeg")]
mod ffmpeg;
mod processor;
mod synthetic;

pub use processor::{VideoOutcome, VideoProcessor};
pub use synthetic::{CountingWriter, SyntheticReader};

const STUB_SCHEME: &str = "stub://";

/// Frame rate as an exact ratio, so 30000/1001 survives a decode/encode
/// round trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    /// A zero numerator or denominator is not a rate; callers fall back.
    pub fn new(num: u32, den: u32) -> Option<Self> {
        (num > 0 && den > 0).then_some(Self { num, den })
    }

    pub const fn per_second(fps: u32) -> Self {
        Self { num: fps, den: 1 }
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.num) / f64::from(self.den)
    }
}

/// Stream properties shared by a reader and the writer it feeds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
}

impl VideoInfo {
    pub fn fps(&self) -> f64 {
        self.frame_rate.as_f64()
    }
}

/// Sequential frame source.
pub trait FrameReader {
    fn info(&self) -> VideoInfo;

    /// Decode the next frame. `Ok(None)` marks end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// Sequential frame sink.
pub trait FrameWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Flush buffered output and finalize the container.
    fn finish(&mut self) -> Result<()>;

    fn frames_written(&self) -> u64;
}

/// Cooperative cancellation flag, checked once per frame.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Open a frame reader for a local path or a `stub://` source.
pub fn open_reader(path: &str) -> DetectResult<Box<dyn FrameReader>> {
    if let Some(spec) = path.strip_prefix(STUB_SCHEME) {
        return Ok(Box::new(SyntheticReader::from_spec(spec)?));
    }
    if !is_local_file_path(path) {
        return Err(DetectError::SourceNotFound(format!(
            "{} (only local files are supported)",
            path
        )));
    }
    if !Path::new(path).is_file() {
        return Err(DetectError::SourceNotFound(path.to_string()));
    }
    #[cfg(feature = "video-ffmpeg")]
    {
        let reader = ffmpeg::FfmpegReader::open(path)
            .map_err(|e| DetectError::UnsupportedCodec(format!("{}: {:#}", path, e)))?;
        Ok(Box::new(reader))
    }
    #[cfg(not(feature = "video-ffmpeg"))]
    {
        Err(DetectError::UnsupportedCodec(
            "video decoding requires the video-ffmpeg feature".to_string(),
        ))
    }
}

/// Open a frame writer matching `info`. `stub://` paths count frames only.
pub fn open_writer(path: &str, info: VideoInfo) -> DetectResult<Box<dyn FrameWriter>> {
    if path.starts_with(STUB_SCHEME) {
        return Ok(Box::new(CountingWriter::new(info)));
    }
    #[cfg(feature = "video-ffmpeg")]
    {
        let writer = ffmpeg::FfmpegWriter::create(path, info)
            .map_err(|e| DetectError::Io(format!("open output {}: {:#}", path, e)))?;
        Ok(Box::new(writer))
    }
    #[cfg(not(feature = "video-ffmpeg"))]
    {
        let _ = info;
        Err(DetectError::UnsupportedCodec(
            "video encoding requires the video-ffmpeg feature".to_string(),
        ))
    }
}

fn is_local_file_path(path: &str) -> bool {
    !path.trim().is_empty() && !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_source_not_found() {
        let err = open_reader("/definitely/not/here.mp4").err().unwrap();
        assert_eq!(err.kind(), "source_not_found");
    }

    #[test]
    fn remote_urls_are_rejected() {
        let err = open_reader("rtsp://camera/stream").err().unwrap();
        assert_eq!(err.kind(), "source_not_found");
    }

    #[test]
    fn stub_reader_and_writer_open() {
        let reader = open_reader("stub://3").unwrap();
        let info = reader.info();
        assert_eq!((info.width, info.height), (64, 48));
        let writer = open_writer("stub://out", info).unwrap();
        assert_eq!(writer.frames_written(), 0);
    }

    #[test]
    fn frame_rate_keeps_ntsc_ratio() {
        let rate = FrameRate::new(30000, 1001).unwrap();
        assert!((rate.as_f64() - 29.97).abs() < 0.001);
        assert_ne!(rate, FrameRate::per_second(30));
        assert!(FrameRate::new(0, 1).is_none());
        assert!(FrameRate::new(25, 0).is_none());
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }
}
