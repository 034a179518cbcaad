//! Error taxonomy for the detection core.
//!
//! Every failure the core can surface maps to exactly one variant. `kind()`
//! gives the stable name used in API payloads and logs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unknown model type: {0}")]
    UnknownModel(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("video source not found: {0}")]
    SourceNotFound(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("detector failure: {0}")]
    DetectorFailure(String),

    #[error("job cancelled after {frames} frames")]
    Cancelled { frames: u64 },

    #[error("i/o failure: {0}")]
    Io(String),
}

impl DetectError {
    pub fn kind(&self) -> &'static str {
        match self {
            DetectError::UnknownModel(_) => "unknown_model",
            DetectError::InvalidImage(_) => "invalid_image",
            DetectError::SourceNotFound(_) => "source_not_found",
            DetectError::UnsupportedCodec(_) => "unsupported_codec",
            DetectError::DetectorFailure(_) => "detector_failure",
            DetectError::Cancelled { .. } => "cancelled",
            DetectError::Io(_) => "io",
        }
    }

    /// Caller errors are never retried and never publish.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            DetectError::UnknownModel(_)
                | DetectError::InvalidImage(_)
                | DetectError::SourceNotFound(_)
        )
    }
}

impl From<std::io::Error> for DetectError {
    fn from(err: std::io::Error) -> Self {
        DetectError::Io(err.to_string())
    }
}

pub type DetectResult<T> = Result<T, DetectError>;
