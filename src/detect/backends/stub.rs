use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;

/// Scripted backend for tests and model-less runs.
///
/// Returns the same rows on every call. Calls whose zero-based index is in
/// `fail_on` return an error instead, which lets tests exercise per-frame
/// failure handling.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    rows: Vec<RawDetection>,
    fail_on: Vec<u64>,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<RawDetection>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    /// Fail the call with the given zero-based index.
    pub fn failing_on(mut self, call_index: u64) -> Self {
        self.fail_on.push(call_index);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<RawDetection>> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on.contains(&call) {
            return Err(anyhow!("scripted failure on call {}", call));
        }
        Ok(self.rows.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_backend_replays_rows_and_fails_on_request() {
        let row = RawDetection::new("pothole", 0.9, [1.0, 1.0, 4.0, 4.0]);
        let mut backend = StubBackend::with_rows(vec![row.clone()]).failing_on(1);
        let image = RgbImage::new(8, 8);

        assert_eq!(backend.detect(&image).unwrap(), vec![row.clone()]);
        assert!(backend.detect(&image).is_err());
        assert_eq!(backend.detect(&image).unwrap(), vec![row]);
        assert_eq!(backend.calls(), 3);
    }
}
