use anyhow::Result;
use image::RgbImage;

use crate::detect::result::RawDetection;

/// Detector backend trait.
///
/// One backend instance serves one domain model. The registry wraps each
/// instance in a `Mutex`, so implementations may keep per-instance scratch
/// state and need not be `Sync`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one RGB image.
    ///
    /// Rows are returned in the model's emission order with boxes in source
    /// pixel coordinates. Implementations must treat the image as read-only.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
