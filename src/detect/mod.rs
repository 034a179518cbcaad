mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::{TractBackend, TractSettings};
pub use registry::{BackendRegistry, SharedBackend};
pub use result::{BoundingBox, Detection, RawDetection};
