//! Roadwatch detection service
//!
//! Turns images and videos into structured detection events for two domain
//! models (traffic violations and potholes) and aggregates them into live
//! counters, a recent-events window and a geo-tagged event feed.
//!
//! # Module Structure
//!
//! - `detect`: detector backends, the backend registry, detection types
//! - `labels`: raw class name to display category mapping
//! - `pipeline`: single-image detect, normalize and annotate
//! - `video`: sequential frame readers/writers and the per-frame loop
//! - `stats`: concurrency-safe counters, recent events and locations
//! - `service`: the orchestration entry point used by the API and CLI
//! - `api`: HTTP surface over the service
//! - `config`: file and environment configuration

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod labels;
pub mod model;
pub mod pipeline;
pub mod service;
pub mod stats;
pub mod video;

pub use annotate::Annotator;
pub use detect::{BackendRegistry, BoundingBox, Detection, DetectorBackend, RawDetection, StubBackend};
pub use error::{DetectError, DetectResult};
pub use model::ModelType;
pub use pipeline::{DetectionPipeline, FrameResult};
pub use service::{DetectionService, VideoSummary};
pub use stats::{DetectionEvent, GeoPoint, LocationEvent, StatsAggregator, StatsSnapshot};
pub use video::{CancelToken, FrameRate, VideoInfo};
