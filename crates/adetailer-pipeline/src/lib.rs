//! adetailer-pipeline: detection-to-sequential-inpainting orchestration (sans-IO).
//!
//! Given a rendered image and an ordered list of stage arguments, the
//! pipeline locates regions of interest with a detector, reshapes the
//! resulting masks and regenerates each region in turn, feeding every
//! job's output into the next:
//!
//! stage args -> detect -> mask transform -> regeneration job (per mask) -> engine
//!
//! This crate has **no I/O dependencies**. Detection backends, the
//! regeneration engine and image storage are traits implemented by the
//! caller; model directory scanning lives in `adetailer-inspect`.

pub mod args;
pub mod detect;
pub mod diagnostics;
pub mod job;
pub mod mask;
pub mod pipeline;
pub mod settings;
pub mod types;

pub use args::{ArgsError, StageArgs, parse_request};
pub use detect::{
    DetectError, DetectionResult, DetectorGateway, Device, HostProfile, LandmarkDetector,
    LoadOptions, ModelHandle, ModelRegistry, ObjectDetector,
};
pub use diagnostics::ImageReport;
pub use job::{JobBuilder, JobContext, RegenerationJob};
pub use mask::MaskTransform;
pub use pipeline::{
    NullSink, Orchestrator, OutputSink, ProcessedImage, RegenerationEngine, Regenerated,
    SaveRequest, annotate,
};
pub use settings::{Settings, SettingsError};
pub use types::{BackendError, BoundingBox, Dimensions, GrayImage, PipelineError, RgbImage};

/// Version string recorded in generation metadata.
#[must_use]
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
