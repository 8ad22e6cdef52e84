//! Shared types for the detailing pipeline.

use serde::{Deserialize, Serialize};

use crate::args::ArgsError;
use crate::detect::DetectError;

/// Re-export `GrayImage` so downstream crates can build masks without
/// depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbImage`: the working image threaded through every
/// regeneration sub-job.
pub use image::RgbImage;

/// Failure reported by an external collaborator (detector backend,
/// regeneration engine, output sink).
///
/// The pipeline never inspects or wraps these; they reach the caller as-is.
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Dimensions of a mask or image buffer.
    #[must_use]
    pub fn of<P: image::Pixel>(image: &image::ImageBuffer<P, Vec<P::Subpixel>>) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
        }
    }
}

/// Axis-aligned detection box in pixel coordinates, `(x0, y0)` inclusive
/// top-left to `(x1, y1)` exclusive bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    #[must_use]
    pub const fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }
}

/// Errors that abort processing of the current source image.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Stage arguments failed validation.
    #[error(transparent)]
    Args(#[from] ArgsError),

    /// A stage selected a model the registry does not know.
    #[error(transparent)]
    Detect(#[from] DetectError),

    /// The detector backend failed.
    #[error(transparent)]
    Detector(BackendError),

    /// The regeneration engine failed.
    #[error(transparent)]
    Engine(BackendError),

    /// Saving a preview or before-image failed.
    #[error(transparent)]
    Sink(BackendError),

    /// The regeneration engine succeeded but returned no image.
    #[error("regeneration engine returned no image for the {ordinal} stage, mask {mask}")]
    EmptyEngineOutput {
        /// Ordinal of the stage (`"1st"`, `"2nd"`, ...).
        ordinal: String,
        /// 1-based mask position within the stage.
        mask: usize,
    },
}
