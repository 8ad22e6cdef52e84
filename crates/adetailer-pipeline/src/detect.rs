//! Detector gateway: one call contract over two detection backends.
//!
//! Models whose name starts with [`LANDMARK_PREFIX`] are served by a
//! geometric-landmark backend that runs on the CPU and needs no loaded
//! checkpoint. Every other name is looked up in the [`ModelRegistry`] and
//! served by a generic object detector, which additionally receives the
//! device to run on and the checkpoint [`LoadOptions`].
//!
//! # Strategy pattern
//!
//! Both backends are traits so the inference runtime stays outside this
//! crate. The gateway only routes, converts the confidence percentage to a
//! fraction, and logs. Backend failures are returned untouched; there is
//! no retry.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{BackendError, GrayImage, RgbImage};

/// Name prefix (case-insensitive) that routes to the landmark backend.
pub const LANDMARK_PREFIX: &str = "mediapipe";

/// Landmark models that are always available.
pub const LANDMARK_MODELS: [&str; 2] = ["mediapipe_face_full", "mediapipe_face_short"];

/// File extension of object-detector checkpoints picked up by a scan.
pub const CHECKPOINT_EXTENSION: &str = "pt";

/// Normalized output of one detector invocation.
#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    /// Per-instance binary masks, same dimensions as the source image.
    /// The confidence threshold has already been applied.
    pub masks: Vec<GrayImage>,
    /// Optional visualization of the detections.
    pub preview: Option<RgbImage>,
}

/// Lookup failures raised by the gateway itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DetectError {
    /// The requested model is not in the registry.
    #[error("model {name:?} not found; available models: {available:?}")]
    ModelNotFound {
        /// The requested name.
        name: String,
        /// Every registered name, in registry order.
        available: Vec<String>,
    },
}

/// Where a registered model comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelSource {
    /// Built into the landmark backend.
    Landmark,
    /// A checkpoint file loaded by the object backend.
    Checkpoint(PathBuf),
}

/// Handle to a registered detection model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelHandle {
    name: String,
    source: ModelSource,
}

impl ModelHandle {
    /// Human-readable model name, e.g. `face_yolov8n.pt`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn source(&self) -> &ModelSource {
        &self.source
    }

    /// Checkpoint path, or `None` for landmark models.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            ModelSource::Landmark => None,
            ModelSource::Checkpoint(p) => Some(p),
        }
    }
}

/// Read-only mapping from model name to [`ModelHandle`].
///
/// Built once at startup and shared by reference afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRegistry {
    models: Vec<ModelHandle>,
}

impl ModelRegistry {
    /// Registry holding the landmark models followed by `checkpoints`.
    ///
    /// Checkpoints are named by file name and sorted by it; only files
    /// with the [`CHECKPOINT_EXTENSION`] are kept. A later checkpoint with
    /// an already-registered name is ignored.
    #[must_use]
    pub fn new(checkpoints: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut files: Vec<(String, PathBuf)> = checkpoints
            .into_iter()
            .filter(|p| p.extension().is_some_and(|e| e == CHECKPOINT_EXTENSION))
            .filter_map(|p| {
                let name = p.file_name()?.to_str()?.to_string();
                Some((name, p))
            })
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut models: Vec<ModelHandle> = LANDMARK_MODELS
            .iter()
            .map(|name| ModelHandle {
                name: (*name).to_string(),
                source: ModelSource::Landmark,
            })
            .collect();
        for (name, path) in files {
            if models.iter().any(|m| m.name == name) {
                continue;
            }
            models.push(ModelHandle {
                name,
                source: ModelSource::Checkpoint(path),
            });
        }

        info!(
            version = crate::version(),
            models = models.len(),
            "detailer initialized"
        );
        Self { models }
    }

    /// Look up a model by name.
    ///
    /// # Errors
    ///
    /// Returns [`DetectError::ModelNotFound`] listing every registered
    /// name when `name` is unknown.
    pub fn get(&self, name: &str) -> Result<&ModelHandle, DetectError> {
        self.models
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| DetectError::ModelNotFound {
                name: name.to_string(),
                available: self.names().map(str::to_string).collect(),
            })
    }

    /// Registered names in registry order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.name.as_str())
    }

    #[must_use]
    pub fn first(&self) -> Option<&ModelHandle> {
        self.models.first()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Whether `name` is served by the landmark backend.
#[must_use]
pub fn is_landmark_model(name: &str) -> bool {
    name.get(..LANDMARK_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(LANDMARK_PREFIX))
}

/// Device the object backend should run on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Device {
    /// Let the backend pick.
    #[default]
    Auto,
    /// Force the CPU.
    Cpu,
    /// A backend-specific device string such as `cuda:1`.
    Named(String),
}

impl Device {
    /// Backend spelling: the empty string means auto-detect.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Auto => "",
            Self::Cpu => "cpu",
            Self::Named(name) => name,
        }
    }

    /// Device policy for a host.
    ///
    /// macOS hosts always auto-detect. Elsewhere, constrained-memory
    /// configurations force the CPU.
    #[must_use]
    pub const fn for_host(host: &HostProfile) -> Self {
        if host.low_memory && !host.macos {
            Self::Cpu
        } else {
            Self::Auto
        }
    }
}

/// The facts about the host that drive [`Device::for_host`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostProfile {
    /// Running on macOS.
    pub macos: bool,
    /// The host runs its models in a low- or medium-VRAM mode.
    pub low_memory: bool,
}

impl HostProfile {
    /// Profile of the current process given the host's memory mode.
    #[must_use]
    pub const fn current(low_memory: bool) -> Self {
        Self {
            macos: cfg!(target_os = "macos"),
            low_memory,
        }
    }
}

/// How the object backend may deserialize checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Allow checkpoint formats that can execute code on load. Registry
    /// checkpoints come from the local model directory, so this defaults
    /// to `true`.
    pub trust_checkpoints: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            trust_checkpoints: true,
        }
    }
}

/// Geometric-landmark detection backend.
pub trait LandmarkDetector {
    /// Detect regions with `model` on `image`, keeping instances whose
    /// confidence is at least `confidence` (0.0–1.0).
    ///
    /// # Errors
    ///
    /// Any backend failure; it is propagated unchanged.
    fn detect(
        &self,
        model: &str,
        image: &RgbImage,
        confidence: f32,
    ) -> Result<DetectionResult, BackendError>;
}

/// Generic object detection backend.
pub trait ObjectDetector {
    /// Detect regions with the checkpoint behind `model` on `image`,
    /// keeping instances whose confidence is at least `confidence`
    /// (0.0–1.0).
    ///
    /// # Errors
    ///
    /// Any backend failure; it is propagated unchanged.
    fn detect(
        &self,
        model: &ModelHandle,
        image: &RgbImage,
        confidence: f32,
        device: &Device,
        options: LoadOptions,
    ) -> Result<DetectionResult, BackendError>;
}

/// Failure of a single [`DetectorGateway::detect`] call.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Unknown model name.
    #[error(transparent)]
    Lookup(#[from] DetectError),
    /// The backend itself failed.
    #[error(transparent)]
    Backend(BackendError),
}

/// Routes detection requests to the right backend.
#[derive(Clone, Copy)]
pub struct DetectorGateway<'a> {
    registry: &'a ModelRegistry,
    landmark: &'a dyn LandmarkDetector,
    object: &'a dyn ObjectDetector,
    device: &'a Device,
    options: LoadOptions,
}

impl<'a> DetectorGateway<'a> {
    #[must_use]
    pub fn new(
        registry: &'a ModelRegistry,
        landmark: &'a dyn LandmarkDetector,
        object: &'a dyn ObjectDetector,
        device: &'a Device,
    ) -> Self {
        Self {
            registry,
            landmark,
            object,
            device,
            options: LoadOptions::default(),
        }
    }

    /// Replace the checkpoint load options handed to the object backend.
    #[must_use]
    pub const fn with_load_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub const fn registry(&self) -> &'a ModelRegistry {
        self.registry
    }

    /// Run detection with `model` at `confidence` percent (0–100).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Lookup`] for an unregistered object model
    /// and [`GatewayError::Backend`] with the backend's own error when
    /// detection fails.
    pub fn detect(
        &self,
        model: &str,
        image: &RgbImage,
        confidence: f64,
    ) -> Result<DetectionResult, GatewayError> {
        #[allow(clippy::cast_possible_truncation)]
        let fraction = (confidence / 100.0) as f32;

        let result = if is_landmark_model(model) {
            let result = self
                .landmark
                .detect(model, image, fraction)
                .map_err(GatewayError::Backend)?;
            info!(model, detected = result.masks.len(), "landmark detection");
            result
        } else {
            let handle = self.registry.get(model)?;
            debug!(
                model,
                device = self.device.as_str(),
                trust_checkpoints = self.options.trust_checkpoints,
                "object detection"
            );
            self.object
                .detect(handle, image, fraction, self.device, self.options)
                .map_err(GatewayError::Backend)?
        };
        Ok(result)
    }
}
