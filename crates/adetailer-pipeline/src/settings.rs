//! Host-level detailer settings.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::args::StageArgs;
use crate::detect::ModelRegistry;

/// Errors from [`Settings::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    /// `max_models` lies outside [`Settings::MAX_MODELS_RANGE`].
    #[error("max_models must be between {min} and {max}, got {value}")]
    MaxModelsOutOfRange {
        value: u8,
        min: u8,
        max: u8,
    },
}

/// Configuration surface shared by every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Number of stages offered to the user.
    pub max_models: u8,
    /// Save each stage's detection preview.
    pub save_previews: bool,
    /// Save the image as it was before any stage regenerated it.
    pub save_images_before: bool,
    /// Restrict sub-jobs to the extensions in `extension_names`.
    pub only_selected_extensions: bool,
    /// Comma-separated extension allow-list.
    pub extension_names: String,
}

impl Settings {
    pub const DEFAULT_MAX_MODELS: u8 = 2;
    pub const MAX_MODELS_RANGE: RangeInclusive<u8> = 1..=5;
    pub const DEFAULT_EXTENSION_NAMES: &str =
        "dynamic_prompting,dynamic_thresholding,wildcards,wildcard_recursive";

    /// Check every field against its declared range.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::MaxModelsOutOfRange`] when `max_models`
    /// is outside `1..=5`.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !Self::MAX_MODELS_RANGE.contains(&self.max_models) {
            return Err(SettingsError::MaxModelsOutOfRange {
                value: self.max_models,
                min: *Self::MAX_MODELS_RANGE.start(),
                max: *Self::MAX_MODELS_RANGE.end(),
            });
        }
        Ok(())
    }

    /// Extension names a sub-job may keep, or `None` when filtering is off.
    ///
    /// Each comma-separated entry contributes both its raw and its
    /// whitespace-trimmed spelling; blank entries are ignored.
    #[must_use]
    pub fn allowed_extensions(&self) -> Option<Vec<String>> {
        if !self.only_selected_extensions {
            return None;
        }
        let mut names = Vec::new();
        for raw in self.extension_names.split(',') {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            for name in [raw, trimmed] {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        Some(names)
    }

    /// Initial stage list: the first registry model, then skipped stages.
    #[must_use]
    pub fn default_stages(&self, registry: &ModelRegistry) -> Vec<StageArgs> {
        (0..self.max_models)
            .map(|n| match registry.first() {
                Some(model) if n == 0 => StageArgs::with_model(model.name()),
                _ => StageArgs::default(),
            })
            .collect()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_models: Self::DEFAULT_MAX_MODELS,
            save_previews: false,
            save_images_before: false,
            only_selected_extensions: true,
            extension_names: Self::DEFAULT_EXTENSION_NAMES.to_string(),
        }
    }
}
