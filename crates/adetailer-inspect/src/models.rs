//! Model directory scanning.

use std::io;
use std::path::{Path, PathBuf};

use adetailer_pipeline::detect::CHECKPOINT_EXTENSION;
use tracing::debug;

/// List the checkpoint files directly inside `dir`, sorted by path.
///
/// A missing directory holds no checkpoints. Subdirectories are not
/// descended into.
///
/// # Errors
///
/// Returns the underlying I/O error when `dir` exists but cannot be read.
pub fn scan(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "model directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let mut found = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == CHECKPOINT_EXTENSION) {
            found.push(path);
        }
    }
    found.sort();
    debug!(dir = %dir.display(), checkpoints = found.len(), "scanned model directory");
    Ok(found)
}
