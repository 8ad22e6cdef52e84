//! Per-image run reports and best-effort side effects.
//!
//! Every call to [`Orchestrator::process_image`](crate::Orchestrator::process_image)
//! returns an [`ImageReport`] alongside the final image: what each stage
//! detected and which seeds its regeneration jobs used. Reports are
//! serializable so callers can log them as JSON, or render them with
//! [`ImageReport::report`].

use serde::{Deserialize, Serialize};
use tracing::warn;

/// What happened to one source image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReport {
    /// 0-based index of the image within its request.
    pub image_index: usize,
    /// One entry per stage, in stage order.
    pub stages: Vec<StageReport>,
    /// Whether any region was regenerated.
    pub changed: bool,
}

/// What happened in one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// `1st`, `2nd`, ...
    pub ordinal: String,
    pub model: String,
    pub outcome: StageOutcome,
}

/// Outcome of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOutcome {
    /// The stage selected no model.
    Skipped,
    /// Detection ran but no mask survived processing.
    NothingDetected,
    /// One regeneration job was issued per mask.
    Regenerated {
        /// Jobs in issue order.
        jobs: Vec<JobRecord>,
    },
}

/// Seeds of one issued regeneration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub seed: i64,
    pub subseed: i64,
}

impl StageReport {
    /// Number of masks regenerated by this stage.
    #[must_use]
    pub fn mask_count(&self) -> usize {
        match &self.outcome {
            StageOutcome::Regenerated { jobs } => jobs.len(),
            StageOutcome::Skipped | StageOutcome::NothingDetected => 0,
        }
    }
}

impl ImageReport {
    /// Total regeneration jobs issued for this image.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.stages.iter().map(StageReport::mask_count).sum()
    }

    /// Format the report as a human-readable table.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!(
            "Detailer Report: image {}\n{}",
            self.image_index + 1,
            "=".repeat(60)
        ));
        lines.push(format!(
            "{:<8} {:<28} {:>6}  {}",
            "Stage", "Model", "Masks", "Details"
        ));
        lines.push("-".repeat(60));

        for stage in &self.stages {
            let details = match &stage.outcome {
                StageOutcome::Skipped => "skipped".to_string(),
                StageOutcome::NothingDetected => "nothing detected".to_string(),
                StageOutcome::Regenerated { jobs } => jobs
                    .iter()
                    .map(|j| format!("seed={} subseed={}", j.seed, j.subseed))
                    .collect::<Vec<_>>()
                    .join(", "),
            };
            lines.push(format!(
                "{:<8} {:<28} {:>6}  {details}",
                stage.ordinal,
                stage.model,
                stage.mask_count()
            ));
        }

        lines.push(String::new());
        lines.push(format!(
            "Jobs: {}  |  Changed: {}",
            self.job_count(),
            if self.changed { "yes" } else { "no" }
        ));

        lines.join("\n")
    }
}

/// Run a side effect whose failure must not abort processing.
///
/// On error, logs a warning naming `operation` and discards the error.
/// Returns whether the operation succeeded.
pub fn best_effort<E: std::fmt::Display>(operation: &str, result: Result<(), E>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(operation, error = %e, "best-effort operation failed");
            false
        }
    }
}
