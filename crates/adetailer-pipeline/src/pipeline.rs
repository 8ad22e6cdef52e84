//! Orchestrator: detection, mask processing and sequential regeneration
//! for one source image at a time.
//!
//! ```text
//! Idle ──advance index──▶ Stage(n) ──detect──▶ Mask(n, j) ──engine──▶ Mask(n, j+1)
//!                            ▲   │ nothing / skipped                     │
//!                            │   ▼                                       │
//!                            └── Stage(n+1) ◀────────── last mask ───────┘
//!                                    │ last stage
//!                                    ▼
//!                                  Done
//! ```
//!
//! The working image is owned by the call: each job starts from the
//! previous job's first output image, so regions regenerated by earlier
//! masks and stages are visible to later ones. Within a stage, mask `j`
//! uses the image's base seed plus `j`; every stage starts again from the
//! base seed.
//!
//! Detector and engine failures abort the image and are returned to the
//! caller unchanged. Only the diagnostic parameter summary is
//! best-effort.

use tracing::{debug, info};

use crate::args::{self, StageArgs};
use crate::detect::{DetectorGateway, GatewayError};
use crate::diagnostics::{self, ImageReport, JobRecord, StageOutcome, StageReport};
use crate::job::{JobBuilder, JobContext, RegenerationJob};
use crate::mask::MaskTransform;
use crate::settings::Settings;
use crate::types::{BackendError, PipelineError, RgbImage};

/// Suffix of saved detection previews.
pub const PREVIEW_SUFFIX: &str = "-ad-preview";

/// Suffix of the saved pre-detailing snapshot.
pub const BEFORE_SUFFIX: &str = "-ad-before";

// ───────────────────────── Collaborators ──────────────────────────

/// Output of one regeneration job.
#[derive(Debug, Clone, Default)]
pub struct Regenerated {
    /// Generated images; only the first is used.
    pub images: Vec<RgbImage>,
}

/// The image-generation engine that runs inpainting jobs.
pub trait RegenerationEngine {
    /// Run one job.
    ///
    /// Implementations must honor [`RegenerationJob::skip_detailer`] and
    /// never route the job back through a detailer.
    ///
    /// # Errors
    ///
    /// Any engine failure; it aborts the current image unchanged.
    fn regenerate(&mut self, job: RegenerationJob) -> Result<Regenerated, BackendError>;
}

/// Which snapshot a [`SaveRequest`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    /// A stage's detection preview.
    Preview,
    /// The image before any stage changed it.
    Before,
}

/// Metadata for an image handed to an [`OutputSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub kind: SaveKind,
    /// File-name suffix, e.g. `-ad-preview-2nd`.
    pub suffix: String,
    pub seed: i64,
    pub prompt: String,
    /// Parameter summary to embed in the file.
    pub info: String,
}

/// Destination for saved images and the diagnostic parameter summary.
pub trait OutputSink {
    /// Persist an intermediate image.
    ///
    /// # Errors
    ///
    /// Any storage failure; it aborts the current image.
    fn save_image(&mut self, image: &RgbImage, request: &SaveRequest) -> Result<(), BackendError>;

    /// Record the parameter summary of the last image of a batch.
    ///
    /// # Errors
    ///
    /// Any storage failure; it is logged and discarded.
    fn write_params(&mut self, summary: &str) -> Result<(), BackendError>;
}

/// Sink that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn save_image(&mut self, _image: &RgbImage, _request: &SaveRequest) -> Result<(), BackendError> {
        Ok(())
    }

    fn write_params(&mut self, _summary: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Final image and report of [`Orchestrator::process_image`].
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    /// Replaces the source image.
    pub image: RgbImage,
    pub report: ImageReport,
}

/// Merge the stages' extra generation parameters into `ctx`.
///
/// Sub-jobs issued by the detailer are left untouched.
pub fn annotate(ctx: &mut JobContext, stages: &[StageArgs]) {
    if ctx.skip_detailer {
        return;
    }
    ctx.extra_generation_params
        .extend(args::extra_params(stages));
}

// ───────────────────────── Orchestrator ──────────────────────────

/// Drives every stage over one source image.
pub struct Orchestrator<'a, E, S> {
    gateway: DetectorGateway<'a>,
    engine: E,
    sink: S,
    settings: &'a Settings,
    builder: JobBuilder,
}

impl<'a, E: RegenerationEngine, S: OutputSink> Orchestrator<'a, E, S> {
    #[must_use]
    pub fn new(gateway: DetectorGateway<'a>, engine: E, sink: S, settings: &'a Settings) -> Self {
        Self {
            gateway,
            engine,
            sink,
            settings,
            builder: JobBuilder::new(settings),
        }
    }

    #[must_use]
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    #[must_use]
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Release the engine and sink.
    pub fn into_parts(self) -> (E, S) {
        (self.engine, self.sink)
    }

    /// Run every stage over `image` and return the final image.
    ///
    /// Advances `ctx`'s image index first, so the caller invokes this once
    /// per image, in request order, with the same context. A context
    /// marked [`skip_detailer`](JobContext::skip_detailer) is returned
    /// untouched.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Detect`] when a stage selects an unknown model.
    /// - [`PipelineError::Detector`] / [`PipelineError::Engine`] with the
    ///   backend's error when detection or regeneration fails.
    /// - [`PipelineError::EmptyEngineOutput`] when the engine returns no
    ///   image.
    /// - [`PipelineError::Sink`] when saving a preview or the before
    ///   snapshot fails.
    pub fn process_image(
        &mut self,
        ctx: &mut JobContext,
        stages: &[StageArgs],
        image: RgbImage,
    ) -> Result<ProcessedImage, PipelineError> {
        if ctx.skip_detailer {
            return Ok(ProcessedImage {
                image,
                report: ImageReport {
                    image_index: ctx.current_index(),
                    stages: Vec::new(),
                    changed: false,
                },
            });
        }

        let index = ctx.advance_image_index();
        let before = self.settings.save_images_before.then(|| image.clone());
        let mut working = image;
        let mut reports = Vec::with_capacity(stages.len());

        for (n, stage) in stages.iter().enumerate() {
            let (next, outcome) = self.run_stage(ctx, n, stage, working)?;
            working = next;
            reports.push(StageReport {
                ordinal: args::ordinal(n + 1),
                model: stage.model().to_string(),
                outcome,
            });
        }

        let changed = reports
            .iter()
            .any(|r| matches!(r.outcome, StageOutcome::Regenerated { .. }));

        if changed && let Some(before) = &before {
            let request = save_request(ctx, index, SaveKind::Before);
            self.sink
                .save_image(before, &request)
                .map_err(PipelineError::Sink)?;
        }

        if ctx.all_prompts.len().checked_sub(1) == Some(index) {
            diagnostics::best_effort("write params", self.sink.write_params(&ctx.infotext(index)));
        }

        Ok(ProcessedImage {
            image: working,
            report: ImageReport {
                image_index: index,
                stages: reports,
                changed,
            },
        })
    }

    fn run_stage(
        &mut self,
        ctx: &JobContext,
        n: usize,
        stage: &StageArgs,
        image: RgbImage,
    ) -> Result<(RgbImage, StageOutcome), PipelineError> {
        if stage.is_skipped() {
            return Ok((image, StageOutcome::Skipped));
        }
        let index = ctx.current_index();
        let ordinal = args::ordinal(n + 1);

        let detection = self
            .gateway
            .detect(stage.model(), &image, stage.confidence())
            .map_err(|e| match e {
                GatewayError::Lookup(e) => PipelineError::Detect(e),
                GatewayError::Backend(e) => PipelineError::Detector(e),
            })?;
        let masks = MaskTransform::from_args(stage).process(detection.masks);

        if masks.is_empty() {
            info!(
                "nothing detected on image {} with {ordinal} settings",
                index + 1
            );
            return Ok((image, StageOutcome::NothingDetected));
        }
        info!(stage = %ordinal, masks = masks.len(), "regenerating detected regions");

        if self.settings.save_previews
            && let Some(preview) = &detection.preview
        {
            let mut request = save_request(ctx, index, SaveKind::Preview);
            request.suffix.push_str(&args::suffix(n, "-"));
            self.sink
                .save_image(preview, &request)
                .map_err(PipelineError::Sink)?;
        }

        let (mut seed, mut subseed) = ctx.select_seeds(index);
        let mut jobs = Vec::with_capacity(masks.len());
        let mut working = image;

        for (j, mask) in masks.into_iter().enumerate() {
            let job = self
                .builder
                .build(ctx, stage, working)
                .with_mask(mask)
                .with_seeds(seed, subseed);
            debug!(stage = %ordinal, mask = j + 1, seed, subseed, "regeneration job");
            jobs.push(JobRecord { seed, subseed });

            let output = self.engine.regenerate(job).map_err(PipelineError::Engine)?;
            working = output.images.into_iter().next().ok_or_else(|| {
                PipelineError::EmptyEngineOutput {
                    ordinal: ordinal.clone(),
                    mask: j + 1,
                }
            })?;

            seed = seed.wrapping_add(1);
            subseed = subseed.wrapping_add(1);
        }

        Ok((working, StageOutcome::Regenerated { jobs }))
    }
}

fn save_request(ctx: &JobContext, index: usize, kind: SaveKind) -> SaveRequest {
    let (seed, _) = ctx.select_seeds(index);
    let suffix = match kind {
        SaveKind::Preview => PREVIEW_SUFFIX,
        SaveKind::Before => BEFORE_SUFFIX,
    };
    SaveRequest {
        kind,
        suffix: suffix.to_string(),
        seed,
        prompt: ctx
            .all_prompts
            .get(index)
            .unwrap_or(&ctx.prompt)
            .clone(),
        info: ctx.infotext(index),
    }
}
