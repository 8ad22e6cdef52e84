//! Regeneration jobs: what the engine is asked to do for one mask.
//!
//! A [`JobContext`] describes the caller's original generation request;
//! [`JobBuilder::build`] combines it with a stage's [`StageArgs`] and the
//! current working image into a self-contained [`RegenerationJob`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::args::StageArgs;
use crate::settings::Settings;
use crate::types::{Dimensions, GrayImage, RgbImage};

/// Samplers the inpainting path cannot run.
pub const INCOMPATIBLE_SAMPLERS: [&str; 2] = ["PLMS", "UniPC"];

/// Replacement for any sampler in [`INCOMPATIBLE_SAMPLERS`].
pub const FALLBACK_SAMPLER: &str = "Euler";

/// Extension kept in sub-jobs whenever a conditioning model is selected.
pub const CONDITIONING_EXTENSION: &str = "controlnet";

/// An always-on host extension attached to a generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    /// Path of the script file that defines the extension.
    pub filename: PathBuf,
}

impl Extension {
    #[must_use]
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
        }
    }

    /// File stem used for allow-list matching, e.g. `wildcards` for
    /// `extensions/wildcards/scripts/wildcards.py`.
    #[must_use]
    pub fn stem(&self) -> &str {
        self.filename
            .file_stem()
            .and_then(std::ffi::OsStr::to_str)
            .unwrap_or_default()
    }
}

/// The caller's generation request, as seen by the detailer.
///
/// Owned by the caller; the orchestrator only advances
/// [`image_index`](Self::image_index) and merges extra parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobContext {
    pub prompt: String,
    pub negative_prompt: String,
    /// Per-image prompts; empty means "use `prompt`".
    pub all_prompts: Vec<String>,
    pub all_negative_prompts: Vec<String>,

    pub seed: i64,
    pub subseed: i64,
    pub all_seeds: Vec<i64>,
    pub all_subseeds: Vec<i64>,
    pub subseed_strength: f64,
    pub seed_resize_from: Option<Dimensions>,

    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler_name: String,
    pub styles: Vec<String>,
    pub tiling: bool,

    /// Always-on extensions of the request.
    pub extensions: Vec<Extension>,
    /// Opaque extension arguments, copied into every sub-job.
    pub extension_args: Value,
    /// Human-readable parameters attached to saved images.
    pub extra_generation_params: Map<String, Value>,

    /// Index of the image being processed; `None` before the first one.
    pub image_index: Option<usize>,
    /// Set on requests issued by the detailer itself.
    pub skip_detailer: bool,
}

impl JobContext {
    /// Move to the next image of the request and return its index.
    pub fn advance_image_index(&mut self) -> usize {
        let next = self.image_index.map_or(0, |i| i + 1);
        self.image_index = Some(next);
        next
    }

    /// Index of the current image (0 before [`advance_image_index`](Self::advance_image_index)).
    #[must_use]
    pub fn current_index(&self) -> usize {
        self.image_index.unwrap_or(0)
    }

    /// Positive and negative prompt for image `index`.
    ///
    /// A non-empty override wins; otherwise the per-image list is indexed
    /// modulo its length, falling back to the base prompt when the list is
    /// empty. The two prompts are resolved independently.
    #[must_use]
    pub fn select_prompts(&self, index: usize, args: &StageArgs) -> (String, String) {
        let pick = |over: &str, list: &[String], base: &str| {
            if over.is_empty() {
                cycle(list, index).map_or(base, String::as_str).to_string()
            } else {
                over.to_string()
            }
        };
        (
            pick(args.prompt(), &self.all_prompts, &self.prompt),
            pick(
                args.negative_prompt(),
                &self.all_negative_prompts,
                &self.negative_prompt,
            ),
        )
    }

    /// Seed and subseed for image `index`, with the same wraparound rule
    /// as [`select_prompts`](Self::select_prompts).
    #[must_use]
    pub fn select_seeds(&self, index: usize) -> (i64, i64) {
        (
            cycle(&self.all_seeds, index).copied().unwrap_or(self.seed),
            cycle(&self.all_subseeds, index)
                .copied()
                .unwrap_or(self.subseed),
        )
    }

    /// Human-readable parameter summary for image `index`.
    ///
    /// Prompt and seed are those of image `index`, not of the first image.
    ///
    /// ```text
    /// a photo of a cat
    /// Negative prompt: blurry
    /// Steps: 20, Sampler: Euler a, CFG scale: 7, Seed: 1234, Size: 512x512, ADetailer model: face_yolov8n.pt
    /// ```
    #[must_use]
    pub fn infotext(&self, index: usize) -> String {
        let prompt = cycle(&self.all_prompts, index).unwrap_or(&self.prompt);
        let negative = cycle(&self.all_negative_prompts, index).unwrap_or(&self.negative_prompt);
        let (seed, _) = self.select_seeds(index);

        let mut params = vec![
            format!("Steps: {}", self.steps),
            format!("Sampler: {}", quote(&self.sampler_name)),
            format!("CFG scale: {}", self.cfg_scale),
            format!("Seed: {seed}"),
            format!("Size: {}x{}", self.width, self.height),
        ];
        params.extend(
            self.extra_generation_params
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| format!("{k}: {}", quote(&render(v)))),
        );

        let mut text = prompt.clone();
        if !negative.is_empty() {
            text.push_str("\nNegative prompt: ");
            text.push_str(negative);
        }
        text.push('\n');
        text.push_str(&params.join(", "));
        text
    }
}

impl Default for JobContext {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            all_prompts: Vec::new(),
            all_negative_prompts: Vec::new(),
            seed: -1,
            subseed: -1,
            all_seeds: Vec::new(),
            all_subseeds: Vec::new(),
            subseed_strength: 0.0,
            seed_resize_from: None,
            width: 512,
            height: 512,
            steps: 20,
            cfg_scale: 7.0,
            sampler_name: "Euler a".to_string(),
            styles: Vec::new(),
            tiling: false,
            extensions: Vec::new(),
            extension_args: Value::Null,
            extra_generation_params: Map::new(),
            image_index: None,
            skip_detailer: false,
        }
    }
}

fn cycle<T>(list: &[T], index: usize) -> Option<&T> {
    if list.is_empty() {
        None
    } else {
        list.get(index % list.len())
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}

/// Quote a parameter value when it would break the `key: value, ...` format.
fn quote(text: &str) -> String {
    if text.contains([',', ':', '\n']) {
        Value::String(text.to_string()).to_string()
    } else {
        text.to_string()
    }
}

/// How masked pixels are initialized before sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InpaintFill {
    Fill,
    /// Start from the original pixels.
    #[default]
    Original,
    LatentNoise,
    LatentNothing,
}

/// Conditioning model passed through to the engine untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conditioning {
    pub model: String,
    pub weight: f64,
}

/// A complete, self-contained regeneration request for one mask.
#[derive(Debug, Clone, PartialEq)]
pub struct RegenerationJob {
    pub init_image: RgbImage,
    /// Region to regenerate; set per mask by the orchestrator.
    pub mask: Option<GrayImage>,
    pub prompt: String,
    pub negative_prompt: String,
    pub styles: Vec<String>,
    pub seed: i64,
    pub subseed: i64,
    pub subseed_strength: f64,
    pub seed_resize_from: Option<Dimensions>,
    pub sampler_name: String,
    pub batch_size: u32,
    pub n_iter: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub tiling: bool,
    pub denoising_strength: f64,
    pub mask_blur: u32,
    pub inpainting_fill: InpaintFill,
    pub inpaint_full_res: bool,
    pub inpaint_full_res_padding: u32,
    pub inpainting_mask_invert: bool,
    pub extra_generation_params: Map<String, Value>,
    pub do_not_save_samples: bool,
    pub do_not_save_grid: bool,
    pub extensions: Vec<Extension>,
    pub extension_args: Value,
    pub conditioning: Option<Conditioning>,
    /// Do-not-recurse marker; the engine must not run the detailer again.
    pub skip_detailer: bool,
}

impl RegenerationJob {
    #[must_use]
    pub fn with_mask(mut self, mask: GrayImage) -> Self {
        self.mask = Some(mask);
        self
    }

    #[must_use]
    pub const fn with_seeds(mut self, seed: i64, subseed: i64) -> Self {
        self.seed = seed;
        self.subseed = subseed;
        self
    }
}

/// Builds [`RegenerationJob`]s under one settings profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobBuilder {
    allowed_extensions: Option<Vec<String>>,
}

impl JobBuilder {
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self {
            allowed_extensions: settings.allowed_extensions(),
        }
    }

    /// Build the job for the context's current image.
    ///
    /// The job starts from `image` with no mask; seeds are the image's
    /// base seeds. Both are adjusted per mask by the caller.
    #[must_use = "returns the job to hand to the engine"]
    pub fn build(&self, ctx: &JobContext, args: &StageArgs, image: RgbImage) -> RegenerationJob {
        let index = ctx.current_index();
        let (prompt, negative_prompt) = ctx.select_prompts(index, args);
        let (seed, subseed) = ctx.select_seeds(index);
        let (width, height) = args.inpaint_size().unwrap_or((ctx.width, ctx.height));

        let sampler_name = if INCOMPATIBLE_SAMPLERS.contains(&ctx.sampler_name.as_str()) {
            FALLBACK_SAMPLER.to_string()
        } else {
            ctx.sampler_name.clone()
        };

        let conditioning = args.controlnet().map(|(model, weight)| Conditioning {
            model: model.to_string(),
            weight,
        });

        RegenerationJob {
            init_image: image,
            mask: None,
            prompt,
            negative_prompt,
            styles: ctx.styles.clone(),
            seed,
            subseed,
            subseed_strength: ctx.subseed_strength,
            seed_resize_from: ctx.seed_resize_from,
            sampler_name,
            batch_size: 1,
            n_iter: 1,
            steps: args.steps().unwrap_or(ctx.steps),
            cfg_scale: args.cfg_scale().unwrap_or(ctx.cfg_scale),
            width,
            height,
            tiling: ctx.tiling,
            denoising_strength: args.denoising_strength(),
            mask_blur: args.mask_blur(),
            inpainting_fill: InpaintFill::Original,
            inpaint_full_res: args.inpaint_full_res(),
            inpaint_full_res_padding: args.inpaint_full_res_padding(),
            inpainting_mask_invert: false,
            extra_generation_params: ctx.extra_generation_params.clone(),
            do_not_save_samples: true,
            do_not_save_grid: true,
            extensions: self.filter_extensions(&ctx.extensions, conditioning.is_some()),
            extension_args: ctx.extension_args.clone(),
            conditioning,
            skip_detailer: true,
        }
    }

    /// Keep the allow-listed extensions, in their original order.
    #[must_use]
    pub fn filter_extensions(&self, extensions: &[Extension], conditioned: bool) -> Vec<Extension> {
        let Some(allowed) = &self.allowed_extensions else {
            return extensions.to_vec();
        };
        extensions
            .iter()
            .filter(|ext| {
                let stem = ext.stem();
                allowed.iter().any(|name| name == stem)
                    || (conditioned && stem == CONDITIONING_EXTENSION)
            })
            .cloned()
            .collect()
    }
}
