//! Per-stage detailing arguments.
//!
//! The host hands the pipeline one loosely-typed mapping per stage. These
//! mappings are validated exactly once, here, into immutable [`StageArgs`]
//! values; everything downstream works with the typed form.
//!
//! # Wire format
//!
//! Each stage mapping uses the `ad_*` keys listed in [`FIELDS`]. A missing
//! key (or an explicit `null`) resolves to the field's default. Unknown keys,
//! values of the wrong JSON type and numbers outside the declared range are
//! rejected with [`ArgsError::Validation`], which names the stage ordinal,
//! the offending field, and dumps every recognized field for debugging.

use std::fmt::Write as _;
use std::ops::RangeInclusive;

use serde::Serialize;
use serde_json::{Map, Value};

/// Model selector meaning "skip this stage".
pub const NO_MODEL: &str = "None";

/// Every recognized wire key, in display order.
pub const FIELDS: [&str; 20] = [
    "ad_model",
    "ad_prompt",
    "ad_negative_prompt",
    "ad_conf",
    "ad_dilate_erode",
    "ad_x_offset",
    "ad_y_offset",
    "ad_mask_blur",
    "ad_denoising_strength",
    "ad_inpaint_full_res",
    "ad_inpaint_full_res_padding",
    "ad_use_inpaint_width_height",
    "ad_inpaint_width",
    "ad_inpaint_height",
    "ad_use_steps",
    "ad_steps",
    "ad_use_cfg_scale",
    "ad_cfg_scale",
    "ad_controlnet_model",
    "ad_controlnet_weight",
];

/// Errors raised while turning raw host arguments into [`StageArgs`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgsError {
    /// The host passed no stage mappings at all.
    #[error("not enough arguments passed to the detailer; input: {input}")]
    NotEnoughArguments {
        /// Raw input, rendered as JSON.
        input: String,
    },

    /// A stage mapping contained a bad value.
    #[error("validation failed for {ordinal} arguments: {field}: {reason}\n{dump}")]
    Validation {
        /// Ordinal of the stage (`"1st"`, `"2nd"`, ...).
        ordinal: String,
        /// Wire key of the offending field.
        field: String,
        /// What was wrong with it.
        reason: String,
        /// One line per recognized field: value and JSON type.
        dump: String,
    },

    /// A stage argument was not a mapping at all.
    ///
    /// This is an integration bug between the host surface and the
    /// pipeline rather than bad user data.
    #[error("{ordinal} - non-mapping arguments are sent: {payload}")]
    NotAMapping {
        /// Ordinal of the stage (`"1st"`, `"2nd"`, ...).
        ordinal: String,
        /// Raw payload, rendered as JSON.
        payload: String,
    },
}

/// Validated, immutable arguments for one detection + inpainting stage.
///
/// Construct with [`StageArgs::from_value`] (or [`parse_request`] for a
/// whole request). Serializes back to the `ad_*` wire keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageArgs {
    #[serde(rename = "ad_model")]
    model: String,
    #[serde(rename = "ad_prompt")]
    prompt: String,
    #[serde(rename = "ad_negative_prompt")]
    negative_prompt: String,
    #[serde(rename = "ad_conf")]
    confidence: f64,
    #[serde(rename = "ad_dilate_erode")]
    dilate_erode: i32,
    #[serde(rename = "ad_x_offset")]
    x_offset: i32,
    #[serde(rename = "ad_y_offset")]
    y_offset: i32,
    #[serde(rename = "ad_mask_blur")]
    mask_blur: u32,
    #[serde(rename = "ad_denoising_strength")]
    denoising_strength: f64,
    #[serde(rename = "ad_inpaint_full_res")]
    inpaint_full_res: bool,
    #[serde(rename = "ad_inpaint_full_res_padding")]
    inpaint_full_res_padding: u32,
    #[serde(rename = "ad_use_inpaint_width_height")]
    use_inpaint_width_height: bool,
    #[serde(rename = "ad_inpaint_width")]
    inpaint_width: u32,
    #[serde(rename = "ad_inpaint_height")]
    inpaint_height: u32,
    #[serde(rename = "ad_use_steps")]
    use_steps: bool,
    #[serde(rename = "ad_steps")]
    steps: u32,
    #[serde(rename = "ad_use_cfg_scale")]
    use_cfg_scale: bool,
    #[serde(rename = "ad_cfg_scale")]
    cfg_scale: f64,
    #[serde(rename = "ad_controlnet_model")]
    controlnet_model: String,
    #[serde(rename = "ad_controlnet_weight")]
    controlnet_weight: f64,
}

impl StageArgs {
    pub const DEFAULT_CONFIDENCE: f64 = 30.0;
    pub const DEFAULT_DILATE_ERODE: i32 = 32;
    pub const DEFAULT_MASK_BLUR: u32 = 4;
    pub const DEFAULT_DENOISING_STRENGTH: f64 = 0.4;
    pub const DEFAULT_INPAINT_SIZE: u32 = 512;
    pub const DEFAULT_STEPS: u32 = 28;
    pub const DEFAULT_CFG_SCALE: f64 = 7.0;
    pub const DEFAULT_CONTROLNET_WEIGHT: f64 = 1.0;

    pub const CONFIDENCE_RANGE: RangeInclusive<f64> = 0.0..=100.0;
    pub const DILATE_ERODE_RANGE: RangeInclusive<i64> = -128..=128;
    pub const OFFSET_RANGE: RangeInclusive<i64> = -200..=200;
    pub const MASK_BLUR_RANGE: RangeInclusive<i64> = 0..=64;
    pub const UNIT_RANGE: RangeInclusive<f64> = 0.0..=1.0;
    pub const PADDING_RANGE: RangeInclusive<i64> = 0..=256;
    pub const INPAINT_SIZE_RANGE: RangeInclusive<i64> = 64..=2048;
    pub const STEPS_RANGE: RangeInclusive<i64> = 1..=150;
    pub const CFG_SCALE_RANGE: RangeInclusive<f64> = 0.0..=30.0;

    /// Validate one raw stage mapping.
    ///
    /// `ordinal` is the 1-based stage position, used only in error
    /// messages.
    ///
    /// # Errors
    ///
    /// Returns [`ArgsError::NotAMapping`] when `raw` is not a JSON object and
    /// [`ArgsError::Validation`] when any field is unknown, mistyped or out
    /// of range.
    pub fn from_value(raw: &Value, ordinal: usize) -> Result<Self, ArgsError> {
        let Value::Object(map) = raw else {
            return Err(ArgsError::NotAMapping {
                ordinal: self::ordinal(ordinal),
                payload: raw.to_string(),
            });
        };

        Self::from_map(map).map_err(|e| ArgsError::Validation {
            ordinal: self::ordinal(ordinal),
            field: e.field,
            reason: e.reason,
            dump: dump_fields(map),
        })
    }

    fn from_map(map: &Map<String, Value>) -> Result<Self, FieldError> {
        if let Some(unknown) = map.keys().find(|k| !FIELDS.contains(&k.as_str())) {
            return Err(FieldError::new(unknown, "unknown field"));
        }

        let r = FieldReader { map };
        Ok(Self {
            model: r.string("ad_model", NO_MODEL)?,
            prompt: r.string("ad_prompt", "")?,
            negative_prompt: r.string("ad_negative_prompt", "")?,
            confidence: r.float(
                "ad_conf",
                Self::DEFAULT_CONFIDENCE,
                Self::CONFIDENCE_RANGE,
            )?,
            dilate_erode: r.int(
                "ad_dilate_erode",
                Self::DEFAULT_DILATE_ERODE,
                Self::DILATE_ERODE_RANGE,
            )?,
            x_offset: r.int("ad_x_offset", 0, Self::OFFSET_RANGE)?,
            y_offset: r.int("ad_y_offset", 0, Self::OFFSET_RANGE)?,
            mask_blur: r.int("ad_mask_blur", Self::DEFAULT_MASK_BLUR, Self::MASK_BLUR_RANGE)?,
            denoising_strength: r.float(
                "ad_denoising_strength",
                Self::DEFAULT_DENOISING_STRENGTH,
                Self::UNIT_RANGE,
            )?,
            inpaint_full_res: r.boolean("ad_inpaint_full_res", true)?,
            inpaint_full_res_padding: r.int(
                "ad_inpaint_full_res_padding",
                0,
                Self::PADDING_RANGE,
            )?,
            use_inpaint_width_height: r.boolean("ad_use_inpaint_width_height", false)?,
            inpaint_width: r.int(
                "ad_inpaint_width",
                Self::DEFAULT_INPAINT_SIZE,
                Self::INPAINT_SIZE_RANGE,
            )?,
            inpaint_height: r.int(
                "ad_inpaint_height",
                Self::DEFAULT_INPAINT_SIZE,
                Self::INPAINT_SIZE_RANGE,
            )?,
            use_steps: r.boolean("ad_use_steps", false)?,
            steps: r.int("ad_steps", Self::DEFAULT_STEPS, Self::STEPS_RANGE)?,
            use_cfg_scale: r.boolean("ad_use_cfg_scale", false)?,
            cfg_scale: r.float("ad_cfg_scale", Self::DEFAULT_CFG_SCALE, Self::CFG_SCALE_RANGE)?,
            controlnet_model: r.string("ad_controlnet_model", NO_MODEL)?,
            controlnet_weight: r.float(
                "ad_controlnet_weight",
                Self::DEFAULT_CONTROLNET_WEIGHT,
                Self::UNIT_RANGE,
            )?,
        })
    }

    /// Stage arguments with every field at its default and the given model.
    #[must_use]
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Detector selector, or [`NO_MODEL`].
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether this stage is switched off.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.model == NO_MODEL
    }

    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    #[must_use]
    pub fn negative_prompt(&self) -> &str {
        &self.negative_prompt
    }

    /// Detection confidence threshold as a percentage (0–100).
    #[must_use]
    pub const fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Erosion (negative) or dilation (positive) radius in pixels.
    #[must_use]
    pub const fn dilate_erode(&self) -> i32 {
        self.dilate_erode
    }

    /// Horizontal mask offset; positive moves right.
    #[must_use]
    pub const fn x_offset(&self) -> i32 {
        self.x_offset
    }

    /// Vertical mask offset; positive moves up.
    #[must_use]
    pub const fn y_offset(&self) -> i32 {
        self.y_offset
    }

    #[must_use]
    pub const fn mask_blur(&self) -> u32 {
        self.mask_blur
    }

    #[must_use]
    pub const fn denoising_strength(&self) -> f64 {
        self.denoising_strength
    }

    #[must_use]
    pub const fn inpaint_full_res(&self) -> bool {
        self.inpaint_full_res
    }

    #[must_use]
    pub const fn inpaint_full_res_padding(&self) -> u32 {
        self.inpaint_full_res_padding
    }

    /// The width/height override, when enabled.
    #[must_use]
    pub const fn inpaint_size(&self) -> Option<(u32, u32)> {
        if self.use_inpaint_width_height {
            Some((self.inpaint_width, self.inpaint_height))
        } else {
            None
        }
    }

    /// The step-count override, when enabled.
    #[must_use]
    pub const fn steps(&self) -> Option<u32> {
        if self.use_steps {
            Some(self.steps)
        } else {
            None
        }
    }

    /// The guidance-scale override, when enabled.
    #[must_use]
    pub const fn cfg_scale(&self) -> Option<f64> {
        if self.use_cfg_scale {
            Some(self.cfg_scale)
        } else {
            None
        }
    }

    /// Conditioning model and weight, or `None` when no model is selected.
    #[must_use]
    pub fn controlnet(&self) -> Option<(&str, f64)> {
        if self.controlnet_model == NO_MODEL {
            None
        } else {
            Some((&self.controlnet_model, self.controlnet_weight))
        }
    }

    /// Human-readable generation parameters for this stage.
    ///
    /// Keys carry `suffix` (see [`suffix`]). Parameters that do not
    /// influence the result, such as an empty prompt or an override whose
    /// toggle is off, are omitted. A skipped stage contributes nothing.
    #[must_use]
    pub fn extra_params(&self, suffix: &str) -> Map<String, Value> {
        let mut params = Map::new();
        if self.is_skipped() {
            return params;
        }

        let mut put = |name: &str, value: Value| {
            params.insert(format!("ADetailer {name}{suffix}"), value);
        };

        put("model", self.model.clone().into());
        if !self.prompt.is_empty() {
            put("prompt", self.prompt.clone().into());
        }
        if !self.negative_prompt.is_empty() {
            put("negative prompt", self.negative_prompt.clone().into());
        }
        #[allow(clippy::cast_possible_truncation)]
        let conf = self.confidence.round() as i64;
        put("conf", conf.into());
        put("dilate/erode", self.dilate_erode.into());
        if self.x_offset != 0 {
            put("x offset", self.x_offset.into());
        }
        if self.y_offset != 0 {
            put("y offset", self.y_offset.into());
        }
        put("mask blur", self.mask_blur.into());
        put("denoising strength", self.denoising_strength.into());
        put("inpaint full", self.inpaint_full_res.into());
        if self.inpaint_full_res {
            put("inpaint padding", self.inpaint_full_res_padding.into());
        }
        if self.use_inpaint_width_height {
            put("use inpaint width/height", true.into());
            put("inpaint width", self.inpaint_width.into());
            put("inpaint height", self.inpaint_height.into());
        }
        if self.use_steps {
            put("use separate steps", true.into());
            put("steps", self.steps.into());
        }
        if self.use_cfg_scale {
            put("use separate CFG scale", true.into());
            put("CFG scale", self.cfg_scale.into());
        }
        if let Some((model, weight)) = self.controlnet() {
            put("ControlNet model", model.into());
            put("ControlNet weight", weight.into());
        }
        params
    }
}

impl Default for StageArgs {
    fn default() -> Self {
        Self {
            model: NO_MODEL.to_string(),
            prompt: String::new(),
            negative_prompt: String::new(),
            confidence: Self::DEFAULT_CONFIDENCE,
            dilate_erode: Self::DEFAULT_DILATE_ERODE,
            x_offset: 0,
            y_offset: 0,
            mask_blur: Self::DEFAULT_MASK_BLUR,
            denoising_strength: Self::DEFAULT_DENOISING_STRENGTH,
            inpaint_full_res: true,
            inpaint_full_res_padding: 0,
            use_inpaint_width_height: false,
            inpaint_width: Self::DEFAULT_INPAINT_SIZE,
            inpaint_height: Self::DEFAULT_INPAINT_SIZE,
            use_steps: false,
            steps: Self::DEFAULT_STEPS,
            use_cfg_scale: false,
            cfg_scale: Self::DEFAULT_CFG_SCALE,
            controlnet_model: NO_MODEL.to_string(),
            controlnet_weight: Self::DEFAULT_CONTROLNET_WEIGHT,
        }
    }
}

/// Parse the host's positional script arguments.
///
/// The host sends an optional leading `bool` (the enable checkbox)
/// followed by one mapping per stage. Returns `Ok(None)` when the request
/// is disabled: the checkbox is off, or the first stage selects no model.
/// Disabled requests are not validated further.
///
/// # Errors
///
/// Returns [`ArgsError::NotEnoughArguments`] when no stage mapping is
/// present, and the errors of [`StageArgs::from_value`] for each stage.
pub fn parse_request(values: &[Value]) -> Result<Option<Vec<StageArgs>>, ArgsError> {
    let (enabled, stages) = match values {
        [] | [Value::Bool(_)] => {
            return Err(ArgsError::NotEnoughArguments {
                input: Value::Array(values.to_vec()).to_string(),
            });
        }
        [Value::Bool(enabled), rest @ ..] => (*enabled, rest),
        all => (true, all),
    };

    let first_model = stages
        .first()
        .and_then(Value::as_object)
        .and_then(|m| m.get("ad_model"))
        .and_then(Value::as_str)
        .unwrap_or(NO_MODEL);
    if !enabled || first_model == NO_MODEL {
        return Ok(None);
    }

    stages
        .iter()
        .enumerate()
        .map(|(i, raw)| StageArgs::from_value(raw, i + 1))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Merge every stage's [`StageArgs::extra_params`] and the crate version.
#[must_use]
pub fn extra_params(stages: &[StageArgs]) -> Map<String, Value> {
    let mut params = Map::new();
    for (n, stage) in stages.iter().enumerate() {
        params.extend(stage.extra_params(&suffix(n, " ")));
    }
    params.insert("ADetailer version".to_string(), crate::version().into());
    params
}

/// English ordinal for a 1-based position: `1st`, `2nd`, `11th`, `23rd`.
#[must_use]
pub fn ordinal(n: usize) -> String {
    let tail = if (11..=13).contains(&(n % 100)) {
        "th"
    } else {
        match n % 10 {
            1 => "st",
            2 => "nd",
            3 => "rd",
            _ => "th",
        }
    };
    format!("{n}{tail}")
}

/// Naming suffix for a 0-based stage index.
///
/// The first stage has no suffix; later stages get `sep` followed by the
/// ordinal (`suffix(1, " ") == " 2nd"`, `suffix(2, "-") == "-3rd"`).
#[must_use]
pub fn suffix(n: usize, sep: &str) -> String {
    if n == 0 {
        String::new()
    } else {
        format!("{sep}{}", ordinal(n + 1))
    }
}

struct FieldError {
    field: String,
    reason: String,
}

impl FieldError {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Typed access to a raw stage mapping with defaults for absent keys.
struct FieldReader<'a> {
    map: &'a Map<String, Value>,
}

impl FieldReader<'_> {
    fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    fn string(&self, key: &str, default: &str) -> Result<String, FieldError> {
        match self.get(key) {
            None => Ok(default.to_string()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(FieldError::new(
                key,
                format!("expected a string, got {}", json_type(other)),
            )),
        }
    }

    fn boolean(&self, key: &str, default: bool) -> Result<bool, FieldError> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(FieldError::new(
                key,
                format!("expected a boolean, got {}", json_type(other)),
            )),
        }
    }

    /// Integer field; integral floats such as `32.0` are accepted.
    fn int<T>(&self, key: &str, default: T, range: RangeInclusive<i64>) -> Result<T, FieldError>
    where
        T: TryFrom<i64>,
    {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };
        let n = value
            .as_i64()
            .or_else(|| {
                value
                    .as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                    .map(|f| {
                        #[allow(clippy::cast_possible_truncation)]
                        let n = f as i64;
                        n
                    })
            })
            .ok_or_else(|| {
                FieldError::new(key, format!("expected an integer, got {value}"))
            })?;
        if !range.contains(&n) {
            return Err(FieldError::new(
                key,
                format!(
                    "{n} is out of range {}..={}",
                    range.start(),
                    range.end()
                ),
            ));
        }
        T::try_from(n).map_err(|_| FieldError::new(key, format!("{n} does not fit")))
    }

    fn float(&self, key: &str, default: f64, range: RangeInclusive<f64>) -> Result<f64, FieldError> {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };
        let f = value
            .as_f64()
            .ok_or_else(|| FieldError::new(key, format!("expected a number, got {value}")))?;
        if !range.contains(&f) {
            return Err(FieldError::new(
                key,
                format!("{f} is out of range {}..={}", range.start(), range.end()),
            ));
        }
        Ok(f)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One line per recognized field: `    ad_conf: 150 (number)`.
fn dump_fields(map: &Map<String, Value>) -> String {
    let mut out = String::new();
    for field in FIELDS {
        let (shown, kind) = match map.get(field) {
            None | Some(Value::Null) => ("DEFAULT".to_string(), "null"),
            Some(v) => (v.to_string(), json_type(v)),
        };
        let _ = writeln!(out, "    {field}: {shown} ({kind})");
    }
    out
}
