//! adetailer-inspect: validate a detailer request against a model directory.
//!
//! Reads the host's positional script arguments (a JSON array: optional
//! enable flag, then one `ad_*` mapping per stage), validates every stage,
//! resolves each selected model against the scanned model directory and
//! prints the resolved stages plus the generation metadata they would add.
//!
//! # Usage
//!
//! ```text
//! cargo run --bin adetailer-inspect -- [OPTIONS] <REQUEST_JSON>
//! ```
//!
//! Logging goes to stderr and honors `RUST_LOG` (default `info`).

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod models;

use std::path::PathBuf;
use std::process::ExitCode;

use adetailer_pipeline::detect::is_landmark_model;
use adetailer_pipeline::{
    ArgsError, DetectError, Device, HostProfile, ModelRegistry, Settings, SettingsError,
    StageArgs, args,
};
use clap::Parser;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Request validation for the detailer pipeline.
///
/// Parses a stage request, checks every value against its declared range
/// and resolves the selected detection models.
#[derive(Parser)]
#[command(name = "adetailer-inspect", version)]
struct Cli {
    /// Path to the request: a JSON array of script arguments.
    request: PathBuf,

    /// Directory holding `*.pt` detection checkpoints.
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Full detailer settings as a JSON string.
    ///
    /// Missing fields take their defaults. The JSON must be a valid
    /// `Settings` serialization.
    #[arg(long)]
    settings_json: Option<String>,

    /// The host runs its models in a low- or medium-VRAM mode.
    #[arg(long)]
    low_vram: bool,

    /// Output the inspection as JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, thiserror::Error)]
enum InspectError {
    #[error("error reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("error parsing {what}: {source}")]
    Json {
        what: &'static str,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Args(#[from] ArgsError),
    #[error(transparent)]
    Detect(#[from] DetectError),
}

/// Everything the tool learned about one request.
#[derive(Debug, Serialize)]
struct Inspection {
    enabled: bool,
    device: String,
    models: Vec<String>,
    stages: Vec<StageArgs>,
    extra_params: Map<String, Value>,
}

impl Inspection {
    fn report(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("Detailer Request\n{}", "=".repeat(60)));
        lines.push(format!(
            "Enabled: {}",
            if self.enabled { "yes" } else { "no" }
        ));
        let device = if self.device.is_empty() {
            "auto"
        } else {
            &self.device
        };
        lines.push(format!("Device: {device}"));
        lines.push(format!("Models: {}", self.models.join(", ")));

        if self.enabled {
            lines.push(String::new());
            lines.push(format!(
                "{:<8} {:<28} {:>6} {:>8}",
                "Stage", "Model", "Conf", "Denoise"
            ));
            lines.push("-".repeat(60));
            for (n, stage) in self.stages.iter().enumerate() {
                lines.push(format!(
                    "{:<8} {:<28} {:>6} {:>8}",
                    args::ordinal(n + 1),
                    stage.model(),
                    stage.confidence(),
                    stage.denoising_strength()
                ));
            }

            lines.push(String::new());
            for (key, value) in &self.extra_params {
                lines.push(format!("{key}: {value}"));
            }
        }

        lines.join("\n")
    }
}

fn inspect(cli: &Cli) -> Result<Inspection, InspectError> {
    let settings: Settings = match &cli.settings_json {
        Some(json) => serde_json::from_str(json).map_err(|source| InspectError::Json {
            what: "--settings-json",
            source,
        })?,
        None => Settings::default(),
    };
    settings.validate()?;

    let checkpoints = match &cli.models_dir {
        Some(dir) => models::scan(dir).map_err(|source| InspectError::Read {
            path: dir.clone(),
            source,
        })?,
        None => Vec::new(),
    };
    let registry = ModelRegistry::new(checkpoints);
    let device = Device::for_host(&HostProfile::current(cli.low_vram));

    let raw = std::fs::read_to_string(&cli.request).map_err(|source| InspectError::Read {
        path: cli.request.clone(),
        source,
    })?;
    let values: Vec<Value> = serde_json::from_str(&raw).map_err(|source| InspectError::Json {
        what: "request",
        source,
    })?;

    let stages = args::parse_request(&values)?;
    let (enabled, stages) = match stages {
        Some(stages) => (true, stages),
        None => (false, settings.default_stages(&registry)),
    };

    if enabled {
        if stages.len() > usize::from(settings.max_models) {
            warn!(
                stages = stages.len(),
                max_models = settings.max_models,
                "request has more stages than configured"
            );
        }
        for stage in stages.iter().filter(|s| !s.is_skipped()) {
            if !is_landmark_model(stage.model()) {
                let handle = registry.get(stage.model())?;
                info!(model = handle.name(), path = ?handle.path(), "model resolved");
            }
        }
        info!(stages = stages.len(), "request is valid");
    } else {
        info!("request is disabled");
    }

    Ok(Inspection {
        enabled,
        device: device.as_str().to_string(),
        models: registry.names().map(str::to_string).collect(),
        extra_params: if enabled {
            args::extra_params(&stages)
        } else {
            Map::new()
        },
        stages,
    })
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let inspection = match inspect(&cli) {
        Ok(inspection) => inspection,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&inspection) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing inspection: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("{}", inspection.report());
    }

    ExitCode::SUCCESS
}
