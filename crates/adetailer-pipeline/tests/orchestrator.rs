//! Integration tests: drive the orchestrator end to end with scripted
//! detectors, a counting engine and a recording sink.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;

use adetailer_pipeline::diagnostics::StageOutcome;
use adetailer_pipeline::job::{Extension, JobContext, RegenerationJob};
use adetailer_pipeline::pipeline::SaveKind;
use adetailer_pipeline::{
    BackendError, DetectError, DetectionResult, Dimensions, DetectorGateway, Device, GrayImage,
    LandmarkDetector, LoadOptions, ModelHandle, ModelRegistry, ObjectDetector, Orchestrator,
    OutputSink, PipelineError, Regenerated, RegenerationEngine, RgbImage, SaveRequest, Settings,
    StageArgs, annotate,
};
use image::{Luma, Rgb};
use serde_json::{Value, json};

const SIZE: u32 = 16;

// ───────────────────────── Fakes ──────────────────────────

#[derive(Default)]
struct ScriptedDetector {
    masks: HashMap<String, Vec<GrayImage>>,
    preview: bool,
    fail: Option<&'static str>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedDetector {
    fn with(mut self, model: &str, masks: Vec<GrayImage>) -> Self {
        self.masks.insert(model.to_string(), masks);
        self
    }

    fn respond(
        &self,
        call: String,
        model: &str,
        image: &RgbImage,
    ) -> Result<DetectionResult, BackendError> {
        self.calls.borrow_mut().push(call);
        if let Some(message) = self.fail {
            return Err(message.into());
        }
        Ok(DetectionResult {
            masks: self.masks.get(model).cloned().unwrap_or_default(),
            preview: self.preview.then(|| image.clone()),
        })
    }
}

impl LandmarkDetector for ScriptedDetector {
    fn detect(
        &self,
        model: &str,
        image: &RgbImage,
        confidence: f32,
    ) -> Result<DetectionResult, BackendError> {
        self.respond(format!("landmark {model} {confidence:.2}"), model, image)
    }
}

impl ObjectDetector for ScriptedDetector {
    fn detect(
        &self,
        model: &ModelHandle,
        image: &RgbImage,
        confidence: f32,
        _device: &Device,
        _options: LoadOptions,
    ) -> Result<DetectionResult, BackendError> {
        self.respond(
            format!("object {} {confidence:.2}", model.name()),
            model.name(),
            image,
        )
    }
}

/// Returns the input image with the red channel of pixel (0, 0) bumped,
/// so the number of jobs an image went through is readable from it.
#[derive(Default)]
struct CountingEngine {
    jobs: Vec<RegenerationJob>,
    fail_at: Option<usize>,
    no_output: bool,
}

impl RegenerationEngine for CountingEngine {
    fn regenerate(&mut self, job: RegenerationJob) -> Result<Regenerated, BackendError> {
        let call = self.jobs.len();
        let mut image = job.init_image.clone();
        self.jobs.push(job);
        if self.fail_at == Some(call) {
            return Err("CUDA out of memory".into());
        }
        if self.no_output {
            return Ok(Regenerated::default());
        }
        image.get_pixel_mut(0, 0).0[0] += 1;
        Ok(Regenerated {
            images: vec![image],
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    saved: Vec<SaveRequest>,
    params: Vec<String>,
    fail_params: bool,
}

impl OutputSink for RecordingSink {
    fn save_image(&mut self, _image: &RgbImage, request: &SaveRequest) -> Result<(), BackendError> {
        self.saved.push(request.clone());
        Ok(())
    }

    fn write_params(&mut self, summary: &str) -> Result<(), BackendError> {
        if self.fail_params {
            return Err("read-only file system".into());
        }
        self.params.push(summary.to_string());
        Ok(())
    }
}

// ───────────────────────── Helpers ──────────────────────────

struct Harness {
    registry: ModelRegistry,
    detector: ScriptedDetector,
    device: Device,
    settings: Settings,
}

impl Harness {
    fn new(detector: ScriptedDetector) -> Self {
        Self {
            registry: ModelRegistry::new([
                PathBuf::from("models/face.pt"),
                PathBuf::from("models/hand.pt"),
            ]),
            detector,
            device: Device::Auto,
            settings: Settings::default(),
        }
    }

    fn orchestrator(&self) -> Orchestrator<'_, CountingEngine, RecordingSink> {
        self.orchestrator_with(CountingEngine::default(), RecordingSink::default())
    }

    fn orchestrator_with(
        &self,
        engine: CountingEngine,
        sink: RecordingSink,
    ) -> Orchestrator<'_, CountingEngine, RecordingSink> {
        let gateway =
            DetectorGateway::new(&self.registry, &self.detector, &self.detector, &self.device);
        Orchestrator::new(gateway, engine, sink, &self.settings)
    }

    fn calls(&self) -> Vec<String> {
        self.detector.calls.borrow().clone()
    }
}

fn square(x: u32, y: u32, side: u32) -> GrayImage {
    GrayImage::from_fn(SIZE, SIZE, |px, py| {
        if (x..x + side).contains(&px) && (y..y + side).contains(&py) {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

fn stage(n: usize, raw: &Value) -> StageArgs {
    StageArgs::from_value(raw, n).unwrap()
}

/// A stage that keeps detector masks exactly as returned.
fn exact(n: usize, model: &str) -> StageArgs {
    stage(n, &json!({"ad_model": model, "ad_dilate_erode": 0}))
}

fn canvas() -> RgbImage {
    RgbImage::from_fn(SIZE, SIZE, |x, y| {
        Rgb([0, u8::try_from(x * 8).unwrap(), u8::try_from(y * 8).unwrap()])
    })
}

fn counter(image: &RgbImage) -> u8 {
    image.get_pixel(0, 0).0[0]
}

// ───────────────────────── Sequencing ──────────────────────────

#[test]
fn seeds_advance_per_mask_and_reset_per_stage() {
    let harness = Harness::new(
        ScriptedDetector::default()
            .with("face.pt", vec![square(0, 0, 2), square(4, 4, 2), square(8, 8, 2)])
            .with("hand.pt", vec![square(0, 8, 2), square(8, 0, 2)]),
    );
    let mut orch = harness.orchestrator();
    let mut ctx = JobContext {
        seed: 100,
        subseed: 500,
        ..JobContext::default()
    };

    let out = orch
        .process_image(&mut ctx, &[exact(1, "face.pt"), exact(2, "hand.pt")], canvas())
        .unwrap();

    let seeds: Vec<(i64, i64)> = orch
        .engine()
        .jobs
        .iter()
        .map(|j| (j.seed, j.subseed))
        .collect();
    assert_eq!(
        seeds,
        [(100, 500), (101, 501), (102, 502), (100, 500), (101, 501)]
    );
    assert_eq!(out.report.job_count(), 5);
    assert!(out.report.changed);
}

#[test]
fn empty_detections_leave_image_identical() {
    let harness = Harness::new(ScriptedDetector::default().with("face.pt", Vec::new()));
    let mut orch = harness.orchestrator();
    let mut ctx = JobContext::default();

    let out = orch
        .process_image(&mut ctx, &[exact(1, "face.pt")], canvas())
        .unwrap();

    assert_eq!(out.image, canvas());
    assert!(orch.engine().jobs.is_empty());
    assert_eq!(out.report.stages[0].outcome, StageOutcome::NothingDetected);
    assert!(!out.report.changed);
}

#[test]
fn masks_emptied_by_processing_issue_no_jobs() {
    let harness = Harness::new(ScriptedDetector::default().with("face.pt", vec![square(5, 5, 1)]));
    let mut orch = harness.orchestrator();
    let stages = [stage(1, &json!({"ad_model": "face.pt", "ad_dilate_erode": -2}))];

    let out = orch
        .process_image(&mut JobContext::default(), &stages, canvas())
        .unwrap();

    assert_eq!(out.image, canvas());
    assert!(orch.engine().jobs.is_empty());
}

#[test]
fn output_image_threads_through_every_job() {
    let face_masks = vec![square(0, 0, 2), square(6, 6, 2)];
    let hand_masks = vec![square(10, 10, 3)];
    let harness = Harness::new(
        ScriptedDetector::default()
            .with("face.pt", face_masks.clone())
            .with("hand.pt", hand_masks.clone()),
    );
    let mut orch = harness.orchestrator();

    let out = orch
        .process_image(
            &mut JobContext::default(),
            &[exact(1, "face.pt"), exact(2, "hand.pt")],
            canvas(),
        )
        .unwrap();

    let jobs = &orch.engine().jobs;
    assert_eq!(jobs.len(), 3);
    for (k, job) in jobs.iter().enumerate() {
        assert_eq!(usize::from(counter(&job.init_image)), k);
    }
    assert_eq!(jobs[0].mask.as_ref(), Some(&face_masks[0]));
    assert_eq!(jobs[1].mask.as_ref(), Some(&face_masks[1]));
    assert_eq!(jobs[2].mask.as_ref(), Some(&hand_masks[0]));
    assert_eq!(counter(&out.image), 3);

    // Stage two detects on the image produced by stage one.
    assert_eq!(
        harness.calls(),
        ["object face.pt 0.30", "object hand.pt 0.30"]
    );
}

#[test]
fn skipped_stage_runs_no_detection() {
    let harness = Harness::new(ScriptedDetector::default().with("hand.pt", vec![square(1, 1, 2)]));
    let mut orch = harness.orchestrator();
    let stages = [StageArgs::default(), exact(2, "hand.pt")];

    let out = orch
        .process_image(&mut JobContext::default(), &stages, canvas())
        .unwrap();

    assert_eq!(harness.calls(), ["object hand.pt 0.30"]);
    assert_eq!(out.report.stages[0].outcome, StageOutcome::Skipped);
    assert_eq!(out.report.stages[1].ordinal, "2nd");
    assert_eq!(orch.engine().jobs.len(), 1);
}

#[test]
fn landmark_models_route_to_landmark_backend() {
    let harness = Harness::new(
        ScriptedDetector::default().with("mediapipe_face_full", vec![square(2, 2, 4)]),
    );
    let mut orch = harness.orchestrator();
    let stages = [stage(
        1,
        &json!({"ad_model": "mediapipe_face_full", "ad_conf": 55, "ad_dilate_erode": 0}),
    )];

    orch.process_image(&mut JobContext::default(), &stages, canvas())
        .unwrap();

    assert_eq!(harness.calls(), ["landmark mediapipe_face_full 0.55"]);
    assert_eq!(orch.engine().jobs.len(), 1);
}

// ───────────────────────── Job contents ──────────────────────────

#[test]
fn prompt_and_seed_wrap_around_per_image_lists() {
    let harness = Harness::new(ScriptedDetector::default().with("face.pt", vec![square(0, 0, 4)]));
    let mut orch = harness.orchestrator();
    let mut ctx = JobContext {
        all_prompts: vec!["p0".into(), "p1".into(), "p2".into()],
        all_seeds: vec![10, 20, 30],
        image_index: Some(4),
        ..JobContext::default()
    };

    let out = orch
        .process_image(&mut ctx, &[exact(1, "face.pt")], canvas())
        .unwrap();

    assert_eq!(out.report.image_index, 5);
    let job = &orch.engine().jobs[0];
    assert_eq!(job.prompt, "p2");
    assert_eq!(job.seed, 30);
}

#[test]
fn incompatible_sampler_is_substituted() {
    let harness = Harness::new(ScriptedDetector::default().with("face.pt", vec![square(0, 0, 4)]));
    let mut orch = harness.orchestrator();
    let mut ctx = JobContext {
        sampler_name: "UniPC".into(),
        ..JobContext::default()
    };

    orch.process_image(&mut ctx, &[exact(1, "face.pt")], canvas())
        .unwrap();

    let job = &orch.engine().jobs[0];
    assert_eq!(job.sampler_name, "Euler");
    assert!(job.skip_detailer);
}

#[test]
fn sub_jobs_keep_only_allowed_extensions() {
    let harness = Harness::new(ScriptedDetector::default().with("face.pt", vec![square(0, 0, 4)]));
    let mut orch = harness.orchestrator();
    let mut ctx = JobContext {
        extensions: vec![
            Extension::new("extensions/a/scripts/wildcards.py"),
            Extension::new("extensions/b/scripts/regional_prompter.py"),
            Extension::new("extensions/c/scripts/controlnet.py"),
        ],
        ..JobContext::default()
    };
    let stages = [stage(
        1,
        &json!({
            "ad_model": "face.pt",
            "ad_dilate_erode": 0,
            "ad_controlnet_model": "control_v11p_sd15_inpaint",
            "ad_controlnet_weight": 0.5
        }),
    )];

    orch.process_image(&mut ctx, &stages, canvas()).unwrap();

    let job = &orch.engine().jobs[0];
    let stems: Vec<&str> = job.extensions.iter().map(Extension::stem).collect();
    assert_eq!(stems, ["wildcards", "controlnet"]);
    let conditioning = job.conditioning.as_ref().unwrap();
    assert!((conditioning.weight - 0.5).abs() < f64::EPSILON);
}

#[test]
fn recursive_context_is_left_untouched() {
    let harness = Harness::new(ScriptedDetector::default().with("face.pt", vec![square(0, 0, 4)]));
    let mut orch = harness.orchestrator();
    let mut ctx = JobContext {
        skip_detailer: true,
        ..JobContext::default()
    };

    let out = orch
        .process_image(&mut ctx, &[exact(1, "face.pt")], canvas())
        .unwrap();

    assert_eq!(out.image, canvas());
    assert_eq!(ctx.image_index, None);
    assert!(harness.calls().is_empty());
    assert!(orch.engine().jobs.is_empty());
}

// ───────────────────────── Failures ──────────────────────────

#[test]
fn detector_failure_propagates_unchanged() {
    let harness = Harness::new(ScriptedDetector {
        fail: Some("model file is corrupt"),
        ..ScriptedDetector::default()
    });
    let mut orch = harness.orchestrator();

    let err = orch
        .process_image(&mut JobContext::default(), &[exact(1, "face.pt")], canvas())
        .unwrap_err();

    assert!(matches!(err, PipelineError::Detector(_)));
    assert_eq!(err.to_string(), "model file is corrupt");
}

#[test]
fn engine_failure_aborts_remaining_jobs() {
    let harness = Harness::new(
        ScriptedDetector::default()
            .with("face.pt", vec![square(0, 0, 2), square(4, 4, 2), square(8, 8, 2)]),
    );
    let mut orch = harness.orchestrator_with(
        CountingEngine {
            fail_at: Some(1),
            ..CountingEngine::default()
        },
        RecordingSink::default(),
    );

    let err = orch
        .process_image(&mut JobContext::default(), &[exact(1, "face.pt")], canvas())
        .unwrap_err();

    assert!(matches!(err, PipelineError::Engine(_)));
    assert_eq!(err.to_string(), "CUDA out of memory");
    assert_eq!(orch.engine().jobs.len(), 2);
}

#[test]
fn unknown_model_lists_available_names() {
    let harness = Harness::new(ScriptedDetector::default());
    let mut orch = harness.orchestrator();

    let err = orch
        .process_image(&mut JobContext::default(), &[exact(1, "person.pt")], canvas())
        .unwrap_err();

    match err {
        PipelineError::Detect(DetectError::ModelNotFound { name, available }) => {
            assert_eq!(name, "person.pt");
            assert_eq!(
                available,
                ["mediapipe_face_full", "mediapipe_face_short", "face.pt", "hand.pt"]
            );
        }
        other => panic!("expected lookup failure, got {other:?}"),
    }
}

#[test]
fn engine_without_images_is_an_error() {
    let harness = Harness::new(ScriptedDetector::default().with("face.pt", vec![square(0, 0, 4)]));
    let mut orch = harness.orchestrator_with(
        CountingEngine {
            no_output: true,
            ..CountingEngine::default()
        },
        RecordingSink::default(),
    );

    let err = orch
        .process_image(&mut JobContext::default(), &[exact(1, "face.pt")], canvas())
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::EmptyEngineOutput { ref ordinal, mask: 1 } if ordinal == "1st"
    ));
}

// ───────────────────────── Side effects ──────────────────────────

#[test]
fn previews_and_before_snapshot_are_saved_when_enabled() {
    let mut harness = Harness::new(
        ScriptedDetector {
            preview: true,
            ..ScriptedDetector::default()
        }
        .with("face.pt", vec![square(0, 0, 4)])
        .with("hand.pt", vec![square(8, 8, 4)]),
    );
    harness.settings.save_previews = true;
    harness.settings.save_images_before = true;
    let mut orch = harness.orchestrator();
    let mut ctx = JobContext {
        prompt: "portrait".into(),
        seed: 9,
        ..JobContext::default()
    };

    orch.process_image(&mut ctx, &[exact(1, "face.pt"), exact(2, "hand.pt")], canvas())
        .unwrap();

    let saved: Vec<(SaveKind, &str)> = orch
        .sink()
        .saved
        .iter()
        .map(|r| (r.kind, r.suffix.as_str()))
        .collect();
    assert_eq!(
        saved,
        [
            (SaveKind::Preview, "-ad-preview"),
            (SaveKind::Preview, "-ad-preview-2nd"),
            (SaveKind::Before, "-ad-before"),
        ]
    );
    let before = &orch.sink().saved[2];
    assert_eq!(before.seed, 9);
    assert_eq!(before.prompt, "portrait");
}

#[test]
fn nothing_is_saved_when_disabled_or_unchanged() {
    let mut harness = Harness::new(ScriptedDetector {
        preview: true,
        ..ScriptedDetector::default()
    });
    harness.settings.save_images_before = true;
    let mut orch = harness.orchestrator();

    orch.process_image(&mut JobContext::default(), &[exact(1, "face.pt")], canvas())
        .unwrap();

    assert!(orch.sink().saved.is_empty());
}

#[test]
fn params_written_after_last_image_of_batch() {
    let harness = Harness::new(ScriptedDetector::default().with("face.pt", vec![square(0, 0, 4)]));
    let mut orch = harness.orchestrator();
    let mut ctx = JobContext {
        all_prompts: vec!["first".into(), "second".into()],
        ..JobContext::default()
    };
    let stages = [exact(1, "face.pt")];

    orch.process_image(&mut ctx, &stages, canvas()).unwrap();
    assert!(orch.sink().params.is_empty());
    orch.process_image(&mut ctx, &stages, canvas()).unwrap();

    let (engine, sink) = orch.into_parts();
    assert_eq!(sink.params.len(), 1);
    assert!(sink.params[0].starts_with("second\n"));
    assert_eq!(engine.jobs.len(), 2);
    for job in &engine.jobs {
        let mask = job.mask.as_ref().unwrap();
        assert_eq!(Dimensions::of(mask), Dimensions::of(&canvas()));
    }
}

#[test]
fn params_failure_is_swallowed() {
    let harness = Harness::new(ScriptedDetector::default().with("face.pt", vec![square(0, 0, 4)]));
    let mut orch = harness.orchestrator_with(
        CountingEngine::default(),
        RecordingSink {
            fail_params: true,
            ..RecordingSink::default()
        },
    );
    let mut ctx = JobContext {
        all_prompts: vec!["only".into()],
        ..JobContext::default()
    };

    let out = orch
        .process_image(&mut ctx, &[exact(1, "face.pt")], canvas())
        .unwrap();

    assert_eq!(counter(&out.image), 1);
}

#[test]
fn annotate_merges_stage_metadata() {
    let mut ctx = JobContext::default();
    let stages = [exact(1, "face.pt"), StageArgs::default(), exact(3, "hand.pt")];
    annotate(&mut ctx, &stages);

    let params = &ctx.extra_generation_params;
    assert_eq!(params["ADetailer model"], json!("face.pt"));
    assert_eq!(params["ADetailer model 3rd"], json!("hand.pt"));
    assert!(!params.contains_key("ADetailer model 2nd"));
    assert_eq!(
        params["ADetailer version"],
        json!(adetailer_pipeline::version())
    );

    let mut nested = JobContext {
        skip_detailer: true,
        ..JobContext::default()
    };
    annotate(&mut nested, &stages);
    assert!(nested.extra_generation_params.is_empty());
}
