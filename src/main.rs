//! PriceSight - fruit detection with price-tag reading
//!
//! Runs the detection, recognition and association pipeline over image files,
//! either one by one or as a simulated camera stream.

use anyhow::{Context, Result};
use clap::Parser;
use image::RgbaImage;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use price_sight::config::{self, AppConfig};
use price_sight::pipeline::{FramePipeline, FrameReport, FrameWorker};
use price_sight::shared::PipelineEvent;
use price_sight::storage;
use price_sight::vision::labels::PRODUCE_LABELS;
use price_sight::vision::{Backend, ModelManager, ModelVersion, TesseractRecognizer};
use price_sight::Frame;

/// PriceSight - detect fruit and read the nearest price tag
#[derive(Parser, Debug)]
#[command(name = "price-sight")]
#[command(about = "Detects fruit in images and associates each item with its nearest price tag")]
struct Args {
    /// Images to process
    #[arg(required_unless_present_any = ["provision", "write_config"])]
    images: Vec<PathBuf>,

    /// Configuration file (default: <config dir>/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Clockwise rotation needed to make the images upright (0, 90, 180, 270)
    #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
    rotation: i32,

    /// Minimum detection confidence
    #[arg(long)]
    threshold: Option<f32>,

    /// Maximum detections per image
    #[arg(long)]
    max_results: Option<usize>,

    /// Inference backend (cpu, gpu, nnapi)
    #[arg(long)]
    backend: Option<Backend>,

    /// Detection model (ssd_mobilenet_v1, yolov8n)
    #[arg(long)]
    model: Option<ModelVersion>,

    /// Use this model file instead of the cached download
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Only report produce labels (banana, apple, orange, ...)
    #[arg(long)]
    produce_only: bool,

    /// Print reports as JSON lines
    #[arg(long)]
    json: bool,

    /// Feed the images through the background worker like a camera stream
    #[arg(long)]
    stream: bool,

    /// Frames per second in stream mode
    #[arg(long, default_value = "5")]
    fps: u32,

    /// Download/copy the model and language data, then exit
    #[arg(long)]
    provision: bool,

    /// Write the effective configuration to this path
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let default_path = storage::default_config_path().ok();
    let (mut config, _) = config::resolve_config(args.config.as_deref(), default_path.as_deref())?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    if let Some(path) = &args.write_config {
        config::save_config(&config, path).with_context(|| format!("Failed to write config to {:?}", path))?;
        info!("Configuration written to {:?}", path);
        if args.images.is_empty() && !args.provision {
            return Ok(());
        }
    }

    if args.provision {
        return provision(&config);
    }

    let pipeline = FramePipeline::from_config(&config)?;

    if args.stream {
        run_stream(pipeline, &args)
    } else {
        run_single(&pipeline, &args)
    }
}

/// Apply command line overrides on top of the loaded configuration
fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(threshold) = args.threshold {
        config.detector.score_threshold = threshold;
    }
    if let Some(max_results) = args.max_results {
        config.detector.max_results = max_results;
    }
    if let Some(backend) = args.backend {
        config.detector.backend = backend;
    }
    if let Some(model) = args.model {
        config.detector.model_version = model;
    }
    if let Some(path) = &args.model_path {
        config.detector.model_path = Some(path.clone());
    }
    if args.produce_only {
        config.detector.label_allowlist = PRODUCE_LABELS.iter().map(|l| l.to_string()).collect();
    }
}

/// Fetch the detection model and OCR language data
fn provision(config: &AppConfig) -> Result<()> {
    let detector = &config.detector;
    match &detector.model_path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Model file {:?} does not exist", path);
            }
            info!("Using model file {:?}", path);
        }
        None => {
            let manager = match &detector.models_dir {
                Some(dir) => ModelManager::with_dir(dir.clone())?,
                None => ModelManager::new()?,
            };
            let path = manager.ensure_model(detector.model_version, detector.model_url.as_deref())?;
            info!("Model ready at {:?}", path);
        }
    }

    let recognizer = TesseractRecognizer::from_config(&config.ocr)?;
    let outcome = recognizer.setup().context("Failed to provision OCR language data")?;
    info!("OCR language data: {:?}", outcome);

    Ok(())
}

fn load_image(path: &Path) -> Result<RgbaImage> {
    Ok(image::open(path)
        .with_context(|| format!("Failed to open image {:?}", path))?
        .to_rgba8())
}

fn run_single(pipeline: &FramePipeline, args: &Args) -> Result<()> {
    let mut failures = 0usize;

    for path in &args.images {
        let image = match load_image(path) {
            Ok(image) => image,
            Err(e) => {
                error!("{:#}", e);
                failures += 1;
                continue;
            }
        };

        match pipeline.process_image(image, args.rotation) {
            Ok(report) => print_report(&path.display().to_string(), &report, args.json)?,
            Err(e) => {
                error!("{}: {}", path.display(), e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} images failed", failures, args.images.len());
    }
    Ok(())
}

fn run_stream(pipeline: FramePipeline, args: &Args) -> Result<()> {
    let frames = args
        .images
        .iter()
        .map(|path| load_image(path))
        .collect::<Result<Vec<_>>>()?;
    if frames.is_empty() {
        return Ok(());
    }

    let interval = Duration::from_secs_f64(1.0 / args.fps.max(1) as f64);
    let worker = FrameWorker::spawn(pipeline);
    let events = worker.events();
    let stats = worker.stats();

    info!("Streaming {} frames at {} fps", frames.len(), args.fps.max(1));

    let mut last_id = None;
    for image in frames {
        let frame = Frame::new(image, args.rotation)?;
        last_id = Some(frame.id);
        worker.submit(frame);

        for event in events.try_iter() {
            print_event(&event, args.json)?;
        }
        std::thread::sleep(interval);
    }

    // Wait for the last frame to come back
    loop {
        let event = match events.recv_timeout(Duration::from_secs(120)) {
            Ok(event) => event,
            Err(_) => {
                warn!("Timed out waiting for the last frame");
                break;
            }
        };
        print_event(&event, args.json)?;
        let done = match &event {
            PipelineEvent::Results(report) => Some(report.frame_id) == last_id,
            PipelineEvent::Error { frame_id, .. } => *frame_id == last_id,
            PipelineEvent::FrameDropped { frame_id } => Some(*frame_id) == last_id,
            PipelineEvent::Stopped => true,
        };
        if done {
            break;
        }
    }

    drop(worker);
    for event in events.try_iter() {
        print_event(&event, args.json)?;
    }

    let stats = stats.read();
    info!(
        "Stream finished: {} processed, {} dropped, {} events lost",
        stats.frames_processed, stats.frames_dropped, stats.events_dropped
    );
    Ok(())
}

fn print_event(event: &PipelineEvent, json: bool) -> Result<()> {
    match event {
        PipelineEvent::Results(report) => print_report(&report.frame_id.to_string(), report, json)?,
        PipelineEvent::Error { frame_id, message } => match frame_id {
            Some(id) => warn!("Frame {}: {}", id, message),
            None => warn!("{}", message),
        },
        PipelineEvent::FrameDropped { frame_id } => info!("Frame {} dropped", frame_id),
        PipelineEvent::Stopped => info!("Worker stopped"),
    }
    Ok(())
}

fn print_report(source: &str, report: &FrameReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
        return Ok(());
    }

    let result = &report.result;
    let recognition = report
        .recognition_time_ms
        .map(|ms| format!("{} ms", ms))
        .unwrap_or_else(|| "failed".to_string());
    println!(
        "{}: {} item(s) in {}x{} (detection {} ms, recognition {})",
        source,
        result.associations.len(),
        result.frame_width,
        result.frame_height,
        result.inference_time_ms,
        recognition
    );

    for association in &result.associations {
        let d = &association.detection;
        let b = &d.bounding_box;
        let price = match (&association.price_text, association.distance) {
            (Some(text), Some(distance)) => format!("{} ({:.1} px)", text.replace('\n', " "), distance),
            (Some(text), None) => text.replace('\n', " "),
            (None, _) => "no price".to_string(),
        };
        println!(
            "  {:<10} {:.2} [{:.0}, {:.0}, {:.0}, {:.0}] -> {}",
            d.label, d.confidence, b.x0, b.y0, b.x1, b.y1, price
        );
    }

    for notice in &report.notices {
        println!("  note: {}", notice);
    }
    for error in &report.errors {
        println!("  error: {}", error);
    }

    Ok(())
}
