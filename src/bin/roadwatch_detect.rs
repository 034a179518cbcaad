//! roadwatch_detect - one-shot detection over a local image or video

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use image::ImageFormat;
use serde_json::json;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use roadwatch::config::ServiceConfig;
use roadwatch::{CancelToken, DetectionService, GeoPoint, ModelType};

#[path = "../ui.rs"]
mod ui;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Domain model (traffic_violation|pothole).
    #[arg(long, default_value = "traffic_violation")]
    model: String,
    /// Input image or video path, or stub://<frames> for a synthetic video.
    #[arg(long)]
    input: String,
    /// Output path. Defaults to <stem>_output.jpg or <stem>_output.mp4 next to the input.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Latitude attached to the detections.
    #[arg(long, requires = "lon", allow_hyphen_values = true)]
    lat: Option<f64>,
    /// Longitude attached to the detections.
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lon: Option<f64>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(DEFAULT_LOG_FILTER),
    )
    .init();
    let args = Args::parse();
    let ui = ui::Ui::new(
        ui::UiMode::from_flag(&args.ui),
        std::io::stderr().is_terminal(),
    );

    let model: ModelType = args.model.parse()?;
    let location = match (args.lat, args.lon) {
        (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)?),
        _ => None,
    };

    let service = {
        let stage = ui.stage("Load models");
        let config = ServiceConfig::load()?;
        let registry = config.build_registry()?;
        stage.detail(format!("{} backends", registry.list().len()));
        DetectionService::new(
            Arc::new(registry),
            Arc::new(config.build_annotator()?),
            Arc::new(config.build_stats()),
        )
    };

    let summary = if is_image(&args.input) {
        let output = args
            .output
            .unwrap_or_else(|| output_next_to(&args.input, "jpg"));
        let result = {
            let stage = ui.stage("Detect image");
            let bytes = std::fs::read(&args.input)
                .with_context(|| format!("failed to read {}", args.input))?;
            let result = service.handle_image_bytes(&bytes, model, location)?;
            stage.detail(format!("{} detections", result.detections.len()));
            result
        };
        {
            let _stage = ui.stage("Write annotated image");
            result
                .annotated
                .save_with_format(&output, ImageFormat::Jpeg)
                .with_context(|| format!("failed to write {}", output.display()))?;
        }
        json!({
            "model_used": model,
            "processed_image": output.display().to_string(),
            "detected_objects": result.detections,
            "skipped": result.skipped,
        })
    } else {
        let output = args
            .output
            .unwrap_or_else(|| output_next_to(&args.input, "mp4"));
        let output_str = output
            .to_str()
            .ok_or_else(|| anyhow!("output path is not valid UTF-8"))?;
        let stage = ui.stage("Process video");
        let video = service.handle_video(
            &args.input,
            output_str,
            model,
            location,
            &CancelToken::new(),
        )?;
        stage.detail(format!(
            "{} frames, {} skipped, {} detections",
            video.frames_written,
            video.frames_skipped,
            video.detections.len()
        ));
        drop(stage);
        serde_json::to_value(&video)?
    };

    let snapshot = service.snapshot();
    let report = json!({
        "result": summary,
        "stats": snapshot.counters,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn is_image(input: &str) -> bool {
    Path::new(input)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

fn output_next_to(input: &str, ext: &str) -> PathBuf {
    if input.starts_with("stub://") {
        return PathBuf::from("stub://output");
    }
    let path = Path::new(input);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    path.with_file_name(format!("{}_output.{}", stem, ext))
}
