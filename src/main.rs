use std::{
    error::Error,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use leaf_diagnosis::{
    Config, DiagnosisError, Dispatcher, InferenceService, OutputFormat, PredictionResult,
    UploadPolicy,
};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use walkdir::WalkDir;

#[derive(Serialize)]
struct Report<'a> {
    path: String,
    #[serde(flatten)]
    result: &'a PredictionResult,
}

#[derive(Serialize)]
struct Failure {
    path: String,
    kind: String,
    error: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    setup_logging(&config)?;

    ensure!(
        config.model_path.exists(),
        "Model path does not exist: {}",
        config.model_path.display()
    );
    for input in &config.inputs {
        ensure!(input.exists(), "Input does not exist: {}", input.display());
    }

    let service = InferenceService::from_config(&config).context("Failed to load artifacts")?;
    let dispatcher = Dispatcher::new(Arc::new(service), config.max_in_flight)
        .with_timeout(config.timeout());
    let policy = config.upload_policy();

    let image_paths = collect_image_paths(&config.inputs, &policy);
    if image_paths.is_empty() {
        warn!("no images found in the given inputs");
        return Ok(());
    }
    info!(images = image_paths.len(), "classifying");

    let progress_bar = ProgressBar::new(image_paths.len() as u64);
    progress_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
        )?
        .progress_chars("#>-"),
    );

    let limit = dispatcher.max_in_flight() * 2;
    let mut tasks = JoinSet::new();
    let mut failed = 0usize;
    for path in image_paths.iter().cloned() {
        while tasks.len() >= limit {
            if let Some(joined) = tasks.join_next().await {
                failed += report(joined?, config.format, &progress_bar)?;
            }
        }
        let dispatcher = dispatcher.clone();
        let policy = policy.clone();
        tasks.spawn(async move {
            let result = dispatcher.classify_file(&path, &policy).await;
            (path, result)
        });
    }
    while let Some(joined) = tasks.join_next().await {
        failed += report(joined?, config.format, &progress_bar)?;
    }
    progress_bar.finish();

    info!(classified = image_paths.len() - failed, failed, "done");
    if failed > 0 {
        bail!("{failed} of {} images could not be classified", image_paths.len());
    }
    Ok(())
}

fn setup_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize logger")
}

/// Files named directly are always attempted so that policy rejections are
/// reported; directory contents are filtered by extension.
fn collect_image_paths(inputs: &[PathBuf], policy: &UploadPolicy) -> Vec<PathBuf> {
    let mut image_paths = Vec::new();
    for input in inputs {
        if input.is_file() {
            image_paths.push(input.clone());
            continue;
        }
        let mut entries = WalkDir::new(input)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && policy.is_allowed_extension(e.path()))
            .map(|e| e.into_path())
            .collect::<Vec<_>>();
        entries.sort();
        image_paths.extend(entries);
    }
    image_paths
}

/// Prints one outcome and returns 1 if it was a failure.
fn report(
    (path, result): (PathBuf, leaf_diagnosis::Result<PredictionResult>),
    format: OutputFormat,
    progress_bar: &ProgressBar,
) -> Result<usize> {
    progress_bar.inc(1);
    let path = path.display().to_string();
    match result {
        Ok(prediction) => {
            let line = match format {
                OutputFormat::Json => serde_json::to_string(&Report {
                    path,
                    result: &prediction,
                })?,
                OutputFormat::Text => format!(
                    "{path}\n  {} ({}) {:.1}%\n  {}\n  Treatment: {}\n",
                    prediction.display_name,
                    prediction.class_id,
                    prediction.confidence * 100.0,
                    prediction.description,
                    prediction.treatment
                ),
            };
            progress_bar.suspend(|| println!("{line}"));
            Ok(0)
        }
        Err(err) => {
            let kind = format!("{:?}", err.kind());
            let error = error_chain(&err);
            warn!(%path, %kind, "{error}");
            if format == OutputFormat::Json {
                let line = serde_json::to_string(&Failure { path, kind, error })?;
                progress_bar.suspend(|| println!("{line}"));
            }
            Ok(1)
        }
    }
}

fn error_chain(err: &DiagnosisError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
