use clap::{ArgAction, Parser};
use image::imageops::FilterType;
use std::path::PathBuf;
use std::time::Duration;

use crate::decoder::{filter_from_name, ImageDecoder};
use crate::model::{ModelOptions, OutputActivation};
use crate::policy::{UploadPolicy, DEFAULT_MAX_CONTENT_LENGTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// One JSON object per line.
    Json,
    Text,
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Leaf images, or directories searched recursively for them
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    #[arg(short, long)]
    pub model_path: PathBuf,

    /// Index-to-class mapping; the bundled 38-class mapping when omitted
    #[arg(short, long)]
    pub class_indices: Option<PathBuf>,

    /// Disease descriptions; the bundled English knowledge base when omitted
    #[arg(short, long)]
    pub knowledge_base: Option<PathBuf>,

    #[arg(short, long, default_value = "json", value_parser = check_format)]
    pub format: OutputFormat,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(long, default_value_t = ImageDecoder::DEFAULT_SIZE)]
    pub image_size: u32,

    #[arg(long, default_value = "nearest", value_parser = check_filter)]
    pub filter: FilterType,

    #[arg(long, default_value_t = ImageDecoder::DEFAULT_MAX_DIMENSION)]
    pub max_dimension: u32,

    #[arg(long, default_value = "identity", value_parser = check_activation)]
    pub activation: OutputActivation,

    /// ONNX Runtime sessions serving requests in parallel
    #[arg(long, default_value_t = 1)]
    pub replicas: usize,

    /// Intra-op threads per session (0 = runtime default)
    #[arg(long, default_value_t = 0)]
    pub intra_threads: usize,

    #[arg(long, default_value_t = default_parallelism())]
    pub max_in_flight: usize,

    #[arg(long, default_value_t = 30_000)]
    pub timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_CONTENT_LENGTH)]
    pub max_upload_bytes: u64,

    /// Refuse to start when a class has no knowledge base entry
    #[arg(long)]
    pub require_complete_knowledge_base: bool,

    /// -v for debug logs, -vv for trace
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Config {
    pub fn model_options(&self) -> ModelOptions {
        ModelOptions {
            input_size: self.image_size,
            device_id: self.device_id,
            replicas: self.replicas.max(1),
            intra_threads: self.intra_threads,
            activation: self.activation,
        }
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy::default().with_max_content_length(self.max_upload_bytes)
    }

    /// Default log directive for the chosen verbosity.
    pub const fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

fn check_format(s: &str) -> Result<OutputFormat, String> {
    match s.to_ascii_lowercase().as_str() {
        "json" => Ok(OutputFormat::Json),
        "text" => Ok(OutputFormat::Text),
        _ => Err(format!("{s} is not supported. Supported formats: `json`, `text`")),
    }
}

fn check_filter(s: &str) -> Result<FilterType, String> {
    filter_from_name(s).ok_or_else(|| {
        format!(
            "{s} is not a resize filter. Supported filters: `nearest`, `triangle`, `catmull-rom`, `gaussian`, `lanczos3`"
        )
    })
}

fn check_activation(s: &str) -> Result<OutputActivation, String> {
    match s.to_ascii_lowercase().as_str() {
        "identity" | "none" => Ok(OutputActivation::Identity),
        "softmax" => Ok(OutputActivation::Softmax),
        _ => Err(format!("{s} is not supported. Supported activations: `identity`, `softmax`")),
    }
}
