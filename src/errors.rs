use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the leaf diagnosis pipeline.
///
/// Variants are grouped by who can act on them (see [`ErrorKind`]): artifact
/// problems stop the process before it serves anything, decode and policy
/// problems are the caller's input, and inference problems belong to the host.
#[derive(Error, Debug)]
pub enum DiagnosisError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Failed to load {artifact}: {reason}")]
    Load {
        artifact: String,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Decode error: {operation} failed")]
    Decode {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Rejected {path:?}: {reason}")]
    Rejected { path: PathBuf, reason: String },

    #[error("Inference error: {operation} failed")]
    Inference {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("Deadline exceeded after {elapsed:?}")]
    DeadlineExceeded { elapsed: Duration },
}

pub type Result<T> = std::result::Result<T, DiagnosisError>;

/// Coarse classification of a [`DiagnosisError`] for callers that need to pick
/// a response, e.g. an HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad artifacts or configuration. Only produced before serving starts.
    Startup,
    /// The submitted image cannot be used. Retrying the same input is pointless.
    ClientInput,
    /// The model or the host failed. The caller may retry with backoff.
    Infrastructure,
}

impl DiagnosisError {
    pub(crate) fn load(artifact: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Load {
            artifact: artifact.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn decode(operation: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Decode {
            operation: operation.into(),
            source: message.into(),
        }
    }

    pub(crate) fn inference(operation: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Inference {
            operation: operation.into(),
            source: message.into(),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } | Self::Load { .. } | Self::FileSystem { .. } => {
                ErrorKind::Startup
            }
            Self::Decode { .. } | Self::Rejected { .. } => ErrorKind::ClientInput,
            Self::Inference { .. } | Self::DeadlineExceeded { .. } => ErrorKind::Infrastructure,
        }
    }

    /// Suggested HTTP status for a web layer surfacing this error.
    pub const fn http_status_hint(&self) -> u16 {
        match self {
            Self::Rejected { .. } => 415,
            Self::Decode { .. } => 400,
            Self::DeadlineExceeded { .. } => 504,
            Self::Inference { .. } => 503,
            Self::Configuration { .. } | Self::Load { .. } | Self::FileSystem { .. } => 500,
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should construct
/// `DiagnosisError::FileSystem` directly; this is the fallback for bare `?`.
impl From<std::io::Error> for DiagnosisError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Image crate errors only arise while reading submitted images.
impl From<image::ImageError> for DiagnosisError {
    fn from(err: image::ImageError) -> Self {
        Self::Decode {
            operation: "image decoding".to_string(),
            source: Box::new(err),
        }
    }
}

/// ONNX Runtime errors raised while serving are infrastructure failures.
/// Load paths map their errors to `Load` explicitly.
impl From<ort::Error> for DiagnosisError {
    fn from(err: ort::Error) -> Self {
        Self::Inference {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come from tensor plumbing around a model run.
impl From<ndarray::ShapeError> for DiagnosisError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Inference {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

/// JSON errors only occur while parsing artifacts at startup.
impl From<serde_json::Error> for DiagnosisError {
    fn from(err: serde_json::Error) -> Self {
        Self::Load {
            artifact: "json artifact".to_string(),
            reason: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}
