use std::path::Path;

use crate::errors::{DiagnosisError, Result};

pub const DEFAULT_ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];
pub const DEFAULT_MAX_CONTENT_LENGTH: u64 = 16 * 1024 * 1024;

/// Upload checks applied before any bytes reach the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    allowed_extensions: Vec<String>,
    max_content_length: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

impl UploadPolicy {
    pub fn new<I, S>(allowed_extensions: I, max_content_length: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_lowercase())
                .collect(),
            max_content_length,
        }
    }

    pub const fn with_max_content_length(mut self, max_content_length: u64) -> Self {
        self.max_content_length = max_content_length;
        self
    }

    pub const fn max_content_length(&self) -> u64 {
        self.max_content_length
    }

    pub fn allowed_extensions(&self) -> &[String] {
        &self.allowed_extensions
    }

    /// Case-insensitive extension check; files without an extension are refused.
    pub fn is_allowed_extension(&self, path: &Path) -> bool {
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            let extension = extension.to_lowercase();
            self.allowed_extensions.iter().any(|ext| *ext == extension)
        } else {
            false
        }
    }

    pub fn check(&self, path: &Path, content_length: u64) -> Result<()> {
        if !self.is_allowed_extension(path) {
            return Err(DiagnosisError::Rejected {
                path: path.to_path_buf(),
                reason: format!(
                    "file type not allowed, expected one of: {}",
                    self.allowed_extensions.join(", ")
                ),
            });
        }
        if content_length > self.max_content_length {
            return Err(DiagnosisError::Rejected {
                path: path.to_path_buf(),
                reason: format!(
                    "{content_length} bytes exceeds the {} byte limit",
                    self.max_content_length
                ),
            });
        }
        Ok(())
    }
}
