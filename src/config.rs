use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AppError, AppResult};

pub const DEFAULT_SCAN_PATTERN: &str = "nc/uploads/**";
pub const DEFAULT_UPLOADS_PREFIX: &str = "nc/uploads/";
pub const DEFAULT_LEGACY_PATH_PREFIX: &str = "download/";

// SQLite caps bound parameters per statement; staging batches bind one per path.
pub const MIN_SCAN_BATCH: usize = 1;
pub const MAX_SCAN_BATCH: usize = 900;
pub const MIN_IN_FLIGHT: usize = 1;
pub const MAX_IN_FLIGHT: usize = 64;
pub const MIN_PAGE_SIZE: u32 = 1;
pub const MAX_PAGE_SIZE: u32 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("max_passes must be at least 1")]
    NoPasses,
}

impl From<OptionsError> for AppError {
    fn from(error: OptionsError) -> Self {
        let field = match &error {
            OptionsError::Empty { field } => *field,
            OptionsError::NoPasses => "max_passes",
        };
        AppError::new("CONFIG/INVALID", error.to_string()).with_context("field", field)
    }
}

/// Tunables for one migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationOptions {
    /// Glob handed to the storage adapter's scan.
    pub scan_pattern: String,
    /// Storage keys are `uploads_prefix` + the attachment-relative path.
    pub uploads_prefix: String,
    /// Stripped from descriptor `path` values written by older releases.
    pub legacy_path_prefix: String,
    pub scan_batch_size: usize,
    pub max_in_flight_batches: usize,
    pub model_page_size: u32,
    pub row_page_size: u32,
    pub max_passes: u32,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            scan_pattern: DEFAULT_SCAN_PATTERN.to_string(),
            uploads_prefix: DEFAULT_UPLOADS_PREFIX.to_string(),
            legacy_path_prefix: DEFAULT_LEGACY_PATH_PREFIX.to_string(),
            scan_batch_size: 100,
            max_in_flight_batches: 4,
            model_page_size: 100,
            row_page_size: 10,
            max_passes: 1_000,
        }
    }
}

impl MigrationOptions {
    /// Read options from a JSON file; missing keys take their defaults.
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "options_read")
                .with_context("path", path.display().to_string())
        })?;
        let options: MigrationOptions = serde_json::from_str(&raw).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "options_parse")
                .with_context("path", path.display().to_string())
        })?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.scan_pattern.trim().is_empty() {
            return Err(OptionsError::Empty {
                field: "scan_pattern",
            });
        }
        if self.uploads_prefix.trim_matches('/').is_empty() {
            return Err(OptionsError::Empty {
                field: "uploads_prefix",
            });
        }
        if self.max_passes == 0 {
            return Err(OptionsError::NoPasses);
        }
        Ok(())
    }

    /// Validate, then clamp sizes into their supported ranges.
    pub fn normalized(mut self) -> AppResult<Self> {
        self.validate()?;
        if !self.uploads_prefix.ends_with('/') {
            self.uploads_prefix.push('/');
        }
        self.scan_batch_size = self.scan_batch_size.clamp(MIN_SCAN_BATCH, MAX_SCAN_BATCH);
        self.max_in_flight_batches = self
            .max_in_flight_batches
            .clamp(MIN_IN_FLIGHT, MAX_IN_FLIGHT);
        self.model_page_size = self.model_page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);
        self.row_page_size = self.row_page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);
        Ok(self)
    }
}
