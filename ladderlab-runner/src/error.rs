//! Run-level errors.

use crate::config::ConfigError;
use ladderlab_core::data::{DataError, StorageError, UniverseError, ValidationReport};
use ladderlab_core::ladder::AnalysisError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("universe error: {0}")]
    Universe(#[from] UniverseError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The table could not be written in place; the rows are in `path`.
    #[error("write failed ({error}); rows saved to backup {}", .path.display())]
    SavedToBackup { path: PathBuf, error: String },

    #[error("validation failed with {} hard violation(s)", .0.hard().count())]
    Validation(ValidationReport),

    #[error("analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("data source error: {0}")]
    Source(DataError),

    #[error("run cancelled")]
    Cancelled,

    #[error("no instruments to fetch: universe, security list and storage are all empty")]
    NoInstruments,
}

impl From<DataError> for RunError {
    fn from(e: DataError) -> Self {
        match e {
            DataError::Cancelled => RunError::Cancelled,
            other => RunError::Source(other),
        }
    }
}
