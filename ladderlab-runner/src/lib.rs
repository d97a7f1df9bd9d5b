//! LadderLab Runner: configuration and the `fetch` / `analyze` / `status` runs.
//!
//! This crate builds on `ladderlab-core` to provide:
//! - TOML configuration with per-section defaults
//! - Instrument resolution (universe file, security list, stored symbols)
//! - Fetch runs: composite fetch, validation, parquet save, concept tags
//! - Analyze runs: full ladder rebuild, saved only on success
//! - Run reports for the CLI

pub mod config;
pub mod error;
pub mod pipeline;
pub mod report;

pub use config::{ConfigError, FetchSection, LadderConfig, StorageSection, UniverseSection};
pub use error::RunError;
pub use pipeline::{default_end_date, run_analyze, run_fetch, run_status, FetchOptions, Sources};
pub use report::{AnalyzeReport, FailureLine, FetchReport, StatusReport};
