//! Run summaries handed back to the CLI.

use chrono::NaiveDate;
use ladderlab_core::data::{TableMeta, TeardownReport};
use ladderlab_core::domain::{BoardPattern, PromotionRate};
use ladderlab_core::ladder::ClassificationAnomaly;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureLine {
    pub symbol: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub full_refresh: bool,
    pub instruments: usize,
    pub succeeded: usize,
    pub failures: Vec<FailureLine>,
    pub up_to_date: usize,
    pub fallbacks: usize,
    pub bars_fetched: usize,
    /// Table path and total stored rows; `None` when nothing new was fetched.
    pub saved: Option<(PathBuf, usize)>,
    pub soft_violations: Vec<String>,
    pub tags_fetched: usize,
    pub teardown: TeardownReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeReport {
    pub rows: usize,
    pub limit_up_rows: usize,
    pub by_pattern: BTreeMap<BoardPattern, usize>,
    pub anomalies: Vec<ClassificationAnomaly>,
    pub latest_date: Option<NaiveDate>,
    /// Streak level to symbols on `latest_date`.
    pub latest_ladder: BTreeMap<u32, Vec<String>>,
    /// Rates for the most recent date that has a following trading date.
    pub latest_promotion: Vec<PromotionRate>,
    pub ladder_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub data_dir: PathBuf,
    pub tables: BTreeMap<String, TableMeta>,
    pub tagged_symbols: usize,
}
