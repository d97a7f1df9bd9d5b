//! Parquet storage for the bar and ladder tables.
//!
//! Layout:
//! ```text
//! {data_dir}/daily_bars.parquet
//! {data_dir}/limit_up_ladder.parquet
//! {data_dir}/concept_tags.json
//! {data_dir}/meta.json
//! ```
//!
//! Writes go to `*.tmp` and are renamed into place. When that fails the
//! same frame is written to `{stem}_backup.parquet` and the save reports
//! `SaveOutcome::Backup`.

use crate::domain::{
    date_key, parse_date_key, BoardPattern, ConceptTags, DailyBar, LimitUpRecord,
};
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

pub const BARS_FILE: &str = "daily_bars.parquet";
pub const LADDER_FILE: &str = "limit_up_ladder.parquet";
pub const TAGS_FILE: &str = "concept_tags.json";
pub const META_FILE: &str = "meta.json";

pub const COL_SYMBOL: &str = "symbol";
pub const COL_NAME: &str = "name";
pub const COL_DATE: &str = "date";
pub const COL_OPEN: &str = "open";
pub const COL_HIGH: &str = "high";
pub const COL_LOW: &str = "low";
pub const COL_CLOSE: &str = "close";
pub const COL_VOLUME: &str = "volume";
pub const COL_AMOUNT: &str = "amount";

const COL_LIMIT_PRICE: &str = "limit_price";
const COL_IS_LIMIT_UP: &str = "is_limit_up";
const COL_CONSECUTIVE: &str = "consecutive_days";
const COL_PATTERN: &str = "board_pattern";
const COL_NEXT_OPEN: &str = "next_day_open_change_pct";
const COL_TAGS: &str = "concept_tags";

/// Last stored date per symbol.
pub type Coverage = HashMap<String, NaiveDate>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema error: {0}")]
    Schema(String),
}

impl From<PolarsError> for StorageError {
    fn from(e: PolarsError) -> Self {
        StorageError::Parquet(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Merge with stored rows; the new row wins on (symbol, date).
    Append,
    /// Replace the whole table.
    Replace,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Written { path: PathBuf, rows: usize },
    /// The primary write failed; the frame went to `path` instead.
    Backup { path: PathBuf, error: String },
}

impl SaveOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, SaveOutcome::Written { .. })
    }
}

/// Per-table sidecar entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub rows: usize,
    pub symbols: usize,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub data_hash: String,
    pub updated_at: chrono::NaiveDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageMeta {
    #[serde(default)]
    pub tables: BTreeMap<String, TableMeta>,
}

/// Persistence for bars, ladder records and concept tags.
pub trait Storage {
    /// Stored bars, optionally restricted to `symbols`, sorted by (symbol, date).
    fn load_bars(&self, symbols: Option<&[String]>) -> Result<Vec<DailyBar>, StorageError>;

    fn save_bars(&self, rows: &[DailyBar], mode: SaveMode) -> Result<SaveOutcome, StorageError>;

    fn load_ladder(&self) -> Result<Vec<LimitUpRecord>, StorageError>;

    /// Replace the ladder table.
    fn save_ladder(&self, rows: &[LimitUpRecord]) -> Result<SaveOutcome, StorageError>;

    fn load_tags(&self) -> Result<BTreeMap<String, ConceptTags>, StorageError>;

    fn save_tags(&self, tags: &BTreeMap<String, ConceptTags>) -> Result<(), StorageError>;

    /// Last stored date per symbol.
    fn coverage(&self) -> Result<Coverage, StorageError>;
}

pub struct ParquetStorage {
    data_dir: PathBuf,
}

impl ParquetStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn bars_path(&self) -> PathBuf {
        self.data_dir.join(BARS_FILE)
    }

    pub fn ladder_path(&self) -> PathBuf {
        self.data_dir.join(LADDER_FILE)
    }

    fn tags_path(&self) -> PathBuf {
        self.data_dir.join(TAGS_FILE)
    }

    fn meta_path(&self) -> PathBuf {
        self.data_dir.join(META_FILE)
    }

    /// Sidecar metadata; empty when nothing has been written yet.
    pub fn meta(&self) -> Result<StorageMeta, StorageError> {
        match fs::read_to_string(self.meta_path()) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StorageMeta::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn update_meta(&self, table: &str, entry: TableMeta) -> Result<(), StorageError> {
        let mut meta = self.meta().unwrap_or_else(|e| {
            warn!(error = %e, "unreadable meta.json, rewriting");
            StorageMeta::default()
        });
        meta.tables.insert(table.to_string(), entry);
        let path = self.meta_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&meta)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Write `df` atomically to `path`, falling back to the backup file.
    fn write_table(&self, df: &mut DataFrame, path: &Path) -> Result<SaveOutcome, StorageError> {
        fs::create_dir_all(&self.data_dir)?;
        let tmp = path.with_extension("parquet.tmp");

        let primary = write_parquet(df, &tmp).and_then(|_| {
            fs::rename(&tmp, path).map_err(|e| {
                let _ = fs::remove_file(&tmp);
                StorageError::Io(e)
            })
        });

        match primary {
            Ok(()) => Ok(SaveOutcome::Written {
                path: path.to_path_buf(),
                rows: df.height(),
            }),
            Err(primary_err) => {
                let _ = fs::remove_file(&tmp);
                let backup = backup_path(path);
                error!(path = %path.display(), error = %primary_err, "table write failed, trying backup");
                match write_parquet(df, &backup) {
                    Ok(()) => {
                        warn!(backup = %backup.display(), "table saved to backup file");
                        Ok(SaveOutcome::Backup {
                            path: backup,
                            error: primary_err.to_string(),
                        })
                    }
                    Err(backup_err) => {
                        error!(backup = %backup.display(), error = %backup_err, "backup write failed");
                        Err(primary_err)
                    }
                }
            }
        }
    }

    fn read_frame(path: &Path) -> Result<Option<DataFrame>, StorageError> {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(ParquetReader::new(file).finish()?))
    }
}

impl Storage for ParquetStorage {
    fn load_bars(&self, symbols: Option<&[String]>) -> Result<Vec<DailyBar>, StorageError> {
        let Some(df) = Self::read_frame(&self.bars_path())? else {
            return Ok(Vec::new());
        };
        let mut bars = frame_to_bars(&df)?;
        if let Some(wanted) = symbols {
            bars.retain(|b| wanted.iter().any(|s| *s == b.symbol));
        }
        crate::domain::sort_canonical(&mut bars);
        Ok(bars)
    }

    fn save_bars(&self, rows: &[DailyBar], mode: SaveMode) -> Result<SaveOutcome, StorageError> {
        let merged = match mode {
            SaveMode::Replace => merge_bars(Vec::new(), rows.to_vec()),
            SaveMode::Append => merge_bars(self.load_bars(None)?, rows.to_vec()),
        };

        let mut df = bars_frame(&merged)?;
        let outcome = self.write_table(&mut df, &self.bars_path())?;
        if outcome.is_written() {
            self.update_meta("daily_bars", table_meta(&merged, |b| (&b.symbol, b.date))?)?;
        }
        info!(rows = merged.len(), new_rows = rows.len(), ?mode, "bars saved");
        Ok(outcome)
    }

    fn load_ladder(&self) -> Result<Vec<LimitUpRecord>, StorageError> {
        match Self::read_frame(&self.ladder_path())? {
            Some(df) => frame_to_ladder(&df),
            None => Ok(Vec::new()),
        }
    }

    fn save_ladder(&self, rows: &[LimitUpRecord]) -> Result<SaveOutcome, StorageError> {
        let mut df = ladder_frame(rows)?;
        let outcome = self.write_table(&mut df, &self.ladder_path())?;
        if outcome.is_written() {
            self.update_meta("limit_up_ladder", table_meta(rows, |r| (&r.symbol, r.date))?)?;
        }
        Ok(outcome)
    }

    fn load_tags(&self) -> Result<BTreeMap<String, ConceptTags>, StorageError> {
        match fs::read_to_string(self.tags_path()) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_tags(&self, tags: &BTreeMap<String, ConceptTags>) -> Result<(), StorageError> {
        fs::create_dir_all(&self.data_dir)?;
        let path = self.tags_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(tags)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn coverage(&self) -> Result<Coverage, StorageError> {
        let mut coverage = Coverage::new();
        for bar in self.load_bars(None)? {
            coverage
                .entry(bar.symbol)
                .and_modify(|d| *d = (*d).max(bar.date))
                .or_insert(bar.date);
        }
        Ok(coverage)
    }
}

/// Concatenate stored and new rows, keep the newest per (symbol, date), sort.
pub fn merge_bars(existing: Vec<DailyBar>, new: Vec<DailyBar>) -> Vec<DailyBar> {
    let mut by_key: BTreeMap<(String, NaiveDate), DailyBar> = BTreeMap::new();
    for mut bar in existing.into_iter().chain(new) {
        bar.pre_close = None;
        by_key.insert((bar.symbol.clone(), bar.date), bar);
    }
    by_key.into_values().collect()
}

/// Give refetched rows the name stored for the same (symbol, date).
///
/// Sources only report an instrument's current name, while the ST board is
/// judged from the name carried on each day's bar. Rows already on disk keep
/// the name they were first stored with; only new dates take the current one.
/// Returns how many rows were renamed.
pub fn keep_stored_names(fresh: &mut [DailyBar], stored: &[DailyBar]) -> usize {
    let names: HashMap<(&str, NaiveDate), &str> = stored
        .iter()
        .filter(|b| !b.name.is_empty())
        .map(|b| ((b.symbol.as_str(), b.date), b.name.as_str()))
        .collect();
    let mut renamed = 0;
    for bar in fresh.iter_mut() {
        if let Some(&name) = names.get(&(bar.symbol.as_str(), bar.date)) {
            if bar.name != name {
                bar.name = name.to_string();
                renamed += 1;
            }
        }
    }
    renamed
}

/// Tags from this run replace stored ones; symbols without fresh tags keep theirs.
pub fn merge_tags(
    mut stored: BTreeMap<String, ConceptTags>,
    fresh: BTreeMap<String, ConceptTags>,
) -> BTreeMap<String, ConceptTags> {
    for (symbol, tags) in fresh {
        if !tags.is_empty() {
            stored.insert(symbol, tags);
        }
    }
    stored
}

fn backup_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("table");
    path.with_file_name(format!("{stem}_backup.parquet"))
}

fn table_meta<T: Serialize>(
    rows: &[T],
    key: impl Fn(&T) -> (&String, NaiveDate),
) -> Result<TableMeta, StorageError> {
    let symbols: std::collections::HashSet<&String> = rows.iter().map(|r| key(r).0).collect();
    let start = rows.iter().map(|r| key(r).1).min();
    let end = rows.iter().map(|r| key(r).1).max();
    Ok(TableMeta {
        rows: rows.len(),
        symbols: symbols.len(),
        start_date: start.map(date_key),
        end_date: end.map(date_key),
        data_hash: blake3::hash(&serde_json::to_vec(rows)?).to_hex().to_string(),
        updated_at: chrono::Local::now().naive_local(),
    })
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), StorageError> {
    let file = fs::File::create(path)?;
    ParquetWriter::new(file).finish(df)?;
    Ok(())
}

/// Bars as a polars frame in the persisted schema.
pub fn bars_frame(bars: &[DailyBar]) -> Result<DataFrame, StorageError> {
    let df = DataFrame::new(vec![
        Column::new(COL_SYMBOL.into(), bars.iter().map(|b| b.symbol.as_str()).collect::<Vec<_>>()),
        Column::new(COL_NAME.into(), bars.iter().map(|b| b.name.as_str()).collect::<Vec<_>>()),
        Column::new(COL_DATE.into(), bars.iter().map(|b| date_key(b.date)).collect::<Vec<_>>()),
        Column::new(COL_OPEN.into(), bars.iter().map(|b| b.open).collect::<Vec<_>>()),
        Column::new(COL_HIGH.into(), bars.iter().map(|b| b.high).collect::<Vec<_>>()),
        Column::new(COL_LOW.into(), bars.iter().map(|b| b.low).collect::<Vec<_>>()),
        Column::new(COL_CLOSE.into(), bars.iter().map(|b| b.close).collect::<Vec<_>>()),
        Column::new(COL_VOLUME.into(), bars.iter().map(|b| b.volume).collect::<Vec<_>>()),
        Column::new(COL_AMOUNT.into(), bars.iter().map(|b| b.amount).collect::<Vec<_>>()),
    ])?;
    Ok(df)
}

fn str_col<'a>(df: &'a DataFrame, name: &str) -> Result<&'a StringChunked, StorageError> {
    df.column(name)?
        .str()
        .map_err(|e| StorageError::Schema(format!("column '{name}': {e}")))
}

fn f64_col<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Float64Chunked, StorageError> {
    df.column(name)?
        .f64()
        .map_err(|e| StorageError::Schema(format!("column '{name}': {e}")))
}

fn row_date(dates: &StringChunked, i: usize) -> Result<NaiveDate, StorageError> {
    let raw = dates
        .get(i)
        .ok_or_else(|| StorageError::Schema(format!("null date at row {i}")))?;
    parse_date_key(raw).ok_or_else(|| StorageError::Schema(format!("bad date '{raw}' at row {i}")))
}

pub fn frame_to_bars(df: &DataFrame) -> Result<Vec<DailyBar>, StorageError> {
    let symbols = str_col(df, COL_SYMBOL)?;
    let names = str_col(df, COL_NAME)?;
    let dates = str_col(df, COL_DATE)?;
    let opens = f64_col(df, COL_OPEN)?;
    let highs = f64_col(df, COL_HIGH)?;
    let lows = f64_col(df, COL_LOW)?;
    let closes = f64_col(df, COL_CLOSE)?;
    let amounts = f64_col(df, COL_AMOUNT)?;
    let volumes = df
        .column(COL_VOLUME)?
        .u64()
        .map_err(|e| StorageError::Schema(format!("column '{COL_VOLUME}': {e}")))?;

    let mut bars = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        bars.push(DailyBar {
            symbol: symbols
                .get(i)
                .ok_or_else(|| StorageError::Schema(format!("null symbol at row {i}")))?
                .to_string(),
            name: names.get(i).unwrap_or_default().to_string(),
            date: row_date(dates, i)?,
            open: opens.get(i).unwrap_or(f64::NAN),
            high: highs.get(i).unwrap_or(f64::NAN),
            low: lows.get(i).unwrap_or(f64::NAN),
            close: closes.get(i).unwrap_or(f64::NAN),
            volume: volumes.get(i).unwrap_or(0),
            amount: amounts.get(i).unwrap_or(f64::NAN),
            pre_close: None,
        });
    }
    Ok(bars)
}

pub fn ladder_frame(rows: &[LimitUpRecord]) -> Result<DataFrame, StorageError> {
    let df = DataFrame::new(vec![
        Column::new(COL_SYMBOL.into(), rows.iter().map(|r| r.symbol.as_str()).collect::<Vec<_>>()),
        Column::new(COL_NAME.into(), rows.iter().map(|r| r.name.as_str()).collect::<Vec<_>>()),
        Column::new(COL_DATE.into(), rows.iter().map(|r| date_key(r.date)).collect::<Vec<_>>()),
        Column::new(COL_CLOSE.into(), rows.iter().map(|r| r.close).collect::<Vec<_>>()),
        Column::new(COL_LIMIT_PRICE.into(), rows.iter().map(|r| r.limit_price).collect::<Vec<_>>()),
        Column::new(COL_IS_LIMIT_UP.into(), rows.iter().map(|r| r.is_limit_up).collect::<Vec<_>>()),
        Column::new(COL_CONSECUTIVE.into(), rows.iter().map(|r| r.consecutive_days).collect::<Vec<_>>()),
        Column::new(
            COL_PATTERN.into(),
            rows.iter()
                .map(|r| r.board_pattern.map(|p| p.as_str()))
                .collect::<Vec<_>>(),
        ),
        Column::new(
            COL_NEXT_OPEN.into(),
            rows.iter().map(|r| r.next_day_open_change_pct).collect::<Vec<_>>(),
        ),
        Column::new(
            COL_TAGS.into(),
            rows.iter().map(|r| r.concept_tags.join(",")).collect::<Vec<_>>(),
        ),
    ])?;
    Ok(df)
}

pub fn frame_to_ladder(df: &DataFrame) -> Result<Vec<LimitUpRecord>, StorageError> {
    let symbols = str_col(df, COL_SYMBOL)?;
    let names = str_col(df, COL_NAME)?;
    let dates = str_col(df, COL_DATE)?;
    let closes = f64_col(df, COL_CLOSE)?;
    let limits = f64_col(df, COL_LIMIT_PRICE)?;
    let next_open = f64_col(df, COL_NEXT_OPEN)?;
    let patterns = str_col(df, COL_PATTERN)?;
    let tags = str_col(df, COL_TAGS)?;
    let hits = df
        .column(COL_IS_LIMIT_UP)?
        .bool()
        .map_err(|e| StorageError::Schema(format!("column '{COL_IS_LIMIT_UP}': {e}")))?;
    let streaks = df
        .column(COL_CONSECUTIVE)?
        .u32()
        .map_err(|e| StorageError::Schema(format!("column '{COL_CONSECUTIVE}': {e}")))?;

    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let board_pattern = match patterns.get(i) {
            Some(p) => Some(p.parse::<BoardPattern>().map_err(StorageError::Schema)?),
            None => None,
        };
        rows.push(LimitUpRecord {
            symbol: symbols.get(i).unwrap_or_default().to_string(),
            name: names.get(i).unwrap_or_default().to_string(),
            date: row_date(dates, i)?,
            close: closes.get(i).unwrap_or(f64::NAN),
            limit_price: limits.get(i),
            is_limit_up: hits.get(i).unwrap_or(false),
            consecutive_days: streaks.get(i).unwrap_or(0),
            board_pattern,
            next_day_open_change_pct: next_open.get(i),
            concept_tags: tags
                .get(i)
                .filter(|s| !s.is_empty())
                .map(|s| s.split(',').map(String::from).collect())
                .unwrap_or_default(),
        });
    }
    Ok(rows)
}
