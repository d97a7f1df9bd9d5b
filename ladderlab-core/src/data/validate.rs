//! Bar table validation.
//!
//! Runs independent checks over a bar `DataFrame` and collects every
//! violation instead of stopping at the first. Hard violations make the
//! report fail; soft ones are reported only.

use super::storage::{COL_AMOUNT, COL_CLOSE, COL_DATE, COL_HIGH, COL_LOW, COL_NAME, COL_OPEN, COL_SYMBOL, COL_VOLUME};
use crate::domain::parse_date_key;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Columns that must never hold a null (or NaN).
const NON_NULL_COLUMNS: [&str; 6] = [COL_SYMBOL, COL_DATE, COL_OPEN, COL_HIGH, COL_LOW, COL_CLOSE];

/// Expected bar table schema.
pub fn bar_schema() -> Schema {
    Schema::from_iter(vec![
        Field::new(COL_SYMBOL.into(), DataType::String),
        Field::new(COL_NAME.into(), DataType::String),
        Field::new(COL_DATE.into(), DataType::String),
        Field::new(COL_OPEN.into(), DataType::Float64),
        Field::new(COL_HIGH.into(), DataType::Float64),
        Field::new(COL_LOW.into(), DataType::Float64),
        Field::new(COL_CLOSE.into(), DataType::Float64),
        Field::new(COL_VOLUME.into(), DataType::UInt64),
        Field::new(COL_AMOUNT.into(), DataType::Float64),
    ])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Null rate above which a column gets a soft violation.
    pub null_rate_warn: f64,
    /// Null rate above which a column gets a hard violation.
    pub null_rate_max: f64,
    /// Prices above this are reported as suspicious.
    pub price_ceiling: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            null_rate_warn: 0.0,
            null_rate_max: 0.01,
            price_ceiling: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    MissingColumn,
    TypeMismatch,
    BadDate,
    Ohlc,
    NonPositivePrice,
    DuplicateKey,
    NullRate,
    PriceCeiling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
    pub symbol: Option<String>,
    pub date: Option<String>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Hard => "error",
            Severity::Soft => "warning",
        };
        write!(f, "[{level}] {:?}: {}", self.kind, self.message)?;
        match (&self.symbol, &self.date) {
            (Some(s), Some(d)) => write!(f, " ({s} @ {d})"),
            (Some(s), None) => write!(f, " ({s})"),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub rows: usize,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn hard(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.severity == Severity::Hard)
    }

    pub fn soft(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.severity == Severity::Soft)
    }

    pub fn count(&self, kind: ViolationKind) -> usize {
        self.violations.iter().filter(|v| v.kind == kind).count()
    }

    fn push(&mut self, kind: ViolationKind, severity: Severity, message: String) {
        self.violations.push(Violation {
            kind,
            severity,
            message,
            symbol: None,
            date: None,
        });
    }

    fn push_row(
        &mut self,
        kind: ViolationKind,
        severity: Severity,
        message: String,
        symbol: Option<&str>,
        date: Option<&str>,
    ) {
        self.violations.push(Violation {
            kind,
            severity,
            message,
            symbol: symbol.map(String::from),
            date: date.map(String::from),
        });
    }
}

/// Typed views of the columns that passed the schema check.
struct Columns<'a> {
    symbol: Option<&'a StringChunked>,
    date: Option<&'a StringChunked>,
    open: Option<&'a Float64Chunked>,
    high: Option<&'a Float64Chunked>,
    low: Option<&'a Float64Chunked>,
    close: Option<&'a Float64Chunked>,
}

pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, df: &DataFrame) -> ValidationReport {
        let mut report = ValidationReport {
            ok: true,
            rows: df.height(),
            violations: Vec::new(),
        };
        if df.height() == 0 {
            return report;
        }

        let valid_columns = check_schema(df, &mut report);
        let typed = |name: &str| valid_columns.contains(name).then(|| df.column(name).ok()).flatten();
        let cols = Columns {
            symbol: typed(COL_SYMBOL).and_then(|c| c.str().ok()),
            date: typed(COL_DATE).and_then(|c| c.str().ok()),
            open: typed(COL_OPEN).and_then(|c| c.f64().ok()),
            high: typed(COL_HIGH).and_then(|c| c.f64().ok()),
            low: typed(COL_LOW).and_then(|c| c.f64().ok()),
            close: typed(COL_CLOSE).and_then(|c| c.f64().ok()),
        };

        check_dates(&cols, &mut report);
        self.check_prices(&cols, df.height(), &mut report);
        check_duplicates(&cols, &mut report);
        self.check_null_rates(df, &valid_columns, &mut report);

        let ok = report.hard().next().is_none();
        report.ok = ok;
        report
    }

    fn check_prices(&self, cols: &Columns<'_>, height: usize, report: &mut ValidationReport) {
        let (Some(open), Some(high), Some(low), Some(close)) = (cols.open, cols.high, cols.low, cols.close)
        else {
            return;
        };
        for i in 0..height {
            let prices = [open.get(i), high.get(i), low.get(i), close.get(i)];
            // Nulls are the null-rate check's business.
            let [Some(o), Some(h), Some(l), Some(c)] = prices else {
                continue;
            };
            if [o, h, l, c].iter().any(|p| p.is_nan()) {
                continue;
            }
            let symbol = cols.symbol.and_then(|s| s.get(i));
            let date = cols.date.and_then(|s| s.get(i));

            if [o, h, l, c].iter().any(|&p| p <= 0.0) {
                report.push_row(
                    ViolationKind::NonPositivePrice,
                    Severity::Hard,
                    format!("non-positive price (o={o}, h={h}, l={l}, c={c})"),
                    symbol,
                    date,
                );
            }
            if l > o.min(c) || h < o.max(c) {
                report.push_row(
                    ViolationKind::Ohlc,
                    Severity::Hard,
                    format!("inconsistent OHLC (o={o}, h={h}, l={l}, c={c})"),
                    symbol,
                    date,
                );
            }
            if h > self.config.price_ceiling {
                report.push_row(
                    ViolationKind::PriceCeiling,
                    Severity::Soft,
                    format!("high {h} above ceiling {}", self.config.price_ceiling),
                    symbol,
                    date,
                );
            }
        }
    }

    fn check_null_rates(&self, df: &DataFrame, valid: &HashSet<String>, report: &mut ValidationReport) {
        let height = df.height() as f64;
        for column in df.get_columns() {
            let name = column.name().as_str();
            if !valid.contains(name) && bar_schema().contains(name) {
                continue;
            }
            let nulls = column.null_count() + nan_count(column);
            if nulls == 0 {
                continue;
            }
            let rate = nulls as f64 / height;
            let message = format!("column '{name}' has {nulls} nulls ({:.2}%)", rate * 100.0);

            if NON_NULL_COLUMNS.contains(&name) || rate > self.config.null_rate_max {
                report.push(ViolationKind::NullRate, Severity::Hard, message);
            } else if rate > self.config.null_rate_warn {
                report.push(ViolationKind::NullRate, Severity::Soft, message);
            }
        }
    }
}

/// Returns the names of schema columns present with the expected dtype.
fn check_schema(df: &DataFrame, report: &mut ValidationReport) -> HashSet<String> {
    let expected = bar_schema();
    let actual = df.schema();
    let mut valid = HashSet::new();

    for field in expected.iter_fields() {
        let name = field.name().as_str();
        match actual.get(name) {
            None => report.push(
                ViolationKind::MissingColumn,
                Severity::Hard,
                format!("missing required column '{name}'"),
            ),
            Some(dtype) if dtype != field.dtype() => report.push(
                ViolationKind::TypeMismatch,
                Severity::Hard,
                format!(
                    "column '{name}': expected {:?}, got {dtype:?}",
                    field.dtype()
                ),
            ),
            Some(_) => {
                valid.insert(name.to_string());
            }
        }
    }
    valid
}

fn check_dates(cols: &Columns<'_>, report: &mut ValidationReport) {
    let Some(dates) = cols.date else {
        return;
    };
    for (i, date) in dates.into_iter().enumerate() {
        let Some(date) = date else { continue };
        if parse_date_key(date).is_none() {
            report.push_row(
                ViolationKind::BadDate,
                Severity::Hard,
                format!("date '{date}' is not a valid YYYYMMDD date"),
                cols.symbol.and_then(|s| s.get(i)),
                Some(date),
            );
        }
    }
}

fn check_duplicates(cols: &Columns<'_>, report: &mut ValidationReport) {
    let (Some(symbols), Some(dates)) = (cols.symbol, cols.date) else {
        return;
    };
    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    for (symbol, date) in symbols.into_iter().zip(dates.into_iter()) {
        let (Some(symbol), Some(date)) = (symbol, date) else {
            continue;
        };
        if !seen.insert((symbol, date)) {
            report.push_row(
                ViolationKind::DuplicateKey,
                Severity::Hard,
                "duplicate (symbol, date)".into(),
                Some(symbol),
                Some(date),
            );
        }
    }
}

fn nan_count(column: &Column) -> usize {
    match column.f64() {
        Ok(ca) => ca.into_iter().filter(|v| v.is_some_and(f64::is_nan)).count(),
        Err(_) => 0,
    }
}
