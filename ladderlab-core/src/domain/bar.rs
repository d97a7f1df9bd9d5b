//! DailyBar: one instrument on one trading day.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::instrument::{is_st_name, BoardCategory};

/// Canonical date key format (`YYYYMMDD`).
pub const DATE_FORMAT: &str = "%Y%m%d";

/// Format a date as its canonical 8-digit key.
pub fn date_key(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parse a canonical 8-digit key. Anything else (dashes, 7 digits, Feb 30) is `None`.
pub fn parse_date_key(key: &str) -> Option<NaiveDate> {
    if key.len() != 8 || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(key, DATE_FORMAT).ok()
}

/// Unadjusted daily OHLCV bar.
///
/// `pre_close` is derived: the close of the latest earlier bar of the same
/// symbol in the table, filled by [`link_previous_close`]. It is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub symbol: String,
    /// Display name on that day; carries the ST marker.
    pub name: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    /// Turnover in CNY.
    pub amount: f64,
    #[serde(skip)]
    pub pre_close: Option<f64>,
}

impl DailyBar {
    /// Returns true if any price field is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// low <= open, close <= high and every price positive.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
            && self.low > 0.0
    }

    pub fn is_st(&self) -> bool {
        is_st_name(&self.name)
    }

    /// Bare 6-digit code from the symbol.
    pub fn code(&self) -> &str {
        self.symbol.split('.').next().unwrap_or(&self.symbol)
    }

    /// Board for this row, with ST evaluated from this row's name.
    pub fn board(&self) -> BoardCategory {
        BoardCategory::classify(self.code(), self.is_st())
    }

    pub fn date_key(&self) -> String {
        date_key(self.date)
    }
}

/// Sort by (symbol, date) ascending.
pub fn sort_canonical(bars: &mut [DailyBar]) {
    bars.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.date.cmp(&b.date)));
}

/// Fill `pre_close` from the previous row of the same symbol.
///
/// Expects bars sorted by (symbol, date); the first bar of each symbol gets `None`.
pub fn link_previous_close(bars: &mut [DailyBar]) {
    let mut prev: Option<(String, f64)> = None;
    for bar in bars.iter_mut() {
        bar.pre_close = match &prev {
            Some((symbol, close)) if *symbol == bar.symbol => Some(*close),
            _ => None,
        };
        match &mut prev {
            Some((symbol, close)) if *symbol == bar.symbol => *close = bar.close,
            _ => prev = Some((bar.symbol.clone(), bar.close)),
        }
    }
}
