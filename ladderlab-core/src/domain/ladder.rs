//! Derived ladder types: per-row limit-up records and promotion rates.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Intraday shape of a limit-up day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BoardPattern {
    /// 一字板: opened at the limit and never left it.
    OneWord,
    /// T字板: opened at the limit, dipped, closed back at the limit.
    TShaped,
    /// 换手板: reached the limit during the session from a lower open.
    Turnover,
}

impl BoardPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoardPattern::OneWord => "one-word",
            BoardPattern::TShaped => "T-shaped",
            BoardPattern::Turnover => "turnover",
        }
    }

    pub fn all() -> [BoardPattern; 3] {
        [BoardPattern::OneWord, BoardPattern::TShaped, BoardPattern::Turnover]
    }
}

impl fmt::Display for BoardPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BoardPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one-word" => Ok(BoardPattern::OneWord),
            "T-shaped" => Ok(BoardPattern::TShaped),
            "turnover" => Ok(BoardPattern::Turnover),
            other => Err(format!("unknown board pattern '{other}'")),
        }
    }
}

/// One analysed bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitUpRecord {
    pub symbol: String,
    pub name: String,
    pub date: NaiveDate,
    pub close: f64,
    /// `None` on an instrument's first date (no previous close).
    pub limit_price: Option<f64>,
    pub is_limit_up: bool,
    pub consecutive_days: u32,
    /// Set on limit-up rows that classified cleanly.
    pub board_pattern: Option<BoardPattern>,
    /// `None` on an instrument's last date.
    pub next_day_open_change_pct: Option<f64>,
    pub concept_tags: Vec<String>,
}

/// Share of level-N streaks on `date` that reached level N+1 on the next trading date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRate {
    pub date: NaiveDate,
    pub level: u32,
    /// Instruments at `level` on `date` that have a next trading date.
    pub candidates: usize,
    pub promoted: usize,
    pub rate: f64,
}

/// Best-effort concept/industry enrichment for one instrument.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptTags {
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub industry: String,
}

impl ConceptTags {
    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty() && self.industry.is_empty()
    }
}
