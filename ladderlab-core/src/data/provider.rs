//! Source traits and structured error types for the fetch layer.
//!
//! `BarSource` abstracts over the primary TCP quote source and the Eastmoney
//! HTTP source so the composite fetcher can chain them and tests can mock them.

use crate::domain::{ConceptTags, Instrument};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Raw daily OHLCV bar from a source, before it is tagged with symbol and name.
///
/// Missing prices are NaN; the validator reports them as nulls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub amount: f64,
}

/// Structured error types for fetch operations.
#[derive(Debug, Clone, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error (status {status}): {message}")]
    Remote { status: u16, message: String },

    #[error("rate limited by source (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("hard stop: source has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("no quote server reachable (tried {tried})")]
    NoServerReachable { tried: usize },

    #[error("session closed")]
    SessionClosed,

    #[error("cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("data error: {0}")]
    Other(String),
}

impl DataError {
    /// Errors after which the session's byte stream can no longer be trusted.
    pub fn is_protocol(&self) -> bool {
        matches!(self, DataError::Protocol(_) | DataError::SessionClosed)
    }

    /// Map an I/O error from a socket into the fetch taxonomy.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => DataError::Timeout(err.to_string()),
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => DataError::Protocol(err.to_string()),
            _ => DataError::NetworkUnreachable(err.to_string()),
        }
    }
}

/// Inclusive date range of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Same end, later start.
    pub fn starting_at(&self, start: NaiveDate) -> Self {
        Self { start, end: self.end }
    }
}

/// First Monday-to-Friday date strictly after `date`.
pub fn next_weekday_after(date: NaiveDate) -> NaiveDate {
    let mut d = date + ChronoDuration::days(1);
    while matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
        d += ChronoDuration::days(1);
    }
    d
}

/// Latest Monday-to-Friday date at or before `date`.
pub fn weekday_on_or_before(date: NaiveDate) -> NaiveDate {
    let mut d = date;
    while matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
        d -= ChronoDuration::days(1);
    }
    d
}

/// Cooperative cancellation: a shared flag plus an optional deadline.
///
/// Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// `Err(Cancelled)` once the token fired.
    pub fn check(&self) -> Result<(), DataError> {
        if self.is_cancelled() {
            Err(DataError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Where a batch of bars came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSource {
    /// Primary binary quote protocol.
    Tdx,
    /// Eastmoney HTTP kline API.
    Eastmoney,
    /// Test doubles.
    Synthetic,
}

/// Result of a successful fetch for a single instrument.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub symbol: String,
    pub bars: Vec<RawBar>,
    pub source: DataSource,
}

/// Daily bar capability shared by the primary and secondary sources.
pub trait BarSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch unadjusted daily bars for one instrument, ascending by date.
    ///
    /// `worker` identifies the calling pool thread; stateful sources use it to
    /// pick that thread's connection.
    fn fetch_bars(
        &self,
        instrument: &Instrument,
        range: DateRange,
        worker: usize,
        cancel: &CancelToken,
    ) -> Result<FetchResult, DataError>;

    /// Whether the source currently accepts requests (not blocked).
    fn is_available(&self) -> bool {
        true
    }
}

/// Concept and industry tags for one instrument.
pub trait TagSource: Send + Sync {
    fn fetch_tags(&self, instrument: &Instrument) -> Result<ConceptTags, DataError>;
}

/// Listed A-shares, asked for when the primary security list is unavailable.
pub trait InstrumentSource: Send + Sync {
    fn list_instruments(&self, cancel: &CancelToken) -> Result<Vec<Instrument>, DataError>;
}
