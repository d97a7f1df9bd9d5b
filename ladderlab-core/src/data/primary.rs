//! Primary fetcher: daily bars over the calling worker's pooled session.
//!
//! Every call gets `1 + max_retries` attempts with capped exponential backoff
//! plus random jitter. A protocol error closes the worker's session so the
//! next attempt reconnects.

use super::pool::SessionPool;
use super::provider::{BarSource, CancelToken, DataError, DataSource, DateRange, FetchResult};
use super::session::QuoteSession;
use crate::domain::{Exchange, Instrument};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Retry schedule for the primary source.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Upper bound of the random delay added to each backoff.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(retry as i32 - 1);
        let capped = scaled.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }

    fn delay_with_jitter(&self, retry: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(retry) + Duration::from_millis(extra)
    }
}

/// Sleep in short slices so a cancel is noticed promptly.
pub(crate) fn sleep_cancellable(delay: Duration, cancel: &CancelToken) -> Result<(), DataError> {
    const SLICE: Duration = Duration::from_millis(50);
    let until = Instant::now() + delay;
    loop {
        cancel.check()?;
        let now = Instant::now();
        if now >= until {
            return Ok(());
        }
        std::thread::sleep((until - now).min(SLICE));
    }
}

pub struct PrimaryFetcher<'p> {
    pool: &'p SessionPool,
    policy: RetryPolicy,
}

impl<'p> PrimaryFetcher<'p> {
    pub fn new(pool: &'p SessionPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    /// Run `op` on the worker's session under the retry policy.
    fn with_retries<T>(
        &self,
        what: &str,
        worker: usize,
        cancel: &CancelToken,
        mut op: impl FnMut(&mut dyn QuoteSession) -> Result<T, DataError>,
    ) -> Result<T, DataError> {
        let mut last_error = None;

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                sleep_cancellable(self.policy.delay_with_jitter(attempt), cancel)?;
            }
            cancel.check()?;

            let mut lease = match self.pool.acquire(worker) {
                Ok(lease) => lease,
                Err(DataError::SessionClosed) => return Err(DataError::SessionClosed),
                Err(e) => {
                    warn!(what, worker, attempt, error = %e, "primary connect failed");
                    last_error = Some(e);
                    continue;
                }
            };

            match op(&mut *lease) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(what, worker, attempt, error = %e, "primary attempt failed");
                    if e.is_protocol() {
                        lease.invalidate();
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DataError::Other("max retries exceeded".into())))
    }

    /// Every A-share listed on both exchanges, per the primary's security list.
    pub fn list_instruments(
        &self,
        worker: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<Instrument>, DataError> {
        let mut out = Vec::new();
        for exchange in Exchange::all() {
            let entries = self.with_retries("security_list", worker, cancel, |s| {
                s.security_list(exchange)
            })?;
            out.extend(
                entries
                    .into_iter()
                    .filter_map(|e| Instrument::from_code(e.exchange, &e.code, e.name).ok()),
            );
        }
        Ok(out)
    }
}

impl BarSource for PrimaryFetcher<'_> {
    fn name(&self) -> &str {
        "tdx"
    }

    fn fetch_bars(
        &self,
        instrument: &Instrument,
        range: DateRange,
        worker: usize,
        cancel: &CancelToken,
    ) -> Result<FetchResult, DataError> {
        let mut bars = self.with_retries(&instrument.symbol, worker, cancel, |s| {
            s.daily_bars(instrument.exchange, &instrument.code, range)
        })?;
        bars.retain(|b| b.date >= range.start && b.date <= range.end);
        bars.sort_by_key(|b| b.date);
        bars.dedup_by_key(|b| b.date);

        Ok(FetchResult {
            symbol: instrument.symbol.clone(),
            bars,
            source: DataSource::Tdx,
        })
    }
}
