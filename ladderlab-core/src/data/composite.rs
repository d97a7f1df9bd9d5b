//! Composite fetcher: primary→secondary fallback over a bounded worker pool.
//!
//! Each `fetch` call builds its own session pool and rayon thread pool. The
//! rayon thread index is the worker id, so every worker keeps talking to
//! its own session. The session pool is released before `fetch` returns,
//! and again (as a no-op) when it drops during a panic unwind.
//!
//! Without a session factory the primary is skipped and every instrument
//! goes straight to the secondary.

use super::pool::{SessionPool, TeardownReport};
use super::primary::{PrimaryFetcher, RetryPolicy};
use super::provider::{
    next_weekday_after, BarSource, CancelToken, DataError, DataSource, DateRange,
    InstrumentSource, RawBar, TagSource,
};
use super::session::SessionFactory;
use super::storage::Coverage;
use crate::domain::{ConceptTags, DailyBar, Instrument};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub enum FetchMode {
    /// Fetch only what is newer than the stored coverage.
    Incremental(Coverage),
    /// Fetch the whole range for every instrument.
    Full,
}

#[derive(Debug, Clone)]
pub struct CompositeConfig {
    pub workers: usize,
    pub tag_workers: usize,
    pub retry: RetryPolicy,
}

impl Default for CompositeConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            tag_workers: 10,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub symbol: String,
    pub error: DataError,
}

/// Aggregated result of one `fetch` call.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub bars: Vec<DailyBar>,
    /// Instruments that produced a result (possibly zero rows).
    pub succeeded: Vec<String>,
    pub failures: Vec<FetchFailure>,
    /// Instruments whose stored data already reaches the range end.
    pub up_to_date: Vec<String>,
    /// Instruments served by the secondary source.
    pub fallbacks: usize,
    pub cancelled: bool,
    pub teardown: TeardownReport,
}

/// One planned request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTask {
    pub instrument: Instrument,
    pub range: DateRange,
}

/// Split instruments into tasks and already-covered symbols.
pub fn plan_fetch(
    instruments: &[Instrument],
    range: DateRange,
    mode: &FetchMode,
) -> (Vec<FetchTask>, Vec<String>) {
    let mut tasks = Vec::with_capacity(instruments.len());
    let mut up_to_date = Vec::new();

    for instrument in instruments {
        let task_range = match mode {
            FetchMode::Full => range,
            FetchMode::Incremental(coverage) => match coverage.get(&instrument.symbol) {
                Some(&last) => range.starting_at(next_weekday_after(last)),
                None => range,
            },
        };
        if task_range.is_empty() {
            up_to_date.push(instrument.symbol.clone());
        } else {
            tasks.push(FetchTask {
                instrument: instrument.clone(),
                range: task_range,
            });
        }
    }
    (tasks, up_to_date)
}

pub struct CompositeFetcher {
    factory: Option<Arc<dyn SessionFactory>>,
    secondary: Option<Arc<dyn BarSource>>,
    tags: Option<Arc<dyn TagSource>>,
    listing: Option<Arc<dyn InstrumentSource>>,
    config: CompositeConfig,
}

impl CompositeFetcher {
    pub fn new(factory: Arc<dyn SessionFactory>, config: CompositeConfig) -> Self {
        Self {
            factory: Some(factory),
            secondary: None,
            tags: None,
            listing: None,
            config,
        }
    }

    /// No primary quote servers; bars come from the secondary only.
    pub fn without_primary(config: CompositeConfig) -> Self {
        Self {
            factory: None,
            secondary: None,
            tags: None,
            listing: None,
            config,
        }
    }

    pub fn with_secondary(mut self, source: Arc<dyn BarSource>) -> Self {
        self.secondary = Some(source);
        self
    }

    pub fn with_tags(mut self, source: Arc<dyn TagSource>) -> Self {
        self.tags = Some(source);
        self
    }

    /// Instrument list used when the primary cannot provide one.
    pub fn with_listing(mut self, source: Arc<dyn InstrumentSource>) -> Self {
        self.listing = Some(source);
        self
    }

    fn thread_pool(width: usize) -> Result<rayon::ThreadPool, DataError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(width.max(1))
            .build()
            .map_err(|e| DataError::Other(format!("failed to build worker pool: {e}")))
    }

    /// Fetch daily bars for every instrument.
    ///
    /// Per-instrument failures land in `FetchOutcome::failures`; only a pool
    /// construction failure is returned as `Err`.
    pub fn fetch(
        &self,
        instruments: &[Instrument],
        range: DateRange,
        mode: &FetchMode,
        cancel: &CancelToken,
    ) -> Result<FetchOutcome, DataError> {
        let (tasks, up_to_date) = plan_fetch(instruments, range, mode);
        info!(
            instruments = instruments.len(),
            tasks = tasks.len(),
            up_to_date = up_to_date.len(),
            start = %range.start,
            end = %range.end,
            "fetch planned"
        );

        let workers = self.config.workers.max(1);
        let sessions = self
            .factory
            .as_ref()
            .map(|factory| SessionPool::new(Arc::clone(factory), workers));
        let primary = sessions
            .as_ref()
            .map(|pool| PrimaryFetcher::new(pool, self.config.retry.clone()));
        let tp = Self::thread_pool(workers)?;

        let results: Vec<(String, Result<(Vec<RawBar>, DataSource), DataError>)> = tp.install(|| {
            tasks
                .par_iter()
                .map(|task| {
                    let worker = rayon::current_thread_index().unwrap_or(0);
                    let result = self.fetch_one(primary.as_ref(), task, worker, cancel);
                    (task.instrument.symbol.clone(), result)
                })
                .collect()
        });

        let teardown = sessions
            .as_ref()
            .map(SessionPool::release_all)
            .unwrap_or_default();
        if teardown.failed > 0 {
            error!(failed = teardown.failed, "some sessions failed to close");
        }

        let names: HashMap<&str, &str> = tasks
            .iter()
            .map(|t| (t.instrument.symbol.as_str(), t.instrument.name.as_str()))
            .collect();

        let mut outcome = FetchOutcome {
            up_to_date,
            teardown,
            ..Default::default()
        };
        for (symbol, result) in results {
            match result {
                Ok((raw, source)) => {
                    if source != DataSource::Tdx {
                        outcome.fallbacks += 1;
                    }
                    let name = names.get(symbol.as_str()).copied().unwrap_or_default();
                    outcome
                        .bars
                        .extend(raw.into_iter().map(|b| to_daily_bar(&symbol, name, b)));
                    outcome.succeeded.push(symbol);
                }
                Err(error) => {
                    if matches!(error, DataError::Cancelled) {
                        outcome.cancelled = true;
                    } else {
                        error!(symbol = %symbol, error = %error, "instrument failed on all sources");
                    }
                    outcome.failures.push(FetchFailure { symbol, error });
                }
            }
        }
        outcome.cancelled |= cancel.is_cancelled();

        info!(
            succeeded = outcome.succeeded.len(),
            failed = outcome.failures.len(),
            fallbacks = outcome.fallbacks,
            bars = outcome.bars.len(),
            cancelled = outcome.cancelled,
            "fetch finished"
        );
        Ok(outcome)
    }

    fn fetch_one(
        &self,
        primary: Option<&PrimaryFetcher<'_>>,
        task: &FetchTask,
        worker: usize,
        cancel: &CancelToken,
    ) -> Result<(Vec<RawBar>, DataSource), DataError> {
        cancel.check()?;
        let symbol = &task.instrument.symbol;

        let attempt = primary.map(|p| p.fetch_bars(&task.instrument, task.range, worker, cancel));
        let primary_error = match attempt {
            None => None,
            Some(Ok(result)) if !result.bars.is_empty() => return Ok((result.bars, result.source)),
            Some(Ok(_)) => {
                debug!(symbol = %symbol, "primary returned no bars");
                None
            }
            Some(Err(DataError::Cancelled)) => return Err(DataError::Cancelled),
            Some(Err(e)) => {
                warn!(symbol = %symbol, error = %e, "primary exhausted, falling back");
                Some(e)
            }
        };

        let Some(secondary) = &self.secondary else {
            return match (primary_error, primary.is_some()) {
                (Some(e), _) => Err(e),
                (None, true) => Ok((Vec::new(), DataSource::Tdx)),
                (None, false) => Err(DataError::Other("no bar source configured".into())),
            };
        };

        cancel.check()?;
        match secondary.fetch_bars(&task.instrument, task.range, worker, cancel) {
            Ok(result) => Ok((result.bars, result.source)),
            Err(e) => {
                warn!(symbol = %symbol, source = secondary.name(), error = %e, "secondary failed");
                Err(e)
            }
        }
    }

    /// Concept tags for every instrument. Failures degrade to "no tags".
    pub fn fetch_tags(
        &self,
        instruments: &[Instrument],
        cancel: &CancelToken,
    ) -> Result<BTreeMap<String, ConceptTags>, DataError> {
        let Some(source) = &self.tags else {
            return Ok(BTreeMap::new());
        };
        let tp = Self::thread_pool(self.config.tag_workers)?;

        let results: Vec<(String, Option<ConceptTags>)> = tp.install(|| {
            instruments
                .par_iter()
                .map(|inst| {
                    if cancel.is_cancelled() {
                        return (inst.symbol.clone(), None);
                    }
                    match source.fetch_tags(inst) {
                        Ok(tags) => (inst.symbol.clone(), Some(tags)),
                        Err(e) => {
                            debug!(symbol = %inst.symbol, error = %e, "no concept tags");
                            (inst.symbol.clone(), None)
                        }
                    }
                })
                .collect()
        });

        let total = results.len();
        let tags: BTreeMap<String, ConceptTags> = results
            .into_iter()
            .filter_map(|(symbol, tags)| tags.filter(|t| !t.is_empty()).map(|t| (symbol, t)))
            .collect();
        info!(requested = total, tagged = tags.len(), "concept tags fetched");
        Ok(tags)
    }

    /// A-share list from the primary on a short-lived single session, else
    /// from the listing source.
    pub fn list_instruments(&self, cancel: &CancelToken) -> Result<Vec<Instrument>, DataError> {
        let primary_error = match &self.factory {
            Some(factory) => {
                let sessions = SessionPool::new(Arc::clone(factory), 1);
                let result = PrimaryFetcher::new(&sessions, self.config.retry.clone())
                    .list_instruments(0, cancel);
                let teardown = sessions.release_all();
                debug!(
                    opened = teardown.opened,
                    closed = teardown.closed,
                    "security list session released"
                );
                match result {
                    Ok(list) if !list.is_empty() => return Ok(list),
                    Ok(_) => None,
                    Err(DataError::Cancelled) => return Err(DataError::Cancelled),
                    Err(e) => Some(e),
                }
            }
            None => None,
        };

        let Some(listing) = &self.listing else {
            return match primary_error {
                Some(e) => Err(e),
                None => Ok(Vec::new()),
            };
        };
        if let Some(e) = &primary_error {
            warn!(error = %e, "primary security list failed, asking the listing source");
        }
        cancel.check()?;
        listing.list_instruments(cancel)
    }
}

fn to_daily_bar(symbol: &str, name: &str, raw: RawBar) -> DailyBar {
    DailyBar {
        symbol: symbol.to_string(),
        name: name.to_string(),
        date: raw.date,
        open: raw.open,
        high: raw.high,
        low: raw.low,
        close: raw.close,
        volume: raw.volume,
        amount: raw.amount,
        pre_close: None,
    }
}
