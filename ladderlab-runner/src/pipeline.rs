//! `fetch`, `analyze` and `status` runs.
//!
//! Fetch: resolve instruments, fetch missing bars through the composite
//! fetcher, validate, save, then refresh concept tags. Analyze: rebuild the
//! whole ladder from stored bars and replace the ladder table, but only when
//! the analysis succeeded.

use crate::config::{ConfigError, LadderConfig};
use crate::error::RunError;
use crate::report::{AnalyzeReport, FailureLine, FetchReport, StatusReport};
use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use ladderlab_core::data::{
    bars_frame, keep_stored_names, merge_tags, weekday_on_or_before, BarSource, CancelToken,
    CircuitBreaker, CompositeFetcher, DataError, DateRange, EastmoneySource, FetchMode,
    InstrumentSource, ParquetStorage, SaveMode, SaveOutcome, SessionFactory, Storage, TagSource,
    TdxSessionFactory, Universe, Validator,
};
use ladderlab_core::domain::{sort_canonical, Instrument};
use ladderlab_core::ladder::Analyzer;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hour (local time) after which today's bar is considered final.
const MARKET_CLOSE_HOUR: u32 = 15;

/// Data sources a fetch run talks to.
pub struct Sources {
    /// Primary quote servers; `None` when none are configured.
    pub factory: Option<Arc<dyn SessionFactory>>,
    pub secondary: Option<Arc<dyn BarSource>>,
    pub tags: Option<Arc<dyn TagSource>>,
    pub listing: Option<Arc<dyn InstrumentSource>>,
}

impl Sources {
    /// Configured quote servers plus Eastmoney for bars, tags and the
    /// instrument list, sharing one breaker.
    pub fn from_config(config: &LadderConfig) -> Result<Self, RunError> {
        let breaker = Arc::new(CircuitBreaker::new(config.fetch.breaker_cooldown()));
        let eastmoney = Arc::new(EastmoneySource::new(
            config.fetch.eastmoney_config(),
            breaker,
        )?);
        let factory = config.fetch.has_primary().then(|| {
            Arc::new(TdxSessionFactory::new(config.fetch.tdx_config())) as Arc<dyn SessionFactory>
        });
        if factory.is_none() {
            info!("no quote servers configured, fetching from eastmoney only");
        }
        Ok(Self {
            factory,
            secondary: Some(Arc::clone(&eastmoney) as Arc<dyn BarSource>),
            tags: config
                .fetch
                .fetch_tags
                .then(|| Arc::clone(&eastmoney) as Arc<dyn TagSource>),
            listing: Some(eastmoney as Arc<dyn InstrumentSource>),
        })
    }

    fn fetcher(&self, config: &LadderConfig) -> CompositeFetcher {
        let mut fetcher = match &self.factory {
            Some(factory) => {
                CompositeFetcher::new(Arc::clone(factory), config.fetch.composite_config())
            }
            None => CompositeFetcher::without_primary(config.fetch.composite_config()),
        };
        if let Some(listing) = &self.listing {
            fetcher = fetcher.with_listing(Arc::clone(listing));
        }
        if let Some(secondary) = &self.secondary {
            fetcher = fetcher.with_secondary(Arc::clone(secondary));
        }
        if let Some(tags) = &self.tags {
            fetcher = fetcher.with_tags(Arc::clone(tags));
        }
        fetcher
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub full_refresh: bool,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

/// Today once the market has closed, otherwise yesterday; weekends step back to Friday.
pub fn default_end_date(now: NaiveDateTime) -> NaiveDate {
    let today = now.date();
    let candidate = if now.hour() >= MARKET_CLOSE_HOUR {
        today
    } else {
        today.pred_opt().unwrap_or(today)
    };
    weekday_on_or_before(candidate)
}

fn resolve_range(config: &LadderConfig, options: &FetchOptions) -> Result<DateRange, RunError> {
    let start = match options.start {
        Some(d) => d,
        None => config.fetch.start_date()?,
    };
    let end = options
        .end
        .unwrap_or_else(|| default_end_date(Local::now().naive_local()));
    if start > end {
        return Err(ConfigError::Invalid(format!("start date {start} is after end date {end}")).into());
    }
    Ok(DateRange::new(start, end))
}

/// Universe file, else the security list (primary, then the listing source),
/// else whatever is already stored.
fn resolve_instruments(
    config: &LadderConfig,
    fetcher: &CompositeFetcher,
    storage: &dyn Storage,
    cancel: &CancelToken,
) -> Result<Vec<Instrument>, RunError> {
    if let Some(path) = &config.universe.file {
        let instruments = Universe::from_file(path)?.instruments()?;
        info!(path = %path.display(), instruments = instruments.len(), "universe loaded");
        return Ok(instruments);
    }

    match fetcher.list_instruments(cancel) {
        Ok(list) if !list.is_empty() => {
            info!(instruments = list.len(), "security list fetched");
            return Ok(list);
        }
        Ok(_) => warn!("security list is empty"),
        Err(DataError::Cancelled) => return Err(RunError::Cancelled),
        Err(e) => warn!(error = %e, "security list unavailable"),
    }

    // last stored name per symbol
    let mut names: BTreeMap<String, String> = BTreeMap::new();
    for bar in storage.load_bars(None)? {
        names.insert(bar.symbol, bar.name);
    }
    let instruments: Vec<Instrument> = names
        .into_iter()
        .filter_map(|(symbol, name)| match Instrument::parse(&symbol, name) {
            Ok(inst) => Some(inst),
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "skipping stored symbol");
                None
            }
        })
        .collect();
    info!(instruments = instruments.len(), "instruments from stored bars");
    Ok(instruments)
}

fn written(outcome: SaveOutcome) -> Result<(PathBuf, usize), RunError> {
    match outcome {
        SaveOutcome::Written { path, rows } => Ok((path, rows)),
        SaveOutcome::Backup { path, error } => Err(RunError::SavedToBackup { path, error }),
    }
}

pub fn run_fetch(
    config: &LadderConfig,
    storage: &dyn Storage,
    sources: &Sources,
    options: &FetchOptions,
    cancel: &CancelToken,
) -> Result<FetchReport, RunError> {
    let range = resolve_range(config, options)?;
    let fetcher = sources.fetcher(config);

    let instruments = resolve_instruments(config, &fetcher, storage, cancel)?;
    if instruments.is_empty() {
        return Err(RunError::NoInstruments);
    }

    let mode = if options.full_refresh {
        FetchMode::Full
    } else {
        FetchMode::Incremental(storage.coverage()?)
    };
    let mut outcome = fetcher.fetch(&instruments, range, &mode, cancel)?;
    info!(
        opened = outcome.teardown.opened,
        closed = outcome.teardown.closed,
        failed = outcome.teardown.failed,
        "sessions released"
    );
    if outcome.cancelled {
        return Err(RunError::Cancelled);
    }

    let mut report = FetchReport {
        start: range.start,
        end: range.end,
        full_refresh: options.full_refresh,
        instruments: instruments.len(),
        succeeded: outcome.succeeded.len(),
        failures: outcome
            .failures
            .iter()
            .map(|f| FailureLine {
                symbol: f.symbol.clone(),
                error: f.error.to_string(),
            })
            .collect(),
        up_to_date: outcome.up_to_date.len(),
        fallbacks: outcome.fallbacks,
        bars_fetched: outcome.bars.len(),
        saved: None,
        soft_violations: Vec::new(),
        tags_fetched: 0,
        teardown: outcome.teardown,
    };

    if !outcome.bars.is_empty() {
        let stored = storage.load_bars(Some(outcome.succeeded.as_slice()))?;
        let renamed = keep_stored_names(&mut outcome.bars, &stored);
        if renamed > 0 {
            debug!(rows = renamed, "refetched rows keep their stored names");
        }
        sort_canonical(&mut outcome.bars);
        let frame = bars_frame(&outcome.bars)?;
        let validation = Validator::new(config.validation.clone()).validate(&frame);
        for v in validation.soft() {
            warn!(violation = %v, "soft validation issue");
        }
        if !validation.ok {
            return Err(RunError::Validation(validation));
        }
        report.soft_violations = validation.soft().map(|v| v.to_string()).collect();

        let save_mode = if options.full_refresh {
            SaveMode::Replace
        } else {
            SaveMode::Append
        };
        report.saved = Some(written(storage.save_bars(&outcome.bars, save_mode)?)?);
    }

    if sources.tags.is_some() && !outcome.succeeded.is_empty() {
        let fetched: Vec<Instrument> = instruments
            .iter()
            .filter(|i| outcome.succeeded.contains(&i.symbol))
            .cloned()
            .collect();
        let fresh = fetcher.fetch_tags(&fetched, cancel)?;
        report.tags_fetched = fresh.len();
        storage.save_tags(&merge_tags(storage.load_tags()?, fresh))?;
    }

    info!(
        succeeded = report.succeeded,
        failed = report.failures.len(),
        up_to_date = report.up_to_date,
        bars = report.bars_fetched,
        "fetch run finished"
    );
    Ok(report)
}

/// Rebuild the ladder from every stored bar.
///
/// On analysis failure the stored ladder is left untouched.
pub fn run_analyze(config: &LadderConfig, storage: &dyn Storage) -> Result<AnalyzeReport, RunError> {
    let bars = storage.load_bars(None)?;
    let tags = storage.load_tags()?;
    info!(bars = bars.len(), tagged = tags.len(), "analysis input loaded");

    let output = Analyzer::new(config.analysis).analyze(&bars, &tags)?;

    let ladder_path = if output.records.is_empty() {
        warn!("no stored bars, ladder not written");
        None
    } else {
        Some(written(storage.save_ladder(&output.records)?)?.0)
    };

    let latest_promotion = output
        .promotion
        .last()
        .map(|last| output.promotion_on(last.date).cloned().collect())
        .unwrap_or_default();

    let summary = output.summary;
    Ok(AnalyzeReport {
        rows: summary.rows,
        limit_up_rows: summary.limit_up_rows,
        by_pattern: summary.by_pattern,
        anomalies: output.anomalies,
        latest_date: summary.latest_date,
        latest_ladder: summary.latest_ladder,
        latest_promotion,
        ladder_path,
    })
}

pub fn run_status(storage: &ParquetStorage) -> Result<StatusReport, RunError> {
    let meta = storage.meta()?;
    Ok(StatusReport {
        data_dir: storage.data_dir().to_path_buf(),
        tables: meta.tables,
        tagged_symbols: storage.load_tags()?.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(y: i32, m: u32, d: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn after_close_uses_today() {
        // Wednesday
        assert_eq!(default_end_date(at(2024, 3, 6, 16)), NaiveDate::from_ymd_opt(2024, 3, 6).unwrap());
    }

    #[test]
    fn before_close_uses_yesterday() {
        assert_eq!(default_end_date(at(2024, 3, 6, 9)), NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
    }

    #[test]
    fn monday_morning_steps_back_to_friday() {
        assert_eq!(default_end_date(at(2024, 3, 11, 10)), NaiveDate::from_ymd_opt(2024, 3, 8).unwrap());
    }

    #[test]
    fn weekend_after_close_is_friday() {
        assert_eq!(default_end_date(at(2024, 3, 9, 18)), NaiveDate::from_ymd_opt(2024, 3, 8).unwrap());
    }

    #[test]
    fn start_after_end_is_rejected() {
        let options = FetchOptions {
            start: NaiveDate::from_ymd_opt(2024, 3, 8),
            end: NaiveDate::from_ymd_opt(2024, 3, 1),
            ..Default::default()
        };
        assert!(matches!(
            resolve_range(&LadderConfig::default(), &options),
            Err(RunError::Config(_))
        ));
    }

    proptest! {
        #[test]
        fn end_date_is_a_recent_weekday(days in 0i64..3_000, hour in 0u32..24) {
            use chrono::Datelike;
            let now = at(2018, 1, 1, hour) + chrono::Duration::days(days);
            let end = default_end_date(now);
            prop_assert!(end <= now.date());
            prop_assert!((now.date() - end).num_days() <= 3);
            prop_assert!(end.weekday().number_from_monday() <= 5);
        }
    }
}
