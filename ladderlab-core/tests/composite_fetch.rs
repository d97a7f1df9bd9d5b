//! Composite fetcher behaviour against scripted primary and secondary sources.
//!
//! Covers:
//! 1. Primary success, no fallback
//! 2. Primary failure served by the secondary
//! 3. Empty primary reply served by the secondary
//! 4. Both sources failing (batch continues)
//! 5. Teardown on success, on panic and after cancellation
//! 6. Secondary-only fetching and the instrument list fallback

use chrono::NaiveDate;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ladderlab_core::data::wire::SecurityEntry;
use ladderlab_core::data::{
    BarSource, CancelToken, CompositeConfig, CompositeFetcher, DataError, DataSource, DateRange,
    FetchMode, FetchResult, InstrumentSource, QuoteSession, RawBar, RetryPolicy, SessionFactory,
};
use ladderlab_core::domain::{Exchange, Instrument};

// ── Scripted sources ─────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Reply {
    Bars(usize),
    Empty,
    Fail,
    Panic,
}

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
}

fn raw_bars(n: usize) -> Vec<RawBar> {
    (0..n)
        .map(|i| RawBar {
            date: d(4 + i as u32),
            open: 10.0,
            high: 10.5,
            low: 9.8,
            close: 10.2,
            volume: 1_000,
            amount: 10_200.0,
        })
        .collect()
}

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    calls: AtomicUsize,
}

struct ScriptedSession {
    script: Arc<HashMap<String, Reply>>,
    counters: Arc<Counters>,
    closed: bool,
}

impl QuoteSession for ScriptedSession {
    fn daily_bars(
        &mut self,
        _exchange: Exchange,
        code: &str,
        _range: DateRange,
    ) -> Result<Vec<RawBar>, DataError> {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.get(code).copied().unwrap_or(Reply::Empty) {
            Reply::Bars(n) => Ok(raw_bars(n)),
            Reply::Empty => Ok(Vec::new()),
            Reply::Fail => Err(DataError::Timeout(format!("{code} timed out"))),
            Reply::Panic => panic!("scripted panic for {code}"),
        }
    }

    fn security_list(&mut self, _exchange: Exchange) -> Result<Vec<SecurityEntry>, DataError> {
        Ok(Vec::new())
    }

    fn heartbeat(&mut self) -> Result<(), DataError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), DataError> {
        if !self.closed {
            self.closed = true;
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

struct ScriptedFactory {
    script: Arc<HashMap<String, Reply>>,
    counters: Arc<Counters>,
}

impl SessionFactory for ScriptedFactory {
    fn connect(&self, _worker: usize) -> Result<Box<dyn QuoteSession>, DataError> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
            counters: Arc::clone(&self.counters),
            closed: false,
        }))
    }
}

struct ScriptedSecondary {
    script: HashMap<String, Reply>,
    calls: AtomicUsize,
}

impl BarSource for ScriptedSecondary {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch_bars(
        &self,
        instrument: &Instrument,
        _range: DateRange,
        _worker: usize,
        _cancel: &CancelToken,
    ) -> Result<FetchResult, DataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bars = match self.script.get(&instrument.code).copied().unwrap_or(Reply::Empty) {
            Reply::Bars(n) => raw_bars(n),
            Reply::Empty => Vec::new(),
            Reply::Fail | Reply::Panic => {
                return Err(DataError::Remote {
                    status: 500,
                    message: "upstream error".into(),
                })
            }
        };
        Ok(FetchResult {
            symbol: instrument.symbol.clone(),
            bars,
            source: DataSource::Eastmoney,
        })
    }
}

struct FixedListing {
    calls: AtomicUsize,
}

impl InstrumentSource for FixedListing {
    fn list_instruments(&self, _cancel: &CancelToken) -> Result<Vec<Instrument>, DataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            Instrument::parse("000001.SZ", "平安银行").unwrap(),
            Instrument::parse("600000.SH", "浦发银行").unwrap(),
        ])
    }
}

fn script(entries: &[(&str, Reply)]) -> HashMap<String, Reply> {
    entries.iter().map(|(c, r)| (c.to_string(), *r)).collect()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        base_delay: Duration::ZERO,
        backoff_factor: 1.0,
        max_delay: Duration::ZERO,
        jitter: Duration::ZERO,
    }
}

struct Harness {
    fetcher: CompositeFetcher,
    counters: Arc<Counters>,
    secondary: Arc<ScriptedSecondary>,
}

fn harness(primary: &[(&str, Reply)], secondary: &[(&str, Reply)], workers: usize) -> Harness {
    let counters = Arc::new(Counters::default());
    let factory = Arc::new(ScriptedFactory {
        script: Arc::new(script(primary)),
        counters: Arc::clone(&counters),
    });
    let secondary = Arc::new(ScriptedSecondary {
        script: script(secondary),
        calls: AtomicUsize::new(0),
    });
    let config = CompositeConfig {
        workers,
        tag_workers: 2,
        retry: fast_retry(),
    };
    let fetcher = CompositeFetcher::new(factory, config)
        .with_secondary(Arc::clone(&secondary) as Arc<dyn BarSource>);
    Harness {
        fetcher,
        counters,
        secondary,
    }
}

fn instruments(symbols: &[&str]) -> Vec<Instrument> {
    symbols
        .iter()
        .map(|s| Instrument::parse(s, "测试").unwrap())
        .collect()
}

fn range() -> DateRange {
    DateRange::new(d(1), d(29))
}

// ── Tests ────────────────────────────────────────────────────────────

#[test]
fn primary_success_needs_no_fallback() {
    let h = harness(&[("600000", Reply::Bars(3))], &[], 2);
    let out = h
        .fetcher
        .fetch(&instruments(&["600000.SH"]), range(), &FetchMode::Full, &CancelToken::new())
        .unwrap();

    assert_eq!(out.succeeded, vec!["600000.SH".to_string()]);
    assert_eq!(out.bars.len(), 3);
    assert_eq!(out.fallbacks, 0);
    assert!(out.bars.iter().all(|b| b.name == "测试"));
    assert_eq!(h.secondary.calls.load(Ordering::SeqCst), 0);
    assert!(out.teardown.all_closed());
}

#[test]
fn primary_failure_falls_back_to_secondary() {
    let h = harness(&[("000001", Reply::Fail)], &[("000001", Reply::Bars(2))], 2);
    let out = h
        .fetcher
        .fetch(&instruments(&["000001.SZ"]), range(), &FetchMode::Full, &CancelToken::new())
        .unwrap();

    assert_eq!(out.fallbacks, 1);
    assert_eq!(out.bars.len(), 2);
    assert!(out.failures.is_empty());
    // first attempt plus one retry
    assert_eq!(h.counters.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn empty_primary_reply_tries_secondary() {
    let h = harness(&[("300750", Reply::Empty)], &[("300750", Reply::Bars(4))], 1);
    let out = h
        .fetcher
        .fetch(&instruments(&["300750.SZ"]), range(), &FetchMode::Full, &CancelToken::new())
        .unwrap();

    assert_eq!(out.bars.len(), 4);
    assert_eq!(out.fallbacks, 1);
    assert_eq!(h.secondary.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn both_sources_failing_does_not_abort_the_batch() {
    let h = harness(
        &[("600000", Reply::Fail), ("600001", Reply::Bars(2))],
        &[("600000", Reply::Fail)],
        4,
    );
    let out = h
        .fetcher
        .fetch(
            &instruments(&["600000.SH", "600001.SH"]),
            range(),
            &FetchMode::Full,
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(out.succeeded, vec!["600001.SH".to_string()]);
    assert_eq!(out.failures.len(), 1);
    assert_eq!(out.failures[0].symbol, "600000.SH");
    assert!(matches!(out.failures[0].error, DataError::Remote { status: 500, .. }));
    assert!(!out.cancelled);
}

#[test]
fn every_opened_session_is_closed() {
    let symbols = [
        "600000.SH", "600001.SH", "600004.SH", "600006.SH", "600007.SH", "600008.SH",
    ];
    let primary: Vec<(&str, Reply)> = symbols
        .iter()
        .map(|s| (&s[..6], Reply::Bars(1)))
        .collect();
    let h = harness(&primary, &[], 3);
    let out = h
        .fetcher
        .fetch(&instruments(&symbols), range(), &FetchMode::Full, &CancelToken::new())
        .unwrap();

    assert_eq!(out.succeeded.len(), symbols.len());
    let opened = h.counters.opened.load(Ordering::SeqCst);
    assert!(opened >= 1 && opened <= 3, "one session per worker, got {opened}");
    assert_eq!(h.counters.closed.load(Ordering::SeqCst), opened);
    assert_eq!(out.teardown.opened, opened);
    assert_eq!(out.teardown.closed, opened);
}

#[test]
fn sessions_close_when_a_worker_panics() {
    let h = harness(
        &[("600000", Reply::Bars(1)), ("600001", Reply::Panic)],
        &[],
        2,
    );
    let list = instruments(&["600000.SH", "600001.SH"]);
    let result = catch_unwind(AssertUnwindSafe(|| {
        h.fetcher
            .fetch(&list, range(), &FetchMode::Full, &CancelToken::new())
    }));

    assert!(result.is_err());
    let opened = h.counters.opened.load(Ordering::SeqCst);
    assert!(opened >= 1);
    assert_eq!(h.counters.closed.load(Ordering::SeqCst), opened);
}

#[test]
fn cancelled_before_dispatch_opens_nothing() {
    let h = harness(&[("600000", Reply::Bars(1))], &[("600000", Reply::Bars(1))], 2);
    let cancel = CancelToken::new();
    cancel.cancel();
    let out = h
        .fetcher
        .fetch(&instruments(&["600000.SH"]), range(), &FetchMode::Full, &cancel)
        .unwrap();

    assert!(out.cancelled);
    assert!(out.bars.is_empty());
    assert!(matches!(out.failures[0].error, DataError::Cancelled));
    assert_eq!(h.counters.opened.load(Ordering::SeqCst), 0);
    assert_eq!(h.secondary.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn up_to_date_instruments_are_skipped() {
    let h = harness(&[("600000", Reply::Bars(1))], &[], 1);
    let mut coverage = ladderlab_core::data::Coverage::new();
    coverage.insert("600000.SH".into(), d(29));
    let out = h
        .fetcher
        .fetch(
            &instruments(&["600000.SH"]),
            range(),
            &FetchMode::Incremental(coverage),
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(out.up_to_date, vec!["600000.SH".to_string()]);
    assert!(out.succeeded.is_empty());
    assert_eq!(h.counters.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn without_primary_every_instrument_uses_the_secondary() {
    let secondary = Arc::new(ScriptedSecondary {
        script: script(&[("600000", Reply::Bars(2)), ("000001", Reply::Fail)]),
        calls: AtomicUsize::new(0),
    });
    let config = CompositeConfig {
        workers: 2,
        tag_workers: 1,
        retry: fast_retry(),
    };
    let fetcher = CompositeFetcher::without_primary(config)
        .with_secondary(Arc::clone(&secondary) as Arc<dyn BarSource>);

    let out = fetcher
        .fetch(
            &instruments(&["600000.SH", "000001.SZ"]),
            range(),
            &FetchMode::Full,
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(out.succeeded, vec!["600000.SH".to_string()]);
    assert_eq!(out.bars.len(), 2);
    assert_eq!(out.failures.len(), 1);
    assert_eq!(secondary.calls.load(Ordering::SeqCst), 2);
    assert_eq!(out.teardown.opened, 0);
}

#[test]
fn empty_primary_security_list_asks_the_listing_source() {
    let h = harness(&[], &[], 1);
    let listing = Arc::new(FixedListing {
        calls: AtomicUsize::new(0),
    });
    let fetcher = h
        .fetcher
        .with_listing(Arc::clone(&listing) as Arc<dyn InstrumentSource>);

    let list = fetcher.list_instruments(&CancelToken::new()).unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(listing.calls.load(Ordering::SeqCst), 1);
    // the primary was asked first and its session released
    assert_eq!(h.counters.opened.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn listing_source_alone_provides_instruments() {
    let listing = Arc::new(FixedListing {
        calls: AtomicUsize::new(0),
    });
    let fetcher = CompositeFetcher::without_primary(CompositeConfig::default())
        .with_listing(Arc::clone(&listing) as Arc<dyn InstrumentSource>);

    let symbols: Vec<String> = fetcher
        .list_instruments(&CancelToken::new())
        .unwrap()
        .into_iter()
        .map(|i| i.symbol)
        .collect();
    assert_eq!(symbols, vec!["000001.SZ", "600000.SH"]);
}
