//! Bars to ladder records.

use super::board;
use super::limit::{is_limit_up, limit_from_prev, DEFAULT_HIT_TOLERANCE};
use super::promotion::promotion_rates;
use super::streak::consecutive_days;
use crate::domain::{
    link_previous_close, sort_canonical, BoardPattern, ConceptTags, DailyBar, LimitUpRecord,
    PromotionRate,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Anomalies carried in an `InconsistencyRate` error.
pub const MAX_EXAMPLES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub hit_tolerance: f64,
    /// Fraction of limit-up rows allowed to go unclassified.
    pub max_anomaly_rate: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            hit_tolerance: DEFAULT_HIT_TOLERANCE,
            max_anomaly_rate: 0.05,
        }
    }
}

/// A limit-up row that matched no board pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationAnomaly {
    pub symbol: String,
    pub date: NaiveDate,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(
        "{} of limit-up rows unclassified exceeds threshold {}",
        fmt_pct(.rate),
        fmt_pct(.threshold)
    )]
    InconsistencyRate {
        rate: f64,
        threshold: f64,
        examples: Vec<ClassificationAnomaly>,
    },

    #[error("bar table: {0}")]
    Table(String),
}

fn fmt_pct(v: &f64) -> String {
    format!("{:.2}%", v * 100.0)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisSummary {
    pub rows: usize,
    pub limit_up_rows: usize,
    pub by_pattern: BTreeMap<BoardPattern, usize>,
    pub anomalies: usize,
    pub latest_date: Option<NaiveDate>,
    /// Streak level to symbols at that level on `latest_date`.
    pub latest_ladder: BTreeMap<u32, Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisOutput {
    /// Sorted by (symbol, date).
    pub records: Vec<LimitUpRecord>,
    pub promotion: Vec<PromotionRate>,
    pub anomalies: Vec<ClassificationAnomaly>,
    pub summary: AnalysisSummary,
}

impl AnalysisOutput {
    pub fn promotion_on(&self, date: NaiveDate) -> impl Iterator<Item = &PromotionRate> {
        self.promotion.iter().filter(move |p| p.date == date)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Analyzer {
    config: AnalysisConfig,
}

impl Analyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Rebuild every record from `bars`.
    ///
    /// Input order does not matter; duplicate (symbol, date) keys are a
    /// table error.
    pub fn analyze(
        &self,
        bars: &[DailyBar],
        tags: &BTreeMap<String, ConceptTags>,
    ) -> Result<AnalysisOutput, AnalysisError> {
        let mut bars = bars.to_vec();
        sort_canonical(&mut bars);
        if let Some(pair) = bars
            .windows(2)
            .find(|w| w[0].symbol == w[1].symbol && w[0].date == w[1].date)
        {
            return Err(AnalysisError::Table(format!(
                "duplicate bar for {} on {}",
                pair[0].symbol, pair[0].date
            )));
        }
        link_previous_close(&mut bars);

        let mut records = Vec::with_capacity(bars.len());
        let mut anomalies = Vec::new();
        for group in bars.chunk_by(|a, b| a.symbol == b.symbol) {
            self.analyze_symbol(group, tags.get(&group[0].symbol), &mut records, &mut anomalies);
        }

        let limit_up_rows = records.iter().filter(|r| r.is_limit_up).count();
        let rate = if limit_up_rows == 0 {
            0.0
        } else {
            anomalies.len() as f64 / limit_up_rows as f64
        };
        if rate > self.config.max_anomaly_rate {
            warn!(
                anomalies = anomalies.len(),
                limit_up_rows,
                rate,
                "board classification inconsistency above threshold"
            );
            anomalies.truncate(MAX_EXAMPLES);
            return Err(AnalysisError::InconsistencyRate {
                rate,
                threshold: self.config.max_anomaly_rate,
                examples: anomalies,
            });
        }

        let promotion = promotion_rates(&records);
        let summary = summarize(&records, anomalies.len());
        info!(
            rows = summary.rows,
            limit_up_rows = summary.limit_up_rows,
            anomalies = summary.anomalies,
            "analysis complete"
        );
        Ok(AnalysisOutput {
            records,
            promotion,
            anomalies,
            summary,
        })
    }

    fn analyze_symbol(
        &self,
        group: &[DailyBar],
        tags: Option<&ConceptTags>,
        records: &mut Vec<LimitUpRecord>,
        anomalies: &mut Vec<ClassificationAnomaly>,
    ) {
        let tol = self.config.hit_tolerance;
        let limits: Vec<Option<f64>> = group
            .iter()
            .map(|b| limit_from_prev(b.pre_close, b.board().limit_multiplier()))
            .collect();
        let hits: Vec<bool> = group
            .iter()
            .zip(&limits)
            .map(|(b, limit)| limit.is_some_and(|l| is_limit_up(b.close, l, tol)))
            .collect();
        let streaks = consecutive_days(&hits);

        for (i, bar) in group.iter().enumerate() {
            let mut pattern = None;
            if let (true, Some(limit)) = (hits[i], limits[i]) {
                match board::classify(bar.open, bar.high, bar.low, bar.close, limit, tol) {
                    Ok(p) => pattern = Some(p),
                    Err(reason) => {
                        debug!(symbol = %bar.symbol, date = %bar.date, %reason, "unclassified limit-up");
                        anomalies.push(ClassificationAnomaly {
                            symbol: bar.symbol.clone(),
                            date: bar.date,
                            reason,
                        });
                    }
                }
            }

            let next_day_open_change_pct = group
                .get(i + 1)
                .map(|next| (next.open - bar.close) / bar.close * 100.0)
                .filter(|pct| pct.is_finite());

            let concept_tags = match (hits[i], tags) {
                (true, Some(t)) => t.concepts.clone(),
                _ => Vec::new(),
            };

            records.push(LimitUpRecord {
                symbol: bar.symbol.clone(),
                name: bar.name.clone(),
                date: bar.date,
                close: bar.close,
                limit_price: limits[i],
                is_limit_up: hits[i],
                consecutive_days: streaks[i],
                board_pattern: pattern,
                next_day_open_change_pct,
                concept_tags,
            });
        }
    }
}

fn summarize(records: &[LimitUpRecord], anomalies: usize) -> AnalysisSummary {
    let mut by_pattern = BTreeMap::new();
    for p in records.iter().filter_map(|r| r.board_pattern) {
        *by_pattern.entry(p).or_insert(0) += 1;
    }
    let latest_date = records.iter().map(|r| r.date).max();
    let mut latest_ladder: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    if let Some(latest) = latest_date {
        for r in records
            .iter()
            .filter(|r| r.date == latest && r.consecutive_days > 0)
        {
            latest_ladder
                .entry(r.consecutive_days)
                .or_default()
                .push(r.symbol.clone());
        }
    }
    AnalysisSummary {
        rows: records.len(),
        limit_up_rows: records.iter().filter(|r| r.is_limit_up).count(),
        by_pattern,
        anomalies,
        latest_date,
        latest_ladder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(symbol: &str, name: &str, day: u32, ohlc: (f64, f64, f64, f64)) -> DailyBar {
        DailyBar {
            symbol: symbol.into(),
            name: name.into(),
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            open: ohlc.0,
            high: ohlc.1,
            low: ohlc.2,
            close: ohlc.3,
            volume: 1_000,
            amount: 1.0e6,
            pre_close: None,
        }
    }

    fn flat(symbol: &str, day: u32, price: f64) -> DailyBar {
        bar(symbol, "浦发银行", day, (price, price, price, price))
    }

    #[test]
    fn three_day_streak_with_patterns() {
        let bars = vec![
            flat("600000.SH", 4, 10.00),
            bar("600000.SH", "浦发银行", 5, (10.10, 11.00, 10.05, 11.00)),
            bar("600000.SH", "浦发银行", 6, (12.10, 12.10, 11.80, 12.10)),
            flat("600000.SH", 7, 13.31),
            bar("600000.SH", "浦发银行", 8, (13.00, 13.50, 12.90, 13.20)),
        ];
        let out = Analyzer::default().analyze(&bars, &BTreeMap::new()).unwrap();
        let streaks: Vec<u32> = out.records.iter().map(|r| r.consecutive_days).collect();
        assert_eq!(streaks, vec![0, 1, 2, 3, 0]);
        let patterns: Vec<_> = out.records.iter().map(|r| r.board_pattern).collect();
        assert_eq!(
            patterns,
            vec![
                None,
                Some(BoardPattern::Turnover),
                Some(BoardPattern::TShaped),
                Some(BoardPattern::OneWord),
                None
            ]
        );
        assert_eq!(out.records[0].limit_price, None);
        assert_eq!(out.records[4].next_day_open_change_pct, None);
        let pct = out.records[3].next_day_open_change_pct.unwrap();
        assert!((pct - (13.00 - 13.31) / 13.31 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn st_name_on_the_row_selects_five_percent() {
        let bars = vec![
            bar("600001.SH", "*ST邯钢", 4, (4.00, 4.00, 4.00, 4.00)),
            bar("600001.SH", "*ST邯钢", 5, (4.10, 4.20, 4.05, 4.20)),
        ];
        let out = Analyzer::default().analyze(&bars, &BTreeMap::new()).unwrap();
        assert_eq!(out.records[1].limit_price, Some(4.20));
        assert!(out.records[1].is_limit_up);
    }

    #[test]
    fn chinext_uses_twenty_percent() {
        let bars = vec![flat("300750.SZ", 4, 10.00), flat("300750.SZ", 5, 11.00)];
        let out = Analyzer::default().analyze(&bars, &BTreeMap::new()).unwrap();
        assert_eq!(out.records[1].limit_price, Some(12.00));
        assert!(!out.records[1].is_limit_up);
    }

    #[test]
    fn tags_only_on_limit_up_rows() {
        let bars = vec![flat("600000.SH", 4, 10.00), flat("600000.SH", 5, 11.00)];
        let mut tags = BTreeMap::new();
        tags.insert(
            "600000.SH".to_string(),
            ConceptTags {
                concepts: vec!["银行".into(), "上海".into()],
                industry: "银行".into(),
            },
        );
        let out = Analyzer::default().analyze(&bars, &tags).unwrap();
        assert!(out.records[0].concept_tags.is_empty());
        assert_eq!(out.records[1].concept_tags, vec!["银行", "上海"]);
    }

    #[test]
    fn anomaly_rate_above_threshold_fails() {
        // closes at the limit after trading above it: unclassifiable
        let bars = vec![
            flat("600000.SH", 4, 10.00),
            bar("600000.SH", "浦发银行", 5, (11.00, 11.20, 10.90, 11.00)),
        ];
        let err = Analyzer::default()
            .analyze(&bars, &BTreeMap::new())
            .unwrap_err();
        match err {
            AnalysisError::InconsistencyRate { rate, examples, .. } => {
                assert!((rate - 1.0).abs() < 1e-12);
                assert_eq!(examples.len(), 1);
                assert_eq!(examples[0].symbol, "600000.SH");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn anomalous_row_keeps_streak_when_tolerated() {
        let bars = vec![
            flat("600000.SH", 4, 10.00),
            bar("600000.SH", "浦发银行", 5, (11.00, 11.20, 10.90, 11.00)),
        ];
        let analyzer = Analyzer::new(AnalysisConfig {
            max_anomaly_rate: 1.0,
            ..AnalysisConfig::default()
        });
        let out = analyzer.analyze(&bars, &BTreeMap::new()).unwrap();
        assert!(out.records[1].is_limit_up);
        assert_eq!(out.records[1].consecutive_days, 1);
        assert_eq!(out.records[1].board_pattern, None);
        assert_eq!(out.anomalies.len(), 1);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let bars = vec![flat("600000.SH", 4, 10.00), flat("600000.SH", 4, 10.50)];
        assert!(matches!(
            Analyzer::default().analyze(&bars, &BTreeMap::new()),
            Err(AnalysisError::Table(_))
        ));
    }

    #[test]
    fn output_sorted_and_summary_histogram() {
        let bars = vec![
            flat("600001.SH", 5, 11.00),
            flat("600000.SH", 5, 11.00),
            flat("600001.SH", 4, 10.00),
            flat("600000.SH", 4, 10.00),
        ];
        let out = Analyzer::default().analyze(&bars, &BTreeMap::new()).unwrap();
        let keys: Vec<_> = out
            .records
            .iter()
            .map(|r| (r.symbol.as_str(), r.date.format("%d").to_string()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("600000.SH", "04".to_string()),
                ("600000.SH", "05".to_string()),
                ("600001.SH", "04".to_string()),
                ("600001.SH", "05".to_string()),
            ]
        );
        assert_eq!(out.summary.by_pattern.get(&BoardPattern::OneWord), Some(&2));
        assert_eq!(
            out.summary.latest_ladder.get(&1),
            Some(&vec!["600000.SH".to_string(), "600001.SH".to_string()])
        );
    }

    #[test]
    fn empty_input_is_empty_output() {
        let out = Analyzer::default().analyze(&[], &BTreeMap::new()).unwrap();
        assert!(out.records.is_empty());
        assert_eq!(out.summary.latest_date, None);
    }
}
