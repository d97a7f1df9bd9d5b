//! Ladder promotion rates.

use crate::domain::{LimitUpRecord, PromotionRate};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Aggregate promotion rates by (date, level).
///
/// `records` must be sorted by (symbol, date). The trading calendar is every
/// date present in `records`. A level-N row on D is a candidate when its
/// instrument also has a row on the next trading date after D, so the last
/// date and suspensions drop out of the denominator. It is promoted when that
/// row sits at level N+1. Output is ordered by date, then level.
pub fn promotion_rates(records: &[LimitUpRecord]) -> Vec<PromotionRate> {
    let calendar: BTreeSet<NaiveDate> = records.iter().map(|r| r.date).collect();
    let next_trading_date: HashMap<NaiveDate, NaiveDate> = calendar
        .iter()
        .zip(calendar.iter().skip(1))
        .map(|(d, next)| (*d, *next))
        .collect();
    let mut tally: BTreeMap<(NaiveDate, u32), (usize, usize)> = BTreeMap::new();

    for pair in records.windows(2) {
        let (today, next) = (&pair[0], &pair[1]);
        if today.symbol != next.symbol || today.consecutive_days == 0 {
            continue;
        }
        if next_trading_date.get(&today.date) != Some(&next.date) {
            continue;
        }
        let entry = tally
            .entry((today.date, today.consecutive_days))
            .or_default();
        entry.0 += 1;
        if next.consecutive_days == today.consecutive_days + 1 {
            entry.1 += 1;
        }
    }

    tally
        .into_iter()
        .map(|((date, level), (candidates, promoted))| PromotionRate {
            date,
            level,
            candidates,
            promoted,
            rate: promoted as f64 / candidates as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(symbol: &str, day: u32, streak: u32) -> LimitUpRecord {
        LimitUpRecord {
            symbol: symbol.into(),
            name: String::new(),
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            close: 10.0,
            limit_price: Some(10.0),
            is_limit_up: streak > 0,
            consecutive_days: streak,
            board_pattern: None,
            next_day_open_change_pct: None,
            concept_tags: Vec::new(),
        }
    }

    #[test]
    fn six_of_ten_promote() {
        let mut records = Vec::new();
        for i in 0..10 {
            let symbol = format!("6000{i:02}.SH");
            records.push(rec(&symbol, 4, 1));
            records.push(rec(&symbol, 5, if i < 6 { 2 } else { 0 }));
        }
        let rates = promotion_rates(&records);
        let first = rates.iter().find(|r| r.level == 1).unwrap();
        assert_eq!(first.candidates, 10);
        assert_eq!(first.promoted, 6);
        assert!((first.rate - 0.6).abs() < 1e-12);
    }

    #[test]
    fn last_row_is_not_a_candidate() {
        let records = vec![rec("600000.SH", 4, 1), rec("600001.SH", 4, 1)];
        assert!(promotion_rates(&records).is_empty());
    }

    #[test]
    fn suspended_instrument_is_not_a_candidate() {
        let records = vec![
            rec("600000.SH", 4, 1),
            rec("600000.SH", 5, 2),
            // no row on the 5th
            rec("600001.SH", 4, 1),
            rec("600001.SH", 6, 2),
        ];
        let rates = promotion_rates(&records);
        let on_4th: Vec<_> = rates
            .iter()
            .filter(|r| r.date.format("%d").to_string() == "04")
            .map(|r| (r.level, r.candidates, r.promoted))
            .collect();
        assert_eq!(on_4th, vec![(1u32, 1usize, 1usize)]);
    }

    #[test]
    fn ordered_by_date_then_level() {
        let records = vec![
            rec("600000.SH", 4, 1),
            rec("600000.SH", 5, 2),
            rec("600000.SH", 6, 3),
            rec("600001.SH", 5, 1),
            rec("600001.SH", 6, 0),
        ];
        let keys: Vec<_> = promotion_rates(&records)
            .iter()
            .map(|r| (r.date.format("%d").to_string(), r.level))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("04".to_string(), 1u32),
                ("05".to_string(), 1),
                ("05".to_string(), 2)
            ]
        );
    }
}
