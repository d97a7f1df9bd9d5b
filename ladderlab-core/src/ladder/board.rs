//! Board pattern of a limit-up day.

use crate::domain::BoardPattern;

fn at(price: f64, limit: f64, tolerance: f64) -> bool {
    (price - limit).abs() <= tolerance
}

/// Classify a limit-up bar; `Err` carries why no pattern matched.
///
/// Checked in order: one-word (O = H = L = C = limit), T-shaped
/// (O = C = H = limit, L below), turnover (C = limit, O below).
pub fn classify(
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    limit: f64,
    tolerance: f64,
) -> Result<BoardPattern, String> {
    let (o, h, l, c) = (
        at(open, limit, tolerance),
        at(high, limit, tolerance),
        at(low, limit, tolerance),
        at(close, limit, tolerance),
    );

    if o && h && l && c {
        return Ok(BoardPattern::OneWord);
    }
    if o && c && h && low < limit - tolerance {
        return Ok(BoardPattern::TShaped);
    }
    if c && open < limit - tolerance {
        return Ok(BoardPattern::Turnover);
    }

    let reason = if !c {
        format!("close {close} is not at limit {limit}")
    } else if open > limit + tolerance {
        format!("open {open} above limit {limit}")
    } else if !h {
        format!("high {high} differs from limit {limit}")
    } else {
        format!("unclassifiable bar o={open} h={high} l={low} c={close} limit={limit}")
    };
    Err(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-4;

    #[test]
    fn one_word() {
        assert_eq!(classify(11.0, 11.0, 11.0, 11.0, 11.0, TOL), Ok(BoardPattern::OneWord));
    }

    #[test]
    fn t_shaped() {
        assert_eq!(classify(11.0, 11.0, 10.5, 11.0, 11.0, TOL), Ok(BoardPattern::TShaped));
    }

    #[test]
    fn turnover() {
        assert_eq!(classify(10.2, 11.0, 10.1, 11.0, 11.0, TOL), Ok(BoardPattern::Turnover));
    }

    #[test]
    fn close_above_limit_is_anomalous() {
        assert!(classify(10.0, 11.5, 10.0, 11.5, 11.0, TOL).is_err());
    }

    #[test]
    fn high_above_limit_with_open_at_limit() {
        // opened at the limit, traded above it: no pattern fits
        let err = classify(11.0, 11.2, 10.9, 11.0, 11.0, TOL).unwrap_err();
        assert!(err.contains("high"));
    }

    #[test]
    fn equality_within_tolerance() {
        assert_eq!(
            classify(11.00005, 11.0, 10.99995, 11.0, 11.0, TOL),
            Ok(BoardPattern::OneWord)
        );
    }
}
