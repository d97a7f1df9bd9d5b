//! Limit-up price and hit detection.
//!
//! limit = floor(prev_close * multiplier * 100 + 0.49999) / 100
//!
//! The epsilon is slightly below one half so that products landing exactly on
//! a half-cent round down, matching the exchange price tables.

/// Added before flooring to cents.
pub const ROUNDING_EPSILON: f64 = 0.49999;

/// Default slack for `close >= limit`.
pub const DEFAULT_HIT_TOLERANCE: f64 = 1e-4;

/// Limit-up price in yuan, rounded to the cent.
pub fn limit_price(prev_close: f64, multiplier: f64) -> f64 {
    (prev_close * multiplier * 100.0 + ROUNDING_EPSILON).floor() / 100.0
}

/// `None` when the previous close is missing or unusable.
pub fn limit_from_prev(prev_close: Option<f64>, multiplier: f64) -> Option<f64> {
    prev_close
        .filter(|p| p.is_finite() && *p > 0.0)
        .map(|p| limit_price(p, multiplier))
}

pub fn is_limit_up(close: f64, limit: f64, tolerance: f64) -> bool {
    !close.is_nan() && close >= limit - tolerance
}
