//! Limit-up ladder analysis: limit prices, streaks, board patterns and
//! promotion rates.

pub mod analyzer;
pub mod board;
pub mod limit;
pub mod promotion;
pub mod streak;

pub use analyzer::{
    AnalysisConfig, AnalysisError, AnalysisOutput, AnalysisSummary, Analyzer,
    ClassificationAnomaly, MAX_EXAMPLES,
};
pub use limit::{is_limit_up, limit_price, DEFAULT_HIT_TOLERANCE, ROUNDING_EPSILON};
pub use promotion::promotion_rates;
pub use streak::consecutive_days;
