//! LadderLab Core: quote sessions, fetchers, validation, storage and the
//! limit-up ladder analyzer.
//!
//! - Domain types (instruments, daily bars, ladder records, promotion rates)
//! - Primary binary quote protocol with per-worker session pool
//! - Eastmoney HTTP fallback and concept tags
//! - Frame validation and parquet storage
//! - Limit price, streak, board pattern and promotion analysis

pub mod data;
pub mod domain;
pub mod ladder;
