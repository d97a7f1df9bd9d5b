//! TOML run configuration.
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! valid configuration. Sections map onto the constructors of the core
//! components; nothing is read from global state.

use chrono::NaiveDate;
use ladderlab_core::data::eastmoney::{DEFAULT_KLINE_URL, DEFAULT_LIST_URL, DEFAULT_QUOTE_URL};
use ladderlab_core::data::{
    CancelToken, CompositeConfig, EastmoneyConfig, RetryPolicy, TdxConfig, ValidationConfig,
};
use ladderlab_core::domain::parse_date_key;
use ladderlab_core::ladder::AnalysisConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LadderConfig {
    pub storage: StorageSection,
    pub fetch: FetchSection,
    pub validation: ValidationConfig,
    pub analysis: AnalysisConfig,
    pub universe: UniverseSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub workers: usize,
    pub tag_workers: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub request_timeout_secs: u64,
    /// Idle ping interval; 0 disables the heartbeat.
    pub heartbeat_secs: u64,
    /// Wall-clock budget for a whole fetch run.
    pub deadline_secs: Option<u64>,
    /// `YYYYMMDD`
    pub default_start_date: String,
    /// `host:port` quote servers speaking the framed daily-bar protocol.
    /// Empty disables the primary source.
    pub servers: Vec<String>,
    pub kline_url: String,
    pub quote_url: String,
    pub list_url: String,
    pub breaker_cooldown_secs: u64,
    pub fetch_tags: bool,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            workers: 20,
            tag_workers: 10,
            max_retries: 3,
            base_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            jitter_ms: 250,
            request_timeout_secs: 10,
            heartbeat_secs: 15,
            deadline_secs: None,
            default_start_date: "20240101".to_string(),
            servers: Vec::new(),
            kline_url: DEFAULT_KLINE_URL.to_string(),
            quote_url: DEFAULT_QUOTE_URL.to_string(),
            list_url: DEFAULT_LIST_URL.to_string(),
            breaker_cooldown_secs: 30 * 60,
            fetch_tags: true,
        }
    }
}

impl FetchSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }

    pub fn composite_config(&self) -> CompositeConfig {
        CompositeConfig {
            workers: self.workers,
            tag_workers: self.tag_workers,
            retry: self.retry_policy(),
        }
    }

    pub fn tdx_config(&self) -> TdxConfig {
        TdxConfig {
            servers: self.servers.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
            heartbeat: (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs)),
        }
    }

    pub fn eastmoney_config(&self) -> EastmoneyConfig {
        EastmoneyConfig {
            kline_url: self.kline_url.clone(),
            quote_url: self.quote_url.clone(),
            list_url: self.list_url.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn has_primary(&self) -> bool {
        !self.servers.is_empty()
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }

    pub fn start_date(&self) -> Result<NaiveDate, ConfigError> {
        parse_date_key(&self.default_start_date).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "fetch.default_start_date '{}' is not YYYYMMDD",
                self.default_start_date
            ))
        })
    }

    /// Cancellation token honouring `deadline_secs`.
    pub fn cancel_token(&self) -> CancelToken {
        match self.deadline_secs {
            Some(secs) => CancelToken::with_deadline(Duration::from_secs(secs)),
            None => CancelToken::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseSection {
    /// Explicit instrument list; the primary security list is used when unset.
    pub file: Option<PathBuf>,
}

impl LadderConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fetch = &self.fetch;
        if fetch.workers == 0 || fetch.tag_workers == 0 {
            return Err(ConfigError::Invalid(
                "fetch.workers and fetch.tag_workers must be at least 1".into(),
            ));
        }
        if let Some(bad) = fetch.servers.iter().find(|s| !s.contains(':')) {
            return Err(ConfigError::Invalid(format!(
                "fetch.servers entry '{bad}' is not host:port"
            )));
        }
        if fetch.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("fetch.request_timeout_secs must be positive".into()));
        }
        if !(fetch.backoff_factor >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "fetch.backoff_factor must be >= 1, got {}",
                fetch.backoff_factor
            )));
        }
        fetch.start_date()?;

        unit_interval("validation.null_rate_warn", self.validation.null_rate_warn)?;
        unit_interval("validation.null_rate_max", self.validation.null_rate_max)?;
        if self.validation.null_rate_warn > self.validation.null_rate_max {
            return Err(ConfigError::Invalid(
                "validation.null_rate_warn exceeds validation.null_rate_max".into(),
            ));
        }
        if !(self.validation.price_ceiling > 0.0) {
            return Err(ConfigError::Invalid("validation.price_ceiling must be positive".into()));
        }

        unit_interval("analysis.max_anomaly_rate", self.analysis.max_anomaly_rate)?;
        if !(self.analysis.hit_tolerance >= 0.0) {
            return Err(ConfigError::Invalid("analysis.hit_tolerance must be >= 0".into()));
        }
        Ok(())
    }
}

fn unit_interval(field: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{field} must be in [0, 1], got {value}")))
    }
}
