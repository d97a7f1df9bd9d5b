//! Explicit instrument universe loaded from TOML.
//!
//! ```toml
//! [[instruments]]
//! symbol = "600000.SH"
//! name = "浦发银行"
//! ```

use crate::domain::{Instrument, InstrumentError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("read universe file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse universe TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialize universe: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("universe entry {index}: {source}")]
    Entry {
        index: usize,
        #[source]
        source: InstrumentError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseEntry {
    pub symbol: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Universe {
    #[serde(default)]
    pub instruments: Vec<UniverseEntry>,
}

impl Universe {
    pub fn from_file(path: &Path) -> Result<Self, UniverseError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, UniverseError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, UniverseError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Parsed instruments, first occurrence of each symbol wins.
    ///
    /// Any entry that is not an A-share fails the whole universe.
    pub fn instruments(&self) -> Result<Vec<Instrument>, UniverseError> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(self.instruments.len());
        for (index, entry) in self.instruments.iter().enumerate() {
            let instrument = Instrument::parse(&entry.symbol, entry.name.clone())
                .map_err(|source| UniverseError::Entry { index, source })?;
            if seen.insert(instrument.symbol.clone()) {
                out.push(instrument);
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}
