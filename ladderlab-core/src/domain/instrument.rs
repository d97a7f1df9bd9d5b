//! Instrument identity and regulatory board classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Exchange an A-share is listed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Exchange {
    /// Shanghai Stock Exchange (`.SH`).
    Sh,
    /// Shenzhen Stock Exchange (`.SZ`).
    Sz,
}

impl Exchange {
    pub fn suffix(&self) -> &'static str {
        match self {
            Exchange::Sh => "SH",
            Exchange::Sz => "SZ",
        }
    }

    /// Market id used by the primary quote protocol (0 = Shenzhen, 1 = Shanghai).
    pub fn market_id(&self) -> u8 {
        match self {
            Exchange::Sz => 0,
            Exchange::Sh => 1,
        }
    }

    pub fn from_market_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Exchange::Sz),
            1 => Some(Exchange::Sh),
            _ => None,
        }
    }

    pub fn all() -> [Exchange; 2] {
        [Exchange::Sz, Exchange::Sh]
    }
}

/// Regulatory tier that sets the daily price-move limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoardCategory {
    Main,
    ChiNext,
    Star,
    St,
}

impl BoardCategory {
    /// Multiplier applied to the previous close to get the limit-up price.
    pub fn limit_multiplier(&self) -> f64 {
        match self {
            BoardCategory::St => 1.05,
            BoardCategory::ChiNext | BoardCategory::Star => 1.20,
            BoardCategory::Main => 1.10,
        }
    }

    /// Board for a 6-digit code on a day when the ST flag is `st`.
    ///
    /// ST status wins over the listing board.
    pub fn classify(code: &str, st: bool) -> Self {
        if st {
            return BoardCategory::St;
        }
        if code.starts_with("300") || code.starts_with("301") {
            BoardCategory::ChiNext
        } else if code.starts_with("688") || code.starts_with("689") {
            BoardCategory::Star
        } else {
            BoardCategory::Main
        }
    }
}

/// Whether a display name marks the stock as specially treated (`ST`, `*ST`, `SST`...).
pub fn is_st_name(name: &str) -> bool {
    name.to_ascii_uppercase().contains("ST")
}

const SH_PREFIXES: &[&str] = &["600", "601", "603", "605", "688", "689"];
const SZ_PREFIXES: &[&str] = &["000", "001", "002", "003", "300", "301"];

/// A listed A-share.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Exchange-qualified symbol, e.g. `600000.SH`.
    pub symbol: String,
    /// Bare 6-digit code.
    pub code: String,
    pub exchange: Exchange,
    pub name: String,
}

impl Instrument {
    /// Parse `600000.SH`, `sz.000001` or a bare code (exchange inferred from the prefix).
    pub fn parse(symbol: &str, name: impl Into<String>) -> Result<Self, InstrumentError> {
        let trimmed = symbol.trim();
        let upper = trimmed.to_ascii_uppercase();

        let (code, exchange) = if let Some((code, suffix)) = upper.split_once('.') {
            match (code, suffix) {
                ("SH", c) => (c.to_string(), Some(Exchange::Sh)),
                ("SZ", c) => (c.to_string(), Some(Exchange::Sz)),
                (c, "SH") => (c.to_string(), Some(Exchange::Sh)),
                (c, "SZ") => (c.to_string(), Some(Exchange::Sz)),
                _ => return Err(InstrumentError::InvalidSymbol(trimmed.to_string())),
            }
        } else {
            (upper.clone(), None)
        };

        if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InstrumentError::InvalidSymbol(trimmed.to_string()));
        }

        let inferred = if code.starts_with('6') {
            Exchange::Sh
        } else {
            Exchange::Sz
        };
        let exchange = exchange.unwrap_or(inferred);

        Self::from_code(exchange, &code, name)
    }

    /// Build from an exchange and bare code, rejecting anything that is not an A-share.
    pub fn from_code(
        exchange: Exchange,
        code: &str,
        name: impl Into<String>,
    ) -> Result<Self, InstrumentError> {
        let prefixes = match exchange {
            Exchange::Sh => SH_PREFIXES,
            Exchange::Sz => SZ_PREFIXES,
        };
        if code.len() != 6 || !prefixes.iter().any(|p| code.starts_with(p)) {
            return Err(InstrumentError::NotAShare(format!(
                "{code}.{}",
                exchange.suffix()
            )));
        }

        Ok(Self {
            symbol: format!("{code}.{}", exchange.suffix()),
            code: code.to_string(),
            exchange,
            name: name.into(),
        })
    }

    /// Board on a day when the instrument traded under `name_that_day`.
    pub fn board_on(&self, name_that_day: &str) -> BoardCategory {
        BoardCategory::classify(&self.code, is_st_name(name_that_day))
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum InstrumentError {
    #[error("invalid symbol '{0}'")]
    InvalidSymbol(String),

    #[error("'{0}' is not an A-share (B shares, funds and indices are excluded)")]
    NotAShare(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qualified_and_bare_symbols() {
        let a = Instrument::parse("600000.SH", "浦发银行").unwrap();
        assert_eq!(a.code, "600000");
        assert_eq!(a.exchange, Exchange::Sh);

        let b = Instrument::parse("sz.000001", "").unwrap();
        assert_eq!(b.symbol, "000001.SZ");

        let c = Instrument::parse("300750", "").unwrap();
        assert_eq!(c.symbol, "300750.SZ");

        let d = Instrument::parse("688981", "").unwrap();
        assert_eq!(d.exchange, Exchange::Sh);
    }

    #[test]
    fn rejects_b_shares_and_garbage() {
        assert!(matches!(
            Instrument::parse("900901.SH", ""),
            Err(InstrumentError::NotAShare(_))
        ));
        assert!(matches!(
            Instrument::parse("200002.SZ", ""),
            Err(InstrumentError::NotAShare(_))
        ));
        assert!(matches!(
            Instrument::parse("ABC", ""),
            Err(InstrumentError::InvalidSymbol(_))
        ));
        // Shanghai prefix listed under Shenzhen
        assert!(Instrument::parse("600000.SZ", "").is_err());
    }

    #[test]
    fn board_depends_on_prefix_and_st() {
        assert_eq!(BoardCategory::classify("600000", false), BoardCategory::Main);
        assert_eq!(BoardCategory::classify("300750", false), BoardCategory::ChiNext);
        assert_eq!(BoardCategory::classify("301001", false), BoardCategory::ChiNext);
        assert_eq!(BoardCategory::classify("688981", false), BoardCategory::Star);
        assert_eq!(BoardCategory::classify("300750", true), BoardCategory::St);
    }

    #[test]
    fn st_is_evaluated_from_the_name_of_the_day() {
        let inst = Instrument::parse("000004.SZ", "国华网安").unwrap();
        assert_eq!(inst.board_on("国华网安"), BoardCategory::Main);
        assert_eq!(inst.board_on("*ST国华"), BoardCategory::St);
        assert!(is_st_name("ST天山"));
        assert!(!is_st_name("平安银行"));
    }

    #[test]
    fn multipliers() {
        assert_eq!(BoardCategory::Main.limit_multiplier(), 1.10);
        assert_eq!(BoardCategory::ChiNext.limit_multiplier(), 1.20);
        assert_eq!(BoardCategory::Star.limit_multiplier(), 1.20);
        assert_eq!(BoardCategory::St.limit_multiplier(), 1.05);
    }
}
