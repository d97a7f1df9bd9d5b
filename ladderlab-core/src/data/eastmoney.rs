//! Eastmoney HTTP source: unadjusted daily klines, concept/industry tags and
//! the listed A-share universe.
//!
//! One request per call; the composite fetcher never retries this source.
//! HTTP 403 trips the shared circuit breaker at once, 429 and 5xx count
//! toward its threshold, and while it is open every call fails fast.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{
    BarSource, CancelToken, DataError, DataSource, DateRange, FetchResult, InstrumentSource,
    RawBar, TagSource,
};
use crate::domain::{date_key, ConceptTags, Exchange, Instrument};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_KLINE_URL: &str = "https://push2his.eastmoney.com/api/qt/stock/kline/get";
pub const DEFAULT_QUOTE_URL: &str = "https://push2.eastmoney.com/api/qt/stock/get";
pub const DEFAULT_LIST_URL: &str = "https://push2.eastmoney.com/api/qt/clist/get";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const KLINE_FIELDS1: &str = "f1,f2,f3,f4,f5,f6";
const KLINE_FIELDS2: &str = "f51,f52,f53,f54,f55,f56,f57";
const QUOTE_FIELDS: &str = "f58,f127,f128,f129";
/// Shenzhen main + ChiNext, Shanghai main + STAR.
const LIST_FILTER: &str = "m:0 t:6,m:0 t:80,m:1 t:2,m:1 t:23";
const LIST_FIELDS: &str = "f12,f13,f14";
const LIST_PAGE_SIZE: usize = 1000;
const LIST_MAX_PAGES: usize = 100;

#[derive(Debug, Deserialize)]
struct KlineResponse {
    data: Option<KlineData>,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    #[serde(default)]
    klines: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    data: Option<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    f127: Option<String>,
    #[serde(default)]
    f129: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Option<ListData>,
}

#[derive(Debug, Deserialize)]
struct ListData {
    #[serde(default)]
    total: usize,
    #[serde(default)]
    diff: Vec<ListItem>,
}

/// `f12` code, `f13` market id, `f14` name.
#[derive(Debug, Deserialize)]
struct ListItem {
    f12: String,
    #[serde(default)]
    f13: Option<u8>,
    #[serde(default)]
    f14: String,
}

#[derive(Debug, Clone)]
pub struct EastmoneyConfig {
    pub kline_url: String,
    pub quote_url: String,
    pub list_url: String,
    pub timeout: Duration,
}

impl Default for EastmoneyConfig {
    fn default() -> Self {
        Self {
            kline_url: DEFAULT_KLINE_URL.to_string(),
            quote_url: DEFAULT_QUOTE_URL.to_string(),
            list_url: DEFAULT_LIST_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct EastmoneySource {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    config: EastmoneyConfig,
}

impl EastmoneySource {
    pub fn new(config: EastmoneyConfig, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DataError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            circuit_breaker,
            config,
        })
    }

    /// Market-qualified id used by both endpoints (`1.600000`, `0.000001`).
    fn secid(instrument: &Instrument) -> String {
        format!("{}.{}", instrument.exchange.market_id(), instrument.code)
    }

    /// One GET with breaker bookkeeping; decodes the JSON body as `T`.
    fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<T, DataError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(DataError::CircuitBreakerTripped);
        }

        let resp = self.client.get(url).query(query).send().map_err(|e| {
            if e.is_timeout() {
                DataError::Timeout(format!("{what}: {e}"))
            } else {
                DataError::NetworkUnreachable(format!("{what}: {e}"))
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            self.circuit_breaker.trip();
            return Err(DataError::CircuitBreakerTripped);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            self.circuit_breaker.record_failure();
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(DataError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if status.is_server_error() {
            self.circuit_breaker.record_failure();
            return Err(DataError::Remote {
                status: status.as_u16(),
                message: format!("HTTP {status} for {what}"),
            });
        }
        if !status.is_success() {
            return Err(DataError::Remote {
                status: status.as_u16(),
                message: format!("HTTP {status} for {what}"),
            });
        }

        let body = resp.json::<T>().map_err(|e| {
            DataError::ResponseFormatChanged(format!("failed to parse response for {what}: {e}"))
        })?;
        self.circuit_breaker.record_success();
        Ok(body)
    }

    fn fetch_klines(&self, instrument: &Instrument, range: DateRange) -> Result<Vec<RawBar>, DataError> {
        let query = [
            ("secid", Self::secid(instrument)),
            ("fields1", KLINE_FIELDS1.to_string()),
            ("fields2", KLINE_FIELDS2.to_string()),
            ("klt", "101".to_string()),
            ("fqt", "0".to_string()),
            ("beg", date_key(range.start)),
            ("end", date_key(range.end)),
            ("lmt", "1000000".to_string()),
        ];
        let resp: KlineResponse = self.get_json(&self.config.kline_url, &query, &instrument.symbol)?;
        let data = resp.data.ok_or_else(|| DataError::SymbolNotFound {
            symbol: instrument.symbol.clone(),
        })?;

        let mut bars = data
            .klines
            .iter()
            .map(|line| parse_kline(line))
            .collect::<Result<Vec<_>, _>>()?;
        bars.retain(|b| b.date >= range.start && b.date <= range.end);
        bars.sort_by_key(|b| b.date);
        Ok(bars)
    }

    /// One page of the A-share list; `None` past the last page.
    fn list_page(&self, page: usize) -> Result<Option<ListData>, DataError> {
        let query = [
            ("fs", LIST_FILTER.to_string()),
            ("fields", LIST_FIELDS.to_string()),
            ("fid", "f12".to_string()),
            ("po", "0".to_string()),
            ("np", "1".to_string()),
            ("pn", page.to_string()),
            ("pz", LIST_PAGE_SIZE.to_string()),
        ];
        let resp: ListResponse = self.get_json(&self.config.list_url, &query, "security list")?;
        Ok(resp.data.filter(|d| !d.diff.is_empty()))
    }
}

fn list_item_instrument(item: ListItem) -> Option<Instrument> {
    let code = item.f12.trim();
    match item.f13.and_then(Exchange::from_market_id) {
        Some(exchange) => Instrument::from_code(exchange, code, item.f14).ok(),
        None => Instrument::parse(code, item.f14).ok(),
    }
}

/// `date,open,close,high,low,volume,amount` (note the close-before-high order).
fn parse_kline(line: &str) -> Result<RawBar, DataError> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 7 {
        return Err(DataError::ResponseFormatChanged(format!(
            "kline has {} fields, expected 7: '{line}'",
            parts.len()
        )));
    }
    let date = NaiveDate::parse_from_str(parts[0], "%Y-%m-%d")
        .map_err(|e| DataError::ResponseFormatChanged(format!("kline date '{}': {e}", parts[0])))?;
    let price = |s: &str| s.trim().parse::<f64>().unwrap_or(f64::NAN);
    let volume = parts[5]
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| {
            DataError::ResponseFormatChanged(format!("kline volume '{}' on {date}", parts[5]))
        })?;

    Ok(RawBar {
        date,
        open: price(parts[1]),
        close: price(parts[2]),
        high: price(parts[3]),
        low: price(parts[4]),
        volume: volume as u64,
        amount: price(parts[6]),
    })
}

/// Eastmoney sends `-` for empty text fields.
fn clean_field(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != "-")
}

impl BarSource for EastmoneySource {
    fn name(&self) -> &str {
        "eastmoney"
    }

    fn fetch_bars(
        &self,
        instrument: &Instrument,
        range: DateRange,
        _worker: usize,
        cancel: &CancelToken,
    ) -> Result<FetchResult, DataError> {
        cancel.check()?;
        let bars = self.fetch_klines(instrument, range)?;
        debug!(symbol = %instrument.symbol, bars = bars.len(), "eastmoney klines");
        Ok(FetchResult {
            symbol: instrument.symbol.clone(),
            bars,
            source: DataSource::Eastmoney,
        })
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

impl TagSource for EastmoneySource {
    fn fetch_tags(&self, instrument: &Instrument) -> Result<ConceptTags, DataError> {
        let query = [
            ("secid", Self::secid(instrument)),
            ("fields", QUOTE_FIELDS.to_string()),
        ];
        let resp: QuoteResponse = self.get_json(&self.config.quote_url, &query, &instrument.symbol)?;
        let data = resp.data.ok_or_else(|| DataError::SymbolNotFound {
            symbol: instrument.symbol.clone(),
        })?;

        let concepts = clean_field(data.f129)
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(ConceptTags {
            concepts,
            industry: clean_field(data.f127).unwrap_or_default(),
        })
    }
}

impl InstrumentSource for EastmoneySource {
    fn list_instruments(&self, cancel: &CancelToken) -> Result<Vec<Instrument>, DataError> {
        let mut out = Vec::new();
        let mut seen = 0;
        for page in 1..=LIST_MAX_PAGES {
            cancel.check()?;
            let Some(data) = self.list_page(page)? else {
                break;
            };
            seen += data.diff.len();
            let total = data.total;
            out.extend(data.diff.into_iter().filter_map(list_item_instrument));
            if seen >= total {
                break;
            }
        }
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out.dedup_by(|a, b| a.symbol == b.symbol);
        debug!(instruments = out.len(), "eastmoney security list");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn source(server: &mockito::ServerGuard) -> (EastmoneySource, Arc<CircuitBreaker>) {
        let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(60)));
        let config = EastmoneyConfig {
            kline_url: format!("{}/api/qt/stock/kline/get", server.url()),
            quote_url: format!("{}/api/qt/stock/get", server.url()),
            list_url: format!("{}/api/qt/clist/get", server.url()),
            timeout: Duration::from_secs(5),
        };
        (EastmoneySource::new(config, breaker.clone()).unwrap(), breaker)
    }

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        )
    }

    fn pingan() -> Instrument {
        Instrument::parse("000001.SZ", "平安银行").unwrap()
    }

    #[test]
    fn parses_unadjusted_klines() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/api/qt/stock/kline/get")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("secid".into(), "0.000001".into()),
                Matcher::UrlEncoded("fqt".into(), "0".into()),
                Matcher::UrlEncoded("beg".into(), "20240101".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"rc":0,"data":{"code":"000001","market":0,"name":"平安银行","klines":[
                    "2024-01-03,9.19,9.20,9.22,9.15,1200000,1102000000.00",
                    "2024-01-02,9.39,9.21,9.42,9.21,1158366,1075742252.45"]}}"#,
            )
            .create();

        let (src, _) = source(&server);
        let result = src
            .fetch_bars(&pingan(), range(), 0, &CancelToken::new())
            .unwrap();
        mock.assert();

        assert_eq!(result.source, DataSource::Eastmoney);
        assert_eq!(result.bars.len(), 2);
        let first = &result.bars[0];
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(first.open, 9.39);
        assert_eq!(first.close, 9.21);
        assert_eq!(first.high, 9.42);
        assert_eq!(first.low, 9.21);
        assert_eq!(first.volume, 1_158_366);
    }

    #[test]
    fn null_data_is_symbol_not_found() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/api/qt/stock/kline/get")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"rc":0,"data":null}"#)
            .create();

        let (src, _) = source(&server);
        let err = src
            .fetch_bars(&pingan(), range(), 0, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DataError::SymbolNotFound { .. }));
    }

    #[test]
    fn malformed_kline_is_format_change() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/api/qt/stock/kline/get")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data":{"klines":["2024-01-02,9.39"]}}"#)
            .create();

        let (src, _) = source(&server);
        let err = src
            .fetch_bars(&pingan(), range(), 0, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DataError::ResponseFormatChanged(_)));
    }

    #[test]
    fn unparseable_volume_is_format_change() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/api/qt/stock/kline/get")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data":{"klines":["2024-01-02,9.39,9.21,9.42,9.21,-,1075742252.45"]}}"#)
            .create();

        let (src, _) = source(&server);
        let err = src
            .fetch_bars(&pingan(), range(), 0, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DataError::ResponseFormatChanged(ref m) if m.contains("volume")));
    }

    #[test]
    fn security_list_pages_until_total() {
        let mut server = mockito::Server::new();
        let first = server
            .mock("GET", "/api/qt/clist/get")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("pn".into(), "1".into()),
                Matcher::UrlEncoded("np".into(), "1".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"data":{"total":4,"diff":[
                    {"f12":"600000","f13":1,"f14":"浦发银行"},
                    {"f12":"000001","f13":0,"f14":"平安银行"}]}}"#,
            )
            .create();
        let second = server
            .mock("GET", "/api/qt/clist/get")
            .match_query(Matcher::UrlEncoded("pn".into(), "2".into()))
            .with_status(200)
            .with_body(
                r#"{"data":{"total":4,"diff":[
                    {"f12":"300750","f13":0,"f14":"宁德时代"},
                    {"f12":"200002","f13":0,"f14":"万科B"}]}}"#,
            )
            .create();

        let (src, _) = source(&server);
        let list = src.list_instruments(&CancelToken::new()).unwrap();
        first.assert();
        second.assert();

        let symbols: Vec<&str> = list.iter().map(|i| i.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["000001.SZ", "300750.SZ", "600000.SH"]);
        assert_eq!(list[2].name, "浦发银行");
    }

    #[test]
    fn empty_list_page_ends_paging() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/api/qt/clist/get")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"rc":0,"data":null}"#)
            .expect(1)
            .create();

        let (src, _) = source(&server);
        assert!(src.list_instruments(&CancelToken::new()).unwrap().is_empty());
    }

    #[test]
    fn forbidden_trips_breaker_and_fails_fast() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/api/qt/stock/kline/get")
            .match_query(Matcher::Any)
            .with_status(403)
            .expect(1)
            .create();

        let (src, breaker) = source(&server);
        let first = src.fetch_bars(&pingan(), range(), 0, &CancelToken::new());
        assert!(matches!(first, Err(DataError::CircuitBreakerTripped)));
        assert!(!breaker.is_allowed());
        assert!(!src.is_available());

        // no second request reaches the server
        let second = src.fetch_bars(&pingan(), range(), 0, &CancelToken::new());
        assert!(matches!(second, Err(DataError::CircuitBreakerTripped)));
        mock.assert();
    }

    #[test]
    fn rate_limit_counts_toward_threshold() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/api/qt/stock/kline/get")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "7")
            .create();

        let (src, breaker) = source(&server);
        let err = src
            .fetch_bars(&pingan(), range(), 0, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DataError::RateLimited { retry_after_secs: 7 }));
        assert!(breaker.is_allowed());

        let _ = src.fetch_bars(&pingan(), range(), 0, &CancelToken::new());
        let _ = src.fetch_bars(&pingan(), range(), 0, &CancelToken::new());
        assert!(!breaker.is_allowed());
    }

    #[test]
    fn parses_concepts_and_industry() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/api/qt/stock/get")
            .match_query(Matcher::UrlEncoded("secid".into(), "1.600000".into()))
            .with_status(200)
            .with_body(
                r#"{"data":{"f58":"浦发银行","f127":"银行","f128":"上海板块","f129":"融资融券,沪股通, 破净股"}}"#,
            )
            .create();

        let (src, _) = source(&server);
        let tags = src
            .fetch_tags(&Instrument::parse("600000.SH", "浦发银行").unwrap())
            .unwrap();
        assert_eq!(tags.industry, "银行");
        assert_eq!(tags.concepts, vec!["融资融券", "沪股通", "破净股"]);
    }

    #[test]
    fn dash_fields_mean_no_tags() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/api/qt/stock/get")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data":{"f58":"x","f127":"-","f129":"-"}}"#)
            .create();

        let (src, _) = source(&server);
        let tags = src.fetch_tags(&pingan()).unwrap();
        assert!(tags.is_empty());
    }

    #[test]
    fn cancelled_call_never_hits_the_network() {
        let server = mockito::Server::new();
        let (src, _) = source(&server);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            src.fetch_bars(&pingan(), range(), 0, &cancel),
            Err(DataError::Cancelled)
        ));
    }
}
