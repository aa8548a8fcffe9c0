use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const MINUTE_MS: i64 = 60_000;

/// Uppercase ASCII ticker, `[A-Z0-9.-]{1,10}`. Byte equality throughout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Parse and canonicalise a raw ticker. Lowercase input is accepted and
    /// uppercased; anything outside the allowed alphabet or length is rejected.
    pub fn parse(raw: &str) -> Option<Symbol> {
        let s = raw.trim().to_ascii_uppercase();
        if s.is_empty() || s.len() > 10 {
            return None;
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
        {
            return None;
        }
        Some(Symbol(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single trade tick off the upstream feed. Append-only; never mutated.
#[derive(Debug, Clone)]
pub struct Trade {
    pub symbol: Symbol,
    pub price: f64,
    pub size: u64,
    /// Event time in epoch milliseconds UTC (upstream stamps nanoseconds; we
    /// keep millisecond precision, which is finer than the minute buckets).
    pub event_ms: i64,
    pub conditions: Vec<String>,
    pub exchange: String,
    pub tape: String,
}

/// Top-of-book quote. Parsed and counted but not aggregated.
#[derive(Debug, Clone)]
pub struct Quote {
    pub symbol: Symbol,
    pub bid_price: f64,
    pub bid_size: u64,
    pub ask_price: f64,
    pub ask_size: u64,
    pub event_ms: i64,
}

/// One minute-aligned OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vwap: Option<f64>,
}

impl Bar {
    pub fn from_trade(price: f64, size: u64) -> Bar {
        Bar {
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size,
            trade_count: Some(1),
            vwap: if size > 0 { Some(price) } else { None },
        }
    }
}

/// News item off the upstream news channel. Immutable after insert except the
/// one-shot sentiment fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub id: String,
    pub symbols: Vec<String>,
    pub headline: String,
    pub summary: String,
    pub source: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment_label: Option<String>,
}

/// Typed envelope between the feed client and the aggregator.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Trade(Trade),
    Quote(Quote),
    /// Provider-computed minute bar (ignored by the aggregator, which builds
    /// its own from trades, but parsed so the channel can be enabled).
    Bar {
        symbol: Symbol,
        bucket_ms: i64,
        bar: Bar,
    },
    News(NewsItem),
}

/// Frame pushed to candle SSE subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct CandleFrame {
    pub symbol: Symbol,
    /// Bucket-start (RFC 3339, minute-aligned) -> bar.
    pub candles: BTreeMap<String, Bar>,
    pub is_initial: bool,
    pub update_timestamp: String,
}

/// Frame pushed to news SSE subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct NewsFrame {
    pub id: String,
    pub time: String,
    pub headline: String,
    pub summary: String,
    pub tickers: Vec<String>,
    pub source: String,
    pub url: String,
}

impl From<&NewsItem> for NewsFrame {
    fn from(item: &NewsItem) -> Self {
        NewsFrame {
            id: item.id.clone(),
            time: rfc3339_utc(item.published_at.timestamp_millis()),
            headline: item.headline.clone(),
            summary: item.summary.clone(),
            tickers: item.symbols.clone(),
            source: item.source.clone(),
            url: item.url.clone(),
        }
    }
}

/// Floor an epoch-ms timestamp to its containing UTC minute.
pub fn minute_floor_ms(ts_ms: i64) -> i64 {
    ts_ms.div_euclid(MINUTE_MS) * MINUTE_MS
}

/// Epoch-ms -> RFC 3339 with `Z` suffix, second precision.
pub fn rfc3339_utc(ts_ms: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => String::new(),
    }
}

/// RFC 3339 timestamp of now, matching the frame `update_timestamp` field.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_parse_canonicalises_and_validates() {
        assert_eq!(Symbol::parse(" aapl ").unwrap().as_str(), "AAPL");
        assert_eq!(Symbol::parse("BRK.B").unwrap().as_str(), "BRK.B");
        assert!(Symbol::parse("").is_none());
        assert!(Symbol::parse("TOOLONGSYMBOL").is_none());
        assert!(Symbol::parse("BAD SYM").is_none());
        assert!(Symbol::parse("eur/usd").is_none());
    }

    #[test]
    fn minute_floor_handles_exact_boundaries() {
        // 14:31:00.000 belongs to the 14:31 bucket.
        let boundary = 1_760_000_000_000 / MINUTE_MS * MINUTE_MS;
        assert_eq!(minute_floor_ms(boundary), boundary);
        // One millisecond before the boundary belongs to the previous bucket.
        assert_eq!(minute_floor_ms(boundary - 1), boundary - MINUTE_MS);
        assert_eq!(minute_floor_ms(boundary + 59_999), boundary);
    }

    #[test]
    fn rfc3339_is_minute_keyed_for_aligned_buckets() {
        let ms = 1_697_034_600_000;
        assert_eq!(rfc3339_utc(ms), "2023-10-11T14:30:00Z");
    }
}
