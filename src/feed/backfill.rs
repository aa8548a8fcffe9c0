use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::candles::BarsSource;
use crate::types::{minute_floor_ms, Bar, Symbol};

/// REST client for historical minute bars, used to seed a builder before live
/// ticks arrive.
#[derive(Clone)]
pub struct BackfillClient {
    http: reqwest::Client,
    base_url: String,
    key: String,
    secret: String,
}

impl BackfillClient {
    pub fn new(base_url: &str, key: &str, secret: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("market-hub")
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Fetch `[start, end]` minute bars, splitting long windows into chunks
    /// of `CHUNK_BARS` with a one-bar overlap so chunk boundaries cannot
    /// leave gaps. Duplicate buckets from the overlap collapse in the merge.
    pub async fn fetch(
        &self,
        symbol: &Symbol,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<(i64, Bar)>> {
        let mut merged: std::collections::BTreeMap<i64, Bar> = std::collections::BTreeMap::new();
        for (chunk_start, chunk_end) in chunk_ranges(start_ms, end_ms, CHUNK_BARS) {
            let bars = self
                .fetch_chunk(symbol, chunk_start, chunk_end, limit)
                .await?;
            merged.extend(bars);
            if merged.len() >= limit {
                break;
            }
        }
        let mut out: Vec<(i64, Bar)> = merged.into_iter().collect();
        if out.len() > limit {
            // Keep the newest `limit` bars.
            out.drain(..out.len() - limit);
        }
        Ok(out)
    }

    /// One REST round-trip. 5xx responses are retried up to three attempts
    /// with exponential backoff; 4xx is fatal for the call (the caller
    /// downgrades it to a warning and keeps the symbol live).
    async fn fetch_chunk(
        &self,
        symbol: &Symbol,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<(i64, Bar)>> {
        let url = format!("{}/bars", self.base_url);
        let start = rfc3339(start_ms)?;
        let end = rfc3339(end_ms)?;

        let max_attempts = 3;
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 1..=max_attempts {
            let res = self
                .http
                .get(&url)
                .query(&[
                    ("symbol", symbol.as_str()),
                    ("timeframe", "1m"),
                    ("start", start.as_str()),
                    ("end", end.as_str()),
                    ("limit", &limit.to_string()),
                ])
                .header("APCA-API-KEY-ID", &self.key)
                .header("APCA-API-SECRET-KEY", &self.secret)
                .send()
                .await;

            match res {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body: Value = resp.json().await?;
                        return Ok(parse_bars_response(&body, start_ms, end_ms));
                    }
                    if status.is_client_error() {
                        anyhow::bail!("bars request rejected: HTTP {status}");
                    }
                    last_err = Some(anyhow::anyhow!("bars request failed: HTTP {status}"));
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!("bars request failed: {e}"));
                }
            }

            if attempt < max_attempts {
                let backoff = Duration::from_millis(200 * (attempt as u64).pow(2));
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("bars request failed")))
    }
}

impl BarsSource for BackfillClient {
    fn fetch_bars(
        &self,
        symbol: Symbol,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> BoxFuture<'static, anyhow::Result<Vec<(i64, Bar)>>> {
        let this = self.clone();
        Box::pin(async move { this.fetch(&symbol, start_ms, end_ms, limit).await })
    }
}

/// Bars per REST request. Windows longer than this are fetched in pieces.
const CHUNK_BARS: usize = 1_000;

/// Split `[start, end]` into minute-bar chunks, overlapping one bar at each
/// boundary, always making forward progress.
fn chunk_ranges(start_ms: i64, end_ms: i64, chunk_bars: usize) -> Vec<(i64, i64)> {
    let chunk_ms = minute_ms_span(chunk_bars);
    let mut out = Vec::new();
    let mut cur = start_ms;
    while cur < end_ms {
        let chunk_end = (cur + chunk_ms).min(end_ms);
        out.push((cur, chunk_end));
        if chunk_end == end_ms {
            break;
        }
        let next = chunk_end - crate::types::MINUTE_MS;
        cur = if next <= cur { chunk_end } else { next };
    }
    if out.is_empty() {
        out.push((start_ms, end_ms));
    }
    out
}

fn minute_ms_span(bars: usize) -> i64 {
    (bars.max(1) as i64).saturating_mul(crate::types::MINUTE_MS)
}

fn rfc3339(ts_ms: i64) -> anyhow::Result<String> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {ts_ms}"))
}

/// Normalize a bars response into `(bucket_ms, Bar)` pairs.
///
/// Two provider shapes are accepted: row-oriented `{"bars":[{t,o,h,l,c,v,n,vw}]}`
/// (a bare top-level array also counts) and column-oriented
/// `{"t":[…],"o":[…],"h":[…],"l":[…],"c":[…],"v":[…]}`. Timestamps are
/// aligned to the minute; bars outside `[start, end]` are dropped.
pub fn parse_bars_response(body: &Value, start_ms: i64, end_ms: i64) -> Vec<(i64, Bar)> {
    let mut out = Vec::new();

    let rows: Option<&Vec<Value>> = body
        .get("bars")
        .and_then(Value::as_array)
        .or_else(|| body.as_array());

    if let Some(rows) = rows {
        for row in rows {
            if let Some(parsed) = parse_row_bar(row) {
                out.push(parsed);
            }
        }
    } else if let Some(ts) = body.get("t").and_then(Value::as_array) {
        out.extend(parse_column_bars(body, ts));
    }

    out.retain(|(bucket_ms, _)| *bucket_ms >= minute_floor_ms(start_ms) && *bucket_ms <= end_ms);
    out.sort_by_key(|(bucket_ms, _)| *bucket_ms);
    out
}

fn parse_row_bar(row: &Value) -> Option<(i64, Bar)> {
    let bucket_ms = bar_ts_ms(row.get("t")?)?;
    Some((
        minute_floor_ms(bucket_ms),
        Bar {
            open: num(row.get("o")?)?,
            high: num(row.get("h")?)?,
            low: num(row.get("l")?)?,
            close: num(row.get("c")?)?,
            volume: num(row.get("v")?)? as u64,
            trade_count: row.get("n").and_then(num).map(|n| n as u64),
            vwap: row.get("vw").and_then(num),
        },
    ))
}

fn parse_column_bars(body: &Value, ts: &[Value]) -> Vec<(i64, Bar)> {
    let col = |key: &str| body.get(key).and_then(Value::as_array);
    let (Some(o), Some(h), Some(l), Some(c), Some(v)) =
        (col("o"), col("h"), col("l"), col("c"), col("v"))
    else {
        return Vec::new();
    };
    let n = col("n");
    let vw = col("vw");

    let mut out = Vec::new();
    for i in 0..ts.len() {
        let Some(bucket_ms) = ts.get(i).and_then(bar_ts_ms) else { continue };
        let (Some(open), Some(high), Some(low), Some(close), Some(vol)) = (
            o.get(i).and_then(num),
            h.get(i).and_then(num),
            l.get(i).and_then(num),
            c.get(i).and_then(num),
            v.get(i).and_then(num),
        ) else {
            continue;
        };
        out.push((
            minute_floor_ms(bucket_ms),
            Bar {
                open,
                high,
                low,
                close,
                volume: vol as u64,
                trade_count: n.and_then(|col| col.get(i)).and_then(num).map(|x| x as u64),
                vwap: vw.and_then(|col| col.get(i)).and_then(num),
            },
        ));
    }
    out
}

fn num(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// Bar timestamps arrive as RFC 3339 strings, epoch seconds, or epoch ms.
fn bar_ts_ms(v: &Value) -> Option<i64> {
    if let Some(raw) = v.as_str() {
        return chrono::DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.timestamp_millis());
    }
    let n = v.as_i64()?;
    // Heuristic: epoch seconds are < 1e11 until the year 5138.
    Some(if n < 100_000_000_000 { n * 1_000 } else { n })
}
