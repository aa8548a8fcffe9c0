use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::AuthedUser;
use crate::error::ApiError;
use crate::state::AppState;
use crate::types::{now_rfc3339, Bar, Symbol};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/snapshot/{symbol}", get(snapshot))
        .route("/api/tradingview/history", get(tradingview_history))
        .route("/api/tradingview/config", get(tradingview_config))
        .route("/api/tradingview/symbol_info", get(tradingview_symbol_info))
        .route("/aggregator/status", get(aggregator_status))
        .route("/database/stats", get(database_stats))
        .route("/database/candle_count/{symbol}", get(candle_count))
        .route("/news/recent", get(recent_news))
}

/// Liveness. Unauthenticated.
async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// `GET /api/snapshot/{symbol}`: the full in-memory series.
async fn snapshot(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    _user: AuthedUser,
) -> Result<Json<Value>, ApiError> {
    let symbol = Symbol::parse(&symbol)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid symbol: {symbol}")))?;
    let candles = state
        .aggregator
        .snapshot(&symbol)
        .ok_or_else(|| ApiError::NotFound(format!("symbol {symbol} not subscribed")))?;

    Ok(Json(json!({
        "symbol": symbol,
        "candles": candles,
        "update_timestamp": now_rfc3339(),
        "is_initial": true,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    symbol: String,
    from_ts: i64,
    to_ts: i64,
    #[serde(default = "default_resolution")]
    resolution: String,
}

fn default_resolution() -> String {
    "1".to_string()
}

/// `GET /api/tradingview/history`: historical bars in UDF column format.
/// A range with no data is `200 {"s":"no_data"}` per the UDF convention.
async fn tradingview_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
    _user: AuthedUser,
) -> Result<Json<Value>, ApiError> {
    let symbol = Symbol::parse(&query.symbol)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid symbol: {}", query.symbol)))?;
    if query.resolution != "1" {
        return Err(ApiError::BadRequest(format!(
            "unsupported resolution: {} (only 1-minute bars)",
            query.resolution
        )));
    }
    if query.to_ts < query.from_ts {
        return Err(ApiError::BadRequest("to_ts precedes from_ts".into()));
    }

    let rows = state
        .store
        .read_range(&symbol, query.from_ts * 1_000, query.to_ts * 1_000)?;
    Ok(Json(to_udf(&rows)))
}

/// Map chronological bars to the TradingView UDF column response.
pub fn to_udf(rows: &[(i64, Bar)]) -> Value {
    if rows.is_empty() {
        return json!({ "s": "no_data", "nextTime": null });
    }

    let mut t = Vec::with_capacity(rows.len());
    let mut o = Vec::with_capacity(rows.len());
    let mut h = Vec::with_capacity(rows.len());
    let mut l = Vec::with_capacity(rows.len());
    let mut c = Vec::with_capacity(rows.len());
    let mut v = Vec::with_capacity(rows.len());
    for (bucket_ms, bar) in rows {
        t.push(bucket_ms / 1_000);
        o.push(bar.open);
        h.push(bar.high);
        l.push(bar.low);
        c.push(bar.close);
        v.push(bar.volume);
    }
    json!({ "s": "ok", "t": t, "o": o, "h": h, "l": l, "c": c, "v": v })
}

/// Static UDF datafeed configuration.
async fn tradingview_config() -> Json<Value> {
    Json(json!({
        "supports_search": false,
        "supports_group_request": false,
        "supports_marks": false,
        "supports_timescale_marks": false,
        "supports_time": true,
        "supported_resolutions": ["1"],
    }))
}

#[derive(Debug, Deserialize)]
pub struct SymbolInfoQuery {
    symbol: String,
}

async fn tradingview_symbol_info(
    Query(query): Query<SymbolInfoQuery>,
) -> Result<Json<Value>, ApiError> {
    let symbol = Symbol::parse(&query.symbol)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid symbol: {}", query.symbol)))?;
    Ok(Json(json!({
        "name": symbol,
        "ticker": symbol,
        "description": format!("{symbol} Stock"),
        "type": "stock",
        "session": "0930-1600",
        "exchange": "US",
        "listed_exchange": "US",
        "timezone": "America/New_York",
        "minmov": 1,
        "pricescale": 100,
        "has_intraday": true,
        "supported_resolutions": ["1"],
        "volume_precision": 0,
        "data_status": "streaming",
    })))
}

/// `GET /aggregator/status`: tracked symbols, queue depth, drop counters.
async fn aggregator_status(
    State(state): State<Arc<AppState>>,
    _user: AuthedUser,
) -> Json<Value> {
    Json(json!({
        "status": "running",
        "symbols_tracked": state.aggregator.tracked_symbols(),
        "queue_size": state.tick_queue.len(),
        "queue_dropped": state.tick_queue.dropped(),
        "counters": state.aggregator.status_counters(),
    }))
}

/// `GET /database/stats`: per-symbol candle coverage in the store.
async fn database_stats(
    State(state): State<Arc<AppState>>,
    _user: AuthedUser,
) -> Result<Json<Value>, ApiError> {
    let stats = state.store.symbol_stats()?;
    let total = stats.len();
    Ok(Json(json!({
        "stats": stats,
        "total_symbols": total,
    })))
}

/// `GET /database/candle_count/{symbol}`: stored bar count for one symbol.
async fn candle_count(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    _user: AuthedUser,
) -> Result<Json<Value>, ApiError> {
    let symbol = Symbol::parse(&symbol)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid symbol: {symbol}")))?;
    let count = state.store.candle_count(Some(&symbol))?;
    Ok(Json(json!({
        "symbol": symbol,
        "candle_count": count,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RecentNewsQuery {
    symbol: Option<String>,
    #[serde(default = "default_news_limit")]
    limit: usize,
}

fn default_news_limit() -> usize {
    100
}

/// `GET /news/recent`: recent stored news, optionally for one symbol.
async fn recent_news(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentNewsQuery>,
    _user: AuthedUser,
) -> Result<Json<Value>, ApiError> {
    let symbol = match &query.symbol {
        Some(raw) => Some(
            Symbol::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("invalid symbol: {raw}")))?,
        ),
        None => None,
    };
    let items = state
        .store
        .recent_news(symbol.as_ref(), query.limit.clamp(1, 1_000))?;
    let count = items.len();
    Ok(Json(json!({ "news": items, "count": count })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, close: f64, volume: u64) -> Bar {
        Bar {
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume,
            trade_count: None,
            vwap: None,
        }
    }

    #[test]
    fn udf_empty_range_is_no_data() {
        let v = to_udf(&[]);
        assert_eq!(v["s"], "no_data");
        assert!(v["nextTime"].is_null());
    }

    #[test]
    fn udf_columns_line_up() {
        let rows = vec![
            (1_697_034_600_000, bar(150.0, 150.5, 15)),
            (1_697_034_660_000, bar(150.5, 149.9, 8)),
        ];
        let v = to_udf(&rows);
        assert_eq!(v["s"], "ok");
        assert_eq!(v["t"], json!([1_697_034_600_i64, 1_697_034_660_i64]));
        assert_eq!(v["o"], json!([150.0, 150.5]));
        assert_eq!(v["c"], json!([150.5, 149.9]));
        assert_eq!(v["v"], json!([15, 8]));
        assert_eq!(v["t"].as_array().unwrap().len(), v["h"].as_array().unwrap().len());
    }
}
