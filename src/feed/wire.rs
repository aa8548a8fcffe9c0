use chrono::DateTime;
use serde_json::Value;

use crate::types::{Bar, FeedEvent, NewsItem, Quote, Symbol, Trade};

/// One message out of an upstream text frame.
#[derive(Debug)]
pub enum ParsedMsg {
    Event(FeedEvent),
    Control(ControlMsg),
    Unknown(String),
}

#[derive(Debug)]
pub enum ControlMsg {
    Connected,
    Authenticated,
    /// Credential rejection. Fatal for the process.
    AuthRejected(String),
    Subscription,
    Error { code: i64, msg: String },
}

/// Parse an upstream text frame. Frames are JSON arrays of tagged objects;
/// a bare object is accepted as a one-element frame. A JSON-level failure is
/// an error (counted by the caller); unknown tags come back as
/// `ParsedMsg::Unknown` so they can be counted without dropping the rest of
/// the frame.
pub fn parse_text_frame(txt: &str) -> anyhow::Result<Vec<ParsedMsg>> {
    let value: Value = serde_json::from_str(txt)?;
    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        other => anyhow::bail!("unexpected frame shape: {other}"),
    };

    Ok(items.into_iter().map(parse_message).collect())
}

fn parse_message(value: Value) -> ParsedMsg {
    let tag = value.get("T").and_then(Value::as_str).unwrap_or("");
    match tag {
        "t" => parse_trade(&value),
        "q" => parse_quote(&value),
        "b" => parse_bar(&value),
        "n" => parse_news(&value),
        "success" => {
            let msg = value.get("msg").and_then(Value::as_str).unwrap_or("");
            match msg {
                "connected" => ParsedMsg::Control(ControlMsg::Connected),
                "authenticated" => ParsedMsg::Control(ControlMsg::Authenticated),
                _ => ParsedMsg::Control(ControlMsg::Subscription),
            }
        }
        "subscription" => ParsedMsg::Control(ControlMsg::Subscription),
        "error" => {
            let code = value.get("code").and_then(Value::as_i64).unwrap_or(0);
            let msg = value
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            // 401/402 are the provider's auth failures; anything else is a
            // soft error surfaced as a control message.
            if code == 401 || code == 402 {
                ParsedMsg::Control(ControlMsg::AuthRejected(format!("{code}: {msg}")))
            } else {
                ParsedMsg::Control(ControlMsg::Error { code, msg })
            }
        }
        other => ParsedMsg::Unknown(other.to_string()),
    }
}

fn symbol_of(value: &Value) -> Option<Symbol> {
    value
        .get("S")
        .and_then(Value::as_str)
        .and_then(Symbol::parse)
}

fn f64_of(value: &Value, key: &str) -> Option<f64> {
    let v = value.get(key)?;
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn u64_of(value: &Value, key: &str) -> Option<u64> {
    let v = value.get(key)?;
    v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// RFC 3339 (nanosecond precision) -> epoch ms.
fn event_ms_of(value: &Value, key: &str) -> Option<i64> {
    let raw = value.get(key)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn strings_of(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_trade(value: &Value) -> ParsedMsg {
    let (Some(symbol), Some(price), Some(event_ms)) = (
        symbol_of(value),
        f64_of(value, "p"),
        event_ms_of(value, "t"),
    ) else {
        return ParsedMsg::Unknown("t".into());
    };
    ParsedMsg::Event(FeedEvent::Trade(Trade {
        symbol,
        price,
        size: u64_of(value, "s").unwrap_or(0),
        event_ms,
        conditions: strings_of(value, "c"),
        exchange: value
            .get("x")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        tape: value
            .get("z")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }))
}

fn parse_quote(value: &Value) -> ParsedMsg {
    let (Some(symbol), Some(event_ms)) = (symbol_of(value), event_ms_of(value, "t")) else {
        return ParsedMsg::Unknown("q".into());
    };
    ParsedMsg::Event(FeedEvent::Quote(Quote {
        symbol,
        bid_price: f64_of(value, "bp").unwrap_or(0.0),
        bid_size: u64_of(value, "bs").unwrap_or(0),
        ask_price: f64_of(value, "ap").unwrap_or(0.0),
        ask_size: u64_of(value, "as").unwrap_or(0),
        event_ms,
    }))
}

fn parse_bar(value: &Value) -> ParsedMsg {
    let (Some(symbol), Some(event_ms)) = (symbol_of(value), event_ms_of(value, "t")) else {
        return ParsedMsg::Unknown("b".into());
    };
    let (Some(open), Some(high), Some(low), Some(close)) = (
        f64_of(value, "o"),
        f64_of(value, "h"),
        f64_of(value, "l"),
        f64_of(value, "c"),
    ) else {
        return ParsedMsg::Unknown("b".into());
    };
    ParsedMsg::Event(FeedEvent::Bar {
        symbol,
        bucket_ms: crate::types::minute_floor_ms(event_ms),
        bar: Bar {
            open,
            high,
            low,
            close,
            volume: u64_of(value, "v").unwrap_or(0),
            trade_count: u64_of(value, "n"),
            vwap: f64_of(value, "vw"),
        },
    })
}

fn parse_news(value: &Value) -> ParsedMsg {
    let id = match value.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return ParsedMsg::Unknown("n".into()),
    };
    let Some(headline) = value.get("headline").and_then(Value::as_str) else {
        return ParsedMsg::Unknown("n".into());
    };
    let published_at = value
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now);

    ParsedMsg::Event(FeedEvent::News(NewsItem {
        id,
        symbols: strings_of(value, "symbols"),
        headline: headline.to_string(),
        summary: value
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        source: value
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        url: value
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        published_at,
        sentiment_score: None,
        sentiment_label: None,
    }))
}
