use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::auth::AuthedUser;
use crate::error::ApiError;
use crate::state::AppState;
use crate::subscriptions::{AddOutcome, RemoveOutcome};
use crate::types::Symbol;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/subscribe/{symbol}",
            get(add_subscription).delete(remove_subscription),
        )
        .route("/api/subscriptions", get(list_subscriptions))
        .route("/ws_manager/{symbol}", get(live_attach))
        .route("/ws_manager/status", get(manager_status))
}

fn parse_symbol(raw: &str) -> Result<Symbol, ApiError> {
    Symbol::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("invalid symbol: {raw}")))
}

/// `GET /api/subscribe/{symbol}`: add to the caller's permanent watchlist.
async fn add_subscription(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    user: AuthedUser,
) -> Result<Json<Value>, ApiError> {
    let symbol = parse_symbol(&symbol)?;
    let (outcome, count) = state
        .subscriptions
        .add_permanent(&user.user_id, &symbol)
        .await?;

    let status = match outcome {
        AddOutcome::Subscribed => "subscribed",
        AddOutcome::Already => "already",
    };
    Ok(Json(json!({
        "status": status,
        "symbol": symbol,
        "subscriber_count": count,
    })))
}

/// `DELETE /api/subscribe/{symbol}`: soft-remove from the watchlist.
async fn remove_subscription(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    user: AuthedUser,
) -> Result<Json<Value>, ApiError> {
    let symbol = parse_symbol(&symbol)?;
    let (outcome, remaining) = state
        .subscriptions
        .remove_permanent(&user.user_id, &symbol)?;

    let status = match outcome {
        RemoveOutcome::Unsubscribed => "unsubscribed",
        RemoveOutcome::NotSubscribed => "not_subscribed",
    };
    Ok(Json(json!({
        "status": status,
        "symbol": symbol,
        "remaining_subscribers": remaining,
    })))
}

/// `GET /api/subscriptions`: the caller's watchlist.
async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    user: AuthedUser,
) -> Result<Json<Value>, ApiError> {
    let symbols = state.subscriptions.list_permanent(&user.user_id)?;
    let count = symbols.len();
    Ok(Json(json!({
        "symbols": symbols,
        "count": count,
    })))
}

/// `GET /ws_manager/{symbol}`: idempotent live attach, so a subsequent
/// stream request finds the builder already seeded.
async fn live_attach(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    user: AuthedUser,
) -> Result<Json<Value>, ApiError> {
    let symbol = parse_symbol(&symbol)?;
    let newly = state
        .subscriptions
        .prepare_live(&user.user_id, &symbol)
        .await?;

    let message = if newly {
        format!("Subscribed to {symbol}")
    } else {
        format!("Already subscribed to {symbol}")
    };
    Ok(Json(json!({
        "status": "subscribed",
        "symbol": symbol,
        "message": message,
    })))
}

/// `GET /ws_manager/status`: upstream connection state and interest table.
async fn manager_status(
    State(state): State<Arc<AppState>>,
    _user: AuthedUser,
) -> Json<Value> {
    let feed = state.feed.status();
    let interest: Vec<Value> = state
        .subscriptions
        .interest_table()
        .into_iter()
        .map(|(symbol, permanent, live, upstream)| {
            json!({
                "symbol": symbol,
                "permanent_count": permanent,
                "live_count": live,
                "upstream_subscribed": upstream,
            })
        })
        .collect();

    Json(json!({
        "feed": feed,
        "subscriptions": interest,
    }))
}
