pub mod market;
pub mod subscriptions;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;

/// Assemble the full HTTP surface.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(subscriptions::routes())
        .merge(market::routes())
        .route("/stream/{symbol}", get(crate::sse::stream_candles))
        .route("/news/stream", get(crate::sse::stream_news))
}
