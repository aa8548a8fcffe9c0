pub mod hub;

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;
use crate::subscriptions::LiveSession;
use crate::types::{now_rfc3339, CandleFrame, Symbol};
use hub::{NewsQueue, SseQueue};

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// EventSource cannot set headers, so streaming endpoints accept the token
/// either as `Authorization: Bearer …` or as a `token` query parameter.
async fn authenticate_stream(
    state: &AppState,
    headers: &HeaderMap,
    query: &TokenQuery,
) -> Result<String, ApiError> {
    let token = crate::auth::bearer_token(headers)
        .or_else(|| query.token.clone())
        .ok_or_else(|| ApiError::Unauthorized("missing token".into()))?;
    let user = state.auth.validate(&token).await?;
    Ok(user.user_id)
}

/// Releases the live attachment and the hub registration when the response
/// stream is dropped, which is how client disconnect reaches us.
struct CandleStreamGuard {
    state: Arc<AppState>,
    symbol: Symbol,
    user_id: String,
    conn_id: u64,
    session: Option<LiveSession>,
}

impl Drop for CandleStreamGuard {
    fn drop(&mut self) {
        self.state.candle_hub.unregister(&self.symbol, self.conn_id);
        if let Some(session) = self.session.take() {
            self.state.subscriptions.detach_live(&session);
        }
        // A prepare-attach by the same user rides along with this stream.
        self.state
            .subscriptions
            .release_prepared(&self.user_id, &self.symbol);
        tracing::debug!("candle stream closed for {}", self.symbol);
    }
}

/// `GET /stream/{symbol}?token=…`: snapshot-then-deltas candle stream.
pub async fn stream_candles(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user_id = authenticate_stream(&state, &headers, &query).await?;
    let symbol = Symbol::parse(&symbol)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid symbol: {symbol}")))?;

    let session = state.subscriptions.attach_live(&user_id, &symbol).await?;
    let (conn_id, queue) = state.candle_hub.register(&symbol);

    // Seed the snapshot directly: the attach above guarantees the builder
    // exists, and any initial emitted before this registration was missed.
    let candles = state.aggregator.snapshot(&symbol).unwrap_or_default();
    queue.push_initial(Arc::new(CandleFrame {
        symbol: symbol.clone(),
        candles,
        is_initial: true,
        update_timestamp: now_rfc3339(),
    }));

    tracing::info!("candle stream attached: {symbol} (user {user_id})");

    let guard = CandleStreamGuard {
        state: state.clone(),
        symbol,
        user_id,
        conn_id,
        session: Some(session),
    };

    let stream = futures_util::stream::unfold(
        (queue, guard),
        |(queue, guard): (Arc<SseQueue>, CandleStreamGuard)| async move {
            let frame = queue.pop().await?;
            let event = Event::default().json_data(&*frame).ok()?;
            Some((Ok::<_, Infallible>(event), (queue, guard)))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

struct NewsStreamGuard {
    state: Arc<AppState>,
    conn_id: u64,
}

impl Drop for NewsStreamGuard {
    fn drop(&mut self) {
        self.state.news_hub.unregister(self.conn_id);
        tracing::debug!("news stream closed");
    }
}

/// `GET /news/stream?token=…`: append-only broadcast of news items.
pub async fn stream_news(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user_id = authenticate_stream(&state, &headers, &query).await?;
    let (conn_id, queue) = state.news_hub.register();
    tracing::info!("news stream attached (user {user_id})");

    let guard = NewsStreamGuard { state: state.clone(), conn_id };

    let stream = futures_util::stream::unfold(
        (queue, guard),
        |(queue, guard): (Arc<NewsQueue>, NewsStreamGuard)| async move {
            let frame = queue.pop().await?;
            let event = Event::default().json_data(&*frame).ok()?;
            Some((Ok::<_, Infallible>(event), (queue, guard)))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
