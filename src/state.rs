use std::sync::Arc;

use crate::auth::AuthVerifier;
use crate::candles::Aggregator;
use crate::config::Config;
use crate::feed::backfill::BackfillClient;
use crate::feed::{FeedClient, FeedHandle};
use crate::queue::TickQueue;
use crate::sse::hub::{CandleHub, NewsHub};
use crate::store::MarketStore;
use crate::subscriptions::SubscriptionManager;

/// The process core: every long-lived component, built once at startup and
/// passed to handlers via `axum::extract::State`. No globals.
pub struct AppState {
    pub config: Config,
    pub store: Arc<MarketStore>,
    pub aggregator: Arc<Aggregator>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub candle_hub: Arc<CandleHub>,
    pub news_hub: Arc<NewsHub>,
    pub feed: FeedHandle,
    pub tick_queue: Arc<TickQueue>,
    pub auth: AuthVerifier,
}

impl AppState {
    /// Wire the core together. Returns the feed client separately so `main`
    /// can own its task (and treat its exit as fatal or not as appropriate).
    pub fn build(config: Config) -> anyhow::Result<(Arc<Self>, FeedClient)> {
        let store = Arc::new(MarketStore::open(&config.store_path)?);

        let candle_hub = CandleHub::new(config.sse_queue_capacity);
        let news_hub = NewsHub::new(config.sse_queue_capacity);

        let backfill = BackfillClient::new(
            &config.upstream_rest_url,
            &config.upstream_ws_key,
            &config.upstream_ws_secret,
        )?;

        let aggregator = Aggregator::new(
            store.clone(),
            Arc::new(backfill),
            candle_hub.clone(),
            news_hub.clone(),
            config.backfill_lookback_minutes,
        );

        let tick_queue = Arc::new(TickQueue::new(config.tick_queue_capacity));
        let (feed_client, feed) = FeedClient::new(config.clone(), tick_queue.clone());

        let subscriptions = SubscriptionManager::new(
            store.clone(),
            Arc::new(aggregator.clone()),
            Arc::new(feed.clone()),
            config.max_concurrent_symbols,
        );

        let auth = AuthVerifier::new(
            config.auth_jwks_url.clone(),
            config.auth_hs256_secret.clone(),
        )?;

        let state = Arc::new(Self {
            config,
            store,
            aggregator,
            subscriptions,
            candle_hub,
            news_hub,
            feed,
            tick_queue,
            auth,
        });
        Ok((state, feed_client))
    }
}
