use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;

use crate::error::ApiError;
use crate::feed::Channel;
use crate::store::MarketStore;
use crate::types::Symbol;

/// Makes a symbol live in the aggregator (builder + one-time backfill).
pub trait HandlerFactory: Send + Sync + 'static {
    fn ensure_handler(&self, symbol: &Symbol) -> BoxFuture<'static, ()>;
}

/// Control surface over the upstream feed. Calls are fire-and-forget; the
/// feed client batches and dedupes them.
pub trait UpstreamControl: Send + Sync + 'static {
    fn subscribe(&self, symbol: &Symbol, channel: Channel);
    fn unsubscribe(&self, symbol: &Symbol, channel: Channel);
}

/// Persisted watchlist rows. The embedded store implements this; an external
/// row store would be a drop-in replacement.
pub trait WatchlistStore: Send + Sync + 'static {
    /// Upsert an active row; true when the user's interest is newly active.
    fn upsert(&self, user_id: &str, symbol: &Symbol) -> Result<bool, ApiError>;
    /// Soft-delete; true when the row was active.
    fn deactivate(&self, user_id: &str, symbol: &Symbol) -> Result<bool, ApiError>;
    fn list_for_user(&self, user_id: &str) -> Result<Vec<Symbol>, ApiError>;
    fn active_rows(&self) -> Result<Vec<(String, Symbol)>, ApiError>;
}

impl WatchlistStore for MarketStore {
    fn upsert(&self, user_id: &str, symbol: &Symbol) -> Result<bool, ApiError> {
        self.watchlist_upsert(user_id, symbol)
    }

    fn deactivate(&self, user_id: &str, symbol: &Symbol) -> Result<bool, ApiError> {
        self.watchlist_deactivate(user_id, symbol)
    }

    fn list_for_user(&self, user_id: &str) -> Result<Vec<Symbol>, ApiError> {
        self.watchlist_for_user(user_id)
    }

    fn active_rows(&self) -> Result<Vec<(String, Symbol)>, ApiError> {
        self.active_watchlist()
    }
}

#[derive(Default)]
struct Interest {
    permanent: HashSet<String>,
    live: usize,
    upstream_subscribed: bool,
}

impl Interest {
    fn total(&self) -> usize {
        self.permanent.len() + self.live
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Subscribed,
    Already,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Unsubscribed,
    NotSubscribed,
}

/// Handle for one live (non-persisted) attachment. Dropping it does nothing;
/// the owner must call `detach_live`.
#[derive(Debug)]
pub struct LiveSession {
    pub id: u64,
    pub user_id: String,
    pub symbol: Symbol,
}

/// Source of truth for who is listening to what.
///
/// Three tiers: persisted watchlist rows, in-memory live sessions, and the
/// single upstream subscription per symbol, kept consistent via
/// `upstream_subscribed ⇔ permanent + live > 0`. Watchlist rows are persisted
/// before any upstream effect so a crash in between recovers on rehydrate.
pub struct SubscriptionManager {
    interest: Mutex<HashMap<Symbol, Interest>>,
    watchlist: Arc<dyn WatchlistStore>,
    handlers: Arc<dyn HandlerFactory>,
    upstream: Arc<dyn UpstreamControl>,
    max_symbols: usize,
    next_session: AtomicU64,
    /// Live sessions opened via the idempotent prepare endpoint, keyed by
    /// (user, symbol). Released as a side effect of that user's SSE
    /// disconnect for the symbol.
    prepared: Mutex<HashMap<(String, Symbol), LiveSession>>,
}

impl SubscriptionManager {
    pub fn new(
        watchlist: Arc<dyn WatchlistStore>,
        handlers: Arc<dyn HandlerFactory>,
        upstream: Arc<dyn UpstreamControl>,
        max_symbols: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            interest: Mutex::new(HashMap::new()),
            watchlist,
            handlers,
            upstream,
            max_symbols,
            next_session: AtomicU64::new(1),
            prepared: Mutex::new(HashMap::new()),
        })
    }

    /// Refuse net-new symbols beyond the configured universe.
    fn admit(&self, symbol: &Symbol) -> Result<(), ApiError> {
        let interest = self.interest.lock().unwrap();
        if !interest.contains_key(symbol) && interest.len() >= self.max_symbols {
            return Err(ApiError::TooManySymbols(format!(
                "symbol universe is full ({} symbols)",
                self.max_symbols
            )));
        }
        Ok(())
    }

    /// Claim the upstream subscription for `symbol` if nobody holds it yet.
    /// Returns true when this caller must perform the subscribe.
    fn claim_upstream(&self, symbol: &Symbol) -> bool {
        let mut interest = self.interest.lock().unwrap();
        let entry = interest.entry(symbol.clone()).or_default();
        if entry.upstream_subscribed {
            false
        } else {
            entry.upstream_subscribed = true;
            true
        }
    }

    async fn make_live(&self, symbol: &Symbol) {
        if self.claim_upstream(symbol) {
            self.handlers.ensure_handler(symbol).await;
            self.upstream.subscribe(symbol, Channel::Trades);
        } else {
            // Somebody else already owns the upstream subscription, but the
            // caller still must not return before the builder exists.
            self.handlers.ensure_handler(symbol).await;
        }
    }

    /// Add `symbol` to the user's persisted watchlist.
    pub async fn add_permanent(
        &self,
        user_id: &str,
        symbol: &Symbol,
    ) -> Result<(AddOutcome, usize), ApiError> {
        self.admit(symbol)?;

        // Persist before any upstream effect.
        self.watchlist.upsert(user_id, symbol)?;

        let inserted = {
            let mut interest = self.interest.lock().unwrap();
            let entry = interest.entry(symbol.clone()).or_default();
            entry.permanent.insert(user_id.to_string())
        };

        self.make_live(symbol).await;

        let count = self.permanent_count(symbol);
        let outcome = if inserted { AddOutcome::Subscribed } else { AddOutcome::Already };
        tracing::info!("user {user_id} watchlist add {symbol}: {outcome:?} ({count} subscribers)");
        Ok((outcome, count))
    }

    /// Soft-delete the watchlist row; drop the upstream subscription when the
    /// last interest goes away. The builder is retained.
    pub fn remove_permanent(
        &self,
        user_id: &str,
        symbol: &Symbol,
    ) -> Result<(RemoveOutcome, usize), ApiError> {
        self.watchlist.deactivate(user_id, symbol)?;

        let (removed, release) = {
            let mut interest = self.interest.lock().unwrap();
            let Some(entry) = interest.get_mut(symbol) else {
                return Ok((RemoveOutcome::NotSubscribed, 0));
            };
            let removed = entry.permanent.remove(user_id);
            let release = entry.total() == 0 && entry.upstream_subscribed;
            if release {
                entry.upstream_subscribed = false;
            }
            (removed, release)
        };

        if release {
            self.upstream.unsubscribe(symbol, Channel::Trades);
            tracing::info!("upstream released for {symbol} (no remaining interest)");
        }

        let count = self.permanent_count(symbol);
        let outcome = if removed { RemoveOutcome::Unsubscribed } else { RemoveOutcome::NotSubscribed };
        Ok((outcome, count))
    }

    pub fn list_permanent(&self, user_id: &str) -> Result<Vec<Symbol>, ApiError> {
        self.watchlist.list_for_user(user_id)
    }

    /// Register a live (per-connection) attachment.
    pub async fn attach_live(
        &self,
        user_id: &str,
        symbol: &Symbol,
    ) -> Result<LiveSession, ApiError> {
        self.admit(symbol)?;

        {
            let mut interest = self.interest.lock().unwrap();
            let entry = interest.entry(symbol.clone()).or_default();
            entry.live += 1;
        }

        self.make_live(symbol).await;

        Ok(LiveSession {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            user_id: user_id.to_string(),
            symbol: symbol.clone(),
        })
    }

    /// Drop a live attachment; release the upstream subscription iff no
    /// interest remains.
    pub fn detach_live(&self, session: &LiveSession) {
        let release = {
            let mut interest = self.interest.lock().unwrap();
            let Some(entry) = interest.get_mut(&session.symbol) else {
                return;
            };
            entry.live = entry.live.saturating_sub(1);
            let release = entry.total() == 0 && entry.upstream_subscribed;
            if release {
                entry.upstream_subscribed = false;
            }
            release
        };

        if release {
            self.upstream.unsubscribe(&session.symbol, Channel::Trades);
            tracing::info!("upstream released for {} (last live session closed)", session.symbol);
        }
    }

    /// Idempotent live attach for `/ws_manager/{symbol}`: the first call for
    /// a (user, symbol) pair opens a live session held by the manager;
    /// repeats are no-ops. Returns true when a new session was opened.
    pub async fn prepare_live(&self, user_id: &str, symbol: &Symbol) -> Result<bool, ApiError> {
        {
            let prepared = self.prepared.lock().unwrap();
            if prepared.contains_key(&(user_id.to_string(), symbol.clone())) {
                return Ok(false);
            }
        }

        let session = self.attach_live(user_id, symbol).await?;

        let key = (user_id.to_string(), symbol.clone());
        let mut prepared = self.prepared.lock().unwrap();
        if prepared.contains_key(&key) {
            // Lost a race with a concurrent prepare; fold this one back.
            drop(prepared);
            self.detach_live(&session);
            return Ok(false);
        }
        prepared.insert(key, session);
        Ok(true)
    }

    /// Drop the prepared session for (user, symbol), if any.
    pub fn release_prepared(&self, user_id: &str, symbol: &Symbol) {
        let session = self
            .prepared
            .lock()
            .unwrap()
            .remove(&(user_id.to_string(), symbol.clone()));
        if let Some(session) = session {
            self.detach_live(&session);
        }
    }

    /// Rebuild interest from the persisted watchlist at process start, then
    /// bring every symbol live (backfill + upstream subscribe, batched by the
    /// feed client).
    pub async fn rehydrate_on_start(&self) -> Result<usize, ApiError> {
        let rows = self.watchlist.active_rows()?;

        let symbols: Vec<Symbol> = {
            let mut interest = self.interest.lock().unwrap();
            for (user_id, symbol) in &rows {
                interest
                    .entry(symbol.clone())
                    .or_default()
                    .permanent
                    .insert(user_id.clone());
            }
            let mut symbols: Vec<Symbol> = interest.keys().cloned().collect();
            symbols.sort();
            symbols
        };

        tracing::info!(
            "rehydrating {} watchlist rows across {} symbols",
            rows.len(),
            symbols.len()
        );
        for symbol in &symbols {
            self.make_live(symbol).await;
        }
        Ok(symbols.len())
    }

    pub fn permanent_count(&self, symbol: &Symbol) -> usize {
        self.interest
            .lock()
            .unwrap()
            .get(symbol)
            .map(|e| e.permanent.len())
            .unwrap_or(0)
    }

    pub fn live_count(&self, symbol: &Symbol) -> usize {
        self.interest
            .lock()
            .unwrap()
            .get(symbol)
            .map(|e| e.live)
            .unwrap_or(0)
    }

    pub fn is_upstream_subscribed(&self, symbol: &Symbol) -> bool {
        self.interest
            .lock()
            .unwrap()
            .get(symbol)
            .map(|e| e.upstream_subscribed)
            .unwrap_or(false)
    }

    /// (symbol, permanent, live, upstream) rows for the status endpoint.
    pub fn interest_table(&self) -> Vec<(Symbol, usize, usize, bool)> {
        let interest = self.interest.lock().unwrap();
        let mut rows: Vec<_> = interest
            .iter()
            .map(|(s, e)| (s.clone(), e.permanent.len(), e.live, e.upstream_subscribed))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Symbol {
        Symbol::parse(s).unwrap()
    }

    #[derive(Default)]
    struct RecordingUpstream {
        calls: Mutex<Vec<(String, String)>>,
    }

    impl UpstreamControl for RecordingUpstream {
        fn subscribe(&self, symbol: &Symbol, channel: Channel) {
            self.calls
                .lock()
                .unwrap()
                .push(("subscribe".into(), format!("{symbol}:{}", channel.key())));
        }
        fn unsubscribe(&self, symbol: &Symbol, channel: Channel) {
            self.calls
                .lock()
                .unwrap()
                .push(("unsubscribe".into(), format!("{symbol}:{}", channel.key())));
        }
    }

    impl RecordingUpstream {
        fn count(&self, action: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(a, _)| a == action)
                .count()
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        ensured: Mutex<Vec<Symbol>>,
    }

    impl HandlerFactory for Arc<RecordingFactory> {
        fn ensure_handler(&self, symbol: &Symbol) -> BoxFuture<'static, ()> {
            self.ensured.lock().unwrap().push(symbol.clone());
            Box::pin(async {})
        }
    }

    fn manager() -> (
        Arc<SubscriptionManager>,
        Arc<RecordingUpstream>,
        Arc<RecordingFactory>,
        Arc<MarketStore>,
    ) {
        let store = Arc::new(MarketStore::open_in_memory().unwrap());
        let upstream = Arc::new(RecordingUpstream::default());
        let factory = Arc::new(RecordingFactory::default());
        let mgr = SubscriptionManager::new(
            store.clone(),
            Arc::new(factory.clone()),
            upstream.clone(),
            500,
        );
        (mgr, upstream, factory, store)
    }

    #[tokio::test]
    async fn reference_counting_scenario() {
        let (mgr, upstream, _, _) = manager();
        let s = sym("AAPL");

        // u1 permanent subscribe: upstream subscribed.
        let (outcome, count) = mgr.add_permanent("u1", &s).await.unwrap();
        assert_eq!(outcome, AddOutcome::Subscribed);
        assert_eq!(count, 1);
        assert!(mgr.is_upstream_subscribed(&s));
        assert_eq!(upstream.count("subscribe"), 1);

        // u2 live stream: upstream unchanged.
        let session = mgr.attach_live("u2", &s).await.unwrap();
        assert_eq!(upstream.count("subscribe"), 1);

        // u1 removes permanent: still subscribed, live interest remains.
        let (outcome, remaining) = mgr.remove_permanent("u1", &s).unwrap();
        assert_eq!(outcome, RemoveOutcome::Unsubscribed);
        assert_eq!(remaining, 0);
        assert!(mgr.is_upstream_subscribed(&s));
        assert_eq!(upstream.count("unsubscribe"), 0);

        // u2 disconnects: upstream unsubscribed.
        mgr.detach_live(&session);
        assert!(!mgr.is_upstream_subscribed(&s));
        assert_eq!(upstream.count("unsubscribe"), 1);
    }

    #[tokio::test]
    async fn add_then_remove_leaves_counts_unchanged() {
        let (mgr, _, _, _) = manager();
        let s = sym("MSFT");

        let before = mgr.permanent_count(&s);
        mgr.add_permanent("u1", &s).await.unwrap();
        mgr.remove_permanent("u1", &s).unwrap();
        assert_eq!(mgr.permanent_count(&s), before);
        assert!(!mgr.is_upstream_subscribed(&s));
    }

    #[tokio::test]
    async fn double_add_is_already_and_subscribes_upstream_once() {
        let (mgr, upstream, factory, _) = manager();
        let s = sym("AAPL");

        let (first, _) = mgr.add_permanent("u1", &s).await.unwrap();
        let (second, count) = mgr.add_permanent("u1", &s).await.unwrap();
        assert_eq!(first, AddOutcome::Subscribed);
        assert_eq!(second, AddOutcome::Already);
        assert_eq!(count, 1);
        assert_eq!(upstream.count("subscribe"), 1);
        // ensure_handler is invoked per call but is idempotent downstream.
        assert!(factory.ensured.lock().unwrap().len() >= 1);
    }

    #[tokio::test]
    async fn remove_unknown_symbol_is_not_subscribed() {
        let (mgr, upstream, _, _) = manager();
        let (outcome, count) = mgr.remove_permanent("u1", &sym("TSLA")).unwrap();
        assert_eq!(outcome, RemoveOutcome::NotSubscribed);
        assert_eq!(count, 0);
        assert_eq!(upstream.count("unsubscribe"), 0);
    }

    #[tokio::test]
    async fn symbol_universe_is_bounded() {
        let store = Arc::new(MarketStore::open_in_memory().unwrap());
        let upstream = Arc::new(RecordingUpstream::default());
        let factory = Arc::new(RecordingFactory::default());
        let mgr = SubscriptionManager::new(store, Arc::new(factory), upstream, 2);

        mgr.add_permanent("u1", &sym("AAPL")).await.unwrap();
        mgr.add_permanent("u1", &sym("MSFT")).await.unwrap();
        let err = mgr.add_permanent("u1", &sym("TSLA")).await.unwrap_err();
        assert!(matches!(err, ApiError::TooManySymbols(_)));

        // Existing symbols are unaffected by the cap.
        let (outcome, _) = mgr.add_permanent("u2", &sym("AAPL")).await.unwrap();
        assert_eq!(outcome, AddOutcome::Subscribed);
    }

    #[tokio::test]
    async fn prepare_live_is_idempotent_and_released_on_detach() {
        let (mgr, upstream, _, _) = manager();
        let s = sym("AAPL");

        assert!(mgr.prepare_live("u1", &s).await.unwrap());
        assert!(!mgr.prepare_live("u1", &s).await.unwrap());
        assert_eq!(mgr.live_count(&s), 1);
        assert!(mgr.is_upstream_subscribed(&s));

        mgr.release_prepared("u1", &s);
        mgr.release_prepared("u1", &s);
        assert_eq!(mgr.live_count(&s), 0);
        assert!(!mgr.is_upstream_subscribed(&s));
        assert_eq!(upstream.count("unsubscribe"), 1);
    }

    #[tokio::test]
    async fn rehydrate_rebuilds_counts_and_resubscribes() {
        let (mgr, upstream, factory, store) = manager();

        mgr.add_permanent("u1", &sym("AAPL")).await.unwrap();
        mgr.add_permanent("u2", &sym("AAPL")).await.unwrap();
        mgr.add_permanent("u2", &sym("MSFT")).await.unwrap();

        // Fresh manager over the same store simulates a restart.
        let upstream2 = Arc::new(RecordingUpstream::default());
        let factory2 = Arc::new(RecordingFactory::default());
        let mgr2 = SubscriptionManager::new(
            store,
            Arc::new(factory2.clone()),
            upstream2.clone(),
            500,
        );
        let restored = mgr2.rehydrate_on_start().await.unwrap();

        assert_eq!(restored, 2);
        assert_eq!(mgr2.permanent_count(&sym("AAPL")), 2);
        assert_eq!(mgr2.permanent_count(&sym("MSFT")), 1);
        assert!(mgr2.is_upstream_subscribed(&sym("AAPL")));
        assert!(mgr2.is_upstream_subscribed(&sym("MSFT")));
        assert_eq!(upstream2.count("subscribe"), 2);
        assert_eq!(factory2.ensured.lock().unwrap().len(), 2);

        // The original manager's upstream set matches pre-restart state.
        assert_eq!(upstream.count("subscribe"), 2);
        let _ = factory;
    }
}
