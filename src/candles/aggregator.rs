use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::OnceCell;

use crate::candles::builder::{CandleBuilder, TradeOutcome};
use crate::queue::TickQueue;
use crate::store::MarketStore;
use crate::subscriptions::HandlerFactory;
use crate::types::{now_ms, Bar, FeedEvent, NewsItem, Symbol, Trade, MINUTE_MS};

/// Source of historical minute bars (the REST backfill client in production,
/// a stub in tests).
pub trait BarsSource: Send + Sync + 'static {
    fn fetch_bars(
        &self,
        symbol: Symbol,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> BoxFuture<'static, anyhow::Result<Vec<(i64, Bar)>>>;
}

/// Receives per-symbol candle updates (the SSE hub in production).
pub trait UpdateSink: Send + Sync + 'static {
    fn on_update(&self, symbol: &Symbol, candles: BTreeMap<String, Bar>, is_initial: bool);
}

/// Receives news items (the news broadcast room in production).
pub trait NewsSink: Send + Sync + 'static {
    fn on_news(&self, item: &NewsItem);
}

struct SymbolSlot {
    builder: Mutex<CandleBuilder>,
    /// Guards the one-time backfill + initial emission.
    init: OnceCell<()>,
}

/// Owns the per-symbol builders and drains the tick queue in a single
/// consumer loop, which is what gives per-symbol updates their total order.
pub struct Aggregator {
    slots: Mutex<HashMap<Symbol, Arc<SymbolSlot>>>,
    store: Arc<MarketStore>,
    bars: Arc<dyn BarsSource>,
    sink: Arc<dyn UpdateSink>,
    news_sink: Arc<dyn NewsSink>,
    backfill_lookback_minutes: u64,

    quotes_seen: AtomicU64,
    provider_bars_seen: AtomicU64,
    news_seen: AtomicU64,
}

impl Aggregator {
    pub fn new(
        store: Arc<MarketStore>,
        bars: Arc<dyn BarsSource>,
        sink: Arc<dyn UpdateSink>,
        news_sink: Arc<dyn NewsSink>,
        backfill_lookback_minutes: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            store,
            bars,
            sink,
            news_sink,
            backfill_lookback_minutes,
            quotes_seen: AtomicU64::new(0),
            provider_bars_seen: AtomicU64::new(0),
            news_seen: AtomicU64::new(0),
        })
    }

    /// Drain the tick queue until it is closed and empty. This task must not
    /// be restarted on failure: diverging in-memory candle state would be
    /// worse than a crash, so the caller aborts the process instead.
    pub async fn run(self: Arc<Self>, queue: Arc<TickQueue>) {
        while let Some(event) = queue.pop().await {
            self.handle_event(event);
        }
        tracing::info!("aggregator loop drained, exiting");
    }

    /// Route one feed event. Synchronous: nothing may suspend between the
    /// builder mutation and the corresponding update emission.
    pub fn handle_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::Trade(trade) => self.handle_trade(trade),
            FeedEvent::Quote(_) => {
                self.quotes_seen.fetch_add(1, Ordering::Relaxed);
            }
            FeedEvent::Bar { .. } => {
                // The aggregator builds its own bars from trades; provider
                // bars are only counted.
                self.provider_bars_seen.fetch_add(1, Ordering::Relaxed);
            }
            FeedEvent::News(item) => self.handle_news(item),
        }
    }

    fn handle_trade(&self, trade: Trade) {
        let slot = self.slot(&trade.symbol);

        let (outcome, delta) = {
            let mut builder = slot.builder.lock().unwrap();
            let outcome = builder.process_trade(trade.price, trade.size, trade.event_ms, now_ms());
            let delta = match outcome {
                TradeOutcome::RejectedLate
                | TradeOutcome::RejectedFuture
                | TradeOutcome::RejectedInvalid => None,
                _ => Some(builder.last_two()),
            };
            (outcome, delta)
        };

        if let TradeOutcome::Transitioned { closed_bucket_ms, closed } = &outcome {
            self.persist_with_retry(&trade.symbol, *closed_bucket_ms, closed);
        }

        if let Some(candles) = delta {
            self.sink.on_update(&trade.symbol, candles, false);
        }
    }

    fn handle_news(&self, item: NewsItem) {
        self.news_seen.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.store.insert_news(&item) {
            tracing::warn!("news insert failed for {}: {e}", item.id);
        }
        self.news_sink.on_news(&item);
    }

    /// One retry on store failure; in-memory state stays authoritative either
    /// way, so the update is still emitted by the caller.
    fn persist_with_retry(&self, symbol: &Symbol, bucket_ms: i64, bar: &Bar) {
        for attempt in 0..2 {
            match self.store.upsert_candle(symbol, bucket_ms, bar) {
                Ok(()) => return,
                Err(e) if attempt == 0 => {
                    tracing::warn!("candle persist failed for {symbol} (retrying): {e}");
                }
                Err(e) => {
                    tracing::error!("candle persist failed for {symbol}, giving up: {e}");
                }
            }
        }
    }

    fn slot(&self, symbol: &Symbol) -> Arc<SymbolSlot> {
        let mut slots = self.slots.lock().unwrap();
        slots
            .entry(symbol.clone())
            .or_insert_with(|| {
                Arc::new(SymbolSlot {
                    builder: Mutex::new(CandleBuilder::new()),
                    init: OnceCell::new(),
                })
            })
            .clone()
    }

    /// Idempotent "make this symbol live": create the builder if needed, and
    /// exactly once per builder lifetime run the backfill, merge it, persist
    /// it, and emit the full series as the initial snapshot.
    pub async fn ensure_handler(&self, symbol: &Symbol) {
        let slot = self.slot(symbol);
        slot.init
            .get_or_init(|| async {
                self.initialize_symbol(symbol, &slot).await;
            })
            .await;
    }

    async fn initialize_symbol(&self, symbol: &Symbol, slot: &SymbolSlot) {
        let end_ms = now_ms();
        let lookback_ms = self.backfill_lookback_minutes as i64 * MINUTE_MS;
        let start_ms = end_ms - lookback_ms;
        let limit = self.backfill_lookback_minutes as usize;

        match self
            .bars
            .fetch_bars(symbol.clone(), start_ms, end_ms, limit)
            .await
        {
            Ok(bars) => {
                let inserted = {
                    let mut builder = slot.builder.lock().unwrap();
                    builder.load_historical(&bars)
                };
                tracing::info!(
                    "backfill for {symbol}: {} bars fetched, {} merged",
                    bars.len(),
                    inserted.len()
                );
                // Durable before the initial snapshot goes out.
                if let Err(e) = self.store.bulk_upsert_candles(symbol, &inserted) {
                    tracing::warn!("backfill persist failed for {symbol} (retrying): {e}");
                    if let Err(e) = self.store.bulk_upsert_candles(symbol, &inserted) {
                        tracing::error!("backfill persist failed for {symbol}, giving up: {e}");
                    }
                }
            }
            Err(e) => {
                // Live data continues; history stays whatever the store had.
                tracing::warn!("backfill failed for {symbol}: {e}");
            }
        }

        let snapshot = slot.builder.lock().unwrap().snapshot_all();
        self.sink.on_update(symbol, snapshot, true);
    }

    /// Full in-memory series for a symbol, if it is tracked.
    pub fn snapshot(&self, symbol: &Symbol) -> Option<BTreeMap<String, Bar>> {
        let slot = {
            let slots = self.slots.lock().unwrap();
            slots.get(symbol).cloned()
        }?;
        Some(slot.builder.lock().unwrap().snapshot_all())
    }

    pub fn is_tracked(&self, symbol: &Symbol) -> bool {
        self.slots.lock().unwrap().contains_key(symbol)
    }

    pub fn tracked_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.slots.lock().unwrap().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Persist every open bucket. Called on graceful shutdown so the most
    /// recent partial bar is not lost.
    pub fn flush_open_buckets(&self) {
        let slots: Vec<(Symbol, Arc<SymbolSlot>)> = {
            let slots = self.slots.lock().unwrap();
            slots.iter().map(|(s, v)| (s.clone(), v.clone())).collect()
        };
        for (symbol, slot) in slots {
            let open = slot.builder.lock().unwrap().open_bar();
            if let Some((bucket_ms, bar)) = open {
                self.persist_with_retry(&symbol, bucket_ms, &bar);
            }
        }
    }

    pub fn status_counters(&self) -> AggregatorCounters {
        let (mut late, mut future, mut invalid) = (0, 0, 0);
        let slots: Vec<Arc<SymbolSlot>> = {
            let slots = self.slots.lock().unwrap();
            slots.values().cloned().collect()
        };
        for slot in slots {
            let builder = slot.builder.lock().unwrap();
            late += builder.late_drops();
            future += builder.future_drops();
            invalid += builder.invalid_drops();
        }
        AggregatorCounters {
            late_drops: late,
            future_drops: future,
            invalid_drops: invalid,
            quotes_seen: self.quotes_seen.load(Ordering::Relaxed),
            provider_bars_seen: self.provider_bars_seen.load(Ordering::Relaxed),
            news_seen: self.news_seen.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AggregatorCounters {
    pub late_drops: u64,
    pub future_drops: u64,
    pub invalid_drops: u64,
    pub quotes_seen: u64,
    pub provider_bars_seen: u64,
    pub news_seen: u64,
}

impl HandlerFactory for Arc<Aggregator> {
    fn ensure_handler(&self, symbol: &Symbol) -> BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        let symbol = symbol.clone();
        Box::pin(async move { Aggregator::ensure_handler(&this, &symbol).await })
    }
}
