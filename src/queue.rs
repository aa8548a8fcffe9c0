use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::types::FeedEvent;

/// Bounded FIFO between the feed client and the aggregator.
///
/// Single producer, single consumer. When full, the *oldest* entry is dropped
/// so the consumer always sees the freshest ticks; drops are counted rather
/// than logged per-event.
pub struct TickQueue {
    inner: Mutex<VecDeque<FeedEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: Mutex<bool>,
}

impl TickQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: Mutex::new(false),
        }
    }

    /// Push an event, evicting the oldest entry on overflow. Never blocks.
    pub fn push(&self, event: FeedEvent) {
        {
            let mut q = self.inner.lock().unwrap();
            if q.len() >= self.capacity {
                q.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            q.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Pop the next event, waiting until one is available or the queue is
    /// closed. Returns `None` only after close once the queue is drained.
    pub async fn pop(&self) -> Option<FeedEvent> {
        loop {
            {
                let mut q = self.inner.lock().unwrap();
                if let Some(event) = q.pop_front() {
                    return Some(event);
                }
                if *self.closed.lock().unwrap() {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop, used by the shutdown drain.
    pub fn try_pop(&self) -> Option<FeedEvent> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Close the queue: pending events remain poppable, after which `pop`
    /// returns `None`.
    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Symbol, Trade};

    fn trade(symbol: &str, price: f64) -> FeedEvent {
        FeedEvent::Trade(Trade {
            symbol: Symbol::parse(symbol).unwrap(),
            price,
            size: 1,
            event_ms: 0,
            conditions: Vec::new(),
            exchange: String::new(),
            tape: String::new(),
        })
    }

    #[tokio::test]
    async fn overflow_drops_the_oldest_entry() {
        let q = TickQueue::new(2);
        q.push(trade("AAPL", 1.0));
        q.push(trade("AAPL", 2.0));
        q.push(trade("AAPL", 3.0));

        assert_eq!(q.dropped(), 1);
        match q.pop().await.unwrap() {
            FeedEvent::Trade(t) => assert_eq!(t.price, 2.0),
            other => panic!("unexpected event: {other:?}"),
        }
        match q.pop().await.unwrap() {
            FeedEvent::Trade(t) => assert_eq!(t.price, 3.0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = std::sync::Arc::new(TickQueue::new(8));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::task::yield_now().await;
        q.push(trade("MSFT", 10.0));
        let got = waiter.await.unwrap();
        assert!(matches!(got, Some(FeedEvent::Trade(_))));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = TickQueue::new(8);
        q.push(trade("AAPL", 1.0));
        q.close();
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }
}
