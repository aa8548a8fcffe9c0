use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::candles::{NewsSink, UpdateSink};
use crate::types::{now_rfc3339, Bar, CandleFrame, NewsFrame, NewsItem, Symbol};

/// Bounded per-connection frame queue with the snapshot/delta discipline:
///
/// - an initial snapshot replaces everything pending and marks the queue
///   initialized;
/// - deltas to an uninitialized queue are dropped (the snapshot subsumes
///   them);
/// - on overflow the oldest *delta* is evicted, never a snapshot.
pub struct SseQueue {
    inner: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

struct QueueState {
    frames: VecDeque<Arc<CandleFrame>>,
    initialized: bool,
    closed: bool,
    dropped: u64,
}

impl SseQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                frames: VecDeque::new(),
                initialized: false,
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push_initial(&self, frame: Arc<CandleFrame>) {
        {
            let mut state = self.inner.lock().unwrap();
            state.frames.clear();
            state.frames.push_back(frame);
            state.initialized = true;
        }
        self.notify.notify_one();
    }

    /// Returns false when the frame was dropped (uninitialized queue, or a
    /// full queue holding nothing evictable).
    pub fn push_delta(&self, frame: Arc<CandleFrame>) -> bool {
        let accepted = {
            let mut state = self.inner.lock().unwrap();
            if !state.initialized || state.closed {
                state.dropped += 1;
                false
            } else {
                if state.frames.len() >= self.capacity {
                    match state.frames.iter().position(|f| !f.is_initial) {
                        Some(pos) => {
                            state.frames.remove(pos);
                            state.dropped += 1;
                        }
                        None => {
                            state.dropped += 1;
                            return false;
                        }
                    }
                }
                state.frames.push_back(frame);
                true
            }
        };
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// Next frame, or `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Arc<CandleFrame>> {
        loop {
            {
                let mut state = self.inner.lock().unwrap();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }
}

/// Fan-out of aggregator updates to every SSE connection on a symbol.
pub struct CandleHub {
    routes: Mutex<HashMap<Symbol, HashMap<u64, Arc<SseQueue>>>>,
    next_conn: AtomicU64,
    capacity: usize,
}

impl CandleHub {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            capacity: queue_capacity.max(1),
        })
    }

    /// Allocate and register an (uninitialized) queue for one connection.
    pub fn register(&self, symbol: &Symbol) -> (u64, Arc<SseQueue>) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SseQueue::new(self.capacity));
        self.routes
            .lock()
            .unwrap()
            .entry(symbol.clone())
            .or_default()
            .insert(conn_id, queue.clone());
        (conn_id, queue)
    }

    pub fn unregister(&self, symbol: &Symbol, conn_id: u64) {
        let mut routes = self.routes.lock().unwrap();
        if let Some(conns) = routes.get_mut(symbol) {
            if let Some(queue) = conns.remove(&conn_id) {
                queue.close();
            }
            if conns.is_empty() {
                routes.remove(symbol);
            }
        }
    }

    pub fn connection_count(&self, symbol: &Symbol) -> usize {
        self.routes
            .lock()
            .unwrap()
            .get(symbol)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

impl UpdateSink for CandleHub {
    fn on_update(&self, symbol: &Symbol, candles: BTreeMap<String, Bar>, is_initial: bool) {
        let queues: Vec<Arc<SseQueue>> = {
            let routes = self.routes.lock().unwrap();
            match routes.get(symbol) {
                Some(conns) => conns.values().cloned().collect(),
                None => return,
            }
        };

        let frame = Arc::new(CandleFrame {
            symbol: symbol.clone(),
            candles,
            is_initial,
            update_timestamp: now_rfc3339(),
        });

        for queue in queues {
            if is_initial {
                queue.push_initial(frame.clone());
            } else {
                queue.push_delta(frame.clone());
            }
        }
    }
}

/// Single broadcast room for news: no per-symbol keying, no initialization
/// state, append-only. A full queue sheds its oldest item.
pub struct NewsHub {
    rooms: Mutex<HashMap<u64, Arc<NewsQueue>>>,
    next_conn: AtomicU64,
    capacity: usize,
}

pub struct NewsQueue {
    inner: Mutex<(VecDeque<Arc<NewsFrame>>, bool)>,
    notify: Notify,
    capacity: usize,
}

impl NewsQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new((VecDeque::new(), false)),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, frame: Arc<NewsFrame>) {
        {
            let mut state = self.inner.lock().unwrap();
            if state.1 {
                return;
            }
            if state.0.len() >= self.capacity {
                state.0.pop_front();
            }
            state.0.push_back(frame);
        }
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> Option<Arc<NewsFrame>> {
        loop {
            {
                let mut state = self.inner.lock().unwrap();
                if let Some(frame) = state.0.pop_front() {
                    return Some(frame);
                }
                if state.1 {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.inner.lock().unwrap().1 = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

impl NewsHub {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            capacity: queue_capacity.max(1),
        })
    }

    pub fn register(&self) -> (u64, Arc<NewsQueue>) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(NewsQueue::new(self.capacity));
        self.rooms.lock().unwrap().insert(conn_id, queue.clone());
        (conn_id, queue)
    }

    pub fn unregister(&self, conn_id: u64) {
        if let Some(queue) = self.rooms.lock().unwrap().remove(&conn_id) {
            queue.close();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }
}

impl NewsSink for NewsHub {
    fn on_news(&self, item: &NewsItem) {
        let queues: Vec<Arc<NewsQueue>> = {
            let rooms = self.rooms.lock().unwrap();
            if rooms.is_empty() {
                return;
            }
            rooms.values().cloned().collect()
        };
        let frame = Arc::new(NewsFrame::from(item));
        for queue in queues {
            queue.push(frame.clone());
        }
    }
}
