pub mod backfill;
pub mod wire;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::config::Config;
use crate::queue::TickQueue;
use crate::subscriptions::UpstreamControl;
use crate::types::Symbol;
use wire::{parse_text_frame, ControlMsg, ParsedMsg};

/// Upstream channels. `key` is the field name used in subscribe frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Trades,
    Quotes,
    Bars,
    News,
}

impl Channel {
    pub fn key(&self) -> &'static str {
        match self {
            Channel::Trades => "trades",
            Channel::Quotes => "quotes",
            Channel::Bars => "bars",
            Channel::News => "news",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubKey {
    pub symbol: Symbol,
    pub channel: Channel,
}

#[derive(Debug)]
enum FeedCommand {
    Subscribe(SubKey),
    Unsubscribe(SubKey),
    Shutdown,
}

/// Upstream connection lifecycle. `Reconnecting` is entered from `Connected`
/// on any transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    ShuttingDown,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Authenticating => "authenticating",
            ConnState::Connected => "connected",
            ConnState::Reconnecting => "reconnecting",
            ConnState::ShuttingDown => "shutting_down",
        }
    }
}

/// Observability + desired-subscription state shared between the feed task
/// and its handle.
#[derive(Default)]
struct FeedShared {
    state: Mutex<Option<ConnState>>,
    desired: Mutex<HashSet<SubKey>>,
    connect_attempts: AtomicU64,
    disconnects: AtomicU64,
    malformed_frames: AtomicU64,
    unknown_messages: AtomicU64,
    connected_at_ms: Mutex<Option<i64>>,
    last_error: Mutex<Option<String>>,
    last_close: Mutex<Option<String>>,
}

impl FeedShared {
    fn note_error(&self, msg: impl Into<String>) {
        *self.last_error.lock().unwrap() = Some(msg.into());
    }

    fn note_close(&self, msg: impl Into<String>) {
        *self.last_close.lock().unwrap() = Some(msg.into());
    }
}

/// Cloneable control surface over the feed task. All other components talk to
/// the upstream socket only through this.
#[derive(Clone)]
pub struct FeedHandle {
    tx: mpsc::UnboundedSender<FeedCommand>,
    shared: Arc<FeedShared>,
}

impl FeedHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(FeedCommand::Shutdown);
    }

    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            state: self
                .shared
                .state
                .lock()
                .unwrap()
                .unwrap_or(ConnState::Disconnected)
                .as_str(),
            subscriptions: self.shared.desired.lock().unwrap().len(),
            connect_attempts: self.shared.connect_attempts.load(Ordering::Relaxed),
            disconnects: self.shared.disconnects.load(Ordering::Relaxed),
            malformed_frames: self.shared.malformed_frames.load(Ordering::Relaxed),
            unknown_messages: self.shared.unknown_messages.load(Ordering::Relaxed),
            connected_at_ms: *self.shared.connected_at_ms.lock().unwrap(),
            last_error: self.shared.last_error.lock().unwrap().clone(),
            last_close: self.shared.last_close.lock().unwrap().clone(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FeedStatus {
    pub state: &'static str,
    pub subscriptions: usize,
    pub connect_attempts: u64,
    pub disconnects: u64,
    pub malformed_frames: u64,
    pub unknown_messages: u64,
    pub connected_at_ms: Option<i64>,
    pub last_error: Option<String>,
    pub last_close: Option<String>,
}

impl UpstreamControl for FeedHandle {
    fn subscribe(&self, symbol: &Symbol, channel: Channel) {
        let key = SubKey { symbol: symbol.clone(), channel };
        self.shared.desired.lock().unwrap().insert(key.clone());
        let _ = self.tx.send(FeedCommand::Subscribe(key));
    }

    fn unsubscribe(&self, symbol: &Symbol, channel: Channel) {
        let key = SubKey { symbol: symbol.clone(), channel };
        self.shared.desired.lock().unwrap().remove(&key);
        let _ = self.tx.send(FeedCommand::Unsubscribe(key));
    }
}

/// Group a set of subscription keys by channel, symbols sorted, for framing.
fn group_by_channel<'a, I>(keys: I) -> HashMap<Channel, BTreeSet<Symbol>>
where
    I: IntoIterator<Item = &'a SubKey>,
{
    let mut out: HashMap<Channel, BTreeSet<Symbol>> = HashMap::new();
    for key in keys {
        out.entry(key.channel).or_default().insert(key.symbol.clone());
    }
    out
}

/// One control frame per channel: `{"action":…,"trades":["AAPL","MSFT"]}`.
fn build_control_frames(action: &str, groups: &HashMap<Channel, BTreeSet<Symbol>>) -> Vec<String> {
    let mut channels: Vec<&Channel> = groups.keys().collect();
    channels.sort();
    channels
        .into_iter()
        .filter(|ch| !groups[ch].is_empty())
        .map(|ch| {
            let symbols: Vec<&str> = groups[ch].iter().map(|s| s.as_str()).collect();
            let frame = match ch {
                Channel::Trades => serde_json::json!({ "action": action, "trades": symbols }),
                Channel::Quotes => serde_json::json!({ "action": action, "quotes": symbols }),
                Channel::Bars => serde_json::json!({ "action": action, "bars": symbols }),
                Channel::News => serde_json::json!({ "action": action, "news": symbols }),
            };
            frame.to_string()
        })
        .collect()
}

/// Full jitter: uniform over `[0, min(cap, base * 2^attempt)]`.
fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let ceil = exp.min(cap_ms).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceil))
}

pub struct FeedClient {
    cfg: Config,
    shared: Arc<FeedShared>,
    queue: Arc<TickQueue>,
    rx: mpsc::UnboundedReceiver<FeedCommand>,
}

impl FeedClient {
    pub fn new(cfg: Config, queue: Arc<TickQueue>) -> (FeedClient, FeedHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(FeedShared::default());
        let handle = FeedHandle { tx, shared: shared.clone() };
        (Self { cfg, shared, queue, rx }, handle)
    }

    fn set_state(&self, state: ConnState) {
        *self.shared.state.lock().unwrap() = Some(state);
    }

    /// Connect-auth-read loop. Transient failures reconnect forever with
    /// backoff; an authentication rejection is a configuration error and
    /// returns `Err`, which aborts the process.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let _ = url::Url::parse(&self.cfg.upstream_ws_url)
            .map_err(|e| anyhow::anyhow!("bad UPSTREAM_WS_URL: {e}"))?;

        let mut attempt: u32 = 0;

        loop {
            self.shared.connect_attempts.fetch_add(1, Ordering::Relaxed);
            self.set_state(ConnState::Connecting);

            let connect = tokio::time::timeout(
                Duration::from_secs(10),
                tokio_tungstenite::connect_async(self.cfg.upstream_ws_url.as_str()),
            )
            .await;

            let ws = match connect {
                Ok(Ok((ws, _resp))) => ws,
                Ok(Err(e)) => {
                    tracing::warn!("upstream connect failed: {e}");
                    self.shared.note_error(format!("connect failed: {e}"));
                    self.sleep_backoff(&mut attempt).await;
                    continue;
                }
                Err(_) => {
                    tracing::warn!("upstream connect timed out");
                    self.shared.note_error("connect timed out");
                    self.sleep_backoff(&mut attempt).await;
                    continue;
                }
            };

            let (mut writer, mut reader) = ws.split();

            // ── Authenticate ──────────────────────────────────────────
            self.set_state(ConnState::Authenticating);
            let auth = serde_json::json!({
                "action": "auth",
                "key": self.cfg.upstream_ws_key,
                "secret": self.cfg.upstream_ws_secret,
            })
            .to_string();
            if let Err(e) = writer.send(Message::Text(auth)).await {
                tracing::warn!("auth frame send failed: {e}");
                self.sleep_backoff(&mut attempt).await;
                continue;
            }

            match self.await_auth_ack(&mut reader).await {
                AuthOutcome::Ok => {}
                AuthOutcome::Rejected(msg) => {
                    self.set_state(ConnState::Disconnected);
                    anyhow::bail!("upstream rejected credentials: {msg}");
                }
                AuthOutcome::Transport(msg) => {
                    tracing::warn!("auth handshake failed: {msg}");
                    self.sleep_backoff(&mut attempt).await;
                    continue;
                }
            }

            self.set_state(ConnState::Connected);
            attempt = 0;
            *self.shared.connected_at_ms.lock().unwrap() = Some(crate::types::now_ms());
            tracing::info!("upstream connected and authenticated");

            // ── Re-send the current subscription set as one batch ─────
            let desired = { self.shared.desired.lock().unwrap().clone() };
            if !desired.is_empty() {
                let frames = build_control_frames("subscribe", &group_by_channel(desired.iter()));
                let mut failed = false;
                for frame in frames {
                    if let Err(e) = writer.send(Message::Text(frame)).await {
                        tracing::warn!("resubscribe send failed: {e}");
                        failed = true;
                        break;
                    }
                }
                if failed {
                    self.on_disconnect(&mut attempt).await;
                    continue;
                }
                tracing::info!("resubscribed {} upstream subscriptions", desired.len());
            }

            // ── Steady state ──────────────────────────────────────────
            let mut pending_sub: HashSet<SubKey> = HashSet::new();
            let mut pending_unsub: HashSet<SubKey> = HashSet::new();

            let mut batch_tick =
                tokio::time::interval(Duration::from_millis(self.cfg.sub_batch_ms.max(1)));
            batch_tick.tick().await; // arm

            let ping_timeout = Duration::from_secs(self.cfg.ping_timeout_secs);
            let mut ping_tick = tokio::time::interval(ping_timeout / 3);
            ping_tick.tick().await; // arm
            let mut last_inbound = Instant::now();

            let mut shutting_down = false;

            loop {
                tokio::select! {
                    msg = reader.next() => {
                        match msg {
                            Some(Ok(Message::Text(txt))) => {
                                last_inbound = Instant::now();
                                self.handle_text(&txt);
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                last_inbound = Instant::now();
                                let _ = writer.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Pong(_))) => {
                                last_inbound = Instant::now();
                            }
                            Some(Ok(Message::Close(frame))) => {
                                tracing::warn!("upstream closed: {frame:?}");
                                self.shared.note_close(format!("{frame:?}"));
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!("upstream read error: {e}");
                                self.shared.note_error(format!("read error: {e}"));
                                break;
                            }
                            None => break,
                        }
                    }
                    cmd = self.rx.recv() => {
                        match cmd {
                            Some(FeedCommand::Subscribe(key)) => {
                                pending_unsub.remove(&key);
                                pending_sub.insert(key);
                            }
                            Some(FeedCommand::Unsubscribe(key)) => {
                                pending_sub.remove(&key);
                                pending_unsub.insert(key);
                            }
                            Some(FeedCommand::Shutdown) | None => {
                                shutting_down = true;
                                break;
                            }
                        }
                    }
                    _ = batch_tick.tick(), if !pending_sub.is_empty() || !pending_unsub.is_empty() => {
                        let mut frames = build_control_frames(
                            "subscribe", &group_by_channel(pending_sub.iter()));
                        frames.extend(build_control_frames(
                            "unsubscribe", &group_by_channel(pending_unsub.iter())));
                        pending_sub.clear();
                        pending_unsub.clear();

                        let mut failed = false;
                        for frame in frames {
                            if let Err(e) = writer.send(Message::Text(frame)).await {
                                tracing::warn!("subscription frame send failed: {e}");
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    _ = ping_tick.tick() => {
                        if last_inbound.elapsed() > ping_timeout {
                            tracing::warn!(
                                "no upstream traffic for {}s, reconnecting",
                                last_inbound.elapsed().as_secs()
                            );
                            break;
                        }
                        let _ = writer.send(Message::Ping(Vec::new())).await;
                    }
                }
            }

            if shutting_down {
                self.set_state(ConnState::ShuttingDown);
                let _ = writer.send(Message::Close(None)).await;
                tracing::info!("upstream feed shut down");
                return Ok(());
            }

            self.on_disconnect(&mut attempt).await;
        }
    }

    /// Parse one text frame and enqueue its data messages.
    fn handle_text(&self, txt: &str) {
        match parse_text_frame(txt) {
            Ok(messages) => {
                for msg in messages {
                    match msg {
                        ParsedMsg::Event(event) => self.queue.push(event),
                        ParsedMsg::Control(ctrl) => {
                            tracing::debug!("upstream control: {ctrl:?}");
                        }
                        ParsedMsg::Unknown(tag) => {
                            self.shared.unknown_messages.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!("unknown upstream message type: {tag}");
                        }
                    }
                }
            }
            Err(e) => {
                self.shared.malformed_frames.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("malformed upstream frame: {e}");
            }
        }
    }

    async fn await_auth_ack<S>(&self, reader: &mut S) -> AuthOutcome
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let deadline = Duration::from_secs(10);
        loop {
            let msg = match tokio::time::timeout(deadline, reader.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => return AuthOutcome::Transport(e.to_string()),
                Ok(None) => return AuthOutcome::Transport("connection closed".into()),
                Err(_) => return AuthOutcome::Transport("auth ack timed out".into()),
            };
            let Message::Text(txt) = msg else { continue };
            let Ok(messages) = parse_text_frame(&txt) else { continue };
            for msg in messages {
                match msg {
                    ParsedMsg::Control(ControlMsg::Authenticated) => return AuthOutcome::Ok,
                    ParsedMsg::Control(ControlMsg::AuthRejected(detail)) => {
                        return AuthOutcome::Rejected(detail)
                    }
                    _ => {}
                }
            }
        }
    }

    async fn sleep_backoff(&self, attempt: &mut u32) {
        self.set_state(ConnState::Reconnecting);
        let delay = backoff_delay(*attempt, self.cfg.reconnect_min_ms, self.cfg.reconnect_max_ms);
        *attempt = attempt.saturating_add(1);
        tracing::debug!("upstream reconnect in {}ms", delay.as_millis());
        tokio::time::sleep(delay).await;
    }

    async fn on_disconnect(&self, attempt: &mut u32) {
        self.shared.disconnects.fetch_add(1, Ordering::Relaxed);
        self.sleep_backoff(attempt).await;
    }
}

enum AuthOutcome {
    Ok,
    Rejected(String),
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Symbol {
        Symbol::parse(s).unwrap()
    }

    fn key(s: &str, channel: Channel) -> SubKey {
        SubKey { symbol: sym(s), channel }
    }

    #[test]
    fn control_frames_are_one_per_channel_with_sorted_symbols() {
        let keys = [
            key("MSFT", Channel::Trades),
            key("AAPL", Channel::Trades),
            key("AAPL", Channel::News),
        ];
        let frames = build_control_frames("subscribe", &group_by_channel(keys.iter()));

        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0],
            r#"{"action":"subscribe","trades":["AAPL","MSFT"]}"#
        );
        assert_eq!(frames[1], r#"{"action":"subscribe","news":["AAPL"]}"#);
    }

    #[test]
    fn reconnect_resends_the_full_desired_set_in_one_frame_per_channel() {
        // Scenario: subscribed to {AAPL, MSFT} trades, connection drops.
        // After reconnect exactly one subscribe frame carries both.
        let desired: HashSet<SubKey> =
            [key("AAPL", Channel::Trades), key("MSFT", Channel::Trades)]
                .into_iter()
                .collect();
        let frames = build_control_frames("subscribe", &group_by_channel(desired.iter()));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains(r#""trades":["AAPL","MSFT"]"#));
    }

    #[test]
    fn backoff_respects_floor_and_cap() {
        for attempt in 0..12 {
            let d = backoff_delay(attempt, 1_000, 30_000);
            assert!(d.as_millis() <= 30_000);
        }
        // Attempt 0 draws from [0, base].
        let d0 = backoff_delay(0, 1_000, 30_000);
        assert!(d0.as_millis() <= 1_000);
    }

    #[test]
    fn handle_tracks_desired_set() {
        let cfg_queue = Arc::new(TickQueue::new(8));
        let (client, handle) = FeedClient::new(test_config(), cfg_queue);
        drop(client);

        handle.subscribe(&sym("AAPL"), Channel::Trades);
        handle.subscribe(&sym("AAPL"), Channel::Trades);
        handle.subscribe(&sym("MSFT"), Channel::Trades);
        assert_eq!(handle.status().subscriptions, 2);

        handle.unsubscribe(&sym("AAPL"), Channel::Trades);
        assert_eq!(handle.status().subscriptions, 1);
    }

    fn test_config() -> Config {
        Config {
            upstream_ws_url: "wss://example.test/stream".into(),
            upstream_ws_key: "k".into(),
            upstream_ws_secret: "s".into(),
            upstream_rest_url: "https://example.test".into(),
            backfill_lookback_minutes: 1_440,
            tick_queue_capacity: 500,
            max_concurrent_symbols: 500,
            sse_queue_capacity: 10,
            reconnect_min_ms: 1_000,
            reconnect_max_ms: 30_000,
            ping_timeout_secs: 30,
            sub_batch_ms: 50,
            store_path: "./data/market.db".into(),
            auth_jwks_url: None,
            auth_hs256_secret: Some("dev".into()),
            http_listen_addr: "127.0.0.1:0".into(),
            shutdown_grace_secs: 5,
        }
    }
}
