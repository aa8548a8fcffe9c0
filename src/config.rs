use std::env;
use std::path::PathBuf;

/// Hub configuration derived from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Upstream feed ──────────────────────────────────────────────
    pub upstream_ws_url: String,
    pub upstream_ws_key: String,
    pub upstream_ws_secret: String,
    pub upstream_rest_url: String,

    // ── Aggregation ────────────────────────────────────────────────
    pub backfill_lookback_minutes: u64,
    pub tick_queue_capacity: usize,
    pub max_concurrent_symbols: usize,

    // ── Fan-out ────────────────────────────────────────────────────
    pub sse_queue_capacity: usize,

    // ── Reconnect backoff ──────────────────────────────────────────
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub ping_timeout_secs: u64,
    /// Window over which subscription deltas are coalesced into one frame.
    pub sub_batch_ms: u64,

    // ── Storage ────────────────────────────────────────────────────
    pub store_path: PathBuf,

    // ── Auth ───────────────────────────────────────────────────────
    pub auth_jwks_url: Option<String>,
    pub auth_hs256_secret: Option<String>,

    // ── HTTP ───────────────────────────────────────────────────────
    pub http_listen_addr: String,
    pub shutdown_grace_secs: u64,
}

fn env_str(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn required(name: &str) -> anyhow::Result<String> {
    env_opt(name).ok_or_else(|| anyhow::anyhow!("{name} is required"))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let auth_jwks_url = env_opt("AUTH_JWKS_URL");
        let auth_hs256_secret = env_opt("AUTH_HS256_SECRET");
        if auth_jwks_url.is_none() && auth_hs256_secret.is_none() {
            anyhow::bail!("AUTH_JWKS_URL is required (or AUTH_HS256_SECRET for local dev)");
        }

        let reconnect_min_ms = env_u64("RECONNECT_MIN_MS", 1_000).max(1);
        let reconnect_max_ms = env_u64("RECONNECT_MAX_MS", 30_000).max(reconnect_min_ms);

        Ok(Self {
            upstream_ws_url: required("UPSTREAM_WS_URL")?,
            upstream_ws_key: required("UPSTREAM_WS_KEY")?,
            upstream_ws_secret: required("UPSTREAM_WS_SECRET")?,
            upstream_rest_url: required("UPSTREAM_REST_URL")?,

            backfill_lookback_minutes: env_u64("BACKFILL_LOOKBACK_MINUTES", 1_440).max(1),
            tick_queue_capacity: env_usize("TICK_QUEUE_CAPACITY", 500).max(1),
            max_concurrent_symbols: env_usize("MAX_CONCURRENT_SYMBOLS", 500).max(1),

            sse_queue_capacity: env_usize("SSE_QUEUE_CAPACITY", 10).max(1),

            reconnect_min_ms,
            reconnect_max_ms,
            ping_timeout_secs: env_u64("PING_TIMEOUT_SECS", 30).max(5),
            sub_batch_ms: env_u64("SUB_BATCH_MS", 50).clamp(1, 50),

            store_path: PathBuf::from(env_str("STORE_PATH", "./data/market.db")),

            auth_jwks_url,
            auth_hs256_secret,

            http_listen_addr: env_str("HTTP_LISTEN_ADDR", "0.0.0.0:8001"),
            shutdown_grace_secs: env_u64("SHUTDOWN_GRACE_SECS", 5).clamp(1, 5),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn set_env(key: &str, val: &str) -> Option<String> {
        let prev = env::var(key).ok();
        unsafe {
            env::set_var(key, val);
        }
        prev
    }

    fn restore_env(key: &str, prev: Option<String>) {
        match prev {
            Some(v) => unsafe {
                env::set_var(key, v);
            },
            None => unsafe {
                env::remove_var(key);
            },
        }
    }

    const REQUIRED: [(&str, &str); 5] = [
        ("UPSTREAM_WS_URL", "wss://example.test/stream"),
        ("UPSTREAM_WS_KEY", "key"),
        ("UPSTREAM_WS_SECRET", "secret"),
        ("UPSTREAM_REST_URL", "https://example.test"),
        ("AUTH_HS256_SECRET", "dev-secret"),
    ];

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        let saved: Vec<_> = REQUIRED.iter().map(|(k, v)| (*k, set_env(k, v))).collect();
        let prev_cap = set_env("TICK_QUEUE_CAPACITY", "");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.tick_queue_capacity, 500);
        assert_eq!(cfg.sse_queue_capacity, 10);
        assert_eq!(cfg.backfill_lookback_minutes, 1_440);
        assert_eq!(cfg.reconnect_min_ms, 1_000);
        assert_eq!(cfg.reconnect_max_ms, 30_000);
        assert_eq!(cfg.store_path, PathBuf::from("./data/market.db"));

        restore_env("TICK_QUEUE_CAPACITY", prev_cap);
        for (k, prev) in saved {
            restore_env(k, prev);
        }
    }

    #[test]
    fn reconnect_max_is_clamped_to_min() {
        let _guard = ENV_LOCK.lock().unwrap();
        let saved: Vec<_> = REQUIRED.iter().map(|(k, v)| (*k, set_env(k, v))).collect();
        let prev_min = set_env("RECONNECT_MIN_MS", "5000");
        let prev_max = set_env("RECONNECT_MAX_MS", "100");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.reconnect_min_ms, 5_000);
        assert_eq!(cfg.reconnect_max_ms, 5_000);

        restore_env("RECONNECT_MIN_MS", prev_min);
        restore_env("RECONNECT_MAX_MS", prev_max);
        for (k, prev) in saved {
            restore_env(k, prev);
        }
    }

    #[test]
    fn missing_upstream_url_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        let saved: Vec<_> = REQUIRED.iter().map(|(k, v)| (*k, set_env(k, v))).collect();
        let prev = set_env("UPSTREAM_WS_URL", "");

        assert!(Config::from_env().is_err());

        restore_env("UPSTREAM_WS_URL", prev);
        for (k, prev) in saved {
            restore_env(k, prev);
        }
    }
}
