use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use market_hub::config::Config;
use market_hub::routes;
use market_hub::state::AppState;

#[tokio::main]
async fn main() {
    // Initialise tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            std::process::exit(2);
        }
    };
    let listen_addr = cfg.http_listen_addr.clone();
    let grace = Duration::from_secs(cfg.shutdown_grace_secs);

    let (state, feed_client) = match AppState::build(cfg) {
        Ok(built) => built,
        Err(e) => {
            tracing::error!("startup failed: {e}");
            std::process::exit(2);
        }
    };

    let shutting_down = Arc::new(AtomicBool::new(false));

    // Upstream feed task. Transient errors reconnect internally; an Err here
    // means the provider rejected our credentials, which is fatal.
    tokio::spawn(async move {
        if let Err(e) = feed_client.run().await {
            tracing::error!("upstream feed failed: {e}");
            std::process::exit(1);
        }
    });

    // Aggregator task. If it dies outside shutdown the in-memory candle
    // state can no longer be trusted, so the process aborts.
    let aggregator_task = tokio::spawn(
        state.aggregator.clone().run(state.tick_queue.clone()),
    );
    {
        let shutting_down = shutting_down.clone();
        let watchdog = aggregator_task;
        tokio::spawn(async move {
            let result = watchdog.await;
            if !shutting_down.load(Ordering::SeqCst) {
                tracing::error!("aggregator exited unexpectedly: {result:?}");
                std::process::exit(1);
            }
        });
    }

    // Bring persisted watchlist symbols back to life before serving.
    match state.subscriptions.rehydrate_on_start().await {
        Ok(n) => tracing::info!("rehydrated {n} symbols from the watchlist"),
        Err(e) => tracing::error!("watchlist rehydrate failed: {e}"),
    }

    let app = routes::api_router()
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("cannot bind {listen_addr}: {e}");
            std::process::exit(2);
        }
    };
    tracing::info!("market hub listening on http://{listen_addr}");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("server error: {e}");
    }

    // Drain: let the aggregator finish queued ticks for a bounded grace
    // period, close the upstream, flush open buckets, then exit.
    shutting_down.store(true, Ordering::SeqCst);
    state.tick_queue.close();

    let drain_deadline = tokio::time::Instant::now() + grace;
    while !state.tick_queue.is_empty() && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    state.feed.shutdown();
    state.aggregator.flush_open_buckets();
    tracing::info!("shutdown complete");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    tracing::info!("shutdown signal received, gracefully stopping…");
}
