pub mod api;
mod refresh;
mod supervisor;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, watch};

use crate::cache::QuoteCache;
use crate::constants::{
    API_BIND_ADDR, FEED_TICK_INTERVAL_MS, RECONNECT_BACKOFF_SECS, SUBSCRIPTION_REFRESH_SECS,
};
use crate::feed::{EventReceiver, FeedClient, FeedEvent, SimulatedFeed, SimulatedFeedConfig};
use crate::logging;

pub use refresh::refresh_subscriptions;
pub use supervisor::ConnectionState;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub reconnect_backoff: Duration,
    pub refresh_interval: Duration,
    /// Symbols subscribed before the first connection attempt.
    pub symbols: Vec<String>,
    pub feed: SimulatedFeedConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: API_BIND_ADDR,
            reconnect_backoff: Duration::from_secs(RECONNECT_BACKOFF_SECS),
            refresh_interval: Duration::from_secs(SUBSCRIPTION_REFRESH_SECS),
            symbols: Vec::new(),
            feed: SimulatedFeedConfig::default(),
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct ServeArgs {
    /// Address the HTTP API listens on
    #[arg(long, default_value_t = API_BIND_ADDR)]
    pub bind: SocketAddr,

    /// Seconds to wait before reconnecting after a feed failure
    #[arg(long, default_value_t = RECONNECT_BACKOFF_SECS)]
    pub reconnect_backoff_secs: u64,

    /// Seconds between subscription refresh passes
    #[arg(long, default_value_t = SUBSCRIPTION_REFRESH_SECS)]
    pub refresh_secs: u64,

    /// Interval between simulated feed ticks in milliseconds
    #[arg(long, default_value_t = FEED_TICK_INTERVAL_MS)]
    pub tick_interval_ms: u64,

    /// Subscribe to a symbol on startup (repeatable)
    #[arg(short, long = "symbol")]
    pub symbols: Vec<String>,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            bind: API_BIND_ADDR,
            reconnect_backoff_secs: RECONNECT_BACKOFF_SECS,
            refresh_secs: SUBSCRIPTION_REFRESH_SECS,
            tick_interval_ms: FEED_TICK_INTERVAL_MS,
            symbols: Vec::new(),
        }
    }
}

impl From<ServeArgs> for RelayConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            bind_addr: args.bind,
            reconnect_backoff: Duration::from_secs(args.reconnect_backoff_secs),
            refresh_interval: Duration::from_secs(args.refresh_secs),
            symbols: args.symbols,
            feed: SimulatedFeedConfig {
                tick_interval: Duration::from_millis(args.tick_interval_ms),
                ..SimulatedFeedConfig::default()
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownSignal {
    None,
    Graceful,
    Immediate,
}

/// Resolves once a shutdown has been requested or the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<ShutdownSignal>) {
    loop {
        if !matches!(*shutdown.borrow_and_update(), ShutdownSignal::None) {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub async fn run_with_config(config: RelayConfig) -> Result<()> {
    let feed: Arc<dyn FeedClient> = Arc::new(SimulatedFeed::new(config.feed.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);
    let (reload_tx, reload_rx) = broadcast::channel::<()>(16);

    let signals_task = tokio::spawn(handle_signals(shutdown_tx.clone(), reload_tx));

    let run_result = run_with_feed(config, feed, shutdown_rx, reload_rx).await;

    signals_task.abort();
    let _ = signals_task.await;
    drop(shutdown_tx);

    run_result
}

/// Runs the supervisor, dispatcher, refresh loop and HTTP API against
/// `feed` until `shutdown` fires.
pub async fn run_with_feed(
    config: RelayConfig,
    feed: Arc<dyn FeedClient>,
    shutdown: watch::Receiver<ShutdownSignal>,
    reload: broadcast::Receiver<()>,
) -> Result<()> {
    for symbol in &config.symbols {
        feed.subscribe(symbol);
    }

    let cache = QuoteCache::new();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

    let api_state = api::AppState {
        cache: cache.clone(),
        feed: Arc::clone(&feed),
        connection: state_rx,
    };

    logging::info(
        "relay.start",
        "Quote relay starting",
        json!({
            "bind_addr": config.bind_addr.to_string(),
            "reconnect_backoff_ms": config.reconnect_backoff.as_millis() as u64,
            "refresh_interval_ms": config.refresh_interval.as_millis() as u64,
            "symbols": config.symbols,
        }),
    );

    tokio::try_join!(
        supervisor::run_reconnect_loop(
            Arc::clone(&feed),
            event_tx,
            config.reconnect_backoff,
            state_tx,
            shutdown.clone()
        ),
        run_dispatcher(cache.clone(), event_rx, shutdown.clone()),
        refresh::run_refresh_loop(
            cache,
            Arc::clone(&feed),
            config.refresh_interval,
            reload,
            shutdown.clone()
        ),
        api::run_api_server(config.bind_addr, api_state, shutdown),
    )?;

    logging::info_simple("relay.stop", "Quote relay stopped");
    Ok(())
}

async fn handle_signals(
    shutdown_tx: watch::Sender<ShutdownSignal>,
    reload_tx: broadcast::Sender<()>,
) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to register SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                logging::info(
                    "signal.received",
                    "SIGTERM received, initiating graceful shutdown",
                    json!({ "signal": "SIGTERM" })
                );
                let _ = shutdown_tx.send(ShutdownSignal::Graceful);
                break;
            }
            _ = sigint.recv() => {
                logging::warn(
                    "signal.received",
                    "SIGINT received, stopping immediately",
                    json!({ "signal": "SIGINT" })
                );
                let _ = shutdown_tx.send(ShutdownSignal::Immediate);
                break;
            }
            _ = sighup.recv() => {
                logging::info(
                    "signal.received",
                    "SIGHUP received, refreshing subscriptions",
                    json!({ "signal": "SIGHUP" })
                );
                let _ = reload_tx.send(());
            }
        }
    }

    Ok(())
}

/// Drains feed events into the cache. This is the only writer of quote data.
pub(crate) async fn run_dispatcher(
    cache: QuoteCache,
    mut events: EventReceiver,
    mut shutdown: watch::Receiver<ShutdownSignal>,
) -> Result<()> {
    logging::info_simple("dispatch.start", "Feed dispatcher started");

    loop {
        tokio::select! {
            maybe_event = events.recv() => {
                match maybe_event {
                    Some(FeedEvent::Quote { symbol, quote }) => {
                        match cache.apply_update(&symbol, quote).await {
                            Ok(applied) if applied.created => {
                                logging::info(
                                    "cache.symbol_added",
                                    "First quote cached for symbol",
                                    json!({ "symbol": symbol, "price": applied.price })
                                );
                            }
                            Ok(_) => {}
                            Err(err) => {
                                logging::warn(
                                    "dispatch.quote_rejected",
                                    "Dropped quote that failed validation",
                                    json!({ "symbol": symbol, "error": err.to_string() })
                                );
                            }
                        }
                    }
                    Some(FeedEvent::Error { error, context }) => {
                        logging::error(
                            "feed.error",
                            "Feed reported an error",
                            json!({ "error": error, "context": context })
                        );
                    }
                    None => break,
                }
            }
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }

    logging::info_simple("dispatch.stop", "Feed dispatcher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote::Quote;

    #[tokio::test]
    async fn dispatcher_applies_quotes_and_skips_invalid_ones() {
        let cache = QuoteCache::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);

        tx.send(FeedEvent::Quote {
            symbol: "AAPL".into(),
            quote: Quote::scaled(15_000.0, 100),
        })
        .unwrap();
        tx.send(FeedEvent::Error {
            error: "socket reset".into(),
            context: "read".into(),
        })
        .unwrap();
        tx.send(FeedEvent::Quote {
            symbol: "AAPL".into(),
            quote: Quote::scaled(1.0, 0),
        })
        .unwrap();
        tx.send(FeedEvent::Quote {
            symbol: "AAPL".into(),
            quote: Quote::scaled(16_500.0, 100),
        })
        .unwrap();
        drop(tx);

        run_dispatcher(cache.clone(), rx, shutdown_rx)
            .await
            .expect("dispatcher");

        let entry = cache.get("AAPL").await.expect("cached");
        assert_eq!(entry.previous.and_then(|q| q.price), Some(150.0));
        assert_eq!(entry.current.and_then(|q| q.price), Some(165.0));
        let change = entry.percentage_change.expect("change");
        assert!((change - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn dispatcher_stops_on_shutdown() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);

        let handle = tokio::spawn(run_dispatcher(QuoteCache::new(), rx, shutdown_rx));
        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();

        handle.await.expect("join").expect("dispatcher");
    }

    #[test]
    fn serve_args_map_onto_relay_config() {
        let config = RelayConfig::from(ServeArgs {
            reconnect_backoff_secs: 2,
            tick_interval_ms: 50,
            symbols: vec!["BTCUSD".into()],
            ..ServeArgs::default()
        });
        assert_eq!(config.bind_addr, API_BIND_ADDR);
        assert_eq!(config.reconnect_backoff, Duration::from_secs(2));
        assert_eq!(config.refresh_interval, Duration::from_secs(600));
        assert_eq!(config.feed.tick_interval, Duration::from_millis(50));
        assert_eq!(config.symbols, vec!["BTCUSD".to_string()]);
    }
}
