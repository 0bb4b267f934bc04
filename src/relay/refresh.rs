use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::cache::QuoteCache;
use crate::feed::FeedClient;
use crate::logging;

use super::{shutdown_requested, ShutdownSignal};

/// Re-issues a subscribe for every cached symbol and returns how many were sent.
pub async fn refresh_subscriptions(cache: &QuoteCache, feed: &dyn FeedClient) -> usize {
    let symbols = cache.symbols().await;
    for symbol in &symbols {
        feed.subscribe(symbol);
    }
    symbols.len()
}

pub(crate) async fn run_refresh_loop(
    cache: QuoteCache,
    feed: Arc<dyn FeedClient>,
    period: Duration,
    mut reload: broadcast::Receiver<()>,
    mut shutdown: watch::Receiver<ShutdownSignal>,
) -> Result<()> {
    logging::info(
        "refresh.start",
        "Subscription refresh loop started",
        json!({ "period_ms": period.as_millis() as u64 }),
    );

    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reload_open = true;

    loop {
        let trigger = tokio::select! {
            _ = ticker.tick() => "timer",
            recv = reload.recv(), if reload_open => {
                match recv {
                    Ok(()) => "reload",
                    Err(broadcast::error::RecvError::Lagged(_)) => "reload",
                    Err(broadcast::error::RecvError::Closed) => {
                        reload_open = false;
                        continue;
                    }
                }
            }
            _ = shutdown_requested(&mut shutdown) => break,
        };

        let refreshed = refresh_subscriptions(&cache, feed.as_ref()).await;
        logging::info(
            "refresh.done",
            "Re-subscribed tracked symbols",
            json!({ "trigger": trigger, "symbols": refreshed }),
        );
    }

    logging::info_simple("refresh.stop", "Subscription refresh loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::feed::{EventSender, FeedSession};
    use crate::quote::Quote;

    #[derive(Default)]
    struct RecordingFeed {
        subscribed: Mutex<Vec<String>>,
    }

    impl RecordingFeed {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.subscribed.lock().unwrap())
        }
    }

    #[async_trait]
    impl FeedClient for RecordingFeed {
        async fn connect(&self, _events: EventSender) -> Result<FeedSession> {
            anyhow::bail!("not used")
        }

        fn subscribe(&self, symbol: &str) {
            self.subscribed.lock().unwrap().push(symbol.to_string());
        }

        fn unsubscribe(&self, _symbol: &str) {}
    }

    async fn seeded_cache() -> QuoteCache {
        let cache = QuoteCache::new();
        for symbol in ["ETHUSD", "BTCUSD"] {
            cache
                .apply_update(symbol, Quote::with_price(1.0))
                .await
                .unwrap();
        }
        cache
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribes_every_cached_symbol_each_period() {
        let cache = seeded_cache().await;
        let feed = Arc::new(RecordingFeed::default());
        let (_reload_tx, reload_rx) = broadcast::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);

        let handle = tokio::spawn(run_refresh_loop(
            cache,
            feed.clone(),
            Duration::from_secs(600),
            reload_rx,
            shutdown_rx,
        ));

        time::sleep(Duration::from_secs(599)).await;
        assert!(feed.take().is_empty(), "nothing before the first period");

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(feed.take(), vec!["BTCUSD", "ETHUSD"]);

        time::sleep(Duration::from_secs(600)).await;
        assert_eq!(feed.take(), vec!["BTCUSD", "ETHUSD"]);

        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        handle.await.expect("join").expect("refresh loop");
    }

    #[tokio::test(start_paused = true)]
    async fn reload_signal_triggers_immediate_refresh() {
        let cache = seeded_cache().await;
        let feed = Arc::new(RecordingFeed::default());
        let (reload_tx, reload_rx) = broadcast::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);

        let handle = tokio::spawn(run_refresh_loop(
            cache,
            feed.clone(),
            Duration::from_secs(600),
            reload_rx,
            shutdown_rx,
        ));

        reload_tx.send(()).unwrap();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(feed.take().len(), 2);

        drop(reload_tx);
        time::sleep(Duration::from_secs(601)).await;
        assert_eq!(feed.take().len(), 2, "timer keeps running without reload channel");

        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        handle.await.expect("join").expect("refresh loop");
    }
}
