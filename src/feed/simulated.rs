use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::constants::{FEED_PRICE_SCALE, FEED_TICK_INTERVAL_MS};
use crate::logging;
use crate::quote::Quote;

use super::{EventSender, FeedClient, FeedEvent, FeedSession};

#[derive(Clone, Debug)]
pub struct SimulatedFeedConfig {
    pub tick_interval: Duration,
    pub price_scale: u32,
    /// Drop every session after this long, to exercise reconnects.
    pub session_lifetime: Option<Duration>,
    pub seed: Option<u64>,
}

impl Default for SimulatedFeedConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(FEED_TICK_INTERVAL_MS),
            price_scale: FEED_PRICE_SCALE,
            session_lifetime: None,
            seed: None,
        }
    }
}

/// In-process feed that random-walks raw integer prices for every
/// subscribed symbol. Subscriptions outlive sessions, like a vendor client
/// that replays its symbol list after reconnecting.
pub struct SimulatedFeed {
    config: SimulatedFeedConfig,
    subscriptions: watch::Sender<BTreeSet<String>>,
}

impl SimulatedFeed {
    pub fn new(config: SimulatedFeedConfig) -> Self {
        let (subscriptions, _) = watch::channel(BTreeSet::new());
        Self {
            config,
            subscriptions,
        }
    }

    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.subscriptions.borrow().clone()
    }
}

#[async_trait]
impl FeedClient for SimulatedFeed {
    async fn connect(&self, events: EventSender) -> Result<FeedSession> {
        if self.config.tick_interval.is_zero() {
            bail!("simulated feed tick interval must be non-zero");
        }
        if self.config.price_scale == 0 {
            bail!("simulated feed price scale must be non-zero");
        }

        logging::info(
            "feed.simulated.connect",
            "Simulated feed session opened",
            json!({ "symbols": self.subscriptions.borrow().len() }),
        );

        Ok(FeedSession::spawn(run_session(
            self.config.clone(),
            self.subscriptions.subscribe(),
            events,
        )))
    }

    fn subscribe(&self, symbol: &str) {
        self.subscriptions.send_if_modified(|set| set.insert(symbol.to_string()));
    }

    fn unsubscribe(&self, symbol: &str) {
        self.subscriptions.send_if_modified(|set| set.remove(symbol));
    }
}

async fn run_session(
    config: SimulatedFeedConfig,
    subscriptions: watch::Receiver<BTreeSet<String>>,
    events: EventSender,
) -> Result<()> {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let scale = f64::from(config.price_scale);
    let mut raw_prices: HashMap<String, f64> = HashMap::new();

    let mut ticker = time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let expiry = config.session_lifetime.map(|lifetime| Instant::now() + lifetime);
    let expired = async move {
        match expiry {
            Some(deadline) => time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expired);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut expired => {
                bail!("simulated feed session reached its lifetime");
            }
        }

        let symbols = subscriptions.borrow().clone();
        raw_prices.retain(|symbol, _| symbols.contains(symbol));

        for symbol in symbols {
            let raw = raw_prices
                .entry(symbol.clone())
                .or_insert_with(|| (rng.gen_range(20.0..400.0) * scale).round());
            let shock: f64 = rng.sample(StandardNormal);
            *raw = (*raw * (1.0 + shock * 0.002)).round().max(1.0);

            let quote = Quote::scaled(*raw, config.price_scale)
                .field("volume", rng.gen_range(1..5_000u32))
                .field("timestamp_ms", logging::current_timestamp_ms() as u64);

            if events.send(FeedEvent::Quote { symbol, quote }).is_err() {
                // Dispatcher is gone; nothing left to feed.
                return Ok(());
            }
        }
    }
}
