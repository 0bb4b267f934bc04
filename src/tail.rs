use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio::sync::mpsc;

use crate::cache::QuoteCache;
use crate::constants::FEED_TICK_INTERVAL_MS;
use crate::feed::{FeedClient, FeedEvent, SimulatedFeed, SimulatedFeedConfig};

#[derive(Debug, Args, Clone)]
pub struct TailArgs {
    /// Symbol to stream (repeatable, e.g. -s AAPL -s MSFT)
    #[arg(short, long = "symbol", required = true)]
    pub symbols: Vec<String>,

    /// Stop after printing this many quotes
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Interval between simulated feed ticks in milliseconds
    #[arg(long, default_value_t = FEED_TICK_INTERVAL_MS)]
    pub tick_interval_ms: u64,
}

pub async fn run(args: TailArgs) -> Result<()> {
    let feed = SimulatedFeed::new(SimulatedFeedConfig {
        tick_interval: Duration::from_millis(args.tick_interval_ms),
        ..SimulatedFeedConfig::default()
    });
    for symbol in &args.symbols {
        feed.subscribe(symbol);
    }

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let session = feed
        .connect(events_tx)
        .await
        .context("failed to open simulated feed session")?;
    let abort = session.abort_handle();

    let cache = QuoteCache::new();
    let mut printed = 0usize;
    println!("Streaming simulated quotes for {}...", args.symbols.join(", "));

    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Quote { symbol, quote } => {
                let applied = cache.apply_update(&symbol, quote).await?;
                println!(
                    "{:>12} | {:>14} | {:>10}",
                    symbol,
                    format_price(applied.price),
                    format_change(applied.percentage_change)
                );
                printed += 1;
            }
            FeedEvent::Error { error, context } => {
                eprintln!("feed error ({context}): {error}");
            }
        }

        if let Some(limit) = args.limit {
            if printed >= limit {
                break;
            }
        }
    }

    abort.abort();
    session.finished().await
}

fn format_price(price: Option<f64>) -> String {
    match price {
        Some(price) => format!("{price:.4}"),
        None => "-".to_string(),
    }
}

fn format_change(change: Option<f64>) -> String {
    match change {
        Some(change) => format!("{change:+.3}%"),
        None => "-".to_string(),
    }
}
