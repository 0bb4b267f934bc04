//! Streaming feed abstraction.
//!
//! A feed client owns the upstream connection and the set of symbols it
//! should stream. Quotes and errors are pushed onto an unbounded channel
//! that a single dispatcher drains into the cache.

mod simulated;

use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use crate::quote::Quote;

pub use simulated::{SimulatedFeed, SimulatedFeedConfig};

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Quote { symbol: String, quote: Quote },
    Error { error: String, context: String },
}

pub type EventSender = mpsc::UnboundedSender<FeedEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<FeedEvent>;

#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Opens a connection. An `Err` means the connection could not be
    /// established at all; otherwise the returned session runs until the
    /// upstream goes away.
    async fn connect(&self, events: EventSender) -> Result<FeedSession>;

    /// Adds `symbol` to the streamed set. Never blocks; re-subscribing is a no-op.
    fn subscribe(&self, symbol: &str);

    fn unsubscribe(&self, symbol: &str);
}

/// A live feed connection running on its own task.
pub struct FeedSession {
    handle: JoinHandle<Result<()>>,
}

impl FeedSession {
    pub fn spawn<F>(session: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(session),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    /// Resolves once the connection ends. An aborted session counts as a clean end.
    pub async fn finished(self) -> Result<()> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(anyhow::Error::new(err).context("feed session task panicked")),
        }
    }
}
