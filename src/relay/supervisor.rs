use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::time;

use crate::feed::{EventSender, FeedClient};
use crate::logging;

use super::{shutdown_requested, ShutdownSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Keeps the feed connected. Connect failures and ended sessions both wait
/// a constant `backoff` before the next attempt; only shutdown ends the loop.
pub(crate) async fn run_reconnect_loop(
    feed: Arc<dyn FeedClient>,
    events: EventSender,
    backoff: Duration,
    state: watch::Sender<ConnectionState>,
    mut shutdown: watch::Receiver<ShutdownSignal>,
) -> Result<()> {
    logging::info_simple("feed.supervisor.start", "Feed supervisor started");
    let mut attempt: u64 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        state.send_replace(ConnectionState::Connecting);

        let connected = tokio::select! {
            result = feed.connect(events.clone()) => result,
            _ = shutdown_requested(&mut shutdown) => break,
        };

        match connected {
            Ok(session) => {
                state.send_replace(ConnectionState::Connected);
                logging::info(
                    "feed.connected",
                    "Feed connection established",
                    json!({ "attempt": attempt }),
                );
                attempt = 0;

                let abort = session.abort_handle();
                let outcome = tokio::select! {
                    outcome = session.finished() => outcome,
                    _ = shutdown_requested(&mut shutdown) => {
                        abort.abort();
                        break;
                    }
                };
                state.send_replace(ConnectionState::Disconnected);

                match outcome {
                    Ok(()) => logging::warn(
                        "feed.disconnected",
                        "Feed session ended, reconnecting after backoff",
                        json!({ "retry_in_ms": backoff.as_millis() as u64 }),
                    ),
                    Err(err) => logging::error(
                        "feed.disconnected",
                        "Feed session failed, reconnecting after backoff",
                        json!({
                            "error": format!("{err:#}"),
                            "context": "session",
                            "retry_in_ms": backoff.as_millis() as u64,
                        }),
                    ),
                }
            }
            Err(err) => {
                state.send_replace(ConnectionState::Disconnected);
                logging::error(
                    "feed.connect_failed",
                    "Feed connection failed, retrying after backoff",
                    json!({
                        "error": format!("{err:#}"),
                        "context": "connect",
                        "attempt": attempt,
                        "retry_in_ms": backoff.as_millis() as u64,
                    }),
                );
            }
        }

        tokio::select! {
            _ = time::sleep(backoff) => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }

    state.send_replace(ConnectionState::Disconnected);
    logging::info_simple("feed.supervisor.stop", "Feed supervisor stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::Instant;

    use super::*;
    use crate::feed::FeedSession;

    enum Script {
        Fail,
        /// Session that ends when the paired sender fires or is dropped.
        Session(oneshot::Receiver<()>),
    }

    struct ScriptedFeed {
        script: Mutex<VecDeque<Script>>,
        attempts: Mutex<Vec<Instant>>,
    }

    impl ScriptedFeed {
        fn new(script: Vec<Script>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FeedClient for ScriptedFeed {
        async fn connect(&self, _events: EventSender) -> Result<FeedSession> {
            self.attempts.lock().unwrap().push(Instant::now());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Script::Fail) | None => Err(anyhow!("upstream refused connection")),
                Some(Script::Session(done)) => Ok(FeedSession::spawn(async move {
                    let _ = done.await;
                    Ok(())
                })),
            }
        }

        fn subscribe(&self, _symbol: &str) {}

        fn unsubscribe(&self, _symbol: &str) {}
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_constant_backoff_until_connected() {
        let (_end_tx, end_rx) = oneshot::channel();
        let feed = Arc::new(ScriptedFeed::new(vec![
            Script::Fail,
            Script::Fail,
            Script::Session(end_rx),
        ]));
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);

        let handle = tokio::spawn(run_reconnect_loop(
            feed.clone(),
            events,
            Duration::from_secs(5),
            state_tx,
            shutdown_rx,
        ));

        state_rx
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .expect("connected");

        let attempts = feed.attempts();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_secs(5), "retried after {gap:?}");
            assert!(gap < Duration::from_secs(6), "backoff grew to {gap:?}");
        }

        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        handle.await.expect("join").expect("supervisor");
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_session_ends() {
        let (first_end_tx, first_end_rx) = oneshot::channel();
        let (_second_end_tx, second_end_rx) = oneshot::channel();
        let feed = Arc::new(ScriptedFeed::new(vec![
            Script::Session(first_end_rx),
            Script::Session(second_end_rx),
        ]));
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (state_tx, mut state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);

        let handle = tokio::spawn(run_reconnect_loop(
            feed.clone(),
            events,
            Duration::from_secs(5),
            state_tx,
            shutdown_rx,
        ));

        state_rx
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .expect("first session");
        first_end_tx.send(()).unwrap();

        state_rx
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await
            .expect("session ended");
        state_rx
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .expect("second session");

        let attempts = feed.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] - attempts[0] >= Duration::from_secs(5));

        shutdown_tx.send(ShutdownSignal::Immediate).unwrap();
        handle.await.expect("join").expect("supervisor");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff() {
        let feed = Arc::new(ScriptedFeed::new(vec![Script::Fail]));
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);

        let handle = tokio::spawn(run_reconnect_loop(
            feed.clone(),
            events,
            Duration::from_secs(3600),
            state_tx,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        handle.await.expect("join").expect("supervisor");
        assert_eq!(feed.attempts().len(), 1);
    }
}
