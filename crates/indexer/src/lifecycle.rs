use std::{sync::Arc, time::Duration};

use todo_sdk::source::EventBroker;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::{
    config::IndexerConfig,
    consumer::{ConsumerLoop, ConsumerState, ConsumerStats, EventHandler, mark_draining},
    error::IndexerError,
};

/// Owns the consumer loop's task: starts it, stops it, and reports how it ended.
pub struct Indexer<B, H> {
    broker: B,
    handler: Option<H>,
    config: IndexerConfig,
    shutdown: CancellationToken,
    state: Arc<watch::Sender<ConsumerState>>,
    done: Option<oneshot::Receiver<ConsumerStats>>,
}

impl<B, H> Indexer<B, H>
where
    B: EventBroker,
    H: EventHandler + 'static,
{
    pub fn new(broker: B, handler: H, config: IndexerConfig) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);

        Indexer {
            broker,
            handler: Some(handler),
            config,
            shutdown: CancellationToken::new(),
            state: Arc::new(state),
            done: None,
        }
    }

    /// Uses `token` as the stop signal, so a parent token can stop the indexer too.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Subscribes to the broker and launches the consumer loop.
    ///
    /// Returns as soon as the loop's task is spawned. A subscription failure
    /// is returned directly and nothing is spawned. Once the stop signal has
    /// fired the indexer cannot be started.
    pub async fn start(&mut self) -> Result<(), IndexerError> {
        if self.shutdown.is_cancelled() {
            return Err(IndexerError::ShutDown);
        }
        let Some(handler) = self.handler.take() else {
            return Err(IndexerError::AlreadyStarted);
        };

        let pattern = self.config.get_topic_pattern().to_string();
        let source = match self.broker.subscribe(&pattern).await {
            Ok(source) => source,
            Err(err) => {
                error!(pattern = %pattern, error = %err, "failed to subscribe");
                self.handler = Some(handler);
                return Err(IndexerError::Subscribe {
                    pattern,
                    source: err,
                });
            }
        };

        let consumer = ConsumerLoop::new(
            source,
            handler,
            self.config.get_poll_interval(),
            self.shutdown.clone(),
            Arc::clone(&self.state),
        );
        let (done_tx, done_rx) = oneshot::channel();
        let span = info_span!("consumer", pattern = %pattern);

        self.state.send_replace(ConsumerState::Running);
        tokio::spawn(
            async move {
                let stats = consumer.run().await;
                let _ = done_tx.send(stats);
            }
            .instrument(span),
        );
        self.done = Some(done_rx);

        info!(pattern = %pattern, "indexer started");
        Ok(())
    }

    /// Signals the loop to drain and waits up to `deadline` for it to finish.
    ///
    /// On timeout the loop may still be applying its in-flight message.
    /// Shutting down an indexer that never started, or already stopped, succeeds.
    pub async fn shutdown(&mut self, deadline: Duration) -> Result<ConsumerStats, IndexerError> {
        info!("shutting down indexer");
        self.shutdown.cancel();
        mark_draining(&self.state);

        let Some(done) = self.done.as_mut() else {
            self.state.send_if_modified(|state| {
                let idle = *state == ConsumerState::Idle;
                if idle {
                    *state = ConsumerState::Stopped;
                }
                idle
            });
            return Ok(ConsumerStats::default());
        };

        match tokio::time::timeout(deadline, done).await {
            Ok(Ok(stats)) => {
                self.done = None;
                info!("shutdown completed");
                Ok(stats)
            }
            Ok(Err(_)) => {
                self.done = None;
                error!("consumer task ended without signalling completion");
                Err(IndexerError::ConsumerAborted)
            }
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "shutdown deadline exceeded");
                Err(IndexerError::ShutdownTimeout(deadline))
            }
        }
    }
}
