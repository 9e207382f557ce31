use std::{fmt, sync::Arc, time::Duration};

use todo_sdk::{
    event::{Envelope, TaskEvent},
    source::{Delivery, EventSource, Fetched},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Reacts to decoded task events.
pub trait EventHandler: Send {
    type Error: fmt::Display + Send;

    /// Applies one event. An error leaves the message unacknowledged.
    fn handle(&mut self, event: &TaskEvent) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Lifecycle of a consumer loop.
///
/// `Idle → Running → Draining → Stopped`, or `Running → Stopped` when the
/// broker closes the stream on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Per-outcome message counts for one run of the loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Applied to the index and acknowledged.
    pub applied: u64,
    /// Unknown event type, acknowledged without being applied.
    pub ignored: u64,
    /// Undecodable, acknowledged and dropped.
    pub discarded: u64,
    /// Apply failed, left unacknowledged.
    pub failed: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Applied => self.applied += 1,
            Outcome::Ignored => self.ignored += 1,
            Outcome::Discarded => self.discarded += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Applied,
    Ignored,
    Discarded,
    Failed,
}

/// Reads events from a source one at a time and hands them to a handler.
///
/// Messages are processed strictly in delivery order. The stop signal is
/// observed between messages and while waiting for the next one, never while
/// a message is being applied.
pub struct ConsumerLoop<S, H> {
    source: S,
    handler: H,
    poll_interval: Duration,
    shutdown: CancellationToken,
    state: Arc<watch::Sender<ConsumerState>>,
    stats: ConsumerStats,
}

impl<S, H> ConsumerLoop<S, H>
where
    S: EventSource,
    H: EventHandler,
{
    pub fn new(
        source: S,
        handler: H,
        poll_interval: Duration,
        shutdown: CancellationToken,
        state: Arc<watch::Sender<ConsumerState>>,
    ) -> Self {
        ConsumerLoop {
            source,
            handler,
            poll_interval,
            shutdown,
            state,
            stats: ConsumerStats::default(),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Runs until the stop signal fires or the stream closes, then closes the source.
    pub async fn run(mut self) -> ConsumerStats {
        mark_running(&self.state);
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "consuming task events"
        );

        while self.next().await {}

        if self.shutdown.is_cancelled() {
            mark_draining(&self.state);
        }

        let ConsumerLoop {
            source,
            state,
            stats,
            ..
        } = self;

        if let Err(err) = source.close().await {
            warn!(error = %err, "failed to close event source");
        }

        info!(
            applied = stats.applied,
            ignored = stats.ignored,
            discarded = stats.discarded,
            failed = stats.failed,
            "no more messages to consume, exiting"
        );
        state.send_replace(ConsumerState::Stopped);

        stats
    }

    /// Fetches and processes at most one message.
    ///
    /// Returns `false` once the loop should exit.
    pub async fn next(&mut self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }

        let fetched = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return false,
            fetched = self.source.fetch(self.poll_interval) => fetched,
        };

        match fetched {
            Ok(Fetched::Message(delivery)) => {
                let outcome = self.process(delivery).await;
                self.stats.record(outcome);
                true
            }
            Ok(Fetched::Empty) => {
                trace!("no message within poll interval");
                true
            }
            Ok(Fetched::Closed) => {
                info!("event stream closed");
                false
            }
            Err(err) => {
                warn!(error = %err, "failed to fetch next message");
                tokio::select! {
                    _ = self.shutdown.cancelled() => false,
                    _ = tokio::time::sleep(self.poll_interval) => true,
                }
            }
        }
    }

    async fn process(&mut self, delivery: Delivery) -> Outcome {
        let envelope = match Envelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(topic = %delivery.topic, error = %err, "ignoring message, invalid envelope");
                self.ack(&delivery).await;
                return Outcome::Discarded;
            }
        };
        let event_type = envelope.event_type.clone();

        let event = match TaskEvent::from_envelope(envelope) {
            Some(Ok(event)) => event,
            Some(Err(err)) => {
                warn!(topic = %delivery.topic, event_type = %event_type, error = %err, "ignoring message, invalid payload");
                self.ack(&delivery).await;
                return Outcome::Discarded;
            }
            None => {
                debug!(topic = %delivery.topic, event_type = %event_type, "ignoring message, unknown event type");
                self.ack(&delivery).await;
                return Outcome::Ignored;
            }
        };

        match self.handler.handle(&event).await {
            Ok(()) => {
                info!(event_type = %event_type, task_id = event.task_id(), "consumed");
                self.ack(&delivery).await;
                Outcome::Applied
            }
            Err(err) => {
                warn!(
                    event_type = %event_type,
                    task_id = event.task_id(),
                    error = %err,
                    "failed to apply event, leaving it unacknowledged"
                );
                Outcome::Failed
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) {
        if let Err(err) = self.source.ack(delivery).await {
            error!(topic = %delivery.topic, position = ?delivery.position, error = %err, "commit failed");
        }
    }
}

pub(crate) fn mark_running(state: &watch::Sender<ConsumerState>) {
    transition(state, ConsumerState::Idle, ConsumerState::Running);
}

pub(crate) fn mark_draining(state: &watch::Sender<ConsumerState>) {
    transition(state, ConsumerState::Running, ConsumerState::Draining);
}

fn transition(state: &watch::Sender<ConsumerState>, from: ConsumerState, to: ConsumerState) {
    state.send_if_modified(|state| {
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    });
}
