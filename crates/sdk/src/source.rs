use std::time::Duration;

use crate::error::SourceError;

/// A message received from a broker, not yet acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Topic or channel the message was published on.
    pub topic: String,
    /// Raw envelope bytes.
    pub payload: Vec<u8>,
    /// Broker offset, for backends that track a durable consumer position.
    pub position: Option<u64>,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Delivery {
            topic: topic.into(),
            payload: payload.into(),
            position: None,
        }
    }

    pub fn at(mut self, position: u64) -> Self {
        self.position = Some(position);
        self
    }
}

/// Result of waiting for the next message.
#[derive(Debug)]
pub enum Fetched {
    Message(Delivery),
    /// Nothing arrived within the timeout.
    Empty,
    /// The stream ended; no further messages will be produced.
    Closed,
}

/// Capability to open a subscription on a broker.
///
/// Poll-based and stream-based brokers both expose the same shape, so the
/// consumer loop never needs to know which one it is reading from.
pub trait EventBroker: Send + Sync {
    type Source: EventSource + 'static;

    /// Acquires a handle to the message stream for topics matching `pattern`.
    fn subscribe(&self, pattern: &str) -> impl Future<Output = Result<Self::Source, SourceError>> + Send;
}

/// An open subscription.
pub trait EventSource: Send {
    /// Waits at most `timeout` for the next message.
    fn fetch(&mut self, timeout: Duration) -> impl Future<Output = Result<Fetched, SourceError>> + Send;

    /// Marks a delivery as consumed so it is never redelivered.
    fn ack(&mut self, delivery: &Delivery) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Releases the subscription.
    fn close(self) -> impl Future<Output = Result<(), SourceError>> + Send
    where
        Self: Sized;
}
