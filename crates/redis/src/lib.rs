//! Subscribe-based task event broker backed by Redis pub/sub.
//!
//! Messages are pushed to connected subscribers only. Nothing is retained, so
//! acknowledgement is a no-op and a message whose apply failed is lost.

use std::{pin::Pin, time::Duration};

use futures_util::{Stream, StreamExt};
use redis::{AsyncCommands, Client, Msg, RedisResult, aio::MultiplexedConnection};
use todo_sdk::{
    error::{PublishError, SourceError},
    event::TaskEvent,
    publish::Publisher,
    source::{Delivery, EventBroker, EventSource, Fetched},
};
use tracing::{debug, info, trace};

type MessageStream = Pin<Box<dyn Stream<Item = Msg> + Send>>;

#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
}

impl RedisBroker {
    pub fn new(client: Client) -> Self {
        RedisBroker { client }
    }

    /// Validates `url` without connecting.
    pub fn open(url: &str) -> RedisResult<Self> {
        Ok(RedisBroker::new(Client::open(url)?))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Connects a publisher to the same server.
    pub async fn publisher(&self) -> RedisResult<RedisPublisher> {
        RedisPublisher::connect(&self.client).await
    }
}

impl EventBroker for RedisBroker {
    type Source = RedisSource;

    async fn subscribe(&self, pattern: &str) -> Result<Self::Source, SourceError> {
        if pattern.is_empty() {
            return Err(SourceError::InvalidPattern(pattern.to_string()));
        }

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(SourceError::backend)?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(SourceError::backend)?;

        info!(pattern, "subscribed to redis channels");

        Ok(RedisSource {
            pattern: pattern.to_string(),
            messages: Box::pin(pubsub.into_on_message()),
        })
    }
}

pub struct RedisSource {
    pattern: String,
    messages: MessageStream,
}

impl EventSource for RedisSource {
    async fn fetch(&mut self, timeout: Duration) -> Result<Fetched, SourceError> {
        match tokio::time::timeout(timeout, self.messages.next()).await {
            Ok(Some(msg)) => Ok(Fetched::Message(delivery(&msg))),
            Ok(None) => Ok(Fetched::Closed),
            Err(_) => Ok(Fetched::Empty),
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), SourceError> {
        trace!(topic = %delivery.topic, "pub/sub messages need no acknowledgement");
        Ok(())
    }

    async fn close(self) -> Result<(), SourceError> {
        // Dropping the stream closes the pub/sub connection.
        drop(self.messages);
        debug!(pattern = %self.pattern, "redis subscription closed");
        Ok(())
    }
}

fn delivery(msg: &Msg) -> Delivery {
    Delivery::new(msg.get_channel_name(), msg.get_payload_bytes())
}

/// Publishes task events on the channel named after their kind.
#[derive(Clone)]
pub struct RedisPublisher {
    connection: MultiplexedConnection,
}

impl RedisPublisher {
    pub fn new(connection: MultiplexedConnection) -> Self {
        RedisPublisher { connection }
    }

    pub async fn connect(client: &Client) -> RedisResult<Self> {
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(RedisPublisher::new(connection))
    }
}

impl Publisher for RedisPublisher {
    async fn publish(&self, event: &TaskEvent) -> Result<(), PublishError> {
        let topic = event.kind().topic();
        let payload = event.encode()?;

        let mut connection = self.connection.clone();
        let receivers: i64 = connection
            .publish(topic, payload)
            .await
            .map_err(|err| PublishError::backend(topic, err))?;

        debug!(topic, task_id = event.task_id(), receivers, "published task event");
        Ok(())
    }
}
