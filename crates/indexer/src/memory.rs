//! In-process broker and search index.
//!
//! The broker keeps every published message in an append-only log with
//! 1-based positions and a single committed offset, so a new subscription
//! resumes after the last acknowledged message the way a consumer group does.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use todo_sdk::{
    error::{PublishError, SearchError, SourceError},
    event::{TaskEvent, topic_matches},
    publish::Publisher,
    search::SearchIndex,
    source::{Delivery, EventBroker, EventSource, Fetched},
    task::Task,
};
use tokio::{sync::Notify, time::Instant};
use tracing::debug;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    log: Mutex<Log>,
    notify: Notify,
}

#[derive(Default)]
struct Log {
    messages: Vec<Delivery>,
    committed: Option<u64>,
    acks: Vec<u64>,
    closed: bool,
    refuse_subscriptions: bool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw message and returns its position.
    pub fn publish_raw(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> u64 {
        let position = {
            let mut log = self.shared.lock();
            let position = log.messages.len() as u64 + 1;
            log.messages
                .push(Delivery::new(topic, payload).at(position));
            position
        };
        self.shared.notify.notify_waiters();
        position
    }

    /// Positions acknowledged so far, in acknowledgement order.
    pub fn acked(&self) -> Vec<u64> {
        self.shared.lock().acks.clone()
    }

    /// Highest acknowledged position.
    pub fn committed(&self) -> Option<u64> {
        self.shared.lock().committed
    }

    pub fn len(&self) -> usize {
        self.shared.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ends every subscription's stream once its remaining messages are read.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Makes subsequent subscriptions fail, simulating an unreachable broker.
    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.shared.lock().refuse_subscriptions = refuse;
    }
}

impl Publisher for MemoryBroker {
    async fn publish(&self, event: &TaskEvent) -> Result<(), PublishError> {
        let payload = event.encode()?;
        self.publish_raw(event.kind().topic(), payload);
        Ok(())
    }
}

impl EventBroker for MemoryBroker {
    type Source = MemorySource;

    async fn subscribe(&self, pattern: &str) -> Result<Self::Source, SourceError> {
        let log = self.shared.lock();
        if log.refuse_subscriptions {
            return Err(SourceError::backend("memory broker refused the subscription"));
        }

        Ok(MemorySource {
            shared: Arc::clone(&self.shared),
            pattern: pattern.to_string(),
            cursor: log.committed.unwrap_or(0) as usize,
        })
    }
}

pub struct MemorySource {
    shared: Arc<Shared>,
    pattern: String,
    /// Index into the log of the next message to read.
    cursor: usize,
}

impl EventSource for MemorySource {
    async fn fetch(&mut self, timeout: Duration) -> Result<Fetched, SourceError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.shared.notify.notified();
            {
                let log = self.shared.lock();
                let start = self.cursor.min(log.messages.len());
                let next = log.messages[start..]
                    .iter()
                    .position(|delivery| topic_matches(&self.pattern, &delivery.topic));
                if let Some(offset) = next {
                    let delivery = log.messages[start + offset].clone();
                    self.cursor = start + offset + 1;
                    return Ok(Fetched::Message(delivery));
                }
                self.cursor = log.messages.len();
                if log.closed {
                    return Ok(Fetched::Closed);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Fetched::Empty);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), SourceError> {
        let Some(position) = delivery.position else {
            return Err(SourceError::MissingPosition(delivery.topic.clone()));
        };

        let mut log = self.shared.lock();
        log.acks.push(position);
        log.committed = log.committed.max(Some(position));
        Ok(())
    }

    async fn close(self) -> Result<(), SourceError> {
        debug!(pattern = %self.pattern, "memory subscription closed");
        Ok(())
    }
}

/// A call made against a [`MemoryIndex`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexOperation {
    Index(Task),
    Delete(String),
}

/// Search index holding documents in a map, recording every call made to it.
#[derive(Clone, Default)]
pub struct MemoryIndex {
    inner: Arc<Mutex<IndexState>>,
}

#[derive(Default)]
struct IndexState {
    documents: BTreeMap<String, Task>,
    operations: Vec<IndexOperation>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().documents.get(id).cloned()
    }

    pub fn documents(&self) -> BTreeMap<String, Task> {
        self.lock().documents.clone()
    }

    /// Every call received, including deletes of absent documents.
    pub fn operations(&self) -> Vec<IndexOperation> {
        self.lock().operations.clone()
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SearchIndex for MemoryIndex {
    async fn index(&self, task: &Task) -> Result<(), SearchError> {
        let mut state = self.lock();
        state.operations.push(IndexOperation::Index(task.clone()));
        state.documents.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SearchError> {
        let mut state = self.lock();
        state.operations.push(IndexOperation::Delete(id.to_string()));
        match state.documents.remove(id) {
            Some(_) => Ok(()),
            None => Err(SearchError::NotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    async fn next_message(source: &mut MemorySource) -> Delivery {
        match source.fetch(WAIT).await.unwrap() {
            Fetched::Message(delivery) => delivery,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn filters_by_topic_pattern() {
        let broker = MemoryBroker::new();
        broker.publish_raw("users.event.created", "x");
        broker.publish_raw("tasks.event.deleted", "y");

        let mut source = broker.subscribe("tasks.*").await.unwrap();

        let delivery = next_message(&mut source).await;
        assert_eq!(delivery.topic, "tasks.event.deleted");
        assert_eq!(delivery.position, Some(2));
        assert!(matches!(source.fetch(WAIT).await.unwrap(), Fetched::Empty));
    }

    #[tokio::test]
    async fn wakes_up_on_publish() {
        let broker = MemoryBroker::new();
        let mut source = broker.subscribe("tasks.*").await.unwrap();

        let publisher = broker.clone();
        let fetch = tokio::spawn(async move { source.fetch(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        publisher
            .publish(&TaskEvent::Deleted("abc".into()))
            .await
            .unwrap();

        let fetched = fetch.await.unwrap().unwrap();
        assert!(matches!(fetched, Fetched::Message(delivery) if delivery.topic == "tasks.event.deleted"));
    }

    #[tokio::test]
    async fn new_subscriptions_resume_after_committed_offset() {
        let broker = MemoryBroker::new();
        broker.publish_raw("tasks.event.created", "1");
        broker.publish_raw("tasks.event.created", "2");
        broker.publish_raw("tasks.event.created", "3");

        let mut first = broker.subscribe("tasks.*").await.unwrap();
        let delivery = next_message(&mut first).await;
        first.ack(&delivery).await.unwrap();
        // Fetched but never acknowledged.
        next_message(&mut first).await;
        first.close().await.unwrap();

        let mut second = broker.subscribe("tasks.*").await.unwrap();
        assert_eq!(next_message(&mut second).await.position, Some(2));
    }

    #[tokio::test]
    async fn closed_broker_ends_stream_after_backlog() {
        let broker = MemoryBroker::new();
        broker.publish_raw("tasks.event.created", "1");
        broker.close();

        let mut source = broker.subscribe("tasks.*").await.unwrap();

        next_message(&mut source).await;
        assert!(matches!(source.fetch(WAIT).await.unwrap(), Fetched::Closed));
    }

    #[tokio::test]
    async fn ack_requires_position() {
        let broker = MemoryBroker::new();
        let mut source = broker.subscribe("tasks.*").await.unwrap();

        let err = source
            .ack(&Delivery::new("tasks.event.created", "x"))
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::MissingPosition(_)));
    }

    #[tokio::test]
    async fn refused_subscription_fails() {
        let broker = MemoryBroker::new();
        broker.refuse_subscriptions(true);

        assert!(broker.subscribe("tasks.*").await.is_err());
    }

    #[tokio::test]
    async fn index_deletes_of_absent_documents_are_not_found() {
        let index = MemoryIndex::new();

        let err = index.delete("abc").await.unwrap_err();

        assert!(matches!(err, SearchError::NotFound(id) if id == "abc"));
        assert_eq!(index.operations(), vec![IndexOperation::Delete("abc".into())]);
    }
}
