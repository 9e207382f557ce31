use std::error::Error as StdError;

use thiserror::Error;

/// Boxed cause for errors raised by a concrete backend (database, broker, HTTP client).
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Error during event serialization/deserialization.
#[derive(Clone, Debug, Error)]
#[error("(de)serialization error: {message}")]
pub struct SerializationError {
    pub message: String,
}

impl SerializationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Error returned when an event could not be handed to the broker.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("failed to publish to `{topic}`: {source}")]
    Backend {
        topic: &'static str,
        #[source]
        source: BoxError,
    },
}

impl PublishError {
    pub fn backend(topic: &'static str, err: impl Into<BoxError>) -> Self {
        PublishError::Backend {
            topic,
            source: err.into(),
        }
    }
}

/// Error raised by an event source while subscribing, fetching or acknowledging.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The topic pattern cannot be expressed by the backend.
    #[error("invalid topic pattern `{0}`")]
    InvalidPattern(String),
    /// A delivery lacked the position the backend needs to acknowledge it.
    #[error("delivery on `{0}` has no position to acknowledge")]
    MissingPosition(String),
    /// The acknowledged position was concurrently moved by another consumer.
    #[error("offset for consumer group `{group}` moved concurrently")]
    OffsetConflict { group: String },
    /// Another consumer already holds the subscription for this group.
    #[error("consumer group `{group}` is already being consumed")]
    GroupBusy { group: String },
    #[error(transparent)]
    Backend(BoxError),
}

impl SourceError {
    pub fn backend(err: impl Into<BoxError>) -> Self {
        SourceError::Backend(err.into())
    }
}

/// Error returned by a search index collaborator.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The document does not exist in the index.
    #[error("document `{0}` not found")]
    NotFound(String),
    /// The search engine answered with a non-success status.
    #[error("search engine responded with {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Backend(BoxError),
}

impl SearchError {
    pub fn backend(err: impl Into<BoxError>) -> Self {
        SearchError::Backend(err.into())
    }
}
