use std::time::Duration;

use thiserror::Error;
use todo_sdk::error::{SearchError, SourceError};

/// Error returned by the lifecycle controller to the process supervisor.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// The broker stream could not be acquired. Fatal at startup.
    #[error("failed to subscribe to `{pattern}`: {source}")]
    Subscribe {
        pattern: String,
        #[source]
        source: SourceError,
    },
    #[error("indexer already started")]
    AlreadyStarted,
    /// The stop signal already fired; the indexer cannot be started anymore.
    #[error("indexer already shut down")]
    ShutDown,
    /// The consumer did not finish draining before the deadline.
    #[error("consumer did not stop within {0:?}")]
    ShutdownTimeout(Duration),
    /// The consumer task ended without signalling completion.
    #[error("consumer task exited without signalling completion")]
    ConsumerAborted,
}

/// Error applying an event to the search index. Always retryable.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Search(#[from] SearchError),
}
