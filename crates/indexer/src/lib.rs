//! Keeps a search index in step with task events.
//!
//! An [`Indexer`] subscribes to an [`EventBroker`](todo_sdk::source::EventBroker),
//! runs a [`ConsumerLoop`] on its own task and hands every decoded event to an
//! [`EventHandler`], usually an [`IndexApplier`] wrapping a search index.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use todo_indexer::{IndexApplier, Indexer, IndexerConfig, memory::{MemoryBroker, MemoryIndex}};
//!
//! # async fn run() -> Result<(), todo_indexer::IndexerError> {
//! let broker = MemoryBroker::new();
//! let mut indexer = Indexer::new(broker, IndexApplier::new(MemoryIndex::new()), IndexerConfig::new());
//!
//! indexer.start().await?;
//! // ...
//! indexer.shutdown(Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

pub mod apply;
pub mod config;
pub mod consumer;
pub mod error;
pub mod lifecycle;
pub mod memory;

pub use apply::IndexApplier;
pub use config::IndexerConfig;
pub use consumer::{ConsumerLoop, ConsumerState, ConsumerStats, EventHandler};
pub use error::{ApplyError, IndexerError};
pub use lifecycle::Indexer;
