//! # Todo SDK
//!
//! Shared types and contracts for keeping the task search index in step with
//! the system of record.
//!
//! ## Overview
//!
//! The write path persists a task mutation, then publishes a [`TaskEvent`]
//! through a [`Publisher`]. Independent indexer processes subscribe through an
//! [`EventBroker`], decode each envelope and apply it to a [`SearchIndex`].
//!
//! Concrete brokers and search engines live in their own crates; this crate
//! only defines the wire format and the seams between them.
//!
//! ## Example
//!
//! ```rust
//! use todo_sdk::prelude::*;
//!
//! let event = TaskEvent::Created(Task::new("abc", "buy milk"));
//! let bytes = event.encode().unwrap();
//!
//! assert_eq!(TaskEvent::decode(&bytes).unwrap(), Some(event));
//! ```
//!
//! [`TaskEvent`]: event::TaskEvent
//! [`Publisher`]: publish::Publisher
//! [`EventBroker`]: source::EventBroker
//! [`SearchIndex`]: search::SearchIndex

pub mod error;
pub mod event;
pub mod publish;
pub mod search;
pub mod service;
pub mod source;
pub mod task;

pub mod prelude {
    pub use crate::error::*;
    pub use crate::event::*;
    pub use crate::publish::*;
    pub use crate::search::*;
    pub use crate::service::*;
    pub use crate::source::*;
    pub use crate::task::*;
}
