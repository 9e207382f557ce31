use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::SerializationError, task::Task};

/// Topic prefix shared by every task event.
pub const TOPIC_PREFIX: &str = "tasks.event.";

/// Pattern matching every task event topic.
pub const ALL_TOPICS: &str = "tasks.*";

/// The closed set of task mutations published by the write path.
///
/// Each kind owns exactly one type tag, which doubles as the topic (or channel)
/// the event is published on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Created, EventKind::Updated, EventKind::Deleted];

    /// The type tag carried in the envelope, and the topic name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "tasks.event.created",
            EventKind::Updated => "tasks.event.updated",
            EventKind::Deleted => "tasks.event.deleted",
        }
    }

    pub const fn topic(&self) -> &'static str {
        self.as_str()
    }

    /// Returns `None` for tags outside the known set.
    pub fn from_type(event_type: &str) -> Option<Self> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == event_type)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The type-tagged wrapper sent over the broker.
///
/// ```json
/// {"Type": "tasks.event.created", "Value": {"ID": "abc", "Description": "buy milk"}}
/// {"Type": "tasks.event.deleted", "Value": "abc"}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<V = Value> {
    #[serde(rename = "Type")]
    pub event_type: String,
    #[serde(rename = "Value")]
    pub value: V,
}

impl Envelope {
    /// Decodes the outer envelope, leaving the payload raw.
    pub fn decode(bytes: &[u8]) -> Result<Self, SerializationError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A decoded task mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskEvent {
    Created(Task),
    Updated(Task),
    Deleted(String),
}

impl TaskEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TaskEvent::Created(_) => EventKind::Created,
            TaskEvent::Updated(_) => EventKind::Updated,
            TaskEvent::Deleted(_) => EventKind::Deleted,
        }
    }

    /// The id of the task this event concerns.
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Created(task) | TaskEvent::Updated(task) => &task.id,
            TaskEvent::Deleted(id) => id,
        }
    }

    /// Encodes the event into its wire envelope.
    pub fn encode(&self) -> Result<Vec<u8>, SerializationError> {
        let event_type = self.kind().as_str().to_string();
        let bytes = match self {
            TaskEvent::Created(task) | TaskEvent::Updated(task) => {
                serde_json::to_vec(&Envelope {
                    event_type,
                    value: task,
                })?
            }
            TaskEvent::Deleted(id) => serde_json::to_vec(&Envelope {
                event_type,
                value: id,
            })?,
        };

        Ok(bytes)
    }

    /// Interprets an envelope's payload according to its type tag.
    ///
    /// Returns `None` if the tag is not a known event kind,
    /// or `Some(Err(...))` if the payload does not have the shape the tag requires.
    pub fn from_envelope(envelope: Envelope) -> Option<Result<Self, SerializationError>> {
        let kind = EventKind::from_type(&envelope.event_type)?;
        Some(Self::from_value(kind, envelope.value))
    }

    /// Decodes wire bytes into an event.
    ///
    /// `Ok(None)` means the envelope was well formed but carries an unknown type tag.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, SerializationError> {
        Self::from_envelope(Envelope::decode(bytes)?).transpose()
    }

    fn from_value(kind: EventKind, value: Value) -> Result<Self, SerializationError> {
        let event = match kind {
            EventKind::Created => TaskEvent::Created(serde_json::from_value(value)?),
            EventKind::Updated => TaskEvent::Updated(serde_json::from_value(value)?),
            EventKind::Deleted => {
                let id = match serde_json::from_value(value)? {
                    DeletedValue::Id(id) => id,
                    DeletedValue::Task { id } => id,
                };
                TaskEvent::Deleted(id)
            }
        };

        if event.task_id().is_empty() {
            return Err(SerializationError::new(format!(
                "{kind} event is missing a task id"
            )));
        }

        Ok(event)
    }
}

/// Deleted payloads are a bare id, or a task object from producers that send the full snapshot.
#[derive(Deserialize)]
#[serde(untagged)]
enum DeletedValue {
    Id(String),
    Task {
        #[serde(rename = "ID")]
        id: String,
    },
}

/// Matches a topic against a pattern where `*` stands for any run of characters.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let Some((head, rest)) = pattern.split_once('*') else {
        return pattern == topic;
    };
    let Some(mut remaining) = topic.strip_prefix(head) else {
        return false;
    };

    let mut parts = rest.split('*').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            return remaining.ends_with(part);
        }
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }

    true
}
