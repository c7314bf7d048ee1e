//! Append-only event log with per-stream optimistic concurrency.

mod local;

pub use local::LocalEventLog;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Version a writer expects a stream to be at before appending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Append regardless of the current version.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream must be at exactly this version (1-based event count).
    Exact(u64),
}

impl ExpectedVersion {
    /// Expectation matching a stream last seen at `version` (0 when empty).
    pub fn from_version(version: u64) -> Self {
        if version == 0 {
            Self::NoStream
        } else {
            Self::Exact(version)
        }
    }

    pub fn is_satisfied_by(&self, current: u64) -> bool {
        match self {
            Self::Any => true,
            Self::NoStream => current == 0,
            Self::Exact(v) => *v == current,
        }
    }
}

/// Identity of one aggregate's stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub aggregate_type: String,
    pub aggregate_id: String,
}

impl StreamId {
    pub fn new(aggregate_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.aggregate_id)
    }
}

/// Audit information stamped on every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Id tying the event to the request or job that caused it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// An event about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: String,
    pub data: Value,
    pub metadata: EventMetadata,
}

/// An event as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Position in the whole log, starting at 1.
    pub position: u64,
    pub stream: StreamId,
    /// Version of the stream after this event, starting at 1.
    pub version: u64,
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: EventMetadata,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Wrong expected version for {stream}: expected {expected:?}, actual {actual}")]
    WrongExpectedVersion {
        stream: StreamId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("Event log IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A readable record sits at the wrong position; replaying past it
    /// would misnumber every later event.
    #[error("Event log corrupt: found position {found}, expected {expected}")]
    Corrupt { found: u64, expected: u64 },

    /// A failed append could not be rolled back; the file needs a reopen.
    #[error("Event log refuses writes after an unrecoverable append failure")]
    Unavailable,
}

/// Durable, replayable history of every aggregate.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append events to a stream if its version matches `expected`.
    ///
    /// Returns the stream version after the append.
    async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<u64, EventLogError>;

    /// Every event of one stream, oldest first.
    async fn read_stream(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, EventLogError>;

    /// Up to `max` events with a position greater than `after`.
    async fn read_all(&self, after: u64, max: usize) -> Result<Vec<RecordedEvent>, EventLogError>;

    /// Position of the last appended event, 0 for an empty log.
    async fn head(&self) -> Result<u64, EventLogError>;
}
