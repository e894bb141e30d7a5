use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bucket used for every event when ordering mode is disabled, and for
/// ordered events that arrive without a partition key.
pub const UNKNOWN_PARTITION_KEY: &str = "unknown";

/// Extension attribute carrying the partition key.
pub const PARTITION_KEY_ATTRIBUTE: &str = "partitionkey";

/// Extension attribute carrying the send time in unix milliseconds.
pub const BENCHMARK_TIMESTAMP_ATTRIBUTE: &str = "benchmarktimestamp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub partition_key: Option<String>,
    pub benchmark_timestamp: Option<i64>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(id: String) -> Self {
        Self {
            id,
            source: "evcheck".into(),
            event_type: "dev.evcheck.event".into(),
            partition_key: None,
            benchmark_timestamp: None,
            data: serde_json::Value::Null,
        }
    }

    /// Stamp the event with the current wall-clock time.
    pub fn stamped(mut self) -> Self {
        self.benchmark_timestamp = Some(Utc::now().timestamp_millis());
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Correlation signals
// ---------------------------------------------------------------------------

/// An event handed to the load generator, before its request completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedRecord {
    pub id: String,
    pub partition_key: Option<String>,
}

impl From<&Event> for ProposedRecord {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            partition_key: event.partition_key.clone(),
        }
    }
}

/// Identifier of an event whose request got a 2xx without transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedSignal {
    pub id: String,
}

impl AcceptedSignal {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// An identifier observed on one side of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub id: String,
    pub partition_key: Option<String>,
}

impl ObservedEvent {
    pub fn new(id: impl Into<String>, partition_key: Option<String>) -> Self {
        Self {
            id: id.into(),
            partition_key,
        }
    }
}

impl From<ProposedRecord> for ObservedEvent {
    fn from(record: ProposedRecord) -> Self {
        Self {
            id: record.id,
            partition_key: record.partition_key,
        }
    }
}

impl From<&Event> for ObservedEvent {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            partition_key: event.partition_key.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Sent,
    Received,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Received => write!(f, "received"),
        }
    }
}
