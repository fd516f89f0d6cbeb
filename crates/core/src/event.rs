use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::StreamId;

/// Last event number of a stream that has no events yet.
pub const EMPTY_STREAM_EVENT_NUMBER: i64 = -1;

/// An event supplied by a caller, not yet positioned in any stream.
///
/// `data` and `metadata` are opaque byte blobs as far as the store is
/// concerned; metadata is optional and empty by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
            metadata: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// Position this event in a stream.
    pub fn to_event_record(
        &self,
        stream_id: StreamId,
        event_number: i64,
        timestamp: DateTime<Utc>,
    ) -> EventRecord {
        EventRecord {
            stream_id,
            event_number,
            timestamp,
            event_type: self.event_type.clone(),
            data: self.data.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// An event as stored: immutable once written.
///
/// `event_number` is dense and strictly increasing within a stream, starting
/// at 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub stream_id: StreamId,
    pub event_number: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl EventRecord {
    pub fn resolve<P>(self, position: P) -> ResolvedEvent<P> {
        ResolvedEvent {
            position,
            event: self,
        }
    }
}

/// An event together with the backend-specific position it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEvent<P> {
    pub position: P,
    pub event: EventRecord,
}
