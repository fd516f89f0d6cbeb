use std::cmp::Ordering;
use std::fmt::Debug;

use thiserror::Error;

use eventstore_core::{EventRecord, ExpectedVersion, NewEvent, ResolvedEvent, StreamId};

/// Lazy, finite sequence of events produced by a read.
///
/// Dropping the iterator early is fine: nothing beyond what has already been
/// pulled is read from storage.
pub type ResolvedEvents<'a, P> =
    Box<dyn Iterator<Item = Result<ResolvedEvent<P>, EventStoreError>> + Send + 'a>;

/// Event store operation error.
///
/// These are **storage errors** (format, concurrency, locking, I/O) as opposed
/// to domain errors raised while validating values.
///
/// ## Error Categories
///
/// - **Parse**: a filename, archive or manifest does not follow its grammar
/// - **WrongExpectedVersion**: optimistic concurrency check failed
/// - **StreamLocked**: another writer holds the stream's lock
/// - **InvalidAppend**: the events or stream id cannot be stored
/// - **Io**: storage failures, propagated unchanged (never retried)
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("stream {stream_id} is at version {actual}, expected {expected}")]
    WrongExpectedVersion {
        stream_id: StreamId,
        actual: i64,
        expected: i64,
    },

    /// Only raised by backends that materialise streams individually.
    #[error("no such stream: {0}")]
    NoSuchStream(StreamId),

    #[error("stream {0} is locked by another writer")]
    StreamLocked(StreamId),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("lock poisoned")]
    LockPoisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EventStoreError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn is_wrong_expected_version(&self) -> bool {
        matches!(self, Self::WrongExpectedVersion { .. })
    }
}

impl From<eventstore_core::DomainError> for EventStoreError {
    fn from(value: eventstore_core::DomainError) -> Self {
        Self::InvalidAppend(value.to_string())
    }
}

/// Converts backend positions to and from strings so collaborators can
/// persist a resumption cursor outside the store.
///
/// Implementations must satisfy `decode(encode(p)) == p`, and
/// `compare_positions` must be a total order.
pub trait PositionCodec: Send + Sync {
    type Position;

    fn encode(&self, position: &Self::Position) -> String;

    fn decode(&self, encoded: &str) -> Result<Self::Position, EventStoreError>;

    fn compare_positions(&self, left: &Self::Position, right: &Self::Position) -> Ordering;
}

/// Store-wide forward reader.
///
/// ## Read Semantics
///
/// `read_all_forwards(after)`:
/// - yields every event whose position sorts strictly after `after`
/// - yields them in position order
/// - is restartable from any position it previously yielded
/// - holds no cursor state inside the store
pub trait EventReader: Send + Sync {
    type Position: Clone + Debug + PartialEq + Send + 'static;
    type Codec: PositionCodec<Position = Self::Position>;

    /// The distinguished "start of store" position.
    fn empty_store_position(&self) -> Self::Position;

    fn position_codec(&self) -> &Self::Codec;

    fn read_all_forwards(
        &self,
        after: &Self::Position,
    ) -> Result<ResolvedEvents<'_, Self::Position>, EventStoreError>;
}

/// Per-stream forward reader.
pub trait EventStreamReader: Send + Sync {
    type Position: Clone + Debug + PartialEq + Send + 'static;

    /// Events of `stream_id` with an event number greater than `after`
    /// (pass [`EMPTY_STREAM_EVENT_NUMBER`](eventstore_core::EMPTY_STREAM_EVENT_NUMBER)
    /// for the whole stream).
    fn read_stream_forwards(
        &self,
        stream_id: &StreamId,
        after: i64,
    ) -> Result<ResolvedEvents<'_, Self::Position>, EventStoreError>;
}

/// Append-only stream writer.
///
/// ## Append Semantics
///
/// - Checks optimistic concurrency (the stream's last event number must match)
/// - Assigns event numbers starting at `last + 1`
/// - Makes the whole batch visible at once to other writers of the stream
/// - Returns the committed records
pub trait EventStreamWriter: Send + Sync {
    fn write_with(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>, EventStoreError>;

    /// Append without any expectation about the stream's current state.
    fn write(
        &self,
        stream_id: &StreamId,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        self.write_with(stream_id, ExpectedVersion::Any, events)
    }

    /// Append only if the stream's last event number is `expected_event_number`.
    fn write_expecting(
        &self,
        stream_id: &StreamId,
        expected_event_number: i64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        self.write_with(
            stream_id,
            ExpectedVersion::Exact(expected_event_number),
            events,
        )
    }
}

/// A complete backend: store reader, stream reader and writer.
pub trait EventSource: Send + Sync {
    type Reader: EventReader;
    type StreamReader: EventStreamReader<Position = <Self::Reader as EventReader>::Position>;
    type Writer: EventStreamWriter;

    fn store_reader(&self) -> &Self::Reader;

    fn stream_reader(&self) -> &Self::StreamReader;

    fn stream_writer(&self) -> &Self::Writer;
}

impl<S> EventStreamWriter for std::sync::Arc<S>
where
    S: EventStreamWriter + ?Sized,
{
    fn write_with(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        (**self).write_with(stream_id, expected, events)
    }
}
