use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DurationRound, TimeDelta};
use serde::{Deserialize, Serialize};

use eventstore_core::{
    Clock, EMPTY_STREAM_EVENT_NUMBER, EventRecord, ExpectedVersion, NewEvent, StreamId,
    SystemClock,
};

use super::r#trait::{
    EventReader, EventSource, EventStoreError, EventStreamWriter, PositionCodec, ResolvedEvents,
};
use super::stream_filter::StreamFilter;

/// Position in the in-memory log: the 1-based index of the positioned
/// event. The empty store is position 0, and a read after position `n`
/// skips the first `n` events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InMemoryPosition(pub u64);

/// Decimal codec for [`InMemoryPosition`].
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryPositionCodec;

impl PositionCodec for InMemoryPositionCodec {
    type Position = InMemoryPosition;

    fn encode(&self, position: &InMemoryPosition) -> String {
        position.0.to_string()
    }

    fn decode(&self, encoded: &str) -> Result<InMemoryPosition, EventStoreError> {
        encoded
            .parse()
            .map(InMemoryPosition)
            .map_err(|e| EventStoreError::parse(format!("in-memory position {encoded:?}: {e}")))
    }

    fn compare_positions(&self, left: &InMemoryPosition, right: &InMemoryPosition) -> Ordering {
        left.cmp(right)
    }
}

#[derive(Debug, Default)]
struct Log {
    events: Vec<EventRecord>,
    last_event_numbers: HashMap<StreamId, i64>,
}

/// Reader half of [`InMemoryEventSource`]; cheap to clone.
#[derive(Debug, Clone)]
pub struct InMemoryEventReader {
    log: Arc<RwLock<Log>>,
    codec: InMemoryPositionCodec,
}

impl EventReader for InMemoryEventReader {
    type Position = InMemoryPosition;
    type Codec = InMemoryPositionCodec;

    fn empty_store_position(&self) -> InMemoryPosition {
        InMemoryPosition(0)
    }

    fn position_codec(&self) -> &InMemoryPositionCodec {
        &self.codec
    }

    fn read_all_forwards(
        &self,
        after: &InMemoryPosition,
    ) -> Result<ResolvedEvents<'_, InMemoryPosition>, EventStoreError> {
        let log = self.log.read().map_err(|_| EventStoreError::LockPoisoned)?;

        let start = usize::try_from(after.0).unwrap_or(usize::MAX);
        let snapshot: Vec<_> = log
            .events
            .iter()
            .enumerate()
            .skip(start)
            .map(|(idx, e)| e.clone().resolve(InMemoryPosition(idx as u64 + 1)))
            .collect();

        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }
}

/// Writer half of [`InMemoryEventSource`].
#[derive(Debug, Clone)]
pub struct InMemoryEventWriter {
    log: Arc<RwLock<Log>>,
    clock: Arc<dyn Clock>,
}

impl EventStreamWriter for InMemoryEventWriter {
    fn write_with(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let mut log = self.log.write().map_err(|_| EventStoreError::LockPoisoned)?;

        let current = log
            .last_event_numbers
            .get(stream_id)
            .copied()
            .unwrap_or(EMPTY_STREAM_EVENT_NUMBER);

        if let ExpectedVersion::Exact(expected) = expected {
            if expected != current {
                return Err(EventStoreError::WrongExpectedVersion {
                    stream_id: stream_id.clone(),
                    actual: current,
                    expected,
                });
            }
        }

        if events.is_empty() {
            return Ok(vec![]);
        }

        // Same millisecond resolution as the filesystem backend.
        let now = self.clock.now();
        let timestamp = now
            .duration_trunc(TimeDelta::milliseconds(1))
            .unwrap_or(now);

        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in &events {
            let record = e.to_event_record(stream_id.clone(), next, timestamp);
            next += 1;
            log.events.push(record.clone());
            committed.push(record);
        }
        log.last_event_numbers.insert(stream_id.clone(), next - 1);

        Ok(committed)
    }
}

/// In-memory append-only event source.
///
/// Intended for tests/dev and as the reference behaviour for the other
/// backends. Not optimized for performance.
#[derive(Debug, Clone)]
pub struct InMemoryEventSource {
    reader: InMemoryEventReader,
    stream_reader: StreamFilter<InMemoryEventReader>,
    writer: InMemoryEventWriter,
}

impl InMemoryEventSource {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let log = Arc::new(RwLock::new(Log::default()));
        let reader = InMemoryEventReader {
            log: log.clone(),
            codec: InMemoryPositionCodec,
        };
        Self {
            stream_reader: StreamFilter::new(reader.clone()),
            reader,
            writer: InMemoryEventWriter { log, clock },
        }
    }
}

impl Default for InMemoryEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for InMemoryEventSource {
    type Reader = InMemoryEventReader;
    type StreamReader = StreamFilter<InMemoryEventReader>;
    type Writer = InMemoryEventWriter;

    fn store_reader(&self) -> &InMemoryEventReader {
        &self.reader
    }

    fn stream_reader(&self) -> &StreamFilter<InMemoryEventReader> {
        &self.stream_reader
    }

    fn stream_writer(&self) -> &InMemoryEventWriter {
        &self.writer
    }
}
