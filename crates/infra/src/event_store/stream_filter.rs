//! Stream reads expressed as a filter over the store-wide forward scan.

use eventstore_core::StreamId;

use super::r#trait::{EventReader, EventStoreError, EventStreamReader, ResolvedEvents};

/// [`EventStreamReader`] for backends that keep no per-stream structure:
/// reads the whole store forwards and keeps the matching events.
#[derive(Debug, Clone)]
pub struct StreamFilter<R> {
    reader: R,
}

impl<R> StreamFilter<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R> EventStreamReader for StreamFilter<R>
where
    R: EventReader,
{
    type Position = R::Position;

    fn read_stream_forwards(
        &self,
        stream_id: &StreamId,
        after: i64,
    ) -> Result<ResolvedEvents<'_, Self::Position>, EventStoreError> {
        let stream_id = stream_id.clone();
        let events = self
            .reader
            .read_all_forwards(&self.reader.empty_store_position())?;
        Ok(Box::new(events.filter(move |item| match item {
            Ok(resolved) => {
                resolved.event.stream_id == stream_id && resolved.event.event_number > after
            }
            Err(_) => true,
        })))
    }
}
