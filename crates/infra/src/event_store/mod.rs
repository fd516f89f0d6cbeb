//! Append-only event store boundary.
//!
//! Backend-neutral read/write traits plus two implementations: an in-memory
//! log and the flat-pack filesystem store.

pub mod flatpack;
pub mod in_memory;
pub mod stream_filter;
pub mod r#trait;

pub use flatpack::{
    FlatPackEventReader, FlatPackEventSource, FlatPackEventWriter, FlatPackPosition,
    FlatPackPositionCodec, PackSummary,
};
pub use in_memory::{
    InMemoryEventReader, InMemoryEventSource, InMemoryEventWriter, InMemoryPosition,
    InMemoryPositionCodec,
};
pub use stream_filter::StreamFilter;
pub use r#trait::{
    EventReader, EventSource, EventStoreError, EventStreamReader, EventStreamWriter,
    PositionCodec, ResolvedEvents,
};
