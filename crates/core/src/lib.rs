//! `eventstore-core`: event store domain building blocks.
//!
//! This crate contains the backend-agnostic model shared by every event store
//! implementation (no storage concerns).

pub mod clock;
pub mod error;
pub mod event;
pub mod id;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use event::{EMPTY_STREAM_EVENT_NUMBER, EventRecord, NewEvent, ResolvedEvent};
pub use id::StreamId;
pub use version::ExpectedVersion;
