//! Optimistic concurrency expectations.

use serde::{Deserialize, Serialize};

/// Optimistic concurrency expectation for a stream write.
///
/// Event numbers are zero-based; a stream without events is at
/// [`EMPTY_STREAM_EVENT_NUMBER`](crate::EMPTY_STREAM_EVENT_NUMBER) (`-1`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Skip version checking and append after whatever is there.
    Any,
    /// Require the stream's last event number to be exactly this value.
    Exact(i64),
}

impl From<i64> for ExpectedVersion {
    fn from(value: i64) -> Self {
        ExpectedVersion::Exact(value)
    }
}
