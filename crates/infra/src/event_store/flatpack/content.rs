//! Event file bodies.
//!
//! A loose file (or archive entry) holds the event data, then, only when the
//! event has metadata, a newline and the metadata. The data is recovered as
//! the first JSON value of the body.

use serde::de::IgnoredAny;

use crate::event_store::EventStoreError;

/// Split a stored body into `(data, metadata)`.
///
/// Bodies that do not start with a JSON value, or hold nothing but
/// whitespace after it, are returned whole as data.
pub fn split_content(body: Vec<u8>) -> (Vec<u8>, Vec<u8>) {
    let mut values = serde_json::Deserializer::from_slice(&body).into_iter::<IgnoredAny>();
    let end = match values.next() {
        Some(Ok(_)) => values.byte_offset(),
        _ => return (body, Vec::new()),
    };

    let metadata_start = body[end..]
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|offset| end + offset);
    match metadata_start {
        None => (body, Vec::new()),
        Some(start) => {
            let metadata = body[start..].to_vec();
            let mut data = body;
            data.truncate(end);
            (data, metadata)
        }
    }
}

pub fn join_content(data: &[u8], metadata: &[u8]) -> Vec<u8> {
    if metadata.is_empty() {
        return data.to_vec();
    }
    let mut body = Vec::with_capacity(data.len() + 1 + metadata.len());
    body.extend_from_slice(data);
    body.push(b'\n');
    body.extend_from_slice(metadata);
    body
}

/// Fails unless `data` and `metadata` come back unchanged from the body
/// they are stored as.
pub fn check_separable(
    event_type: &str,
    data: &[u8],
    metadata: &[u8],
) -> Result<(), EventStoreError> {
    let (stored_data, stored_metadata) = split_content(join_content(data, metadata));
    if stored_data != data || stored_metadata != metadata {
        return Err(EventStoreError::InvalidAppend(format!(
            "{event_type} event would not read back unchanged: data must be a single JSON value \
             (with no trailing whitespace when metadata is present) and metadata must not start \
             with whitespace"
        )));
    }
    Ok(())
}
