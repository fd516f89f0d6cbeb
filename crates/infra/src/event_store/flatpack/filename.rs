//! Sortable on-disk names.
//!
//! Loose event files are named
//! `<timestamp>.<category>.<id>.<eventNumber>.<type>.json` where the
//! timestamp is a fixed-width RFC 3339 UTC instant with millisecond precision
//! and the event number is 16 zero-padded lowercase hex digits. Both are fixed
//! width, so lexicographic order of names follows time first and then, within
//! a stream, event number.

use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;

use eventstore_core::StreamId;

use crate::event_store::EventStoreError;

pub(crate) const LOOSE_SUFFIX: &str = ".json";
pub(crate) const PACK_SUFFIX: &str = ".cpio.xz";
pub(crate) const MANIFEST_SUFFIX: &str = ".manifest";
pub(crate) const LOCK_PREFIX: &str = "LOCK.";
pub(crate) const TEMP_PREFIX: &str = ".pack.";
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

static FILENAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z)\.([^.]+)\.([^.]+)\.([0-9a-f]{16})\.([^.]+)\.json$",
    )
    .expect("filename pattern is a valid regex")
});

/// What a directory entry is, judged from its name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Loose,
    Pack,
    Manifest,
    Lock,
    Temp,
    Other,
}

pub fn classify(name: &str) -> FileKind {
    if name.starts_with(LOCK_PREFIX) {
        FileKind::Lock
    } else if name.starts_with(TEMP_PREFIX) {
        FileKind::Temp
    } else if name.starts_with('.') {
        FileKind::Other
    } else if name.ends_with(PACK_SUFFIX) {
        FileKind::Pack
    } else if name.ends_with(MANIFEST_SUFFIX) {
        FileKind::Manifest
    } else if name.ends_with(LOOSE_SUFFIX) {
        FileKind::Loose
    } else {
        FileKind::Other
    }
}

/// A decoded loose event filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilename {
    /// The timestamp exactly as it appears in the name.
    pub timestamp_text: String,
    pub timestamp: DateTime<Utc>,
    pub stream_id: StreamId,
    pub event_number: i64,
    pub event_type: String,
}

impl EventFilename {
    pub fn parse(name: &str) -> Result<Self, EventStoreError> {
        let captures = FILENAME_PATTERN
            .captures(name)
            .ok_or_else(|| EventStoreError::parse(format!("unparseable filename: {name}")))?;

        let timestamp_text = captures[1].to_string();
        let timestamp = DateTime::parse_from_rfc3339(&timestamp_text)
            .map_err(|e| EventStoreError::parse(format!("bad timestamp in {name}: {e}")))?
            .with_timezone(&Utc);
        let event_number = i64::from_str_radix(&captures[4], 16)
            .map_err(|e| EventStoreError::parse(format!("bad event number in {name}: {e}")))?;

        Ok(Self {
            timestamp_text,
            timestamp,
            stream_id: StreamId::new(&captures[2], &captures[3]),
            event_number,
            event_type: captures[5].to_string(),
        })
    }

    pub fn belongs_to(&self, stream_id: &StreamId) -> bool {
        self.stream_id == *stream_id
    }
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn loose_filename(
    timestamp: DateTime<Utc>,
    stream_id: &StreamId,
    event_number: i64,
    event_type: &str,
) -> String {
    format!(
        "{}.{}.{}.{:016x}.{}{}",
        format_timestamp(timestamp),
        stream_id.category,
        stream_id.id,
        event_number,
        event_type,
        LOOSE_SUFFIX
    )
}

pub fn pack_filename(timestamp_text: &str) -> String {
    format!("{timestamp_text}{PACK_SUFFIX}")
}

pub fn manifest_filename(timestamp_text: &str) -> String {
    format!("{timestamp_text}{MANIFEST_SUFFIX}")
}

/// `T.cpio.xz` -> `T.manifest`.
pub fn manifest_for_pack(pack_name: &str) -> String {
    manifest_filename(pack_name.strip_suffix(PACK_SUFFIX).unwrap_or(pack_name))
}

/// The leading timestamp of an event, archive or manifest name (empty for an
/// empty name).
///
/// Timestamps end at the first `Z`, which no earlier timestamp character can
/// be.
pub fn timestamp_of(name: &str) -> &str {
    match name.find('Z') {
        Some(idx) => &name[..=idx],
        None => name,
    }
}

/// Whether the archive `pack_name` can contain entries sorting after
/// `after_key`.
///
/// An archive is named after its newest entry, so this holds exactly when the
/// archive's timestamp is not earlier than `after_key`'s. Comparing whole
/// names instead would miss entries sharing the archive's timestamp but
/// sorting after `<timestamp>.cpio.xz`.
pub fn pack_may_follow(pack_name: &str, after_key: &str) -> bool {
    after_key.is_empty() || timestamp_of(pack_name) >= timestamp_of(after_key)
}
