use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::event_store::{EventStoreError, PositionCodec};

/// Where an event lives in a flat-pack directory.
///
/// Both variants share a sort key (the event's own filename), so an event
/// keeps its place in the global order when compaction moves it from a loose
/// file into an archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlatPackPosition {
    /// An event still stored as its own file.
    LooseFile { filename: String },
    /// An event stored as `entry` inside the archive `pack`.
    PackedFile { pack: String, entry: String },
}

impl FlatPackPosition {
    pub fn loose(filename: impl Into<String>) -> Self {
        Self::LooseFile {
            filename: filename.into(),
        }
    }

    pub fn packed(pack: impl Into<String>, entry: impl Into<String>) -> Self {
        Self::PackedFile {
            pack: pack.into(),
            entry: entry.into(),
        }
    }

    /// Start of the store; sorts before every event.
    pub fn empty() -> Self {
        Self::loose("")
    }

    pub fn sort_key(&self) -> &str {
        match self {
            Self::LooseFile { filename } => filename,
            Self::PackedFile { entry, .. } => entry,
        }
    }
}

/// `entry` for loose positions, `pack#entry` for packed ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatPackPositionCodec;

impl PositionCodec for FlatPackPositionCodec {
    type Position = FlatPackPosition;

    fn encode(&self, position: &FlatPackPosition) -> String {
        match position {
            FlatPackPosition::LooseFile { filename } => filename.clone(),
            FlatPackPosition::PackedFile { pack, entry } => format!("{pack}#{entry}"),
        }
    }

    fn decode(&self, encoded: &str) -> Result<FlatPackPosition, EventStoreError> {
        match encoded.split_once('#') {
            None => Ok(FlatPackPosition::loose(encoded)),
            Some((pack, entry)) if !pack.is_empty() && !entry.is_empty() => {
                Ok(FlatPackPosition::packed(pack, entry))
            }
            Some(_) => Err(EventStoreError::parse(format!(
                "malformed packed position: {encoded:?}"
            ))),
        }
    }

    fn compare_positions(&self, left: &FlatPackPosition, right: &FlatPackPosition) -> Ordering {
        left.sort_key().cmp(right.sort_key())
    }
}
