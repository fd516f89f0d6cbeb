//! Per-archive sidecar recording each stream's last event number.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tracing::{debug, warn};

use eventstore_core::StreamId;

use super::archive::entry_names;
use super::filename::{EventFilename, TEMP_PREFIX, TEMP_SUFFIX, manifest_for_pack};
use crate::event_store::EventStoreError;

/// `"<category> <id> <lastEventNumber>"` per stream, sorted by stream id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    streams: BTreeMap<StreamId, i64>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that `stream_id` has an event numbered `event_number`.
    pub fn record(&mut self, stream_id: &StreamId, event_number: i64) {
        self.streams
            .entry(stream_id.clone())
            .and_modify(|last| *last = (*last).max(event_number))
            .or_insert(event_number);
    }

    pub fn last_event_number(&self, stream_id: &StreamId) -> Option<i64> {
        self.streams.get(stream_id).copied()
    }

    /// Number of streams with an entry.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn to_text(&self) -> String {
        self.streams
            .iter()
            .map(|(stream, n)| format!("{} {} {}\n", stream.category, stream.id, n))
            .collect()
    }

    pub fn parse(text: &str) -> Result<Self, EventStoreError> {
        let mut manifest = Self::new();
        for line in text.lines().filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split(' ').collect();
            let [category, id, number] = fields.as_slice() else {
                return Err(EventStoreError::parse(format!("bad manifest line: {line:?}")));
            };
            let number = number
                .parse::<i64>()
                .map_err(|e| EventStoreError::parse(format!("bad manifest line {line:?}: {e}")))?;
            manifest.record(&StreamId::new(*category, *id), number);
        }
        Ok(manifest)
    }

    /// Persist to `path`, failing with `AlreadyExists` rather than replacing
    /// an existing manifest.
    ///
    /// The text is written and synced under a temporary name first, so the
    /// manifest never appears at `path` incomplete.
    pub fn write_new(&self, path: &Path) -> io::Result<()> {
        let directory = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(directory)?;
        temp.write_all(self.to_text().as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist_noclobber(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Rebuild from the entry names of an archive without reading their data.
    pub fn derive_from_pack(pack_path: &Path) -> Result<Self, EventStoreError> {
        let mut manifest = Self::new();
        for name in entry_names(pack_path)? {
            let parsed = EventFilename::parse(&name)?;
            manifest.record(&parsed.stream_id, parsed.event_number);
        }
        Ok(manifest)
    }

    /// The manifest belonging to the archive `pack_name` in `directory`,
    /// deriving and persisting it first when it is missing.
    ///
    /// Safe to race with other processes: whoever creates the file first
    /// wins and everyone else reads theirs.
    pub fn load_or_derive(directory: &Path, pack_name: &str) -> Result<Self, EventStoreError> {
        match read_existing(directory, pack_name)? {
            Some(manifest) => Ok(manifest),
            None => derive_and_persist(directory, pack_name),
        }
    }
}

/// The manifest at its usual path, or `None` when there is none.
///
/// Every line ends in a newline and an archive is never empty, so text that
/// is empty or stops mid-line was cut short. Such a manifest is rebuilt from
/// the archive in memory and the file is left alone.
fn read_existing(
    directory: &Path,
    pack_name: &str,
) -> Result<Option<Manifest>, EventStoreError> {
    let manifest_path = directory.join(manifest_for_pack(pack_name));
    let text = match fs::read_to_string(&manifest_path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !text.ends_with('\n') {
        warn!(
            manifest = %manifest_path.display(),
            "manifest is incomplete, deriving it from the archive"
        );
        return Manifest::derive_from_pack(&directory.join(pack_name)).map(Some);
    }
    Manifest::parse(&text).map(Some)
}

fn derive_and_persist(directory: &Path, pack_name: &str) -> Result<Manifest, EventStoreError> {
    debug!(pack = %pack_name, "deriving missing manifest");
    let derived = Manifest::derive_from_pack(&directory.join(pack_name))?;
    match derived.write_new(&directory.join(manifest_for_pack(pack_name))) {
        Ok(()) => Ok(derived),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!(pack = %pack_name, "manifest was created concurrently, reading it");
            Ok(read_existing(directory, pack_name)?.unwrap_or(derived))
        }
        Err(e) => Err(e.into()),
    }
}
