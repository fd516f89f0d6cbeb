//! Flat-pack filesystem event store.
//!
//! Every event is written as its own "loose" file in one flat directory.
//! Loose files are periodically merged into immutable xz-compressed CPIO
//! archives, each with a manifest recording the last event number of every
//! stream it holds. Reads merge archives and loose files back into one
//! filename-ordered sequence, so compaction never changes what a reader sees.
//!
//! ## Thread Safety
//!
//! [`FlatPackEventSource`] and its reader and writer are `Send + Sync` and
//! cheap to clone; clones share the same locks and position cache.

mod archive;
mod compactor;
mod content;
mod directory;
mod filename;
mod lock;
mod manifest;
mod position;
mod reader;
mod writer;

#[cfg(test)]
pub(crate) mod test_support;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument};

use eventstore_core::Clock;

use crate::config::{FlatPackConfig, StreamLocking};
use crate::event_store::{EventSource, EventStoreError, StreamFilter};

pub use compactor::PackSummary;
pub use filename::{EventFilename, FileKind, classify};
pub use lock::{InProcessLocks, Lockable, MarkerFileLocks, StreamLockGuard, StreamLocks};
pub use manifest::Manifest;
pub use position::{FlatPackPosition, FlatPackPositionCodec};
pub use reader::FlatPackEventReader;
pub use writer::{FlatPackEventWriter, LockedStream, StreamPositionTracker};

/// State shared by every handle on one directory.
#[derive(Debug)]
pub(crate) struct Store {
    pub(crate) directory: PathBuf,
    pub(crate) lock: Lockable,
}

impl Store {
    pub(crate) fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            lock: Lockable::new(),
        }
    }
}

/// Event source over a flat-pack directory.
#[derive(Debug, Clone)]
pub struct FlatPackEventSource {
    config: FlatPackConfig,
    store: Arc<Store>,
    reader: FlatPackEventReader,
    stream_reader: StreamFilter<FlatPackEventReader>,
    writer: FlatPackEventWriter,
}

impl FlatPackEventSource {
    /// Open (creating if needed) the directory named by `config`.
    pub fn open(config: FlatPackConfig, clock: Arc<dyn Clock>) -> Result<Self, EventStoreError> {
        fs::create_dir_all(&config.base_directory)?;

        let store = Arc::new(Store::new(config.base_directory.clone()));
        let locks: Box<dyn StreamLocks> = match config.stream_locking {
            StreamLocking::MarkerFile => Box::new(MarkerFileLocks::new(&config.base_directory)),
            StreamLocking::InProcess => Box::new(InProcessLocks::new()),
        };
        let tracker = Arc::new(StreamPositionTracker::new(&config.base_directory, locks));
        let reader = FlatPackEventReader::new(store.clone());

        info!(
            directory = %config.base_directory.display(),
            stream_locking = ?config.stream_locking,
            "opened flat-pack event store"
        );

        Ok(Self {
            stream_reader: StreamFilter::new(reader.clone()),
            reader,
            writer: FlatPackEventWriter::new(store.clone(), tracker, clock),
            store,
            config,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.store.directory
    }

    pub fn config(&self) -> &FlatPackConfig {
        &self.config
    }

    /// Merge all loose files into a new archive if there are at least
    /// `minimum_files` of them.
    ///
    /// Returns `Ok(None)` when packing was skipped; the directory is then
    /// unchanged. Readers see the same events before and after.
    #[instrument(skip(self), fields(directory = %self.store.directory.display()), err)]
    pub fn pack_loose_files(
        &self,
        minimum_files: usize,
    ) -> Result<Option<PackSummary>, EventStoreError> {
        compactor::pack_loose_files(&self.store, minimum_files, self.config.compression_level)
    }

    /// [`pack_loose_files`](Self::pack_loose_files) with the configured
    /// minimum.
    pub fn pack(&self) -> Result<Option<PackSummary>, EventStoreError> {
        self.pack_loose_files(self.config.pack_minimum_files)
    }
}

impl EventSource for FlatPackEventSource {
    type Reader = FlatPackEventReader;
    type StreamReader = StreamFilter<FlatPackEventReader>;
    type Writer = FlatPackEventWriter;

    fn store_reader(&self) -> &FlatPackEventReader {
        &self.reader
    }

    fn stream_reader(&self) -> &StreamFilter<FlatPackEventReader> {
        &self.stream_reader
    }

    fn stream_writer(&self) -> &FlatPackEventWriter {
        &self.writer
    }
}
