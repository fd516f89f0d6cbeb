//! Lock coordination for a flat-pack directory.
//!
//! Two levels:
//! - [`Lockable`]: a process-wide readers-writer lock. Reads take it shared
//!   while they list the directory; writers and the compactor take it
//!   exclusively.
//! - [`StreamLocks`]: a non-blocking per-stream lock nested inside the
//!   exclusive lock, either as marker files (cross-process) or as an
//!   in-process set.

use std::collections::HashSet;
use std::fmt::Debug;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use eventstore_core::StreamId;

use super::filename::LOCK_PREFIX;
use crate::event_store::EventStoreError;

#[derive(Debug, Default)]
pub struct Lockable {
    lock: RwLock<()>,
}

impl Lockable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Result<RwLockReadGuard<'_, ()>, EventStoreError> {
        self.lock.read().map_err(|_| EventStoreError::LockPoisoned)
    }

    pub fn exclusive(&self) -> Result<RwLockWriteGuard<'_, ()>, EventStoreError> {
        self.lock.write().map_err(|_| EventStoreError::LockPoisoned)
    }
}

/// Per-stream mutual exclusion. Acquisition never blocks or retries.
pub trait StreamLocks: Send + Sync + Debug {
    /// Take the lock for `stream_id`, failing with
    /// [`EventStoreError::StreamLocked`] when someone else holds it.
    fn try_lock(&self, stream_id: &StreamId) -> Result<StreamLockGuard<'_>, EventStoreError>;

    /// Called by [`StreamLockGuard`] on drop.
    fn release(&self, stream_id: &StreamId) -> Result<(), EventStoreError>;
}

/// Holds a stream lock until dropped.
#[must_use = "the stream is unlocked as soon as the guard is dropped"]
#[derive(Debug)]
pub struct StreamLockGuard<'a> {
    locks: &'a dyn StreamLocks,
    stream_id: StreamId,
}

impl<'a> StreamLockGuard<'a> {
    fn new(locks: &'a dyn StreamLocks, stream_id: StreamId) -> Self {
        Self { locks, stream_id }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }
}

impl Drop for StreamLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.locks.release(&self.stream_id) {
            warn!(stream_id = %self.stream_id, error = %e, "failed to release stream lock");
        }
    }
}

/// `LOCK.<category>.<id>` marker files created with exclusive create.
///
/// A marker left behind by a crashed process is never reclaimed; it has to
/// be removed by hand before the stream can be written again.
#[derive(Debug, Clone)]
pub struct MarkerFileLocks {
    directory: PathBuf,
}

impl MarkerFileLocks {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn marker_path(&self, stream_id: &StreamId) -> PathBuf {
        self.directory
            .join(format!("{LOCK_PREFIX}{}.{}", stream_id.category, stream_id.id))
    }
}

impl StreamLocks for MarkerFileLocks {
    fn try_lock(&self, stream_id: &StreamId) -> Result<StreamLockGuard<'_>, EventStoreError> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.marker_path(stream_id))
        {
            Ok(_) => Ok(StreamLockGuard::new(self, stream_id.clone())),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(EventStoreError::StreamLocked(stream_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn release(&self, stream_id: &StreamId) -> Result<(), EventStoreError> {
        fs::remove_file(self.marker_path(stream_id))?;
        Ok(())
    }
}

/// Per-stream locks for a single process.
#[derive(Debug, Default)]
pub struct InProcessLocks {
    held: Mutex<HashSet<StreamId>>,
}

impl InProcessLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamLocks for InProcessLocks {
    fn try_lock(&self, stream_id: &StreamId) -> Result<StreamLockGuard<'_>, EventStoreError> {
        let mut held = self.held.lock().map_err(|_| EventStoreError::LockPoisoned)?;
        if !held.insert(stream_id.clone()) {
            return Err(EventStoreError::StreamLocked(stream_id.clone()));
        }
        Ok(StreamLockGuard::new(self, stream_id.clone()))
    }

    fn release(&self, stream_id: &StreamId) -> Result<(), EventStoreError> {
        let mut held = self.held.lock().map_err(|_| EventStoreError::LockPoisoned)?;
        held.remove(stream_id);
        Ok(())
    }
}
