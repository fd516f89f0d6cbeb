//! Appends events to streams as loose files.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DurationRound, TimeDelta};
use tracing::{debug, instrument, warn};

use eventstore_core::id::validate_component;
use eventstore_core::{
    Clock, EMPTY_STREAM_EVENT_NUMBER, EventRecord, ExpectedVersion, NewEvent, StreamId,
};

use super::Store;
use super::content::{check_separable, join_content};
use super::directory;
use super::filename::{
    EventFilename, FileKind, classify, loose_filename, pack_may_follow, timestamp_of,
};
use super::lock::{StreamLockGuard, StreamLocks};
use super::manifest::Manifest;
use crate::event_store::{EventStoreError, EventStreamWriter};

/// Last event of a stream known to this process, and the file (or archive)
/// it was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamPosition {
    filename: String,
    event_number: i64,
}

/// Tracks each stream's last event number without an index.
///
/// Positions are cached per stream and refreshed on every lock by scanning
/// only the directory entries that sort after the cached one, newest first.
#[derive(Debug)]
pub struct StreamPositionTracker {
    directory: PathBuf,
    locks: Box<dyn StreamLocks>,
    positions: Mutex<HashMap<StreamId, StreamPosition>>,
}

impl StreamPositionTracker {
    pub fn new(directory: impl Into<PathBuf>, locks: Box<dyn StreamLocks>) -> Self {
        Self {
            directory: directory.into(),
            locks,
            positions: Mutex::new(HashMap::new()),
        }
    }

    /// Lock `stream_id` and bring its last event number up to date.
    ///
    /// Fails immediately with [`EventStoreError::StreamLocked`] if another
    /// writer holds the stream.
    pub fn lock(&self, stream_id: &StreamId) -> Result<LockedStream<'_>, EventStoreError> {
        let guard = self.locks.try_lock(stream_id)?;

        let cached = self
            .positions
            .lock()
            .map_err(|_| EventStoreError::LockPoisoned)?
            .get(stream_id)
            .cloned();
        let position = scan_for_stream(&self.directory, stream_id, cached.as_ref())?;
        if position != cached {
            debug!(
                stream_id = %stream_id,
                last_event_number = position.as_ref().map(|p| p.event_number),
                "refreshed stream position"
            );
        }

        Ok(LockedStream {
            tracker: self,
            _guard: guard,
            stream_id: stream_id.clone(),
            last_event_number: position
                .as_ref()
                .map_or(EMPTY_STREAM_EVENT_NUMBER, |p| p.event_number),
            position,
        })
    }

    fn remember(
        &self,
        stream_id: &StreamId,
        position: StreamPosition,
    ) -> Result<(), EventStoreError> {
        self.positions
            .lock()
            .map_err(|_| EventStoreError::LockPoisoned)?
            .insert(stream_id.clone(), position);
        Ok(())
    }
}

/// A stream held by this writer. Unlocked on drop.
#[derive(Debug)]
pub struct LockedStream<'a> {
    tracker: &'a StreamPositionTracker,
    _guard: StreamLockGuard<'a>,
    stream_id: StreamId,
    position: Option<StreamPosition>,
    last_event_number: i64,
}

impl LockedStream<'_> {
    pub fn last_event_number(&self) -> i64 {
        self.last_event_number
    }

    /// Claim the next event number.
    pub fn next_event_number(&mut self) -> i64 {
        self.last_event_number += 1;
        self.last_event_number
    }

    pub fn check_event_number(&self, expected: i64) -> Result<(), EventStoreError> {
        let actual = self
            .position
            .as_ref()
            .map_or(EMPTY_STREAM_EVENT_NUMBER, |p| p.event_number);
        if actual != expected {
            return Err(EventStoreError::WrongExpectedVersion {
                stream_id: self.stream_id.clone(),
                actual,
                expected,
            });
        }
        Ok(())
    }

    /// Record that numbers up to the last claimed one are now on disk, the
    /// newest in `filename`.
    fn commit(self, filename: String) -> Result<(), EventStoreError> {
        self.tracker.remember(
            &self.stream_id,
            StreamPosition {
                filename,
                event_number: self.last_event_number,
            },
        )
    }
}

/// Newest-first search for the stream's last event among the entries sorting
/// after `cached` (all entries when nothing is cached).
fn scan_for_stream(
    directory: &Path,
    stream_id: &StreamId,
    cached: Option<&StreamPosition>,
) -> Result<Option<StreamPosition>, EventStoreError> {
    // An archive sorts after loose files of its own millisecond, so resume
    // from its bare timestamp to keep those in view.
    let after_key = match cached {
        Some(p) if classify(&p.filename) == FileKind::Pack => timestamp_of(&p.filename),
        Some(p) => p.filename.as_str(),
        None => "",
    };
    let listing = directory::list(directory)?;

    let mut candidates: Vec<(String, bool)> = listing
        .loose
        .into_iter()
        .filter(|name| name.as_str() > after_key)
        .map(|name| (name, false))
        .chain(
            listing
                .packs
                .into_iter()
                .filter(|pack| pack_may_follow(pack, after_key))
                .map(|pack| (pack, true)),
        )
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0));

    let mut found: Option<StreamPosition> = None;
    for (name, is_pack) in candidates {
        // Loose files sharing the archive's timestamp may sort below it yet
        // be newer than its contents; nothing older can beat it.
        if let Some(hit) = &found {
            if timestamp_of(&name) != timestamp_of(&hit.filename) {
                break;
            }
        }

        let event_number = if is_pack {
            if found.is_some() {
                continue;
            }
            Manifest::load_or_derive(directory, &name)?.last_event_number(stream_id)
        } else {
            EventFilename::parse(&name)
                .ok()
                .filter(|parsed| parsed.belongs_to(stream_id))
                .map(|parsed| parsed.event_number)
        };

        if let Some(event_number) = event_number {
            if found.as_ref().is_none_or(|hit| event_number > hit.event_number) {
                found = Some(StreamPosition {
                    filename: name,
                    event_number,
                });
            }
            if !is_pack {
                break;
            }
        }
    }

    Ok(found.or_else(|| cached.cloned()))
}

/// Writer half of [`FlatPackEventSource`](super::FlatPackEventSource).
#[derive(Debug, Clone)]
pub struct FlatPackEventWriter {
    store: Arc<Store>,
    tracker: Arc<StreamPositionTracker>,
    clock: Arc<dyn Clock>,
}

impl FlatPackEventWriter {
    pub(crate) fn new(
        store: Arc<Store>,
        tracker: Arc<StreamPositionTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            tracker,
            clock,
        }
    }
}

impl EventStreamWriter for FlatPackEventWriter {
    #[instrument(
        skip(self, stream_id, expected, events),
        fields(
            stream_id = %stream_id,
            event_count = events.len(),
            expected = ?expected
        ),
        err
    )]
    fn write_with(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        stream_id.validate_components()?;
        for event in &events {
            validate_component("event type", &event.event_type)?;
            check_separable(&event.event_type, &event.data, &event.metadata)?;
        }

        let _exclusive = self.store.lock.exclusive()?;
        let mut stream = self.tracker.lock(stream_id)?;

        if let ExpectedVersion::Exact(expected) = expected {
            stream.check_event_number(expected)?;
        }
        if events.is_empty() {
            return Ok(vec![]);
        }

        let now = self.clock.now();
        let timestamp = now.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(now);

        let mut written: Vec<PathBuf> = Vec::with_capacity(events.len());
        let mut committed = Vec::with_capacity(events.len());
        let mut last_filename = String::new();
        for event in &events {
            let event_number = stream.next_event_number();
            let filename = loose_filename(timestamp, stream_id, event_number, &event.event_type);
            let path = self.store.directory.join(&filename);

            if let Err(e) = create_event_file(&path, &join_content(&event.data, &event.metadata)) {
                remove_written(&written);
                return Err(e.into());
            }

            written.push(path);
            committed.push(event.to_event_record(stream_id.clone(), event_number, timestamp));
            last_filename = filename;
        }

        stream.commit(last_filename)?;
        Ok(committed)
    }
}

fn create_event_file(path: &Path, body: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    if let Err(e) = file.write_all(body) {
        drop(file);
        if let Err(cleanup) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %cleanup, "failed to remove partial event file");
        }
        return Err(e);
    }
    Ok(())
}

fn remove_written(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to roll back event file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::flatpack::lock::InProcessLocks;
    use crate::event_store::flatpack::lock::MarkerFileLocks;
    use crate::event_store::flatpack::test_support::{files, given_loose_file, given_pack_file};
    use chrono::{DateTime, Utc};
    use eventstore_core::ManualClock;

    fn at(timestamp: &str) -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            DateTime::parse_from_rfc3339(timestamp).unwrap().with_timezone(&Utc),
        ))
    }

    fn writer_at(dir: &Path, clock: Arc<ManualClock>) -> FlatPackEventWriter {
        FlatPackEventWriter::new(
            Arc::new(Store::new(dir.to_path_buf())),
            Arc::new(StreamPositionTracker::new(dir, Box::new(MarkerFileLocks::new(dir)))),
            clock,
        )
    }

    fn stream() -> StreamId {
        StreamId::new("category", "stream")
    }

    fn late() -> Vec<NewEvent> {
        vec![NewEvent::new("EventType", "{\"when\":\"late\"}")]
    }

    fn content(dir: &Path, name: &str) -> String {
        fs::read_to_string(dir.join(name)).unwrap()
    }

    #[test]
    fn writes_event_as_loose_file() {
        let dir = tempfile::tempdir().unwrap();
        let records = writer_at(dir.path(), at("2017-03-13T19:23:45.123Z"))
            .write(&stream(), late())
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_number, 0);
        assert_eq!(
            files(dir.path()),
            vec!["2017-03-13T19:23:45.123Z.category.stream.0000000000000000.EventType.json"]
        );
        assert_eq!(
            content(
                dir.path(),
                "2017-03-13T19:23:45.123Z.category.stream.0000000000000000.EventType.json"
            ),
            "{\"when\":\"late\"}"
        );
    }

    #[test]
    fn writes_metadata_after_the_data() {
        let dir = tempfile::tempdir().unwrap();
        writer_at(dir.path(), at("2017-03-13T19:23:45.123Z"))
            .write(
                &stream(),
                vec![NewEvent::new("EventType", "{}").with_metadata("{\"user\":\"x\"}")],
            )
            .unwrap();

        assert_eq!(
            content(
                dir.path(),
                "2017-03-13T19:23:45.123Z.category.stream.0000000000000000.EventType.json"
            ),
            "{}\n{\"user\":\"x\"}"
        );
    }

    #[test]
    fn writes_using_next_event_number_after_loose_file() {
        let dir = tempfile::tempdir().unwrap();
        given_loose_file(
            dir.path(),
            "2017-03-13T19:00:00.000Z.category.stream.0000000000000000.EventType.json",
            "{\"when\":\"early\"}",
        );

        writer_at(dir.path(), at("2017-03-13T19:23:45.123Z"))
            .write(&stream(), late())
            .unwrap();

        assert!(dir
            .path()
            .join("2017-03-13T19:23:45.123Z.category.stream.0000000000000001.EventType.json")
            .exists());
    }

    #[test]
    fn writes_event_with_satisfied_expectation() {
        let dir = tempfile::tempdir().unwrap();
        given_loose_file(
            dir.path(),
            "2017-03-13T19:00:00.000Z.category.stream.0000000000000000.EventType.json",
            "{}",
        );

        writer_at(dir.path(), at("2017-03-13T19:23:45.123Z"))
            .write_expecting(&stream(), 0, late())
            .unwrap();

        assert!(dir
            .path()
            .join("2017-03-13T19:23:45.123Z.category.stream.0000000000000001.EventType.json")
            .exists());
    }

    #[test]
    fn refuses_to_write_event_with_unsatisfied_expectation() {
        let dir = tempfile::tempdir().unwrap();
        given_loose_file(
            dir.path(),
            "2017-03-13T19:00:00.000Z.category.stream.0000000000000000.EventType.json",
            "{}",
        );
        let before = files(dir.path());

        let err = writer_at(dir.path(), at("2017-03-13T19:23:45.123Z"))
            .write_expecting(&stream(), 5, late())
            .unwrap_err();

        match err {
            EventStoreError::WrongExpectedVersion {
                stream_id,
                actual,
                expected,
            } => {
                assert_eq!(stream_id, stream());
                assert_eq!(actual, 0);
                assert_eq!(expected, 5);
            }
            other => panic!("expected WrongExpectedVersion, got {other}"),
        }
        assert_eq!(files(dir.path()), before);
    }

    #[test]
    fn expectation_is_checked_for_empty_batches() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer_at(dir.path(), at("2017-03-13T19:23:45.123Z"));

        assert!(writer
            .write_expecting(&stream(), EMPTY_STREAM_EVENT_NUMBER, vec![])
            .unwrap()
            .is_empty());
        assert!(writer
            .write_expecting(&stream(), 0, vec![])
            .unwrap_err()
            .is_wrong_expected_version());
        assert!(files(dir.path()).is_empty());
    }

    #[test]
    fn writes_distinct_event_numbers_within_and_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let clock = at("2017-03-13T19:23:45.123Z");
        let writer = writer_at(dir.path(), clock.clone());

        writer
            .write(
                &stream(),
                vec![NewEvent::new("EventType", "{}"), NewEvent::new("EventType", "{}")],
            )
            .unwrap();
        let records = writer.write(&stream(), late()).unwrap();
        assert_eq!(records[0].event_number, 2);

        assert_eq!(
            files(dir.path()),
            vec![
                "2017-03-13T19:23:45.123Z.category.stream.0000000000000000.EventType.json",
                "2017-03-13T19:23:45.123Z.category.stream.0000000000000001.EventType.json",
                "2017-03-13T19:23:45.123Z.category.stream.0000000000000002.EventType.json",
            ]
        );
    }

    #[test]
    fn sees_events_written_by_another_writer() {
        let dir = tempfile::tempdir().unwrap();
        let clock = at("2017-03-13T19:23:45.123Z");
        let first = writer_at(dir.path(), clock.clone());
        let second = writer_at(dir.path(), clock.clone());

        first.write(&stream(), late()).unwrap();
        clock.advance(chrono::Duration::milliseconds(1));
        second.write(&stream(), late()).unwrap();
        clock.advance(chrono::Duration::milliseconds(1));

        let records = first.write(&stream(), late()).unwrap();
        assert_eq!(records[0].event_number, 2);
    }

    #[test]
    fn writes_using_next_event_number_after_packed_file_and_creates_manifest() {
        let dir = tempfile::tempdir().unwrap();
        given_pack_file(
            dir.path(),
            &[(
                "2017-03-13T19:00:00.000Z.category.stream.0000000000000000.EventType.json",
                "{ \"type\": \"packed\" }",
            )],
        );

        writer_at(dir.path(), at("2017-03-13T19:23:45.123Z"))
            .write(&stream(), late())
            .unwrap();

        assert!(dir
            .path()
            .join("2017-03-13T19:23:45.123Z.category.stream.0000000000000001.EventType.json")
            .exists());
        assert_eq!(content(dir.path(), "2017-03-13T19:00:00.000Z.manifest"), "category stream 0\n");
        assert!(!files(dir.path()).iter().any(|f| f.contains("LOCK")));
    }

    #[test]
    fn only_consults_the_most_recent_archive_holding_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        given_pack_file(
            dir.path(),
            &[("2017-03-13T19:00:00.000Z.category.streamA.0000000000000000.EventType.json", "{}")],
        );
        given_pack_file(
            dir.path(),
            &[("2017-03-13T20:00:00.000Z.category.streamA.0000000000000001.EventType.json", "{}")],
        );

        writer_at(dir.path(), at("2017-08-01T00:00:00Z"))
            .write(&StreamId::new("category", "streamA"), late())
            .unwrap();

        assert!(dir
            .path()
            .join("2017-08-01T00:00:00.000Z.category.streamA.0000000000000002.EventType.json")
            .exists());
        assert_eq!(
            content(dir.path(), "2017-03-13T20:00:00.000Z.manifest"),
            "category streamA 1\n"
        );
        assert!(!dir.path().join("2017-03-13T19:00:00.000Z.manifest").exists());
    }

    #[test]
    fn newer_loose_file_in_the_archive_millisecond_beats_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        given_pack_file(
            dir.path(),
            &[("2017-03-13T19:00:00.000Z.category.stream.0000000000000000.EventType.json", "{}")],
        );
        // Sorts before "2017-03-13T19:00:00.000Z.cpio.xz".
        given_loose_file(
            dir.path(),
            "2017-03-13T19:00:00.000Z.category.stream.0000000000000001.Another.json",
            "{}",
        );

        let records = writer_at(dir.path(), at("2017-03-13T19:00:00.000Z"))
            .write(&stream(), late())
            .unwrap();
        assert_eq!(records[0].event_number, 2);
    }

    #[test]
    fn locked_stream_is_refused_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        given_loose_file(dir.path(), "LOCK.category.stream", "");

        let err = writer_at(dir.path(), at("2017-03-13T19:23:45.123Z"))
            .write(&stream(), late())
            .unwrap_err();
        assert!(matches!(err, EventStoreError::StreamLocked(_)), "{err}");
        assert_eq!(files(dir.path()), vec!["LOCK.category.stream"]);
    }

    #[test]
    fn rejects_names_that_cannot_be_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer_at(dir.path(), at("2017-03-13T19:23:45.123Z"));

        for (stream_id, event_type) in [
            (StreamId::new("cate.gory", "stream"), "EventType"),
            (StreamId::new("category", "str eam"), "EventType"),
            (StreamId::new("category", ""), "EventType"),
            (stream(), "Event.Type"),
        ] {
            let err = writer
                .write(&stream_id, vec![NewEvent::new(event_type, "{}")])
                .unwrap_err();
            assert!(matches!(err, EventStoreError::InvalidAppend(_)), "{err}");
        }
        assert!(files(dir.path()).is_empty());
    }

    #[test]
    fn in_process_locks_leave_no_marker_files() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StreamPositionTracker::new(dir.path(), Box::new(InProcessLocks::new()));

        let held = tracker.lock(&stream()).unwrap();
        assert_eq!(held.last_event_number(), EMPTY_STREAM_EVENT_NUMBER);
        assert!(matches!(tracker.lock(&stream()), Err(EventStoreError::StreamLocked(_))));
        assert!(files(dir.path()).is_empty());
    }
}
