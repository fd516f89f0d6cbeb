//! Store-wide forward reads over loose files and archives.
//!
//! A read lists the directory under the shared lock, then releases it and
//! streams events by merging the qualifying archives' entries with the
//! qualifying loose files in filename order. Archives are opened only when
//! the merge reaches them.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::sync::Arc;

use tracing::{debug, instrument};

use eventstore_core::{EventRecord, ResolvedEvent};

use super::Store;
use super::archive::{PackEntry, PackFileReader, open_pack};
use super::content::split_content;
use super::directory;
use super::filename::{EventFilename, pack_may_follow, timestamp_of};
use super::position::{FlatPackPosition, FlatPackPositionCodec};
use crate::event_store::{EventReader, EventStoreError, ResolvedEvents};

/// How many times one read may start over after a listed loose file was
/// absorbed by a concurrent compaction.
const MAX_REPLANS: u32 = 8;

/// Reader half of [`FlatPackEventSource`](super::FlatPackEventSource).
#[derive(Debug, Clone)]
pub struct FlatPackEventReader {
    store: Arc<Store>,
    codec: FlatPackPositionCodec,
}

impl FlatPackEventReader {
    pub(crate) fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            codec: FlatPackPositionCodec,
        }
    }
}

impl EventReader for FlatPackEventReader {
    type Position = FlatPackPosition;
    type Codec = FlatPackPositionCodec;

    fn empty_store_position(&self) -> FlatPackPosition {
        FlatPackPosition::empty()
    }

    fn position_codec(&self) -> &FlatPackPositionCodec {
        &self.codec
    }

    #[instrument(skip(self, after), fields(after = after.sort_key()), err)]
    fn read_all_forwards(
        &self,
        after: &FlatPackPosition,
    ) -> Result<ResolvedEvents<'_, FlatPackPosition>, EventStoreError> {
        let plan = ReadPlan::list(&self.store, after.sort_key())?;
        debug!(
            loose_files = plan.loose.len(),
            packs = plan.packs.len(),
            "planned forward read"
        );
        Ok(Box::new(MergedEvents {
            store: self.store.clone(),
            last_key: after.sort_key().to_string(),
            plan,
            current_pack: None,
            pending: None,
            replans_left: MAX_REPLANS,
            done: false,
        }))
    }
}

/// The files one read will visit, fixed when the directory is listed.
#[derive(Debug)]
struct ReadPlan {
    /// Sort key the read resumes after.
    after_key: String,
    loose: VecDeque<String>,
    packs: VecDeque<String>,
}

impl ReadPlan {
    fn list(store: &Store, after_key: &str) -> Result<Self, EventStoreError> {
        let listing = {
            let _shared = store.lock.shared()?;
            directory::list(&store.directory)?
        };

        let cutoff = listing.merged_until().map(str::to_string);
        let packs: VecDeque<String> = listing
            .packs
            .into_iter()
            .filter(|pack| pack_may_follow(pack, after_key))
            .collect();
        let loose = listing
            .loose
            .into_iter()
            .filter(|name| name.as_str() > after_key)
            .filter(|name| {
                cutoff
                    .as_deref()
                    .is_none_or(|cutoff| timestamp_of(name) >= cutoff)
            })
            .collect();

        Ok(Self {
            after_key: after_key.to_string(),
            loose,
            packs,
        })
    }
}

struct OpenPack {
    name: String,
    reader: PackFileReader,
}

/// Lazily merges archive entries with loose files.
struct MergedEvents {
    store: Arc<Store>,
    /// Sort key of the last event yielded (or of the starting position).
    last_key: String,
    plan: ReadPlan,
    current_pack: Option<OpenPack>,
    /// Next archive entry, with the archive it came from.
    pending: Option<(String, PackEntry)>,
    replans_left: u32,
    done: bool,
}

enum Step {
    Emit(ResolvedEvent<FlatPackPosition>),
    Skip,
    Replan,
    Finished,
}

impl MergedEvents {
    fn step(&mut self) -> Result<Step, EventStoreError> {
        self.fill_pending()?;

        let order = match (self.plan.loose.front(), &self.pending) {
            (None, None) => return Ok(Step::Finished),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(loose), Some((_, entry))) => loose.as_str().cmp(entry.name.as_str()),
        };
        if order == Ordering::Equal {
            // Archived copy wins over leftover debris.
            self.plan.loose.pop_front();
            return Ok(Step::Skip);
        }

        if order == Ordering::Less {
            let Some(name) = self.plan.loose.front().cloned() else {
                return Ok(Step::Finished);
            };
            let filename = EventFilename::parse(&name)?;
            let body = match fs::read(self.store.directory.join(&name)) {
                Ok(body) => body,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Step::Replan),
                Err(e) => return Err(e.into()),
            };
            self.plan.loose.pop_front();
            Ok(Step::Emit(
                to_record(&filename, body).resolve(FlatPackPosition::loose(name)),
            ))
        } else {
            let Some((pack, entry)) = self.pending.take() else {
                return Ok(Step::Finished);
            };
            let filename = EventFilename::parse(&entry.name)?;
            Ok(Step::Emit(
                to_record(&filename, entry.data)
                    .resolve(FlatPackPosition::packed(pack, entry.name)),
            ))
        }
    }

    /// Make sure `pending` holds the next archive entry after the plan's
    /// starting point, if any archive has one left.
    fn fill_pending(&mut self) -> Result<(), EventStoreError> {
        while self.pending.is_none() {
            let Some(open) = self.current_pack.as_mut() else {
                let Some(name) = self.plan.packs.pop_front() else {
                    return Ok(());
                };
                let reader = open_pack(&self.store.directory.join(&name))?;
                self.current_pack = Some(OpenPack { name, reader });
                continue;
            };

            match open.reader.next_entry()? {
                Some(entry) if entry.name.as_str() > self.plan.after_key.as_str() => {
                    self.pending = Some((open.name.clone(), entry));
                }
                Some(_) => {}
                None => self.current_pack = None,
            }
        }
        Ok(())
    }

    fn replan(&mut self) -> Result<(), EventStoreError> {
        if self.replans_left == 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "loose files kept disappearing while reading",
            )
            .into());
        }
        self.replans_left -= 1;
        debug!(after = %self.last_key, "loose file vanished, re-planning read");
        self.plan = ReadPlan::list(&self.store, &self.last_key)?;
        self.current_pack = None;
        self.pending = None;
        Ok(())
    }
}

impl Iterator for MergedEvents {
    type Item = Result<ResolvedEvent<FlatPackPosition>, EventStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let step = match self.step() {
                Ok(Step::Replan) => self.replan().map(|()| Step::Skip),
                other => other,
            };
            match step {
                Ok(Step::Emit(event)) => {
                    self.last_key = event.position.sort_key().to_string();
                    return Some(Ok(event));
                }
                Ok(Step::Skip | Step::Replan) => {}
                Ok(Step::Finished) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

fn to_record(filename: &EventFilename, body: Vec<u8>) -> EventRecord {
    let (data, metadata) = split_content(body);
    EventRecord {
        stream_id: filename.stream_id.clone(),
        event_number: filename.event_number,
        timestamp: filename.timestamp,
        event_type: filename.event_type.clone(),
        data,
        metadata,
    }
}
