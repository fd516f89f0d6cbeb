//! Merges loose event files into an archive plus manifest.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Store;
use super::archive::{create_pack, entry_names, finish_pack};
use super::directory::{self, Listing};
use super::filename::{
    EventFilename, TEMP_PREFIX, TEMP_SUFFIX, manifest_filename, pack_filename, timestamp_of,
};
use super::manifest::Manifest;
use crate::event_store::EventStoreError;

/// What one compaction produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackSummary {
    pub pack_file: String,
    pub manifest_file: String,
    pub files_packed: usize,
    pub streams: usize,
}

/// Pack every loose file, provided there are at least `minimum_files` of
/// them. Returns `None` (and touches nothing) otherwise.
///
/// Loose files already held by the newest archive are left over from a
/// compaction that stopped before deleting them. They are never packed a
/// second time, and are deleted along with the files that are.
///
/// The archive only becomes visible, under its final name, once it and its
/// manifest are complete; the loose files are deleted after that.
pub(crate) fn pack_loose_files(
    store: &Store,
    minimum_files: usize,
    compression_level: u32,
) -> Result<Option<PackSummary>, EventStoreError> {
    let _exclusive = store.lock.exclusive()?;

    let (loose, debris) = split_debris(&store.directory, directory::list(&store.directory)?)?;
    if loose.is_empty() || loose.len() < minimum_files {
        debug!(
            loose_files = loose.len(),
            debris = debris.len(),
            minimum_files,
            "not enough loose files to pack"
        );
        return Ok(None);
    }
    let parsed = loose
        .iter()
        .map(|name| EventFilename::parse(name))
        .collect::<Result<Vec<_>, _>>()?;

    let temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(&store.directory)?;

    let mut manifest = Manifest::new();
    let mut writer = create_pack(temp.as_file(), compression_level);
    for (name, filename) in loose.iter().zip(&parsed) {
        let body = fs::read(store.directory.join(name))?;
        writer.append(name, filename.timestamp.timestamp(), &body)?;
        manifest.record(&filename.stream_id, filename.event_number);
    }
    finish_pack(writer)?.sync_all()?;

    let Some(newest) = parsed.last() else {
        return Ok(None);
    };
    let pack_file = pack_filename(&newest.timestamp_text);
    let manifest_file = manifest_filename(&newest.timestamp_text);
    let manifest_path = store.directory.join(&manifest_file);

    manifest.write_new(&manifest_path)?;
    if let Err(e) = temp.persist_noclobber(store.directory.join(&pack_file)) {
        if let Err(cleanup) = fs::remove_file(&manifest_path) {
            warn!(
                manifest = %manifest_file,
                error = %cleanup,
                "failed to remove orphaned manifest"
            );
        }
        return Err(e.error.into());
    }

    if !debris.is_empty() {
        debug!(debris = debris.len(), "removing loose files left by an earlier compaction");
    }
    for name in loose.iter().chain(&debris) {
        match fs::remove_file(store.directory.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    let summary = PackSummary {
        pack_file,
        manifest_file,
        files_packed: loose.len(),
        streams: manifest.stream_count(),
    };
    info!(
        pack_file = %summary.pack_file,
        files_packed = summary.files_packed,
        streams = summary.streams,
        "packed loose event files"
    );
    Ok(Some(summary))
}

/// Split loose files into those still to be packed and those the newest
/// archive already holds: anything older than the archive, and anything
/// sharing its timestamp that appears among its entries.
fn split_debris(
    directory: &Path,
    listing: Listing,
) -> Result<(Vec<String>, Vec<String>), EventStoreError> {
    let Some(cutoff) = listing.merged_until().map(str::to_string) else {
        return Ok((listing.loose, Vec::new()));
    };
    let (debris, live): (Vec<String>, Vec<String>) = listing
        .loose
        .into_iter()
        .partition(|name| timestamp_of(name) < cutoff.as_str());

    if !live.iter().any(|name| timestamp_of(name) == cutoff.as_str()) {
        return Ok((live, debris));
    }
    let Some(newest_pack) = listing.packs.last() else {
        return Ok((live, debris));
    };
    let archived: HashSet<String> = entry_names(&directory.join(newest_pack))?
        .into_iter()
        .collect();
    let (also_debris, live): (Vec<String>, Vec<String>) =
        live.into_iter().partition(|name| archived.contains(name));
    Ok((live, debris.into_iter().chain(also_debris).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::flatpack::archive::open_pack;
    use crate::event_store::flatpack::test_support::{files, given_loose_file, given_pack_file};

    const A: &str = "2016-05-20T05:16:58.061Z.cat.1.0000000000000000.A.json";
    const B: &str = "2016-05-20T05:16:58.062Z.dog.1.0000000000000000.B.json";
    const C: &str = "2016-05-20T05:16:58.063Z.cat.1.0000000000000001.C.json";

    #[test]
    fn packs_loose_files_into_an_archive_named_after_the_newest() {
        let dir = tempfile::tempdir().unwrap();
        for name in [A, B, C] {
            given_loose_file(dir.path(), name, "{}");
        }

        let summary = pack_loose_files(&Store::new(dir.path().to_path_buf()), 1, 1)
            .unwrap()
            .unwrap();

        assert_eq!(
            summary,
            PackSummary {
                pack_file: "2016-05-20T05:16:58.063Z.cpio.xz".into(),
                manifest_file: "2016-05-20T05:16:58.063Z.manifest".into(),
                files_packed: 3,
                streams: 2,
            }
        );
        assert_eq!(
            files(dir.path()),
            vec![summary.pack_file.clone(), summary.manifest_file.clone()]
        );
        assert_eq!(
            fs::read_to_string(dir.path().join(&summary.manifest_file)).unwrap(),
            "cat 1 1\ndog 1 0\n"
        );

        assert_eq!(entry_names(&dir.path().join(&summary.pack_file)).unwrap(), vec![A, B, C]);
    }

    #[test]
    fn leaves_the_directory_alone_below_the_minimum() {
        let dir = tempfile::tempdir().unwrap();
        given_loose_file(dir.path(), A, "{}");

        let store = Store::new(dir.path().to_path_buf());
        assert_eq!(pack_loose_files(&store, 2, 1).unwrap(), None);
        assert_eq!(files(dir.path()), vec![A]);
    }

    #[test]
    fn empty_directory_is_never_packed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        assert_eq!(pack_loose_files(&store, 0, 1).unwrap(), None);
        assert!(files(dir.path()).is_empty());
    }

    #[test]
    fn unparseable_loose_file_aborts_without_leaving_a_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        given_loose_file(dir.path(), A, "{}");
        given_loose_file(dir.path(), "2016-05-20T05:16:58.062Z.scratch.json", "{}");

        let err = pack_loose_files(&Store::new(dir.path().to_path_buf()), 1, 1).unwrap_err();
        assert!(matches!(err, EventStoreError::Parse(_)), "{err}");
        assert_eq!(files(dir.path()).len(), 2);
    }

    #[test]
    fn refuses_to_replace_an_existing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        given_loose_file(dir.path(), A, "{}");
        given_loose_file(dir.path(), "2016-05-20T05:16:58.061Z.manifest", "cat 1 0\n");

        let err = pack_loose_files(&Store::new(dir.path().to_path_buf()), 1, 1).unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists
        ));
        assert_eq!(files(dir.path()), vec![A, "2016-05-20T05:16:58.061Z.manifest"]);
    }

    #[test]
    fn files_left_behind_by_an_interrupted_compaction_are_not_packed_again() {
        let dir = tempfile::tempdir().unwrap();
        let old_pack = given_pack_file(dir.path(), &[(A, "{}"), (B, "{}")]);
        for name in [A, B, C] {
            given_loose_file(dir.path(), name, "{}");
        }

        let summary = pack_loose_files(&Store::new(dir.path().to_path_buf()), 1, 1)
            .unwrap()
            .unwrap();

        assert_eq!(summary.files_packed, 1);
        assert_eq!(summary.streams, 1);
        assert_eq!(entry_names(&dir.path().join(&summary.pack_file)).unwrap(), vec![C]);
        assert_eq!(
            files(dir.path()),
            vec![old_pack, summary.pack_file.clone(), summary.manifest_file.clone()]
        );
    }

    #[test]
    fn only_debris_left_is_not_enough_to_pack() {
        let dir = tempfile::tempdir().unwrap();
        let old_pack = given_pack_file(dir.path(), &[(A, "{}"), (B, "{}")]);
        given_loose_file(dir.path(), A, "{}");
        given_loose_file(dir.path(), B, "{}");

        let store = Store::new(dir.path().to_path_buf());
        assert_eq!(pack_loose_files(&store, 1, 1).unwrap(), None);
        // The older archive sorts between the two leftovers.
        assert_eq!(files(dir.path()), vec![A.to_string(), old_pack, B.to_string()]);
    }
}
