use std::fs;
use std::io;
use std::path::Path;

use super::filename::{FileKind, classify, timestamp_of};

/// Event-bearing entries of a flat-pack directory, each sorted ascending.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Listing {
    pub loose: Vec<String>,
    pub packs: Vec<String>,
}

impl Listing {
    /// Timestamp of the newest archive. Loose files older than this were
    /// merged into an archive by a compaction that stopped before deleting
    /// them.
    pub fn merged_until(&self) -> Option<&str> {
        self.packs.last().map(|pack| timestamp_of(pack))
    }
}

/// List loose files and archives; anything else (manifests, lock markers,
/// temp files, foreign files) is ignored.
pub fn list(directory: &Path) -> io::Result<Listing> {
    let mut listing = Listing::default();
    for entry in fs::read_dir(directory)? {
        let Ok(name) = entry?.file_name().into_string() else {
            continue;
        };
        match classify(&name) {
            FileKind::Loose => listing.loose.push(name),
            FileKind::Pack => listing.packs.push(name),
            FileKind::Manifest | FileKind::Lock | FileKind::Temp | FileKind::Other => {}
        }
    }
    listing.loose.sort();
    listing.packs.sort();
    Ok(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::flatpack::test_support::given_loose_file;

    #[test]
    fn ignores_everything_but_events_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "2016-05-20T05:16:58.062Z.cat.1.0000000000000001.A.json",
            "2016-05-20T05:16:58.061Z.cat.1.0000000000000000.A.json",
            "2016-05-20T05:16:57.000Z.cpio.xz",
            "2016-05-20T05:16:57.000Z.manifest",
            "LOCK.cat.1",
            ".pack.x1y2z3.tmp",
            "README",
        ] {
            given_loose_file(dir.path(), name, "");
        }

        let listing = list(dir.path()).unwrap();
        assert_eq!(
            listing.loose,
            vec![
                "2016-05-20T05:16:58.061Z.cat.1.0000000000000000.A.json",
                "2016-05-20T05:16:58.062Z.cat.1.0000000000000001.A.json",
            ]
        );
        assert_eq!(listing.packs, vec!["2016-05-20T05:16:57.000Z.cpio.xz"]);
        assert_eq!(listing.merged_until(), Some("2016-05-20T05:16:57.000Z"));
        assert_eq!(Listing::default().merged_until(), None);
    }
}
