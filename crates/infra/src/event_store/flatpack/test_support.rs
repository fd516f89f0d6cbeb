//! Directory fixtures for flat-pack tests.

use std::fs::{self, File};
use std::path::Path;

use super::archive::{create_pack, finish_pack};
use super::filename::{pack_filename, timestamp_of};

pub fn given_loose_file(directory: &Path, name: &str, body: &str) -> String {
    fs::write(directory.join(name), body).unwrap();
    name.to_string()
}

/// Write an archive of `entries` named after the last entry, without a
/// manifest.
pub fn given_pack_file(directory: &Path, entries: &[(&str, &str)]) -> String {
    let (last, _) = entries.last().expect("at least one entry");
    let name = pack_filename(timestamp_of(last));
    let mut writer = create_pack(File::create(directory.join(&name)).unwrap(), 1);
    for (entry, body) in entries {
        writer.append(entry, 0, body.as_bytes()).unwrap();
    }
    finish_pack(writer).unwrap().sync_all().unwrap();
    name
}

/// Every entry in `directory`, sorted.
pub fn files(directory: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(directory)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}
