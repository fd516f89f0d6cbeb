//! Pack archives: a CPIO "newc" entry stream compressed with xz.
//!
//! Each entry is one former loose file, stored under its original name with
//! its bytes unchanged. Entries are written in ascending name order and the
//! stream ends with the conventional `TRAILER!!!` entry.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::event_store::EventStoreError;

const MAGIC: &[u8; 6] = b"070701";
const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";
const REGULAR_FILE_MODE: u32 = 0o100644;

/// Reader over an archive file on disk.
pub type PackFileReader = PackReader<XzDecoder<BufReader<File>>>;

pub fn open_pack(path: &Path) -> io::Result<PackFileReader> {
    let file = File::open(path)?;
    Ok(PackReader::new(XzDecoder::new(BufReader::new(file))))
}

/// Names of every entry in the archive at `path`, in archive order, without
/// materialising their data.
pub fn entry_names(path: &Path) -> Result<Vec<String>, EventStoreError> {
    let mut reader = open_pack(path)?;
    let mut names = Vec::new();
    while let Some(name) = reader.next_entry_name()? {
        names.push(name);
    }
    Ok(names)
}

/// Start an xz-compressed archive writing to `sink`.
pub fn create_pack<W: Write>(
    sink: W,
    compression_level: u32,
) -> PackWriter<XzEncoder<BufWriter<W>>> {
    PackWriter::new(XzEncoder::new(BufWriter::new(sink), compression_level))
}

/// Flush the trailer and the xz stream, handing back the underlying sink.
pub fn finish_pack<W: Write>(writer: PackWriter<XzEncoder<BufWriter<W>>>) -> io::Result<W> {
    let encoder = writer.finish()?;
    let buffered = encoder.finish()?;
    buffered.into_inner().map_err(|e| e.into_error())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub name: String,
    pub data: Vec<u8>,
}

/// Writes CPIO newc entries to an uncompressed sink.
#[derive(Debug)]
pub struct PackWriter<W: Write> {
    inner: W,
    next_inode: u32,
}

impl<W: Write> PackWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            next_inode: 1,
        }
    }

    /// Append one regular-file entry; `mtime` is in seconds since the epoch.
    pub fn append(&mut self, name: &str, mtime: i64, data: &[u8]) -> io::Result<()> {
        let inode = self.next_inode;
        self.next_inode += 1;
        self.write_entry(inode, REGULAR_FILE_MODE, name, mtime, data)
    }

    /// Write the trailer entry and return the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_entry(0, 0, TRAILER, 0, &[])?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn write_entry(
        &mut self,
        inode: u32,
        mode: u32,
        name: &str,
        mtime: i64,
        data: &[u8],
    ) -> io::Result<()> {
        let name_size = name.len() + 1;
        let file_size = u32::try_from(data.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{name} is too large to pack"),
            )
        })?;
        let fields = [
            inode,
            mode,
            0, // uid
            0, // gid
            if mode == 0 { 0 } else { 1 },
            u32::try_from(mtime).unwrap_or(0),
            file_size,
            0, // devmajor
            0, // devminor
            0, // rdevmajor
            0, // rdevminor
            u32::try_from(name_size)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry name too long"))?,
            0, // check
        ];

        let mut header = Vec::with_capacity(HEADER_LEN + name_size + 3);
        header.extend_from_slice(MAGIC);
        for field in fields {
            header.extend_from_slice(format!("{field:08x}").as_bytes());
        }
        header.extend_from_slice(name.as_bytes());
        header.push(0);
        header.resize(header.len() + padding(HEADER_LEN + name_size), 0);

        self.inner.write_all(&header)?;
        self.inner.write_all(data)?;
        self.inner.write_all(&[0; 3][..padding(data.len())])
    }
}

/// Streams CPIO newc entries, one at a time.
#[derive(Debug)]
pub struct PackReader<R: Read> {
    inner: R,
    finished: bool,
}

struct Header {
    name: String,
    file_size: usize,
}

impl<R: Read> PackReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            finished: false,
        }
    }

    /// The next entry with its data, or `None` after the trailer.
    pub fn next_entry(&mut self) -> Result<Option<PackEntry>, EventStoreError> {
        let Some(header) = self.read_header()? else {
            return Ok(None);
        };
        let mut data = vec![0; header.file_size];
        self.inner.read_exact(&mut data)?;
        self.skip(padding(header.file_size))?;
        Ok(Some(PackEntry {
            name: header.name,
            data,
        }))
    }

    /// The next entry's name, skipping over its data.
    pub fn next_entry_name(&mut self) -> Result<Option<String>, EventStoreError> {
        let Some(header) = self.read_header()? else {
            return Ok(None);
        };
        self.skip(header.file_size + padding(header.file_size))?;
        Ok(Some(header.name))
    }

    fn read_header(&mut self) -> Result<Option<Header>, EventStoreError> {
        if self.finished {
            return Ok(None);
        }

        let mut raw = [0u8; HEADER_LEN];
        read_exact_or_parse(&mut self.inner, &mut raw, "truncated archive header")?;
        if &raw[..6] != MAGIC {
            return Err(EventStoreError::parse("archive entry has bad magic"));
        }

        let field = |idx: usize| -> Result<usize, EventStoreError> {
            let start = 6 + idx * 8;
            let text = std::str::from_utf8(&raw[start..start + 8])
                .map_err(|_| EventStoreError::parse("non-ASCII archive header field"))?;
            usize::from_str_radix(text, 16).map_err(|_| {
                EventStoreError::parse(format!("non-hex archive header field {text:?}"))
            })
        };
        let file_size = field(6)?;
        let name_size = field(11)?;
        if name_size == 0 {
            return Err(EventStoreError::parse("archive entry without a name"));
        }

        let mut name = vec![0; name_size + padding(HEADER_LEN + name_size)];
        read_exact_or_parse(&mut self.inner, &mut name, "truncated archive entry name")?;
        name.truncate(name_size - 1);
        let name = String::from_utf8(name)
            .map_err(|_| EventStoreError::parse("non-UTF-8 archive entry name"))?;

        if name == TRAILER {
            self.finished = true;
            return Ok(None);
        }
        Ok(Some(Header { name, file_size }))
    }

    fn skip(&mut self, len: usize) -> Result<(), EventStoreError> {
        let copied = io::copy(&mut (&mut self.inner).take(len as u64), &mut io::sink())?;
        if copied < len as u64 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }
}

fn read_exact_or_parse(
    reader: &mut impl Read,
    buf: &mut [u8],
    what: &str,
) -> Result<(), EventStoreError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(EventStoreError::parse(what)),
        Err(e) => Err(e.into()),
    }
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = PackWriter::new(Vec::new());
        for (name, data) in entries {
            writer.append(name, 1_463_721_418, data.as_bytes()).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn reads_entries_back_in_write_order() {
        let bytes = archive(&[("a.json", "{\"x\":1}"), ("bb.json", ""), ("ccc.json", "12345")]);
        assert_eq!(bytes.len() % 4, 0);

        let mut reader = PackReader::new(bytes.as_slice());
        let mut names = vec![];
        while let Some(entry) = reader.next_entry().unwrap() {
            names.push((entry.name, entry.data));
        }
        assert_eq!(
            names,
            vec![
                ("a.json".to_string(), b"{\"x\":1}".to_vec()),
                ("bb.json".to_string(), vec![]),
                ("ccc.json".to_string(), b"12345".to_vec()),
            ]
        );
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn skips_data_when_only_names_are_needed() {
        let bytes = archive(&[("first.json", "some data"), ("second.json", "more")]);
        let mut reader = PackReader::new(bytes.as_slice());
        assert_eq!(reader.next_entry_name().unwrap().as_deref(), Some("first.json"));
        let second = reader.next_entry().unwrap().unwrap();
        assert_eq!(second.name, "second.json");
        assert_eq!(second.data, b"more");
        assert_eq!(reader.next_entry_name().unwrap(), None);
    }

    #[test]
    fn writes_regular_file_headers() {
        let bytes = archive(&[("a.json", "x")]);
        let header = std::str::from_utf8(&bytes[..HEADER_LEN]).unwrap();
        assert!(header.starts_with("070701"));
        assert_eq!(&header[6..14], "00000001"); // inode
        assert_eq!(&header[14..22], "000081a4"); // 0100644
        assert_eq!(&header[38..46], "00000001"); // nlink
        assert_eq!(&header[46..54], format!("{:08x}", 1_463_721_418));
        assert_eq!(&header[54..62], "00000001"); // filesize
        assert_eq!(&header[94..102], "00000007"); // "a.json\0"
    }

    #[test]
    fn bad_magic_is_a_parse_error() {
        let mut bytes = archive(&[("a.json", "x")]);
        bytes[0] = b'1';
        let err = PackReader::new(bytes.as_slice()).next_entry().unwrap_err();
        assert!(matches!(err, EventStoreError::Parse(_)), "{err}");
    }

    #[test]
    fn truncated_header_is_a_parse_error() {
        let bytes = archive(&[("a.json", "x")]);
        let err = PackReader::new(&bytes[..50]).next_entry().unwrap_err();
        assert!(matches!(err, EventStoreError::Parse(_)), "{err}");
    }

    #[test]
    fn truncated_data_is_an_io_error() {
        let bytes = archive(&[("a.json", "0123456789")]);
        let cut = HEADER_LEN + 8 + 4;
        let err = PackReader::new(&bytes[..cut]).next_entry().unwrap_err();
        match err {
            EventStoreError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected I/O error, got {other}"),
        }
    }

    #[test]
    fn compressed_archive_survives_a_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pack.cpio.xz");

        let mut writer = create_pack(File::create(&path).unwrap(), 1);
        writer.append("a.json", 0, b"{}").unwrap();
        finish_pack(writer).unwrap().sync_all().unwrap();

        let mut reader = open_pack(&path).unwrap();
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(
            entry,
            PackEntry {
                name: "a.json".into(),
                data: b"{}".to_vec()
            }
        );
        assert!(reader.next_entry().unwrap().is_none());
        assert_eq!(entry_names(&path).unwrap(), vec!["a.json"]);
    }
}
