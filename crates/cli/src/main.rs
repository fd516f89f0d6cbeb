//! `flatpack`: maintenance commands for a flat-pack event store directory.
//!
//! Usage:
//!   flatpack --dir /var/lib/events pack --min-files 500
//!   flatpack dump --after '2016-05-20T05:16:58.061Z.cpio.xz#2016-...json'

use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use eventstore_core::{ResolvedEvent, SystemClock};
use eventstore_infra::config::{ENV_DIR, FlatPackConfig};
use eventstore_infra::event_store::{
    EventReader, EventSource, FlatPackEventSource, FlatPackPosition, PositionCodec,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "flatpack")]
#[command(about = "Inspect and compact a flat-pack event store directory")]
struct Args {
    /// Store directory (overrides EVENTSTORE_DIR)
    #[arg(short, long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge loose event files into a new archive
    Pack {
        /// Skip packing below this many loose files (default from config)
        #[arg(long)]
        min_files: Option<usize>,
    },
    /// Print events as JSON lines, in store order
    Dump {
        /// Only events after this encoded position
        #[arg(long)]
        after: Option<String>,
    },
}

/// One line of `dump` output.
#[derive(Debug, Serialize)]
struct DumpedEvent {
    position: String,
    category: String,
    id: String,
    event_number: i64,
    timestamp: String,
    event_type: String,
    data: serde_json::Value,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    metadata: serde_json::Value,
}

impl DumpedEvent {
    fn new(position: String, resolved: ResolvedEvent<FlatPackPosition>) -> Self {
        let event = resolved.event;
        Self {
            position,
            category: event.stream_id.category,
            id: event.stream_id.id,
            event_number: event.event_number,
            timestamp: event.timestamp.to_rfc3339(),
            event_type: event.event_type,
            data: blob_to_json(&event.data),
            metadata: blob_to_json(&event.metadata),
        }
    }
}

/// Blobs that hold JSON are embedded as-is; anything else becomes a string.
fn blob_to_json(blob: &[u8]) -> serde_json::Value {
    if blob.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(blob)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(blob).into_owned()))
}

fn load_config(dir: Option<PathBuf>) -> anyhow::Result<FlatPackConfig> {
    let dir = dir.map(|d| d.to_string_lossy().into_owned());
    FlatPackConfig::from_lookup(|name| {
        if name == ENV_DIR && dir.is_some() {
            return dir.clone();
        }
        std::env::var(name).ok()
    })
    .context("loading flat-pack configuration")
}

fn pack(source: &FlatPackEventSource, min_files: Option<usize>) -> anyhow::Result<()> {
    let minimum = min_files.unwrap_or(source.config().pack_minimum_files);
    let summary = source
        .pack_loose_files(minimum)
        .with_context(|| format!("packing {}", source.directory().display()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match summary {
        Some(summary) => serde_json::to_writer(&mut out, &summary)?,
        None => serde_json::to_writer(
            &mut out,
            &serde_json::json!({ "skipped": true, "minimum_files": minimum }),
        )?,
    }
    writeln!(out)?;
    Ok(())
}

fn dump(source: &FlatPackEventSource, after: Option<String>) -> anyhow::Result<()> {
    let reader = source.store_reader();
    let codec = reader.position_codec();
    let after = match after {
        Some(encoded) => codec
            .decode(&encoded)
            .with_context(|| format!("decoding position {encoded:?}"))?,
        None => reader.empty_store_position(),
    };

    let mut out = BufWriter::new(io::stdout().lock());
    let mut count = 0usize;
    for resolved in reader.read_all_forwards(&after)? {
        let resolved = resolved.context("reading events")?;
        let line = DumpedEvent::new(codec.encode(&resolved.position), resolved);
        serde_json::to_writer(&mut out, &line)?;
        writeln!(out)?;
        count += 1;
    }
    out.flush()?;
    tracing::debug!(events = count, "dump complete");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    eventstore_observability::init();

    let args = Args::parse();
    let config = load_config(args.dir)?;
    let source = FlatPackEventSource::open(config, Arc::new(SystemClock))
        .context("opening event store")?;

    match args.command {
        Command::Pack { min_files } => pack(&source, min_files),
        Command::Dump { after } => dump(&source, after),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use eventstore_core::{EventRecord, StreamId};

    #[test]
    fn parses_subcommands_with_global_dir() {
        let args =
            Args::try_parse_from(["flatpack", "pack", "--min-files", "5", "--dir", "/tmp/x"])
                .unwrap();
        assert_eq!(args.dir, Some(PathBuf::from("/tmp/x")));
        assert!(matches!(args.command, Command::Pack { min_files: Some(5) }));

        let args = Args::try_parse_from(["flatpack", "dump"]).unwrap();
        assert!(matches!(args.command, Command::Dump { after: None }));
    }

    #[test]
    fn embeds_json_blobs_and_quotes_the_rest() {
        assert_eq!(blob_to_json(b"{\"a\":1}"), serde_json::json!({ "a": 1 }));
        assert_eq!(blob_to_json(b"plain"), serde_json::json!("plain"));
        assert_eq!(blob_to_json(b""), serde_json::Value::Null);
    }

    #[test]
    fn dumped_event_omits_missing_metadata() {
        let record = EventRecord {
            stream_id: StreamId::new("cat", "1"),
            event_number: 0,
            timestamp: DateTime::parse_from_rfc3339("2016-05-20T05:16:58.061Z")
                .unwrap()
                .with_timezone(&Utc),
            event_type: "A".into(),
            data: b"{}".to_vec(),
            metadata: vec![],
        };
        let line = DumpedEvent::new("pos".into(), record.resolve(FlatPackPosition::loose("pos")));
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["category"], "cat");
        assert_eq!(json["data"], serde_json::json!({}));
        assert!(json.get("metadata").is_none());
    }
}
