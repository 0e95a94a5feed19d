/// Append-only audit log of model events.
///
/// Each record is framed independently so a reader can stop at any record
/// boundary:
///
/// ```text
/// [u32 LE payload length][u32 LE crc32 of payload][bincode HistoryRecord]
/// ```
///
/// Only the event kinds listed in `ModelOptions::store_history` are written.
/// Logging is best effort: a failed append is reported through `tracing` and
/// never fails the operation that produced the event.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{ChainError, ChainResult};
use crate::query::TagQuery;
use crate::types::{Tag, Token};

/// Kind of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Start,
    End,
    Train,
    TrainDeferred,
    RepartitionStart,
    RepartitionDone,
    Generate,
}

impl EventKind {
    /// Every kind, for "log everything".
    pub fn all() -> BTreeSet<EventKind> {
        [
            EventKind::Start,
            EventKind::End,
            EventKind::Train,
            EventKind::TrainDeferred,
            EventKind::RepartitionStart,
            EventKind::RepartitionDone,
            EventKind::Generate,
        ]
        .into_iter()
        .collect()
    }
}

impl std::str::FromStr for EventKind {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(EventKind::Start),
            "end" => Ok(EventKind::End),
            "train" => Ok(EventKind::Train),
            "train_deferred" => Ok(EventKind::TrainDeferred),
            "repartition_start" => Ok(EventKind::RepartitionStart),
            "repartition_done" => Ok(EventKind::RepartitionDone),
            "generate" => Ok(EventKind::Generate),
            other => Err(ChainError::InvalidOptions {
                reason: format!("unknown history event kind '{}'", other),
            }),
        }
    }
}

/// Event-specific data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Start { order: usize, partitions: u32 },
    End { total_link_count: u64 },
    Train { tokens: Vec<Token>, tags: Vec<Tag> },
    TrainDeferred { tokens: Vec<Token>, tags: Vec<Tag> },
    RepartitionStart { partitions: u32, total_link_count: u64 },
    RepartitionDone { links_moved: u64, percent_moved: f64 },
    Generate { query: TagQuery, output: Vec<Token> },
}

impl EventPayload {
    /// The kind this payload is logged under.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Start { .. } => EventKind::Start,
            EventPayload::End { .. } => EventKind::End,
            EventPayload::Train { .. } => EventKind::Train,
            EventPayload::TrainDeferred { .. } => EventKind::TrainDeferred,
            EventPayload::RepartitionStart { .. } => EventKind::RepartitionStart,
            EventPayload::RepartitionDone { .. } => EventKind::RepartitionDone,
            EventPayload::Generate { .. } => EventKind::Generate,
        }
    }
}

/// One framed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp_ms: i64,
    pub event_kind: EventKind,
    pub payload: EventPayload,
}

/// Writer for a model's audit log.
#[derive(Debug)]
pub struct HistoryLog {
    path: PathBuf,
    enabled: BTreeSet<EventKind>,
    sink: Option<BufWriter<File>>,
}

impl HistoryLog {
    /// A log at `path` recording the `enabled` kinds. The file is opened on
    /// the first recorded event.
    pub fn new(path: impl Into<PathBuf>, enabled: BTreeSet<EventKind>) -> Self {
        Self {
            path: path.into(),
            enabled,
            sink: None,
        }
    }

    /// Replace the set of recorded kinds.
    pub fn set_enabled(&mut self, enabled: BTreeSet<EventKind>) {
        self.enabled = enabled;
    }

    /// True if `kind` is recorded.
    pub fn is_enabled(&self, kind: EventKind) -> bool {
        self.enabled.contains(&kind)
    }

    /// Record an event if its kind is enabled.
    pub fn record(&mut self, payload: EventPayload) {
        let kind = payload.kind();
        if !self.is_enabled(kind) {
            return;
        }
        let record = HistoryRecord {
            timestamp_ms: Utc::now().timestamp_millis(),
            event_kind: kind,
            payload,
        };
        if let Err(e) = self.append(&record) {
            warn!(error = %e, kind = ?kind, "Failed to append history record");
        }
    }

    fn append(&mut self, record: &HistoryRecord) -> ChainResult<()> {
        let bytes = bincode::serialize(record)?;
        let sink = match self.sink.as_mut() {
            Some(sink) => sink,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .map_err(|e| ChainError::io(&self.path, e))?;
                self.sink.insert(BufWriter::new(file))
            }
        };
        let crc = crc32fast::hash(&bytes);
        let write = |sink: &mut BufWriter<File>| -> std::io::Result<()> {
            sink.write_all(&(bytes.len() as u32).to_le_bytes())?;
            sink.write_all(&crc.to_le_bytes())?;
            sink.write_all(&bytes)
        };
        write(sink).map_err(|e| ChainError::io(&self.path, e))
    }

    /// Push buffered records to disk.
    pub fn flush(&mut self) -> ChainResult<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.flush().map_err(|e| ChainError::io(&self.path, e))?;
        }
        Ok(())
    }
}

impl Drop for HistoryLog {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Decode every complete, intact record in a log file.
///
/// Stops at the first truncated or corrupt frame.
pub fn read_records(path: &Path) -> ChainResult<Vec<HistoryRecord>> {
    let mut bytes = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| ChainError::io(path, e))?;

    let mut records = Vec::new();
    let mut rest = bytes.as_slice();
    while rest.len() >= 8 {
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let crc = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
        let Some(body) = rest.get(8..8 + len) else {
            break;
        };
        if crc32fast::hash(body) != crc {
            break;
        }
        match bincode::deserialize::<HistoryRecord>(body) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        rest = &rest[8 + len..];
    }
    Ok(records)
}
