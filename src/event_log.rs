//! Durable append-only event log.
//!
//! The log is the single source of truth for update ordering: the index of
//! an entry equals its position in append order, with no gaps. Durability is
//! one JSON record per line of an append-only file:
//!
//! ```text
//! {"index":0,"payload":{"type":"increment"}}
//! {"index":1,"payload":{"type":"decrement"}}
//! ```
//!
//! On open the file is read back in full, in order, before any connection is
//! accepted. `append` writes and syncs the record *before* returning the
//! assigned index, so a broadcast can never carry an entry that was not
//! persisted.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::protocol::LogEntry;

/// The ordered, append-only sequence of update payloads.
#[derive(Debug)]
pub struct EventLog {
    /// Payloads in append order; the vector position is the entry index.
    entries: Vec<Value>,
    /// Durable backing file, opened for append. `None` = in-memory only.
    writer: Option<File>,
}

impl EventLog {
    /// Create an ephemeral log with no durable backing.
    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            writer: None,
        }
    }

    /// Open a durable log, replaying any existing records into memory.
    ///
    /// A missing file starts an empty log and is created on first append.
    /// Records must be dense from index 0; a record whose index does not
    /// match its line position is corruption.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, EventLogError> {
        let path = path.as_ref();
        let mut entries = Vec::new();

        match File::open(path).await {
            Ok(file) => {
                let mut lines = BufReader::new(file).lines();
                let mut line_no = 0usize;
                while let Some(line) = lines.next_line().await? {
                    // Diagnostics report the physical file line, which can
                    // run ahead of the record count when blank lines are
                    // skipped.
                    let at_line = line_no;
                    line_no += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let record = LogEntry::decode(&line).map_err(|e| EventLogError::Corrupt {
                        path: path.to_path_buf(),
                        line: at_line,
                        detail: e.to_string(),
                    })?;
                    if record.index != entries.len() as u64 {
                        return Err(EventLogError::Corrupt {
                            path: path.to_path_buf(),
                            line: at_line,
                            detail: format!(
                                "expected index {}, found {}",
                                entries.len(),
                                record.index
                            ),
                        });
                    }
                    entries.push(record.payload);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(EventLogError::Io(e)),
        }

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        log::info!(
            "event log opened at {} with {} entries",
            path.display(),
            entries.len()
        );

        Ok(Self {
            entries,
            writer: Some(writer),
        })
    }

    /// Append a payload, assigning it the next index.
    ///
    /// The record is written and synced to the backing file before the index
    /// is returned; on write failure the log is unchanged and the error is
    /// surfaced to the caller, which must not broadcast the entry.
    pub async fn append(&mut self, payload: Value) -> Result<u64, EventLogError> {
        let index = self.entries.len() as u64;

        if let Some(writer) = &mut self.writer {
            let record = LogEntry::new(index, payload.clone());
            let mut line = record
                .encode()
                .map_err(|e| EventLogError::Encode(e.to_string()))?;
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
            writer.sync_data().await?;
        }

        self.entries.push(payload);
        Ok(index)
    }

    /// Every entry from index 0, in append order. Safe to call repeatedly.
    pub fn replay(&self) -> Vec<LogEntry> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, payload)| LogEntry::new(i as u64, payload.clone()))
            .collect()
    }

    /// Number of entries, which is also the next index to assign.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entry has ever been appended.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The index the next `append` will assign.
    pub fn next_index(&self) -> u64 {
        self.entries.len() as u64
    }
}

/// Event log errors.
#[derive(Debug)]
pub enum EventLogError {
    /// Reading or writing the backing file failed.
    Io(std::io::Error),
    /// A record could not be decoded or is out of sequence.
    Corrupt {
        path: PathBuf,
        line: usize,
        detail: String,
    },
    /// A payload could not be serialized into a record.
    Encode(String),
}

impl std::fmt::Display for EventLogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "event log I/O error: {e}"),
            Self::Corrupt { path, line, detail } => {
                write!(
                    f,
                    "corrupt event log {} at line {line}: {detail}",
                    path.display()
                )
            }
            Self::Encode(e) => write!(f, "event log encode error: {e}"),
        }
    }
}

impl std::error::Error for EventLogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EventLogError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
