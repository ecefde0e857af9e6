//! CommandJournal implementations.
//!
//! - `InMemoryCommandJournal`: default, survives nothing, keeps the wiring uniform
//! - `FileCommandJournal`: JSON lines on local disk

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ports::{CommandJournal, JournalError};
use crate::queue::QueuedCommand;

#[derive(Default)]
pub struct InMemoryCommandJournal {
    pending: Mutex<BTreeMap<u64, QueuedCommand>>,
}

impl InMemoryCommandJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandJournal for InMemoryCommandJournal {
    async fn append(&self, entry: &QueuedCommand) -> Result<(), JournalError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| JournalError::Other(e.to_string()))?;
        pending.insert(entry.seq, entry.clone());
        Ok(())
    }

    async fn ack(&self, seq: u64) -> Result<(), JournalError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| JournalError::Other(e.to_string()))?;
        pending.remove(&seq);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<QueuedCommand>, JournalError> {
        let pending = self
            .pending
            .lock()
            .map_err(|e| JournalError::Other(e.to_string()))?;
        Ok(pending.values().cloned().collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Append { entry: QueuedCommand },
    Ack { seq: u64 },
}

/// Records written since the last rewrite before an ack triggers compaction.
const COMPACT_AFTER: usize = 512;

struct FileState {
    path: PathBuf,
    file: File,
    pending: BTreeMap<u64, QueuedCommand>,
    /// Lines in the file.
    records: usize,
}

impl FileState {
    fn should_compact(&self) -> bool {
        (self.pending.is_empty() && self.records > 0)
            || (self.records >= COMPACT_AFTER && self.records >= 2 * self.pending.len())
    }

    fn compact(&mut self) -> Result<(), JournalError> {
        FileCommandJournal::compact(&self.path, &self.pending)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        debug!(
            pending = self.pending.len(),
            dropped = self.records.saturating_sub(self.pending.len()),
            "compacted command journal"
        );
        self.records = self.pending.len();
        Ok(())
    }
}

/// Append-only JSON-lines journal.
///
/// Each line is an `append` or `ack` record. Opening the journal replays the
/// file and rewrites it with only the still-pending appends; so does an ack
/// that leaves nothing pending, or one that finds the file mostly acked.
pub struct FileCommandJournal {
    state: Arc<Mutex<FileState>>,
}

impl FileCommandJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let pending = Self::replay(&path)?;
        Self::compact(&path, &pending)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), pending = pending.len(), "opened command journal");
        Ok(Self {
            state: Arc::new(Mutex::new(FileState {
                path,
                file,
                records: pending.len(),
                pending,
            })),
        })
    }

    fn replay(path: &Path) -> Result<BTreeMap<u64, QueuedCommand>, JournalError> {
        let mut pending = BTreeMap::new();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pending),
            Err(e) => return Err(e.into()),
        };

        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(&line) {
                Ok(JournalRecord::Append { entry }) => {
                    pending.insert(entry.seq, entry);
                }
                Ok(JournalRecord::Ack { seq }) => {
                    pending.remove(&seq);
                }
                // a torn final write is expected after a crash
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping unreadable journal record"),
            }
        }
        Ok(pending)
    }

    fn compact(path: &Path, pending: &BTreeMap<u64, QueuedCommand>) -> Result<(), JournalError> {
        let tmp = path.with_extension("compact");
        {
            let mut out = File::create(&tmp)?;
            for entry in pending.values() {
                write_record(&mut out, &JournalRecord::Append { entry: entry.clone() })?;
            }
            out.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    async fn write(&self, record: JournalRecord) -> Result<(), JournalError> {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || {
            let mut state = state
                .lock()
                .map_err(|e| JournalError::Other(e.to_string()))?;
            write_record(&mut state.file, &record)?;
            state.records += 1;
            match record {
                JournalRecord::Append { entry } => {
                    state.pending.insert(entry.seq, entry);
                }
                JournalRecord::Ack { seq } => {
                    state.pending.remove(&seq);
                    if state.should_compact() {
                        state.compact()?;
                    }
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| JournalError::Other(format!("journal write failed: {e}")))?
    }
}

fn write_record(file: &mut File, record: &JournalRecord) -> Result<(), JournalError> {
    let mut line =
        serde_json::to_string(record).map_err(|e| JournalError::Corrupt(e.to_string()))?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    file.flush()?;
    Ok(())
}

#[async_trait]
impl CommandJournal for FileCommandJournal {
    async fn append(&self, entry: &QueuedCommand) -> Result<(), JournalError> {
        self.write(JournalRecord::Append {
            entry: entry.clone(),
        })
        .await
    }

    async fn ack(&self, seq: u64) -> Result<(), JournalError> {
        self.write(JournalRecord::Ack { seq }).await
    }

    async fn pending(&self) -> Result<Vec<QueuedCommand>, JournalError> {
        let state = self
            .state
            .lock()
            .map_err(|e| JournalError::Other(e.to_string()))?;
        Ok(state.pending.values().cloned().collect())
    }
}
