//! JsonlRecordSink — append-only newline-delimited JSON record stream.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::PersistenceError;
use crate::pipeline::types::{CustomerLookup, FinalRecord, RecordSink, UNKNOWN_SENDER};

/// One `FinalRecord` per line, appended in completion order.
///
/// Doubles as the customer directory: a sender is known once any record
/// from them has been written, in this process or an earlier one.
pub struct JsonlRecordSink {
    path: PathBuf,
    stream: Mutex<Stream>,
    known_senders: RwLock<HashSet<String>>,
}

struct Stream {
    file: tokio::fs::File,
    /// The last line on disk is unterminated (a crash or failed write left
    /// it torn); the next append starts on a fresh line.
    torn: bool,
}

impl JsonlRecordSink {
    /// Open (or create) the stream and index the senders already in it.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (known_senders, torn) = match tokio::fs::read_to_string(&path).await {
            Ok(existing) => (
                index_senders(&existing),
                !existing.is_empty() && !existing.ends_with('\n'),
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (HashSet::new(), false),
            Err(e) => return Err(e.into()),
        };
        if torn {
            warn!(path = %path.display(), "Record stream ends mid-line; next record starts a new line");
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(
            path = %path.display(),
            known_senders = known_senders.len(),
            "Record stream opened"
        );

        Ok(Self {
            path,
            stream: Mutex::new(Stream { file, torn }),
            known_senders: RwLock::new(known_senders),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of distinct senders with at least one persisted record.
    pub fn known_sender_count(&self) -> usize {
        self.known_senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn normalize_identity(identity: &str) -> String {
    identity.trim().to_lowercase()
}

/// Collect senders from existing lines. Unreadable lines are skipped.
fn index_senders(contents: &str) -> HashSet<String> {
    let mut senders = HashSet::new();
    for (n, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => {
                if let Some(sender) = value.get("sender").and_then(|s| s.as_str()) {
                    senders.insert(normalize_identity(sender));
                }
            }
            Err(e) => warn!(line = n + 1, error = %e, "Skipping unreadable record line"),
        }
    }
    senders
}

#[async_trait]
impl RecordSink for JsonlRecordSink {
    async fn append(&self, record: &FinalRecord) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let write_failed = |e: std::io::Error| PersistenceError::WriteFailed {
            id: record.item.id.clone(),
            reason: e.to_string(),
        };

        {
            let mut stream = self.stream.lock().await;
            if stream.torn {
                stream.file.write_all(b"\n").await.map_err(write_failed)?;
                stream.torn = false;
            }
            // A failed write may leave part of the line behind.
            stream.torn = true;
            stream.file.write_all(line.as_bytes()).await.map_err(write_failed)?;
            stream.file.flush().await.map_err(write_failed)?;
            stream.torn = false;
        }

        self.known_senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize_identity(&record.item.sender));

        debug!(id = %record.item.id, bytes = line.len(), "Record appended");
        Ok(())
    }
}

#[async_trait]
impl CustomerLookup for JsonlRecordSink {
    async fn exists(&self, identity: &str) -> Result<bool, PersistenceError> {
        if normalize_identity(identity) == UNKNOWN_SENDER {
            return Ok(false);
        }
        Ok(self
            .known_senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&normalize_identity(identity)))
    }
}
