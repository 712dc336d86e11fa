//! Durable journal for records the sink could not take
//!
//! One JSON object per line, appended. Loading skips anything that does not
//! parse so a torn write or a stray line never blocks recovery of the rest.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::JournalError;
use crate::record::QueryLog;

/// Subdirectory of the data directory holding the journal.
pub const JOURNAL_DIR: &str = "querybuffer";

/// Journal file name.
pub const JOURNAL_FILE: &str = "pending-logs.jsonl";

/// Fallback store for unflushed records.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append `logs` after whatever is already stored.
    async fn save(&self, logs: &[QueryLog]) -> Result<(), JournalError>;

    /// Every readable record, in write order.
    async fn load_all(&self) -> Result<Vec<QueryLog>, JournalError>;

    /// Drop everything. Clearing an empty journal is not an error.
    async fn clear(&self) -> Result<(), JournalError>;
}

/// JSON-lines journal backed by a single file.
#[derive(Debug, Clone)]
pub struct FileJournal {
    path: PathBuf,
}

impl FileJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Journal at `<data_dir>/querybuffer/pending-logs.jsonl`.
    pub fn in_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join(JOURNAL_DIR).join(JOURNAL_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Journal for FileJournal {
    async fn save(&self, logs: &[QueryLog]) -> Result<(), JournalError> {
        if logs.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Encode the whole batch up front so it goes out in one append.
        let mut payload = Vec::with_capacity(logs.len() * 256);
        for log in logs {
            serde_json::to_writer(&mut payload, log)?;
            payload.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;

        // A torn last line from an interrupted write must not swallow the
        // first record of this batch.
        if file.metadata().await?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                payload.insert(0, b'\n');
            }
        }

        file.write_all(&payload).await?;
        file.flush().await?;
        file.sync_data().await?;

        tracing::debug!(count = logs.len(), path = %self.path.display(), "Journaled query logs");
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<QueryLog>, JournalError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut logs = Vec::new();
        let mut skipped = 0usize;
        for line in bytes.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<QueryLog>(line) {
                Ok(log) => logs.push(log),
                Err(_) => skipped += 1,
            }
        }

        if skipped > 0 {
            tracing::warn!(
                skipped,
                loaded = logs.len(),
                path = %self.path.display(),
                "Skipped malformed journal lines"
            );
        }
        Ok(logs)
    }

    async fn clear(&self) -> Result<(), JournalError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
