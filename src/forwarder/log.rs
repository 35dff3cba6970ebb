//! Append-only audit log of forward attempts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::ForwardError;
use crate::types::{DeviceIdentity, RecordId};

/// What happened to one record on one delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForwardOutcome {
    Attempt,
    Skip,
    Success,
    Failure,
}

impl std::fmt::Display for ForwardOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ForwardOutcome::Attempt => "ATTEMPT",
            ForwardOutcome::Skip => "SKIP",
            ForwardOutcome::Success => "SUCCESS",
            ForwardOutcome::Failure => "FAILURE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardLogEntry {
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
    pub identity: Option<DeviceIdentity>,
    pub outcome: ForwardOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl ForwardLogEntry {
    pub fn new(
        record_id: Option<RecordId>,
        identity: Option<DeviceIdentity>,
        outcome: ForwardOutcome,
    ) -> Self {
        Self {
            at: Utc::now(),
            record_id,
            identity,
            outcome,
            reason: None,
            command: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

#[async_trait]
pub trait ForwardLog: Send + Sync {
    async fn append(&self, entry: &ForwardLogEntry) -> Result<(), ForwardError>;
}

/// JSON-lines file, flushed and synced after every entry.
pub struct JsonlForwardLog {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<File>>,
}

impl JsonlForwardLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ForwardLog for JsonlForwardLog {
    async fn append(&self, entry: &ForwardLogEntry) -> Result<(), ForwardError> {
        let mut line =
            serde_json::to_vec(entry).map_err(|e| ForwardError::Log(e.to_string()))?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ForwardError::Log(e.to_string()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| ForwardError::Log(format!("{}: {e}", self.path.display())))?;
            *guard = Some(file);
        }

        if let Some(file) = guard.as_mut() {
            let written = async {
                file.write_all(&line).await?;
                file.flush().await?;
                file.sync_data().await
            }
            .await;
            if let Err(e) = written {
                // Reopen on the next append
                *guard = None;
                return Err(ForwardError::Log(e.to_string()));
            }
        }
        Ok(())
    }
}

/// In-memory log for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryForwardLog {
    entries: Mutex<Vec<ForwardLogEntry>>,
}

impl MemoryForwardLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ForwardLogEntry> {
        self.entries.lock().clone()
    }

    pub fn count(&self, outcome: ForwardOutcome) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.outcome == outcome)
            .count()
    }
}

#[async_trait]
impl ForwardLog for MemoryForwardLog {
    async fn append(&self, entry: &ForwardLogEntry) -> Result<(), ForwardError> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}
