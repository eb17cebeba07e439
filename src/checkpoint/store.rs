use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use super::snapshot::Checkpoint;
use crate::model::SessionId;

const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checkpoint corruption detected: {reason}")]
    Corrupt { reason: String },

    #[error("Unsupported checkpoint schema version {found}")]
    UnsupportedVersion { found: u32 },
}

/// Durable storage for session checkpoints. Checkpoints are immutable once written.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Newest checkpoint that parses and verifies; invalid ones are skipped.
    async fn load_latest_checkpoint(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Checkpoint>, StoreError>;

    /// Sessions whose latest valid checkpoint is not terminal, plus sessions whose
    /// checkpoints are all unreadable.
    async fn list_nonterminal_sessions(&self) -> Result<Vec<SessionId>, StoreError>;

    /// Every session with at least one stored checkpoint.
    async fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError>;

    /// Deletes all but the newest `keep` checkpoints. Returns how many were removed.
    async fn prune(&self, session_id: &SessionId, keep: usize) -> Result<usize, StoreError>;
}

/// Checkpoints as JSON files under `<root>/<session_id>/`, named by logical timestamp so
/// lexical order is capture order.
pub struct FileSystemStore {
    root: PathBuf,
}

impl FileSystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(session_id.as_str())
    }

    /// Checkpoint files for a session, oldest first.
    async fn checkpoint_files(&self, session_id: &SessionId) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.session_dir(session_id);
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_checkpoint = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(CHECKPOINT_SUFFIX));
            if is_checkpoint {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read_checkpoint(path: &Path) -> Result<Checkpoint, StoreError> {
        let contents = fs::read_to_string(path).await?;
        Checkpoint::from_json(&contents)
    }
}

#[async_trait]
impl CheckpointStore for FileSystemStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let dir = self.session_dir(&checkpoint.session_id);
        fs::create_dir_all(&dir).await?;

        let mut ordinal = 0u32;
        let path = loop {
            let candidate = dir.join(format!(
                "{:020}-{ordinal:03}{CHECKPOINT_SUFFIX}",
                checkpoint.logical_timestamp
            ));
            if !fs::try_exists(&candidate).await? {
                break candidate;
            }
            ordinal += 1;
        };

        // Write to temporary file first, then rename
        let temp_file = path.with_extension("tmp");
        fs::write(&temp_file, checkpoint.to_json()?).await?;
        fs::rename(&temp_file, &path).await?;

        info!(
            session_id = %checkpoint.session_id,
            logical_timestamp = checkpoint.logical_timestamp,
            reason = ?checkpoint.reason,
            file = ?path,
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn load_latest_checkpoint(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Checkpoint>, StoreError> {
        for path in self.checkpoint_files(session_id).await?.into_iter().rev() {
            match Self::read_checkpoint(&path).await {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => warn!(
                    session_id = %session_id,
                    file = ?path,
                    error = %e,
                    "Discarding invalid checkpoint"
                ),
            }
        }
        Ok(None)
    }

    async fn list_nonterminal_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        let mut nonterminal = Vec::new();
        for session_id in self.list_sessions().await? {
            match self.load_latest_checkpoint(&session_id).await? {
                Some(checkpoint) => {
                    if checkpoint
                        .session_state()
                        .is_some_and(|state| !state.is_terminal())
                    {
                        nonterminal.push(session_id);
                    }
                }
                None => nonterminal.push(session_id),
            }
        }
        Ok(nonterminal)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        if !fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let session_id = SessionId::from(name);
            if !self.checkpoint_files(&session_id).await?.is_empty() {
                sessions.push(session_id);
            }
        }
        sessions.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(sessions)
    }

    async fn prune(&self, session_id: &SessionId, keep: usize) -> Result<usize, StoreError> {
        let files = self.checkpoint_files(session_id).await?;
        let excess = files.len().saturating_sub(keep.max(1));
        for path in &files[..excess] {
            fs::remove_file(path).await?;
            debug!(file = ?path, "Removed old checkpoint file");
        }
        if excess > 0 {
            info!(session_id = %session_id, removed = excess, kept = files.len() - excess, "Pruned checkpoints");
        }
        Ok(excess)
    }
}

/// In-process store for tests and dry runs. Keeps serialized documents so invalid
/// checkpoints behave exactly as they do on disk.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<SessionId, Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw document, valid or not.
    pub fn insert_raw(&self, session_id: &SessionId, document: impl Into<String>) {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.clone())
            .or_default()
            .push(document.into());
    }

    pub fn checkpoint_count(&self, session_id: &SessionId) -> usize {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map_or(0, Vec::len)
    }

    fn latest(&self, session_id: &SessionId) -> Option<Checkpoint> {
        let documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        documents
            .get(session_id)?
            .iter()
            .rev()
            .find_map(|document| Checkpoint::from_json(document).ok())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let document = checkpoint.to_json()?;
        self.insert_raw(&checkpoint.session_id, document);
        Ok(())
    }

    async fn load_latest_checkpoint(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.latest(session_id))
    }

    async fn list_nonterminal_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        let mut nonterminal = Vec::new();
        for session_id in self.list_sessions().await? {
            let live = match self.latest(&session_id) {
                Some(checkpoint) => checkpoint
                    .session_state()
                    .is_some_and(|state| !state.is_terminal()),
                None => true,
            };
            if live {
                nonterminal.push(session_id);
            }
        }
        Ok(nonterminal)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        let documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        let mut sessions: Vec<SessionId> = documents
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        sessions.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(sessions)
    }

    async fn prune(&self, session_id: &SessionId, keep: usize) -> Result<usize, StoreError> {
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(docs) = documents.get_mut(session_id) else {
            return Ok(0);
        };
        let excess = docs.len().saturating_sub(keep.max(1));
        docs.drain(..excess);
        Ok(excess)
    }
}
