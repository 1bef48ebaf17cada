//! Durable form drafts, keyed by a stable content id.
//!
//! Drafts survive process restarts in a per-user JSON store and are cleared
//! immediately and unconditionally once a submission succeeds. Saving is
//! debounced — the only timer-driven logic in the crate.

use async_trait::async_trait;
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Duration;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(400);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormDraft {
    pub fields: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub saved_at: OffsetDateTime,
}

impl FormDraft {
    pub fn new(fields: BTreeMap<String, String>) -> Self {
        Self {
            fields,
            saved_at: OffsetDateTime::now_utc(),
        }
    }

    /// A draft with nothing in it is never worth persisting.
    pub fn is_empty(&self) -> bool {
        self.fields.values().all(|value| value.trim().is_empty())
    }
}

#[derive(Error, Debug)]
pub enum DraftError {
    #[error("failed to access draft storage at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode draft: {0}")]
    Encode(String),
    #[error("no platform data directory available")]
    NoDataDir,
}

#[async_trait]
pub trait DraftStore: Send + Sync {
    async fn load(&self, content_id: &str) -> Result<Option<FormDraft>, DraftError>;
    async fn save(&self, content_id: &str, draft: &FormDraft) -> Result<(), DraftError>;
    async fn clear(&self, content_id: &str) -> Result<(), DraftError>;
}

/// One JSON file per content id under the platform data directory.
pub struct JsonDraftStore {
    dir: PathBuf,
}

impl JsonDraftStore {
    pub fn new() -> Result<Self, DraftError> {
        let dirs = ProjectDirs::from("sh", "campus", "campus").ok_or(DraftError::NoDataDir)?;
        Ok(Self {
            dir: dirs.data_dir().join("drafts"),
        })
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, content_id: &str) -> PathBuf {
        let safe: String = content_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl DraftStore for JsonDraftStore {
    async fn load(&self, content_id: &str) -> Result<Option<FormDraft>, DraftError> {
        let path = self.path_for(content_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(DraftError::Io { path, source }),
        };
        let draft = serde_json::from_slice(&bytes)
            .map_err(|err| DraftError::Encode(err.to_string()))?;
        Ok(Some(draft))
    }

    async fn save(&self, content_id: &str, draft: &FormDraft) -> Result<(), DraftError> {
        if draft.is_empty() {
            return self.clear(content_id).await;
        }
        std::fs::create_dir_all(&self.dir).map_err(|source| DraftError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(content_id);
        let bytes = serde_json::to_vec_pretty(draft)
            .map_err(|err| DraftError::Encode(err.to_string()))?;
        std::fs::write(&path, bytes).map_err(|source| DraftError::Io { path, source })?;
        Ok(())
    }

    async fn clear(&self, content_id: &str) -> Result<(), DraftError> {
        let path = self.path_for(content_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DraftError::Io { path, source }),
        }
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryDraftStore {
    drafts: Mutex<HashMap<String, FormDraft>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryDraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl DraftStore for MemoryDraftStore {
    async fn load(&self, content_id: &str) -> Result<Option<FormDraft>, DraftError> {
        Ok(self.drafts.lock().get(content_id).cloned())
    }

    async fn save(&self, content_id: &str, draft: &FormDraft) -> Result<(), DraftError> {
        if draft.is_empty() {
            return self.clear(content_id).await;
        }
        self.saves
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.drafts
            .lock()
            .insert(content_id.to_string(), draft.clone());
        Ok(())
    }

    async fn clear(&self, content_id: &str) -> Result<(), DraftError> {
        self.drafts.lock().remove(content_id);
        Ok(())
    }
}

/// Debounced writer: rapid edits collapse into one persisted draft.
pub struct DraftSaver {
    store: Arc<dyn DraftStore>,
    delay: Duration,
    pending: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DraftSaver {
    pub fn new(store: Arc<dyn DraftStore>) -> Self {
        Self::with_delay(store, DEFAULT_DEBOUNCE)
    }

    pub fn with_delay(store: Arc<dyn DraftStore>, delay: Duration) -> Self {
        Self {
            store,
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Schedule a save of the current field values. A newer schedule
    /// supersedes the pending one.
    pub fn schedule(&self, content_id: &str, fields: BTreeMap<String, String>) {
        let mut pending = self.pending.lock();
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        let store = self.store.clone();
        let delay = self.delay;
        let content_id = content_id.to_string();
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let draft = FormDraft::new(fields);
            if let Err(err) = store.save(&content_id, &draft).await {
                tracing::warn!(target: "campus::drafts", content_id, %err, "draft save failed");
            }
        }));
    }

    /// Persist immediately, superseding any pending debounce.
    pub async fn flush(
        &self,
        content_id: &str,
        fields: BTreeMap<String, String>,
    ) -> Result<(), DraftError> {
        if let Some(previous) = self.pending.lock().take() {
            previous.abort();
        }
        self.store.save(content_id, &FormDraft::new(fields)).await
    }

    /// Clear the stored draft immediately and unconditionally — called on
    /// successful submission or explicit reset.
    pub async fn clear(&self, content_id: &str) -> Result<(), DraftError> {
        if let Some(previous) = self.pending.lock().take() {
            previous.abort();
        }
        self.store.clear(content_id).await
    }
}

impl Drop for DraftSaver {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.lock().take() {
            pending.abort();
        }
    }
}
