//! Poll History
//!
//! Archival of poll sessions. The store is an external collaborator: writes
//! are best-effort and go through an ordered background [`HistoryWriter`] so
//! they never hold up broadcasts.

mod sqlite;

pub use sqlite::SqliteHistoryStore;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::polls::{HistoryRecord, PollId, PollSession, PollStatus};

/// History store errors
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence for poll sessions, keyed by session id.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Short backend name for status output.
    fn backend(&self) -> &'static str;

    /// Insert or replace the session with this id.
    async fn save(&self, session: &PollSession) -> Result<(), HistoryError>;

    /// The session still marked active, if any.
    async fn find_active(&self) -> Result<Option<PollSession>, HistoryError>;

    /// Completed sessions, most recent end time first.
    async fn list_completed(&self) -> Result<Vec<HistoryRecord>, HistoryError>;
}

/// In-process store. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    sessions: RwLock<BTreeMap<PollId, PollSession>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, session: &PollSession) -> Result<(), HistoryError> {
        self.sessions.write().insert(session.id, session.clone());
        Ok(())
    }

    async fn find_active(&self) -> Result<Option<PollSession>, HistoryError> {
        Ok(self
            .sessions
            .read()
            .values()
            .rev()
            .find(|s| s.status == PollStatus::Active)
            .cloned())
    }

    async fn list_completed(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let mut records: Vec<HistoryRecord> = self
            .sessions
            .read()
            .values()
            .filter_map(|s| s.clone().into_record())
            .collect();
        sort_most_recent_first(&mut records);
        Ok(records)
    }
}

pub(crate) fn sort_most_recent_first(records: &mut [HistoryRecord]) {
    records.sort_by(|a, b| b.end_time.cmp(&a.end_time).then(b.id.cmp(&a.id)));
}

/// Which store backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    #[default]
    Memory,
    Sqlite,
    None,
}

/// History configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryConfig {
    pub backend: HistoryBackend,
    /// SQLite connection URL, e.g. `sqlite://pollroom.db`
    pub url: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: HistoryBackend::Memory,
            url: "sqlite://pollroom.db".to_string(),
        }
    }
}

/// Open the configured store. `Ok(None)` when history is disabled.
pub async fn open_store(
    config: &HistoryConfig,
) -> Result<Option<Arc<dyn HistoryStore>>, HistoryError> {
    match config.backend {
        HistoryBackend::None => Ok(None),
        HistoryBackend::Memory => Ok(Some(Arc::new(MemoryHistoryStore::new()))),
        HistoryBackend::Sqlite => {
            let store = SqliteHistoryStore::connect(&config.url).await?;
            Ok(Some(Arc::new(store)))
        }
    }
}

enum WriterCommand {
    Save(Box<PollSession>),
    Flush(oneshot::Sender<()>),
}

/// Ordered, fire-and-forget writes to a [`HistoryStore`].
///
/// Saves are applied in submission order by one background task; failures
/// are logged and dropped.
#[derive(Debug, Clone)]
pub struct HistoryWriter {
    tx: Option<mpsc::UnboundedSender<WriterCommand>>,
}

impl std::fmt::Debug for WriterCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterCommand::Save(session) => write!(f, "Save({})", session.id),
            WriterCommand::Flush(_) => write!(f, "Flush"),
        }
    }
}

impl HistoryWriter {
    /// A writer that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Spawn the writer task for `store`. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn HistoryStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterCommand>();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    WriterCommand::Save(session) => {
                        if let Err(e) = store.save(&session).await {
                            tracing::warn!(
                                poll_id = %session.id,
                                backend = store.backend(),
                                error = %e,
                                "failed to archive poll session"
                            );
                        }
                    }
                    WriterCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::debug!("history writer stopped");
        });
        Self { tx: Some(tx) }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue a save. Never blocks.
    pub fn save(&self, session: PollSession) {
        if let Some(tx) = &self.tx {
            if tx.send(WriterCommand::Save(Box::new(session))).is_err() {
                tracing::warn!("history writer is gone, dropping save");
            }
        }
    }

    /// Wait until every save queued before this call has been applied.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(WriterCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
