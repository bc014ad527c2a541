mod memory;
mod sqlite;
mod sweeper;

pub use memory::MemoryRunStore;
pub use sqlite::SqliteRunStore;
pub use sweeper::RunSweeper;

use async_trait::async_trait;
use std::time::Duration;

use crate::core::error::RelayError;
use crate::core::run::{Message, Run};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    NotFound(String),
    #[error("run store unavailable: {0}")]
    Unavailable(String),
    #[error("run record is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Mutation applied atomically to one run. An error leaves the stored run
/// untouched.
pub type RunMutator<'a> = Box<dyn FnOnce(&mut Run) -> Result<(), RelayError> + Send + 'a>;

/// Tuning shared by every backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    /// Runs idle longer than this are treated as gone.
    pub ttl: Option<Duration>,
    /// Oldest messages beyond this count are dropped on write.
    pub max_messages: Option<usize>,
}

impl StoreOptions {
    pub(crate) fn is_expired(&self, run: &Run) -> bool {
        self.ttl.is_some_and(|ttl| run.is_expired(ttl))
    }

    pub(crate) fn finish_write(&self, run: &mut Run) {
        if let Some(max) = self.max_messages {
            run.cap_history(max);
        }
        run.updated_at = chrono::Utc::now();
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, history: Vec<Message>, model: Option<String>) -> Result<Run, StoreError>;

    async fn get(&self, run_id: &str) -> Result<Run, StoreError>;

    /// Read-modify-write of one run, serialized per id. Returns the run as
    /// written.
    async fn update(&self, run_id: &str, mutator: RunMutator<'_>) -> Result<Run, RelayError>;

    async fn delete(&self, run_id: &str) -> Result<(), StoreError>;

    /// Removes runs idle for longer than `ttl`; returns how many went.
    async fn purge_expired(&self, ttl: Duration) -> Result<usize, StoreError>;
}
