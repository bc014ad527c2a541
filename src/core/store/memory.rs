use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{RunMutator, RunStore, StoreError, StoreOptions};
use crate::core::error::RelayError;
use crate::core::run::{Message, Run};

type RunCell = Arc<Mutex<Run>>;

/// Process-local store. Each run sits in its own mutex so updates to
/// different runs never contend.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<String, RunCell>>,
    options: StoreOptions,
}

impl MemoryRunStore {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            options,
        }
    }

    async fn cell(&self, run_id: &str) -> Result<RunCell, StoreError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, history: Vec<Message>, model: Option<String>) -> Result<Run, StoreError> {
        let mut run = Run::new(history, model);
        self.options.finish_write(&mut run);
        self.runs
            .write()
            .await
            .insert(run.id.clone(), Arc::new(Mutex::new(run.clone())));
        Ok(run)
    }

    async fn get(&self, run_id: &str) -> Result<Run, StoreError> {
        let cell = self.cell(run_id).await?;
        let run = cell.lock().await.clone();
        if self.options.is_expired(&run) {
            self.runs.write().await.remove(run_id);
            return Err(StoreError::NotFound(run_id.to_string()));
        }
        Ok(run)
    }

    async fn update(&self, run_id: &str, mutator: RunMutator<'_>) -> Result<Run, RelayError> {
        let cell = self.cell(run_id).await?;
        let mut guard = cell.lock().await;
        // purged while we waited for the lock
        if !self.runs.read().await.contains_key(run_id) || self.options.is_expired(&guard) {
            return Err(StoreError::NotFound(run_id.to_string()).into());
        }
        let mut draft = guard.clone();
        mutator(&mut draft)?;
        self.options.finish_write(&mut draft);
        *guard = draft.clone();
        Ok(draft)
    }

    async fn delete(&self, run_id: &str) -> Result<(), StoreError> {
        self.runs
            .write()
            .await
            .remove(run_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))
    }

    async fn purge_expired(&self, ttl: Duration) -> Result<usize, StoreError> {
        let mut runs = self.runs.write().await;
        let before = runs.len();
        // a locked cell is mid-update, so it is not idle
        runs.retain(|_, cell| match cell.try_lock() {
            Ok(run) => !run.is_expired(ttl),
            Err(_) => true,
        });
        let purged = before - runs.len();
        if purged > 0 {
            debug!(purged, "Purged expired runs");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::run::RunStatus;

    fn history() -> Vec<Message> {
        vec![Message::user_text("hello")]
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = MemoryRunStore::default();
        let run = store.create(history(), Some("demo".into())).await.unwrap();
        let loaded = store.get(&run.id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Active);
        assert_eq!(loaded.model.as_deref(), Some("demo"));
        assert_eq!(loaded.message_history, history());
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let store = MemoryRunStore::default();
        assert!(matches!(store.get("nope").await, Err(StoreError::NotFound(_))));
        let err = store.update("nope", Box::new(|_| Ok(()))).await.unwrap_err();
        assert!(matches!(err, RelayError::NotFoundRun(_)));
    }

    #[tokio::test]
    async fn failed_mutator_writes_nothing() {
        let store = MemoryRunStore::default();
        let run = store.create(history(), None).await.unwrap();
        let err = store
            .update(
                &run.id,
                Box::new(|run: &mut Run| {
                    run.message_history.clear();
                    run.status = RunStatus::Failed;
                    Err(RelayError::InvalidContinuation("rejected".into()))
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidContinuation(_)));
        let loaded = store.get(&run.id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Active);
        assert_eq!(loaded.message_history.len(), 1);
    }

    #[tokio::test]
    async fn update_applies_history_cap() {
        let store = MemoryRunStore::new(StoreOptions {
            ttl: None,
            max_messages: Some(2),
        });
        let run = store.create(history(), None).await.unwrap();
        let updated = store
            .update(
                &run.id,
                Box::new(|run: &mut Run| {
                    run.message_history.push(Message::assistant_text("a"));
                    run.message_history.push(Message::user_text("b"));
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.message_history.len(), 2);
        assert_eq!(updated.message_history[0].text(), "a");
        assert!(updated.updated_at >= run.updated_at);
    }

    #[tokio::test]
    async fn concurrent_updates_serialize_per_run() {
        let store = Arc::new(MemoryRunStore::default());
        let run = store.create(vec![], None).await.unwrap();
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let id = run.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(
                        &id,
                        Box::new(move |run: &mut Run| {
                            run.message_history.push(Message::user_text(format!("{i}")));
                            Ok(())
                        }),
                    )
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get(&run.id).await.unwrap().message_history.len(), 20);
    }

    #[tokio::test]
    async fn purge_and_lazy_expiry() {
        let store = MemoryRunStore::new(StoreOptions {
            ttl: Some(Duration::from_secs(60)),
            max_messages: None,
        });
        let stale = store.create(history(), None).await.unwrap();
        let fresh = store.create(history(), None).await.unwrap();
        {
            let cell = store.cell(&stale.id).await.unwrap();
            cell.lock().await.updated_at = chrono::Utc::now() - chrono::Duration::minutes(10);
        }
        assert_eq!(store.purge_expired(Duration::from_secs(60)).await.unwrap(), 1);
        assert!(store.get(&fresh.id).await.is_ok());
        assert!(matches!(store.get(&stale.id).await, Err(StoreError::NotFound(_))));

        {
            let cell = store.cell(&fresh.id).await.unwrap();
            cell.lock().await.updated_at = chrono::Utc::now() - chrono::Duration::minutes(10);
        }
        assert!(matches!(store.get(&fresh.id).await, Err(StoreError::NotFound(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn delete_removes_run() {
        let store = MemoryRunStore::default();
        let run = store.create(history(), None).await.unwrap();
        store.delete(&run.id).await.unwrap();
        assert!(matches!(store.delete(&run.id).await, Err(StoreError::NotFound(_))));
    }
}
