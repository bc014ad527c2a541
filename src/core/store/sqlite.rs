use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{RunMutator, RunStore, StoreError, StoreOptions};
use crate::core::error::RelayError;
use crate::core::run::{Message, Run};

/// Runs persisted as JSON rows. The connection mutex is held for single
/// statements only; read-modify-write cycles serialize on a per-run lock that
/// lives only while an update is in flight.
pub struct SqliteRunStore {
    db: Arc<Mutex<Connection>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    options: StoreOptions,
}

impl SqliteRunStore {
    pub async fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        info!("Run store opened at {}", path.display());
        Self::with_connection(conn, options)
    }

    pub fn open_in_memory(options: StoreOptions) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, options)
    }

    fn with_connection(conn: Connection, options: StoreOptions) -> Result<Self, StoreError> {
        // run_json is authoritative; status is a copy kept for ad-hoc queries
        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                run_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_updated_at ON runs(updated_at)",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            locks: Mutex::new(HashMap::new()),
            options,
        })
    }

    async fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(run_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops the lock entry once no other update holds or awaits it, so the
    /// map only ever contains runs with an update in flight.
    async fn release_lock(&self, run_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        let idle = locks
            .get(run_id)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(run_id);
        }
    }

    async fn load(&self, run_id: &str) -> Result<Run, StoreError> {
        let json: Option<String> = {
            let db = self.db.lock().await;
            db.query_row(
                "SELECT run_json FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?
        };
        let json = json.ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        let run: Run = serde_json::from_str(&json)?;
        if self.options.is_expired(&run) {
            self.delete(run_id).await.ok();
            return Err(StoreError::NotFound(run_id.to_string()));
        }
        Ok(run)
    }

    async fn write(&self, run: &Run, insert: bool) -> Result<(), StoreError> {
        let json = serde_json::to_string(run)?;
        let db = self.db.lock().await;
        if insert {
            db.execute(
                "INSERT INTO runs (run_id, status, run_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run.id,
                    run.status.as_str(),
                    json,
                    run.created_at.timestamp_millis(),
                    run.updated_at.timestamp_millis()
                ],
            )?;
        } else {
            let changed = db.execute(
                "UPDATE runs SET status = ?2, run_json = ?3, updated_at = ?4 WHERE run_id = ?1",
                params![
                    run.id,
                    run.status.as_str(),
                    json,
                    run.updated_at.timestamp_millis()
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(run.id.clone()));
            }
        }
        Ok(())
    }

    async fn apply(&self, run_id: &str, mutator: RunMutator<'_>) -> Result<Run, RelayError> {
        let mut run = self.load(run_id).await?;
        mutator(&mut run)?;
        self.options.finish_write(&mut run);
        self.write(&run, false).await?;
        Ok(run)
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create(&self, history: Vec<Message>, model: Option<String>) -> Result<Run, StoreError> {
        let mut run = Run::new(history, model);
        self.options.finish_write(&mut run);
        self.write(&run, true).await?;
        Ok(run)
    }

    async fn get(&self, run_id: &str) -> Result<Run, StoreError> {
        self.load(run_id).await
    }

    async fn update(&self, run_id: &str, mutator: RunMutator<'_>) -> Result<Run, RelayError> {
        let lock = self.run_lock(run_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.apply(run_id, mutator).await
        };
        self.release_lock(run_id, lock).await;
        result
    }

    async fn delete(&self, run_id: &str) -> Result<(), StoreError> {
        let removed = {
            let db = self.db.lock().await;
            db.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?
        };
        if removed == 0 {
            return Err(StoreError::NotFound(run_id.to_string()));
        }
        Ok(())
    }

    async fn purge_expired(&self, ttl: Duration) -> Result<usize, StoreError> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(ttl).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        // holding the lock map keeps new updates out; runs mid-update are skipped
        let locks = self.locks.lock().await;
        let db = self.db.lock().await;
        let expired: Vec<String> = {
            let mut stmt = db.prepare("SELECT run_id FROM runs WHERE updated_at < ?1")?;
            let rows = stmt.query_map(params![cutoff.timestamp_millis()], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        let mut purged = 0;
        for run_id in expired.iter().filter(|id| !locks.contains_key(*id)) {
            purged += db.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
        }
        if purged > 0 {
            debug!(purged, "Purged expired runs");
        }
        Ok(purged)
    }
}
