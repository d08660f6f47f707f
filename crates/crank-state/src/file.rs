use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crank_core::error::{EngineError, EngineResult};
use crank_core::models::{Job, Lock};
use crank_core::repository::{StorageRepository, WriteOp};

use crate::tables::TableSet;

/// File-backed store: one JSON snapshot guarded by an exclusive file lock
/// so independent processes sharing the directory serialize their
/// operations. Suitable for single-box deployments and tests, not for
/// high contention.
#[derive(Clone)]
pub struct FileRepository {
    base: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
    // Serializes tasks within this process; the file lock covers other
    // processes.
    local: Arc<Mutex<()>>,
}

impl FileRepository {
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        Self {
            state_path: base.join("state.json"),
            lock_path: base.join("state.lock"),
            base,
            local: Arc::new(Mutex::new(())),
        }
    }

    fn file_lock(&self) -> EngineResult<std::fs::File> {
        std::fs::create_dir_all(&self.base).map_err(EngineError::storage)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(EngineError::storage)?;
        file.lock_exclusive().map_err(EngineError::storage)?;
        Ok(file)
    }

    async fn load(&self) -> EngineResult<TableSet> {
        match tokio::fs::read(&self.state_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(EngineError::storage),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(TableSet::default()),
            Err(err) => Err(EngineError::storage(err)),
        }
    }

    /// Write-then-rename keeps the snapshot intact if the process dies
    /// mid-write.
    async fn store(&self, tables: &TableSet) -> EngineResult<()> {
        let bytes = serde_json::to_vec_pretty(tables).map_err(EngineError::storage)?;
        let tmp_path = self.base.join("state.json.tmp");
        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(EngineError::storage)?;
        tokio::fs::rename(&tmp_path, &self.state_path)
            .await
            .map_err(EngineError::storage)?;
        Ok(())
    }

    async fn with_tables<T>(
        &self,
        f: impl FnOnce(&mut TableSet) -> EngineResult<(T, bool)>,
    ) -> EngineResult<T> {
        let _local = self.local.lock().await;
        let guard = self.file_lock()?;
        let mut tables = self.load().await?;
        let result = f(&mut tables);
        let outcome = match result {
            Ok((value, dirty)) => {
                if dirty {
                    self.store(&tables).await.map(|_| value)
                } else {
                    Ok(value)
                }
            }
            Err(err) => Err(err),
        };
        if let Err(err) = fs2::FileExt::unlock(&guard) {
            tracing::warn!(error = %err, "failed to unlock state file");
        }
        outcome
    }
}

#[async_trait]
impl StorageRepository for FileRepository {
    async fn apply(&self, ops: Vec<WriteOp>) -> EngineResult<()> {
        self.with_tables(|tables| {
            tables.apply(ops)?;
            Ok(((), true))
        })
        .await
    }

    async fn find_job(&self, id: Uuid) -> EngineResult<Option<Job>> {
        self.with_tables(|tables| Ok((tables.jobs.get(&id).cloned(), false)))
            .await
    }

    async fn find_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<Job>> {
        self.with_tables(|tables| Ok((tables.due_jobs(now, limit), false)))
            .await
    }

    async fn find_jobs_by_correlation(&self, correlation_id: &str) -> EngineResult<Vec<Job>> {
        self.with_tables(|tables| Ok((tables.jobs_by_correlation(correlation_id), false)))
            .await
    }

    async fn count_jobs(&self) -> EngineResult<usize> {
        self.with_tables(|tables| Ok((tables.jobs.len(), false)))
            .await
    }

    async fn find_dead_letter_job(&self, id: Uuid) -> EngineResult<Option<Job>> {
        self.with_tables(|tables| Ok((tables.dead_letter.get(&id).cloned(), false)))
            .await
    }

    async fn list_dead_letter_jobs(&self) -> EngineResult<Vec<Job>> {
        self.with_tables(|tables| Ok((tables.dead_letter.values().cloned().collect(), false)))
            .await
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        self.with_tables(|tables| {
            let acquired = tables.try_acquire_lock(name, owner, expires_at);
            Ok((acquired, acquired))
        })
        .await
    }

    async fn release_lock(&self, name: &str, owner: &str) -> EngineResult<()> {
        self.with_tables(|tables| {
            tables.release_lock(name, owner);
            Ok(((), true))
        })
        .await
    }

    async fn find_lock(&self, name: &str) -> EngineResult<Option<Lock>> {
        self.with_tables(|tables| Ok((tables.locks.get(name).cloned(), false)))
            .await
    }
}
