use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crank_core::error::EngineResult;
use crank_core::models::{Job, Lock};
use crank_core::repository::{StorageRepository, WriteOp};

use crate::tables::TableSet;

/// Reference backend. The write lock held across `apply` makes the whole
/// batch atomic with respect to every other reader and writer.
#[derive(Default, Clone)]
pub struct InMemoryRepository {
    inner: Arc<RwLock<TableSet>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageRepository for InMemoryRepository {
    async fn apply(&self, ops: Vec<WriteOp>) -> EngineResult<()> {
        self.inner.write().await.apply(ops)
    }

    async fn find_job(&self, id: Uuid) -> EngineResult<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn find_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<Job>> {
        Ok(self.inner.read().await.due_jobs(now, limit))
    }

    async fn find_jobs_by_correlation(&self, correlation_id: &str) -> EngineResult<Vec<Job>> {
        Ok(self.inner.read().await.jobs_by_correlation(correlation_id))
    }

    async fn count_jobs(&self) -> EngineResult<usize> {
        Ok(self.inner.read().await.jobs.len())
    }

    async fn find_dead_letter_job(&self, id: Uuid) -> EngineResult<Option<Job>> {
        Ok(self.inner.read().await.dead_letter.get(&id).cloned())
    }

    async fn list_dead_letter_jobs(&self) -> EngineResult<Vec<Job>> {
        Ok(self.inner.read().await.dead_letter.values().cloned().collect())
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        Ok(self
            .inner
            .write()
            .await
            .try_acquire_lock(name, owner, expires_at))
    }

    async fn release_lock(&self, name: &str, owner: &str) -> EngineResult<()> {
        self.inner.write().await.release_lock(name, owner);
        Ok(())
    }

    async fn find_lock(&self, name: &str) -> EngineResult<Option<Lock>> {
        Ok(self.inner.read().await.locks.get(name).cloned())
    }
}
