// Storage repository trait for engine state.
// Implementations: InMemoryRepository, FileRepository (crank-state).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::{Job, Lock};

/// A single revision-guarded mutation. Ops are collected per unit of work
/// and handed to `StorageRepository::apply` in one batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a new job row. Fails with a concurrency conflict if the id
    /// already exists.
    InsertJob(Job),
    /// Replace the stored job. `job.revision` is the revision the caller
    /// read; the store bumps it on success.
    UpdateJob(Job),
    /// Delete a job row, guarded by the revision the caller read.
    DeleteJob { id: Uuid, expected_revision: i32 },
    /// Remove the job from the job table and park it in the dead-letter
    /// namespace, guarded by `job.revision`.
    MoveToDeadLetter(Job),
    /// Remove the job from the dead-letter namespace and reinsert it into
    /// the job table, guarded by `job.revision`.
    RequeueFromDeadLetter(Job),
}

/// Pluggable read/write/query capability for engine entities.
///
/// `apply` is the transaction boundary: the whole batch commits or none of
/// it does, and every revision precondition is checked before any op is
/// applied. Queries only ever observe committed state.
#[async_trait]
pub trait StorageRepository: Send + Sync {
    async fn apply(&self, ops: Vec<WriteOp>) -> EngineResult<()>;

    async fn find_job(&self, id: Uuid) -> EngineResult<Option<Job>>;

    /// Due, unlocked (or lease-lapsed), non-suspended jobs, oldest due
    /// first. This is the acquisition scan; dead-letter jobs live in a
    /// separate namespace precisely to keep it cheap.
    async fn find_due_jobs(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<Job>>;

    async fn find_jobs_by_correlation(&self, correlation_id: &str) -> EngineResult<Vec<Job>>;

    async fn count_jobs(&self) -> EngineResult<usize>;

    async fn find_dead_letter_job(&self, id: Uuid) -> EngineResult<Option<Job>>;

    async fn list_dead_letter_jobs(&self) -> EngineResult<Vec<Job>>;

    /// Claim the named lock if it is absent, expired, or already held by
    /// `owner` (renewal). Returns false when a live foreign owner holds it.
    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> EngineResult<bool>;

    /// Release the named lock if held by `owner`; releasing a lock owned
    /// by someone else is a no-op.
    async fn release_lock(&self, name: &str, owner: &str) -> EngineResult<()>;

    async fn find_lock(&self, name: &str) -> EngineResult<Option<Lock>>;
}
