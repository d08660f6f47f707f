// Per-unit-of-work resource handles. Sessions are looked up by kind from
// an enum-keyed registry so the set of kinds is checked exhaustively at
// compile time; they are never shared between concurrent command contexts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::{Job, Lock};
use crate::repository::{StorageRepository, WriteOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Storage,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
        }
    }
}

/// The storage session buffers writes for the unit of work. In
/// transactional mode the buffer is handed to the repository in one atomic
/// batch at commit; in auto-apply mode every op hits the repository
/// immediately and there is no rollback.
pub struct StorageSession {
    repository: Arc<dyn StorageRepository>,
    transactional: bool,
    pending: Vec<WriteOp>,
}

impl StorageSession {
    fn open(repository: Arc<dyn StorageRepository>, transactional: bool) -> Self {
        Self {
            repository,
            transactional,
            pending: Vec::new(),
        }
    }

    async fn submit(&mut self, op: WriteOp) -> EngineResult<()> {
        if self.transactional {
            self.pending.push(op);
            Ok(())
        } else {
            self.repository.apply(vec![op]).await
        }
    }

    pub async fn insert_job(&mut self, job: Job) -> EngineResult<()> {
        self.submit(WriteOp::InsertJob(job)).await
    }

    pub async fn update_job(&mut self, job: Job) -> EngineResult<()> {
        self.submit(WriteOp::UpdateJob(job)).await
    }

    pub async fn delete_job(&mut self, id: Uuid, expected_revision: i32) -> EngineResult<()> {
        self.submit(WriteOp::DeleteJob {
            id,
            expected_revision,
        })
        .await
    }

    pub async fn move_to_dead_letter(&mut self, job: Job) -> EngineResult<()> {
        self.submit(WriteOp::MoveToDeadLetter(job)).await
    }

    pub async fn requeue_from_dead_letter(&mut self, job: Job) -> EngineResult<()> {
        self.submit(WriteOp::RequeueFromDeadLetter(job)).await
    }

    // Reads go straight to the repository and observe committed state
    // only; commands read an entity before mutating it.

    pub async fn find_job(&self, id: Uuid) -> EngineResult<Option<Job>> {
        self.repository.find_job(id).await
    }

    pub async fn find_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<Job>> {
        self.repository.find_due_jobs(now, limit).await
    }

    pub async fn find_jobs_by_correlation(&self, correlation_id: &str) -> EngineResult<Vec<Job>> {
        self.repository.find_jobs_by_correlation(correlation_id).await
    }

    pub async fn count_jobs(&self) -> EngineResult<usize> {
        self.repository.count_jobs().await
    }

    pub async fn find_dead_letter_job(&self, id: Uuid) -> EngineResult<Option<Job>> {
        self.repository.find_dead_letter_job(id).await
    }

    pub async fn list_dead_letter_jobs(&self) -> EngineResult<Vec<Job>> {
        self.repository.list_dead_letter_jobs().await
    }

    pub async fn find_lock(&self, name: &str) -> EngineResult<Option<Lock>> {
        self.repository.find_lock(name).await
    }

    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    /// Hand pending writes to the transaction for commit.
    pub fn flush(&mut self) -> Vec<WriteOp> {
        std::mem::take(&mut self.pending)
    }

    /// Discard pending writes.
    pub fn rollback(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub async fn close(&mut self) -> EngineResult<()> {
        if !self.pending.is_empty() {
            warn!(
                pending = self.pending.len(),
                "storage session closed with unflushed writes, discarding"
            );
            self.pending.clear();
        }
        Ok(())
    }
}

/// Sessions as a closed sum so the registry stays exhaustively matched.
pub enum EngineSession {
    Storage(StorageSession),
}

impl EngineSession {
    pub fn kind(&self) -> SessionKind {
        match self {
            Self::Storage(_) => SessionKind::Storage,
        }
    }

    pub fn flush(&mut self) -> Vec<WriteOp> {
        match self {
            Self::Storage(session) => session.flush(),
        }
    }

    pub fn rollback(&mut self) -> usize {
        match self {
            Self::Storage(session) => session.rollback(),
        }
    }

    pub async fn close(&mut self) -> EngineResult<()> {
        match self {
            Self::Storage(session) => session.close().await,
        }
    }
}

/// Kind-to-factory registry with lazy open; at most one session per kind
/// per unit of work.
pub struct SessionRegistry {
    repository: Arc<dyn StorageRepository>,
    transactional: bool,
    open: HashMap<SessionKind, EngineSession>,
}

impl SessionRegistry {
    pub fn new(repository: Arc<dyn StorageRepository>, transactional: bool) -> Self {
        Self {
            repository,
            transactional,
            open: HashMap::new(),
        }
    }

    fn get_or_open(&mut self, kind: SessionKind) -> &mut EngineSession {
        let repository = Arc::clone(&self.repository);
        let transactional = self.transactional;
        self.open.entry(kind).or_insert_with(|| match kind {
            SessionKind::Storage => {
                EngineSession::Storage(StorageSession::open(repository, transactional))
            }
        })
    }

    pub fn storage(&mut self) -> &mut StorageSession {
        match self.get_or_open(SessionKind::Storage) {
            EngineSession::Storage(session) => session,
        }
    }

    /// Drain pending writes from every open session, in open order.
    pub fn flush_all(&mut self) -> Vec<WriteOp> {
        let mut ops = Vec::new();
        for session in self.open.values_mut() {
            ops.append(&mut session.flush());
        }
        ops
    }

    pub fn rollback_all(&mut self) -> usize {
        self.open.values_mut().map(|s| s.rollback()).sum()
    }

    pub async fn close_all(&mut self) -> EngineResult<()> {
        let mut first_error = None;
        for session in self.open.values_mut() {
            if let Err(err) = session.close().await {
                warn!(kind = session.kind().as_str(), error = %err, "session close failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
