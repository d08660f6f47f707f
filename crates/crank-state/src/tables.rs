// Shared table state and write-op transition logic for the backends.
// Both the in-memory and the file store hold the same three tables and
// apply batches the same way: validate every revision precondition
// against the current state first, then perform all ops.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crank_core::error::{EngineError, EngineResult};
use crank_core::models::{Job, Lock};
use crank_core::repository::WriteOp;

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct TableSet {
    pub jobs: HashMap<Uuid, Job>,
    pub dead_letter: HashMap<Uuid, Job>,
    pub locks: HashMap<String, Lock>,
}

fn conflict(id: Uuid) -> EngineError {
    EngineError::OptimisticLocking { entity: "job", id }
}

impl TableSet {
    /// All-or-nothing batch: nothing is written unless every precondition
    /// holds.
    pub fn apply(&mut self, ops: Vec<WriteOp>) -> EngineResult<()> {
        for op in &ops {
            self.check(op)?;
        }
        for op in ops {
            self.perform(op);
        }
        Ok(())
    }

    fn check(&self, op: &WriteOp) -> EngineResult<()> {
        match op {
            WriteOp::InsertJob(job) => {
                if self.jobs.contains_key(&job.id) {
                    return Err(conflict(job.id));
                }
            }
            WriteOp::UpdateJob(job) => self.check_revision(&self.jobs, job.id, job.revision)?,
            WriteOp::DeleteJob {
                id,
                expected_revision,
            } => self.check_revision(&self.jobs, *id, *expected_revision)?,
            WriteOp::MoveToDeadLetter(job) => {
                self.check_revision(&self.jobs, job.id, job.revision)?;
            }
            WriteOp::RequeueFromDeadLetter(job) => {
                self.check_revision(&self.dead_letter, job.id, job.revision)?;
            }
        }
        Ok(())
    }

    /// A missing row counts as a conflict: the entity was deleted (or
    /// moved) by a concurrent writer since it was read.
    fn check_revision(
        &self,
        table: &HashMap<Uuid, Job>,
        id: Uuid,
        expected: i32,
    ) -> EngineResult<()> {
        match table.get(&id) {
            Some(stored) if stored.revision == expected => Ok(()),
            _ => Err(conflict(id)),
        }
    }

    fn perform(&mut self, op: WriteOp) {
        match op {
            WriteOp::InsertJob(job) => {
                self.jobs.insert(job.id, job);
            }
            WriteOp::UpdateJob(mut job) => {
                job.revision += 1;
                self.jobs.insert(job.id, job);
            }
            WriteOp::DeleteJob { id, .. } => {
                self.jobs.remove(&id);
            }
            WriteOp::MoveToDeadLetter(mut job) => {
                self.jobs.remove(&job.id);
                job.revision += 1;
                self.dead_letter.insert(job.id, job);
            }
            WriteOp::RequeueFromDeadLetter(mut job) => {
                self.dead_letter.remove(&job.id);
                job.revision += 1;
                self.jobs.insert(job.id, job);
            }
        }
    }

    pub fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Vec<Job> {
        let mut due: Vec<Job> = self
            .jobs
            .values()
            .filter(|job| job.is_acquirable_at(now))
            .cloned()
            .collect();
        due.sort_by_key(|job| job.due_sort_key());
        due.truncate(limit);
        due
    }

    pub fn jobs_by_correlation(&self, correlation_id: &str) -> Vec<Job> {
        self.jobs
            .values()
            .filter(|job| job.correlation_id.as_deref() == Some(correlation_id))
            .cloned()
            .collect()
    }

    pub fn try_acquire_lock(
        &mut self,
        name: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> bool {
        let now = Utc::now();
        let claimable = match self.locks.get(name) {
            None => true,
            Some(lock) => lock.is_expired_at(now) || lock.owner == owner,
        };
        if claimable {
            self.locks.insert(
                name.to_string(),
                Lock {
                    name: name.to_string(),
                    owner: owner.to_string(),
                    expires_at,
                },
            );
        }
        claimable
    }

    pub fn release_lock(&mut self, name: &str, owner: &str) {
        if let Some(lock) = self.locks.get(name) {
            if lock.owner == owner {
                self.locks.remove(name);
            }
        }
    }
}
