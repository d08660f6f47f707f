// Job state machine operations. Every method runs inside a caller-owned
// command context; its writes commit or roll back with that unit of work.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::CommandContext;
use crate::error::{EngineError, EngineResult};
use crate::models::{Job, NewJob};
use crate::schedule::DueDateResolver;

/// Exponential backoff in seconds for the given failure attempt (1-based),
/// capped at `max_secs`.
pub fn retry_backoff_secs(attempt: i32, base_secs: u64, max_secs: u64) -> u64 {
    let attempt = attempt.clamp(1, 32) as u32;
    let backoff = base_secs.saturating_mul(2_u64.saturating_pow(attempt - 1));
    backoff.min(max_secs)
}

pub struct JobService {
    default_retries: i32,
    backoff_base_secs: u64,
    backoff_max_secs: u64,
    resolver: Arc<dyn DueDateResolver>,
}

impl JobService {
    pub fn new(config: &EngineConfig, resolver: Arc<dyn DueDateResolver>) -> Self {
        Self {
            default_retries: config.default_job_retries,
            backoff_base_secs: config.backoff_base_secs,
            backoff_max_secs: config.backoff_max_secs,
            resolver,
        }
    }

    /// Create a job in the ready or timer state.
    pub async fn schedule(
        &self,
        ctx: &mut CommandContext,
        new_job: NewJob,
    ) -> EngineResult<Job> {
        let job = new_job.into_job(self.default_retries);
        ctx.storage().insert_job(job.clone()).await?;
        debug!(job = %job.id, kind = job.kind.as_str(), handler = %job.handler_type, "job scheduled");
        Ok(job)
    }

    /// Seed a recurring timer job from a repeat expression; the first
    /// occurrence is the next one after now.
    pub async fn schedule_recurring(
        &self,
        ctx: &mut CommandContext,
        handler_type: &str,
        handler_config: serde_json::Value,
        repeat: &str,
        correlation_id: Option<&str>,
    ) -> EngineResult<Job> {
        let due = self
            .resolver
            .next_after(repeat, Utc::now())?
            .ok_or_else(|| EngineError::RepeatExpression {
                expr: repeat.to_string(),
                message: "no upcoming occurrence".to_string(),
            })?;
        let mut new_job =
            NewJob::timer(handler_type, handler_config, due).with_repeat(repeat);
        if let Some(correlation_id) = correlation_id {
            new_job = new_job.with_correlation(correlation_id);
        }
        self.schedule(ctx, new_job).await
    }

    /// Claim a job for an executor node: conditional update guarded by the
    /// revision the candidate was read at, so exactly one concurrent
    /// acquirer wins and losers see a conflict to skip.
    pub async fn lock_job(
        &self,
        ctx: &mut CommandContext,
        job: &Job,
        owner: &str,
        lease: Duration,
    ) -> EngineResult<Job> {
        let mut locked = job.clone();
        locked.lock_owner = Some(owner.to_string());
        locked.lock_expiration_time = Some(Utc::now() + lease);
        ctx.storage().update_job(locked.clone()).await?;
        Ok(locked)
    }

    /// Successful execution deletes the job; a repeating timer job also
    /// schedules its next occurrence within the same unit of work.
    pub async fn complete(&self, ctx: &mut CommandContext, job: &Job) -> EngineResult<()> {
        ctx.storage().delete_job(job.id, job.revision).await?;
        if let Some(expr) = job.repeat.as_deref() {
            if let Some(due) = self.resolver.next_after(expr, Utc::now())? {
                let next = job.next_occurrence(due, self.default_retries);
                debug!(job = %job.id, next = %next.id, due = %due, "rescheduling repeating job");
                ctx.storage().insert_job(next).await?;
            } else {
                debug!(job = %job.id, "repeat expression exhausted, not rescheduling");
            }
        }
        Ok(())
    }

    /// Transient failure: decrement the retry budget, clear the lock, push
    /// the due date out by backoff and store diagnostics. The job returns
    /// to the ready/timer state to be reacquired later.
    pub async fn record_failure(
        &self,
        ctx: &mut CommandContext,
        job: &Job,
        message: &str,
        stacktrace: Option<&str>,
    ) -> EngineResult<Job> {
        let now = Utc::now();
        let mut updated = job.clone();
        updated.retries = (job.retries - 1).max(0);
        updated.attempts = job.attempts + 1;
        updated.lock_owner = None;
        updated.lock_expiration_time = None;
        updated.exception_message = Some(message.to_string());
        updated.exception_stacktrace = stacktrace.map(|s| s.to_string());

        let backoff = retry_backoff_secs(
            updated.attempts,
            self.backoff_base_secs,
            self.backoff_max_secs,
        );
        updated.due_date = Some(now + Duration::seconds(backoff as i64));

        info!(
            job = %job.id,
            retries_remaining = updated.retries,
            backoff_secs = backoff,
            "job failed, scheduling retry"
        );
        ctx.storage().update_job(updated.clone()).await?;
        Ok(updated)
    }

    /// Retries exhausted: park the job in the dead-letter namespace where
    /// it is never automatically reacquired.
    pub async fn move_to_dead_letter(
        &self,
        ctx: &mut CommandContext,
        job: &Job,
        reason: &str,
    ) -> EngineResult<()> {
        let mut parked = job.clone();
        parked.lock_owner = None;
        parked.lock_expiration_time = None;
        if parked.exception_message.is_none() {
            parked.exception_message = Some(reason.to_string());
        }
        info!(job = %job.id, reason, "moving job to dead-letter");
        ctx.storage().move_to_dead_letter(parked).await
    }

    /// Operator requeue: reset the retry budget and move the job back to
    /// the ready state, clearing diagnostics from the failed run.
    pub async fn requeue_dead_letter(
        &self,
        ctx: &mut CommandContext,
        id: Uuid,
        retries: i32,
    ) -> EngineResult<Job> {
        let job = ctx
            .storage()
            .find_dead_letter_job(id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "dead-letter job",
                id,
            })?;

        let mut revived = job.clone();
        revived.retries = retries.max(1);
        revived.attempts = 0;
        revived.due_date = None;
        revived.lock_owner = None;
        revived.lock_expiration_time = None;
        revived.exception_message = None;
        revived.exception_stacktrace = None;

        info!(job = %id, retries, "requeueing dead-letter job");
        ctx.storage().requeue_from_dead_letter(revived.clone()).await?;
        Ok(revived)
    }

    /// Suspended jobs are invisible to the acquisition scan until
    /// reactivated.
    pub async fn suspend(&self, ctx: &mut CommandContext, id: Uuid) -> EngineResult<Job> {
        self.set_suspended(ctx, id, true).await
    }

    pub async fn activate(&self, ctx: &mut CommandContext, id: Uuid) -> EngineResult<Job> {
        self.set_suspended(ctx, id, false).await
    }

    async fn set_suspended(
        &self,
        ctx: &mut CommandContext,
        id: Uuid,
        suspended: bool,
    ) -> EngineResult<Job> {
        let job = ctx
            .storage()
            .find_job(id)
            .await?
            .ok_or(EngineError::NotFound { entity: "job", id })?;
        let mut updated = job;
        updated.suspended = suspended;
        ctx.storage().update_job(updated.clone()).await?;
        Ok(updated)
    }

    pub async fn find_due(
        &self,
        ctx: &mut CommandContext,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<Job>> {
        ctx.storage().find_due_jobs(now, limit).await
    }

    /// Operator view of the dead-letter namespace.
    pub async fn find_dead_letter(&self, ctx: &mut CommandContext) -> EngineResult<Vec<Job>> {
        ctx.storage().list_dead_letter_jobs().await
    }
}
