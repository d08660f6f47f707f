// Built-in engine commands. The async executor drives these through the
// command executor; operators and tests can run them directly the same
// way.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::command::Command;
use crate::context::{CloseListener, CommandContext};
use crate::error::{EngineError, EngineResult};
use crate::handler::HandlerRegistry;
use crate::job_service::JobService;
use crate::models::{Job, NewJob};

/// Create a job in the ready or timer state.
pub struct ScheduleJobCmd {
    pub service: Arc<JobService>,
    pub new_job: NewJob,
}

#[async_trait]
impl Command for ScheduleJobCmd {
    type Output = Job;

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Job> {
        self.service.schedule(ctx, self.new_job.clone()).await
    }

    fn name(&self) -> &'static str {
        "schedule-job"
    }
}

/// Seed a recurring timer job from a repeat expression.
pub struct ScheduleRecurringCmd {
    pub service: Arc<JobService>,
    pub handler_type: String,
    pub handler_config: serde_json::Value,
    pub repeat: String,
    pub correlation_id: Option<String>,
}

#[async_trait]
impl Command for ScheduleRecurringCmd {
    type Output = Job;

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Job> {
        self.service
            .schedule_recurring(
                ctx,
                &self.handler_type,
                self.handler_config.clone(),
                &self.repeat,
                self.correlation_id.as_deref(),
            )
            .await
    }

    fn name(&self) -> &'static str {
        "schedule-recurring-job"
    }
}

/// The acquisition scan: due, unlocked, non-suspended jobs.
pub struct FindDueJobsCmd {
    pub now: DateTime<Utc>,
    pub limit: usize,
}

#[async_trait]
impl Command for FindDueJobsCmd {
    type Output = Vec<Job>;

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Vec<Job>> {
        ctx.storage().find_due_jobs(self.now, self.limit).await
    }

    fn name(&self) -> &'static str {
        "find-due-jobs"
    }
}

/// Claim one candidate job. Run with `CommandConfig::no_retry()`: a
/// conflict means another acquirer won and the candidate is skipped.
pub struct LockJobCmd {
    pub service: Arc<JobService>,
    pub job: Job,
    pub owner: String,
    pub lease: Duration,
}

#[async_trait]
impl Command for LockJobCmd {
    type Output = Job;

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Job> {
        self.service
            .lock_job(ctx, &self.job, &self.owner, self.lease)
            .await
    }

    fn name(&self) -> &'static str {
        "lock-job"
    }
}

/// Deletes the job during "closing" when the handler succeeded, so the
/// handler's effects and the job's terminal transition commit together.
struct JobOutcomeListener {
    service: Arc<JobService>,
    job: Job,
}

#[async_trait]
impl CloseListener for JobOutcomeListener {
    async fn on_closing(&mut self, ctx: &mut CommandContext) -> EngineResult<()> {
        if ctx.has_failure() {
            // The failure transition runs in its own unit of work so it
            // survives this one's rollback.
            return Ok(());
        }
        self.service.complete(ctx, &self.job).await
    }

    async fn on_closed(&mut self, ctx: &mut CommandContext) -> EngineResult<()> {
        if ctx.has_failure() {
            debug!(job = %self.job.id, "job execution rolled back");
        } else {
            debug!(job = %self.job.id, handler = %self.job.handler_type, "job completed");
        }
        Ok(())
    }
}

/// Execute a locked job's handler inside one unit of work. The job is
/// re-read so the execution sees its post-acquisition revision; a job
/// that vanished or was reclaimed by another node is a silent no-op
/// (at-least-once semantics).
pub struct ExecuteJobCmd {
    pub service: Arc<JobService>,
    pub handlers: Arc<HandlerRegistry>,
    pub job_id: Uuid,
    pub owner: String,
}

#[async_trait]
impl Command for ExecuteJobCmd {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let job = match ctx.storage().find_job(self.job_id).await? {
            Some(job) => job,
            None => {
                debug!(job = %self.job_id, "job already gone, skipping execution");
                return Ok(());
            }
        };
        if job.lock_owner.as_deref() != Some(self.owner.as_str()) {
            debug!(
                job = %job.id,
                owner = ?job.lock_owner,
                "job reclaimed by another owner, skipping execution"
            );
            return Ok(());
        }

        let handler = self.handlers.get(&job.handler_type).ok_or_else(|| {
            EngineError::HandlerNotFound {
                handler_type: job.handler_type.clone(),
            }
        })?;

        ctx.add_close_listener(Box::new(JobOutcomeListener {
            service: Arc::clone(&self.service),
            job: job.clone(),
        }));

        let config = job.handler_config.clone();
        handler
            .execute(&job, &config, ctx)
            .await
            .map_err(|source| EngineError::Handler {
                job_id: job.id,
                source,
            })
    }

    fn name(&self) -> &'static str {
        "execute-job"
    }
}

/// Record a handler failure: retry/backoff bookkeeping in its own unit of
/// work (run with `CommandConfig::requires_new()`), after the execution
/// command rolled back.
pub struct RecordJobFailureCmd {
    pub service: Arc<JobService>,
    pub job_id: Uuid,
    pub message: String,
    pub stacktrace: Option<String>,
}

#[async_trait]
impl Command for RecordJobFailureCmd {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let job = match ctx.storage().find_job(self.job_id).await? {
            Some(job) => job,
            None => {
                debug!(job = %self.job_id, "job gone before failure bookkeeping, skipping");
                return Ok(());
            }
        };
        self.service
            .record_failure(ctx, &job, &self.message, self.stacktrace.as_deref())
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "record-job-failure"
    }
}

/// Park a retry-exhausted job in the dead-letter namespace.
pub struct MoveToDeadLetterCmd {
    pub service: Arc<JobService>,
    pub job: Job,
    pub reason: String,
}

#[async_trait]
impl Command for MoveToDeadLetterCmd {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        self.service
            .move_to_dead_letter(ctx, &self.job, &self.reason)
            .await
    }

    fn name(&self) -> &'static str {
        "move-to-dead-letter"
    }
}

/// Operator requeue of a dead-letter job back into the scheduler.
pub struct RequeueDeadLetterCmd {
    pub service: Arc<JobService>,
    pub job_id: Uuid,
    pub retries: i32,
}

#[async_trait]
impl Command for RequeueDeadLetterCmd {
    type Output = Job;

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Job> {
        self.service
            .requeue_dead_letter(ctx, self.job_id, self.retries)
            .await
    }

    fn name(&self) -> &'static str {
        "requeue-dead-letter"
    }
}

pub struct SuspendJobCmd {
    pub service: Arc<JobService>,
    pub job_id: Uuid,
}

#[async_trait]
impl Command for SuspendJobCmd {
    type Output = Job;

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Job> {
        self.service.suspend(ctx, self.job_id).await
    }

    fn name(&self) -> &'static str {
        "suspend-job"
    }
}

pub struct ActivateJobCmd {
    pub service: Arc<JobService>,
    pub job_id: Uuid,
}

#[async_trait]
impl Command for ActivateJobCmd {
    type Output = Job;

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Job> {
        self.service.activate(ctx, self.job_id).await
    }

    fn name(&self) -> &'static str {
        "activate-job"
    }
}
