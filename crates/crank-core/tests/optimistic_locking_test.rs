use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use crank_core::command::{Command, CommandConfig};
use crank_core::commands::LockJobCmd;
use crank_core::config::EngineConfig;
use crank_core::context::CommandContext;
use crank_core::error::{EngineError, EngineResult};
use crank_core::interceptor::CommandExecutor;
use crank_core::job_service::JobService;
use crank_core::models::{Job, NewJob};
use crank_core::repository::{StorageRepository, WriteOp};
use crank_core::schedule::CronResolver;
use crank_state::InMemoryRepository;
use uuid::Uuid;

fn init_tracing() -> tracing::dispatcher::DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::set_default(subscriber)
}

fn setup() -> (Arc<InMemoryRepository>, Arc<CommandExecutor>, Arc<JobService>) {
    let config = EngineConfig::responsive();
    let repo = Arc::new(InMemoryRepository::new());
    let executor = Arc::new(CommandExecutor::new(repo.clone(), &config));
    let service = Arc::new(JobService::new(&config, Arc::new(CronResolver)));
    (repo, executor, service)
}

async fn insert_job(repo: &InMemoryRepository) -> Job {
    let job = NewJob::message("noop", serde_json::json!({})).into_job(3);
    repo.apply(vec![WriteOp::InsertJob(job.clone())])
        .await
        .expect("insert");
    job
}

#[tokio::test]
async fn test_stale_update_fails_and_leaves_row_unchanged() {
    let _trace = init_tracing();
    let (repo, _executor, _service) = setup();
    let job = insert_job(&repo).await;

    let mut stale = job.clone();
    stale.revision = 42;
    stale.handler_type = "mutated".to_string();
    stale.retries = 0;

    let result = repo.apply(vec![WriteOp::UpdateJob(stale)]).await;
    assert!(matches!(
        result,
        Err(EngineError::OptimisticLocking { .. })
    ));

    let stored = repo.find_job(job.id).await.expect("find").expect("present");
    assert_eq!(stored.revision, 1);
    assert_eq!(stored.handler_type, "noop");
    assert_eq!(stored.retries, 3);
}

#[tokio::test]
async fn test_concurrent_acquisition_yields_exactly_one_winner() {
    let _trace = init_tracing();
    let (repo, executor, service) = setup();
    let job = insert_job(&repo).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let executor = Arc::clone(&executor);
        let service = Arc::clone(&service);
        let candidate = job.clone();
        tasks.push(tokio::spawn(async move {
            executor
                .execute(
                    CommandConfig::no_retry(),
                    LockJobCmd {
                        service,
                        job: candidate,
                        owner: format!("node-{i}"),
                        lease: Duration::seconds(60),
                    },
                )
                .await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.expect("join") {
            Ok(_) => winners += 1,
            Err(err) if err.is_conflict() => conflicts += 1,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 7);

    let stored = repo.find_job(job.id).await.expect("find").expect("present");
    assert!(stored.lock_owner.is_some());
    assert!(stored.lock_expiration_time.is_some());
    assert_eq!(stored.revision, 2);
}

/// Fails with a forced stale revision on the first attempt, then updates
/// cleanly; the retry interceptor should absorb the conflict.
struct FlakyUpdateCmd {
    job_id: Uuid,
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl Command for FlakyUpdateCmd {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let job = ctx
            .storage()
            .find_job(self.job_id)
            .await?
            .expect("job present");
        let mut updated = job;
        if attempt == 0 {
            updated.revision = 999;
        }
        updated.correlation_id = Some("touched".to_string());
        ctx.storage().update_job(updated).await
    }

    fn name(&self) -> &'static str {
        "flaky-update"
    }
}

#[tokio::test]
async fn test_conflicts_are_retried_a_bounded_number_of_times() {
    let _trace = init_tracing();
    let (repo, executor, _service) = setup();
    let job = insert_job(&repo).await;

    let attempts = Arc::new(AtomicU32::new(0));
    executor
        .execute(
            CommandConfig::default(),
            FlakyUpdateCmd {
                job_id: job.id,
                attempts: Arc::clone(&attempts),
            },
        )
        .await
        .expect("retried command");

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let stored = repo.find_job(job.id).await.expect("find").expect("present");
    assert_eq!(stored.correlation_id.as_deref(), Some("touched"));
}

#[tokio::test]
async fn test_no_retry_config_propagates_the_conflict() {
    let _trace = init_tracing();
    let (repo, executor, _service) = setup();
    let job = insert_job(&repo).await;

    let attempts = Arc::new(AtomicU32::new(0));
    let result = executor
        .execute(
            CommandConfig::no_retry(),
            FlakyUpdateCmd {
                job_id: job.id,
                attempts: Arc::clone(&attempts),
            },
        )
        .await;

    assert!(matches!(
        result,
        Err(EngineError::OptimisticLocking { .. })
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

/// Non-conflict errors must never be retried.
struct AlwaysFailCmd {
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl Command for AlwaysFailCmd {
    type Output = ();

    async fn execute(&self, _ctx: &mut CommandContext) -> EngineResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::Config("not a conflict".to_string()))
    }

    fn name(&self) -> &'static str {
        "always-fail"
    }
}

#[tokio::test]
async fn test_other_errors_are_not_retried() {
    let _trace = init_tracing();
    let (_repo, executor, _service) = setup();

    let attempts = Arc::new(AtomicU32::new(0));
    let result = executor
        .execute(
            CommandConfig::default(),
            AlwaysFailCmd {
                attempts: Arc::clone(&attempts),
            },
        )
        .await;

    assert!(matches!(result, Err(EngineError::Config(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}
