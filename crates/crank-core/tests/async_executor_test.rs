use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crank_core::command::CommandConfig;
use crank_core::commands::ScheduleJobCmd;
use crank_core::config::EngineConfig;
use crank_core::context::CommandContext;
use crank_core::executor::AsyncExecutor;
use crank_core::handler::{HandlerRegistry, JobHandler};
use crank_core::interceptor::CommandExecutor;
use crank_core::job_service::JobService;
use crank_core::models::{Job, NewJob};
use crank_core::repository::StorageRepository;
use crank_core::schedule::CronResolver;
use crank_state::InMemoryRepository;
use tokio::time::{sleep, timeout, Duration};

fn init_tracing() -> tracing::dispatcher::DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::set_default(subscriber)
}

fn test_config() -> EngineConfig {
    EngineConfig {
        async_executor_enabled: true,
        worker_pool_size: 2,
        acquisition_batch_size: 8,
        poll_interval_secs: 0.01,
        lock_lease_secs: 60,
        default_job_retries: 3,
        backoff_base_secs: 0,
        backoff_max_secs: 0,
        lock_wait_timeout_secs: 1,
        lock_poll_millis: 10,
        conflict_retries: 3,
    }
}

struct Rig {
    repo: Arc<InMemoryRepository>,
    executor: Arc<CommandExecutor>,
    service: Arc<JobService>,
    scheduler: AsyncExecutor,
}

fn setup_with(config: EngineConfig, handlers: HandlerRegistry) -> Rig {
    let repo = Arc::new(InMemoryRepository::new());
    let executor = Arc::new(CommandExecutor::new(repo.clone(), &config));
    let service = Arc::new(JobService::new(&config, Arc::new(CronResolver)));
    let scheduler = AsyncExecutor::new(
        Arc::clone(&executor),
        Arc::clone(&service),
        Arc::new(handlers),
        config,
    );
    Rig {
        repo,
        executor,
        service,
        scheduler,
    }
}

struct CountingHandler {
    kind: &'static str,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl JobHandler for CountingHandler {
    fn handler_type(&self) -> &str {
        self.kind
    }

    async fn execute(
        &self,
        _job: &Job,
        _config: &serde_json::Value,
        _ctx: &mut CommandContext,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn schedule(rig: &Rig, new_job: NewJob) -> Job {
    rig.executor
        .execute(
            CommandConfig::default(),
            ScheduleJobCmd {
                service: Arc::clone(&rig.service),
                new_job,
            },
        )
        .await
        .expect("schedule")
}

async fn wait_for_empty_job_table(repo: &InMemoryRepository) {
    timeout(Duration::from_secs(5), async {
        loop {
            if repo.count_jobs().await.expect("count") == 0 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("jobs drained in time");
}

#[tokio::test]
async fn test_background_executor_drains_due_jobs() {
    let _trace = init_tracing();
    let calls = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(CountingHandler {
        kind: "work",
        calls: Arc::clone(&calls),
    }));
    let rig = setup_with(test_config(), handlers);

    for n in 0..5 {
        schedule(&rig, NewJob::message("work", serde_json::json!({ "n": n }))).await;
    }

    let handle = rig.scheduler.start().expect("start");
    wait_for_empty_job_table(&rig.repo).await;
    handle.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert!(rig.repo.list_dead_letter_jobs().await.expect("dl").is_empty());
}

#[tokio::test]
async fn test_disabled_executor_spawns_nothing() {
    let _trace = init_tracing();
    let config = EngineConfig {
        async_executor_enabled: false,
        ..test_config()
    };
    let calls = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(CountingHandler {
        kind: "work",
        calls: Arc::clone(&calls),
    }));
    let rig = setup_with(config, handlers);

    schedule(&rig, NewJob::message("work", serde_json::json!({}))).await;
    let handle = rig.scheduler.start().expect("start");
    sleep(Duration::from_millis(50)).await;
    handle.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(rig.repo.count_jobs().await.expect("count"), 1);
}

#[tokio::test]
async fn test_missing_handler_dead_letters_the_job() {
    let _trace = init_tracing();
    let rig = setup_with(test_config(), HandlerRegistry::new());

    let job = schedule(
        &rig,
        NewJob::message("ghost", serde_json::json!({})).with_retries(2),
    )
    .await;

    let handle = rig.scheduler.start().expect("start");
    timeout(Duration::from_secs(5), async {
        loop {
            if !rig
                .repo
                .list_dead_letter_jobs()
                .await
                .expect("dl")
                .is_empty()
            {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job dead-lettered in time");
    handle.shutdown().await;

    let dead = rig
        .repo
        .find_dead_letter_job(job.id)
        .await
        .expect("find")
        .expect("dead-lettered");
    assert_eq!(dead.retries, 0);
    assert!(dead
        .exception_message
        .as_deref()
        .expect("message")
        .contains("no handler registered"));
}

#[tokio::test]
async fn test_acquisition_is_bounded_by_queue_capacity() {
    let _trace = init_tracing();
    let config = EngineConfig {
        worker_pool_size: 1,
        acquisition_batch_size: 16,
        ..test_config()
    };
    let calls = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(CountingHandler {
        kind: "work",
        calls: Arc::clone(&calls),
    }));
    let rig = setup_with(config, handlers);

    for _ in 0..6 {
        schedule(&rig, NewJob::message("work", serde_json::json!({}))).await;
    }

    // Pool size 1 gives a queue capacity of 2; one pass must not lock
    // more jobs than it could hand to workers.
    let locked = rig.scheduler.acquire_batch().await.expect("acquire");
    assert_eq!(locked.len(), 2);

    let now = chrono::Utc::now();
    let remaining = rig.repo.find_due_jobs(now, 16).await.expect("scan");
    assert_eq!(remaining.len(), 4);
    for job in &remaining {
        assert!(job.lock_owner.is_none());
    }
}

/// Crash recovery: a job locked by a node that died is reacquired once
/// its lease lapses, and re-running the idempotent handler leaves the
/// same end state as a single clean run.
#[tokio::test]
async fn test_lapsed_lease_is_reacquired_and_executed() {
    let _trace = init_tracing();
    let config = EngineConfig {
        lock_lease_secs: 1,
        ..test_config()
    };
    let calls = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(CountingHandler {
        kind: "work",
        calls: Arc::clone(&calls),
    }));
    let rig = setup_with(config, handlers);

    let job = schedule(&rig, NewJob::message("work", serde_json::json!({}))).await;

    // "Crash": lock the job and never execute it.
    let locked = rig.scheduler.acquire_batch().await.expect("acquire");
    assert_eq!(locked.len(), 1);

    // Within the lease the job is invisible to acquisition.
    assert!(rig.scheduler.acquire_batch().await.expect("acquire").is_empty());

    sleep(Duration::from_millis(1100)).await;

    // After the lease lapses any node may reclaim it.
    let reacquired = rig.scheduler.acquire_batch().await.expect("acquire");
    assert_eq!(reacquired.len(), 1);
    rig.scheduler
        .process(reacquired.into_iter().next().expect("job"))
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(rig.repo.find_job(job.id).await.expect("find").is_none());
}

/// At-least-once: processing a stale claim after the job already
/// completed is a no-op, so the final state matches a single execution.
#[tokio::test]
async fn test_stale_claim_after_completion_is_a_noop() {
    let _trace = init_tracing();
    let calls = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(CountingHandler {
        kind: "work",
        calls: Arc::clone(&calls),
    }));
    let rig = setup_with(test_config(), handlers);

    schedule(&rig, NewJob::message("work", serde_json::json!({}))).await;

    let locked = rig.scheduler.acquire_batch().await.expect("acquire");
    let claim = locked.into_iter().next().expect("job");

    rig.scheduler.process(claim.clone()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.repo.count_jobs().await.expect("count"), 0);

    // Replay of the same claim (e.g. a second node after lease expiry).
    rig.scheduler.process(claim).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.repo.count_jobs().await.expect("count"), 0);
    assert!(rig.repo.list_dead_letter_jobs().await.expect("dl").is_empty());
}

/// A job whose lock was taken over by another node is skipped, not
/// executed, by the original claimant.
#[tokio::test]
async fn test_foreign_lock_owner_is_respected() {
    let _trace = init_tracing();
    let calls = Arc::new(AtomicU32::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(CountingHandler {
        kind: "work",
        calls: Arc::clone(&calls),
    }));
    let rig = setup_with(test_config(), handlers);

    let job = schedule(&rig, NewJob::message("work", serde_json::json!({}))).await;

    // Another node claims the row directly.
    let stored = rig
        .repo
        .find_job(job.id)
        .await
        .expect("find")
        .expect("present");
    let mut foreign = stored.clone();
    foreign.lock_owner = Some("some-other-node".to_string());
    foreign.lock_expiration_time = Some(chrono::Utc::now() + chrono::Duration::seconds(60));
    rig.repo
        .apply(vec![crank_core::repository::WriteOp::UpdateJob(foreign)])
        .await
        .expect("foreign claim");

    // Our executor tries to run its stale claim and must back off.
    rig.scheduler.process(stored).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(rig.repo.find_job(job.id).await.expect("find").is_some());
}
