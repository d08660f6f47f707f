// The async executor: an acquisition loop that finds due, unlocked jobs,
// claims them with optimistic per-row locks, and hands them to a bounded
// worker pool. Every acquisition and every execution is its own command.

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::CommandConfig;
use crate::commands::{
    ExecuteJobCmd, FindDueJobsCmd, LockJobCmd, MoveToDeadLetterCmd, RecordJobFailureCmd,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::handler::HandlerRegistry;
use crate::interceptor::CommandExecutor;
use crate::job_service::JobService;
use crate::models::Job;

#[derive(Debug, Default, Serialize)]
pub struct AcquisitionMetrics {
    pub scanned: usize,
    pub acquired: usize,
    pub conflicts: usize,
    pub dead_lettered: usize,
    pub backpressure: bool,
    pub cycle_ms: u128,
}

pub struct AsyncExecutor {
    executor: Arc<CommandExecutor>,
    service: Arc<JobService>,
    handlers: Arc<HandlerRegistry>,
    config: EngineConfig,
    node_id: String,
    job_tx: mpsc::Sender<Job>,
    job_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

/// Handles for the spawned loop and worker tasks.
pub struct ExecutorHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl ExecutorHandle {
    /// Signal shutdown and wait for the acquisition loop and all workers
    /// to stop. Jobs still locked in the queue are left to lease expiry.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        join_all(self.handles).await;
    }
}

impl AsyncExecutor {
    pub fn new(
        executor: Arc<CommandExecutor>,
        service: Arc<JobService>,
        handlers: Arc<HandlerRegistry>,
        config: EngineConfig,
    ) -> Self {
        // Queue capacity bounds how far acquisition can run ahead of the
        // workers; locks are never taken for jobs that cannot be serviced
        // before the next cycle.
        let capacity = config.worker_pool_size.max(1) * 2;
        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        Self {
            executor,
            service,
            handlers,
            config,
            node_id: format!("node-{}", Uuid::new_v4()),
            job_tx,
            job_rx: Arc::new(Mutex::new(job_rx)),
            shutdown_tx,
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Spawn the acquisition loop and the worker pool.
    pub fn start(&self) -> EngineResult<ExecutorHandle> {
        self.config.validate()?;
        if !self.config.async_executor_enabled {
            info!("async executor disabled by configuration");
            return Ok(ExecutorHandle {
                shutdown_tx: self.shutdown_tx.clone(),
                handles: Vec::new(),
            });
        }

        info!(
            node = %self.node_id,
            pool = self.config.worker_pool_size,
            batch = self.config.acquisition_batch_size,
            poll_secs = self.config.poll_interval_secs,
            "starting async executor"
        );

        let mut handles = Vec::new();
        for worker in 0..self.config.worker_pool_size {
            handles.push(self.spawn_worker(worker));
        }
        handles.push(self.spawn_acquisition_loop());

        Ok(ExecutorHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            handles,
        })
    }

    fn spawn_acquisition_loop(&self) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let service = Arc::clone(&self.service);
        let job_tx = self.job_tx.clone();
        let config = self.config.clone();
        let node_id = self.node_id.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let cycle_start = Instant::now();
                let mut metrics = AcquisitionMetrics::default();
                if let Err(err) = acquire_cycle(
                    &executor,
                    &service,
                    &job_tx,
                    &config,
                    &node_id,
                    &mut metrics,
                )
                .await
                {
                    error!(error = %err, "acquisition cycle failed");
                }
                metrics.cycle_ms = cycle_start.elapsed().as_millis();

                let metrics_json = serde_json::to_string(&metrics).unwrap_or_default();
                debug!("ACQUISITION_METRICS: {}", metrics_json);

                // Sleep only when the cycle found nothing to do; when work
                // was acquired, loop back immediately to check for more.
                if metrics.acquired == 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs_f64(config.poll_interval_secs)) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
            info!("acquisition loop stopped");
        })
    }

    fn spawn_worker(&self, worker: usize) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let service = Arc::clone(&self.service);
        let handlers = Arc::clone(&self.handlers);
        let job_rx = Arc::clone(&self.job_rx);
        let node_id = self.node_id.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                let job = {
                    let mut rx = job_rx.lock().await;
                    tokio::select! {
                        job = rx.recv() => job,
                        _ = shutdown_rx.changed() => None,
                    }
                };
                let Some(job) = job else { break };
                execute_one(&executor, &service, &handlers, &node_id, job).await;
            }
            debug!(worker, "worker stopped");
        })
    }

    /// One acquisition pass, callable directly for deterministic tests:
    /// scan for due jobs (bounded by free queue capacity), dead-letter
    /// candidates whose retry budget is spent, lock the rest and enqueue
    /// them. Returns the jobs locked by this pass.
    pub async fn acquire_batch(&self) -> EngineResult<Vec<Job>> {
        let mut metrics = AcquisitionMetrics::default();
        acquire_locked(
            &self.executor,
            &self.service,
            &self.job_tx,
            &self.config,
            &self.node_id,
            &mut metrics,
        )
        .await
    }

    /// Execute one locked job to completion, callable directly for
    /// deterministic tests.
    pub async fn process(&self, job: Job) {
        execute_one(
            &self.executor,
            &self.service,
            &self.handlers,
            &self.node_id,
            job,
        )
        .await;
    }

}

async fn acquire_cycle(
    executor: &Arc<CommandExecutor>,
    service: &Arc<JobService>,
    job_tx: &mpsc::Sender<Job>,
    config: &EngineConfig,
    node_id: &str,
    metrics: &mut AcquisitionMetrics,
) -> EngineResult<()> {
    let locked = acquire_locked(executor, service, job_tx, config, node_id, metrics).await?;
    for job in locked {
        // Capacity was reserved by the batch bound; treat a closed queue
        // as shutdown.
        if job_tx.send(job).await.is_err() {
            warn!("worker queue closed, dropping acquired job lock to lease expiry");
            break;
        }
    }
    Ok(())
}

async fn acquire_locked(
    executor: &Arc<CommandExecutor>,
    service: &Arc<JobService>,
    job_tx: &mpsc::Sender<Job>,
    config: &EngineConfig,
    node_id: &str,
    metrics: &mut AcquisitionMetrics,
) -> EngineResult<Vec<Job>> {
    let free = job_tx.capacity();
    if free == 0 {
        // Workers are saturated; locking more would leave jobs claimed
        // but unserviced until their lease lapses.
        metrics.backpressure = true;
        return Ok(Vec::new());
    }
    let limit = free.min(config.acquisition_batch_size);

    let now = Utc::now();
    let candidates = executor
        .execute(CommandConfig::default(), FindDueJobsCmd { now, limit })
        .await?;
    metrics.scanned = candidates.len();

    let lease = ChronoDuration::seconds(config.lock_lease_secs as i64);
    let mut locked = Vec::new();
    for job in candidates {
        if job.retries == 0 {
            // Budget spent before this attempt: route to dead-letter
            // instead of executing.
            let result = executor
                .execute(
                    CommandConfig::no_retry(),
                    MoveToDeadLetterCmd {
                        service: Arc::clone(service),
                        job,
                        reason: "retries exhausted".to_string(),
                    },
                )
                .await;
            match result {
                Ok(()) => metrics.dead_lettered += 1,
                Err(err) if err.is_conflict() => metrics.conflicts += 1,
                Err(err) => error!(error = %err, "failed to dead-letter exhausted job"),
            }
            continue;
        }

        let result = executor
            .execute(
                CommandConfig::no_retry(),
                LockJobCmd {
                    service: Arc::clone(service),
                    job,
                    owner: node_id.to_string(),
                    lease,
                },
            )
            .await;
        match result {
            Ok(job) => {
                metrics.acquired += 1;
                locked.push(job);
            }
            // Another node or thread won the row; skip silently.
            Err(err) if err.is_conflict() => metrics.conflicts += 1,
            Err(err) => error!(error = %err, "failed to lock job"),
        }
    }
    Ok(locked)
}

async fn execute_one(
    executor: &Arc<CommandExecutor>,
    service: &Arc<JobService>,
    handlers: &Arc<HandlerRegistry>,
    node_id: &str,
    job: Job,
) {
    let result = executor
        .execute(
            CommandConfig::default(),
            ExecuteJobCmd {
                service: Arc::clone(service),
                handlers: Arc::clone(handlers),
                job_id: job.id,
                owner: node_id.to_string(),
            },
        )
        .await;

    let Err(err) = result else { return };
    warn!(job = %job.id, error = %err, "job execution failed");

    let (message, stacktrace) = describe_failure(&err);
    let bookkeeping = executor
        .execute(
            CommandConfig::requires_new(),
            RecordJobFailureCmd {
                service: Arc::clone(service),
                job_id: job.id,
                message,
                stacktrace,
            },
        )
        .await;
    if let Err(err) = bookkeeping {
        // The lease still expires, so the job is not lost; it will be
        // reacquired once the lock lapses.
        error!(job = %job.id, error = %err, "failed to record job failure");
    }
}

fn describe_failure(err: &EngineError) -> (String, Option<String>) {
    let message = err.to_string();
    let chain = format!("{err:?}");
    let stacktrace = if chain == message { None } else { Some(chain) };
    (message, stacktrace)
}
