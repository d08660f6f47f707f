// The command executor composes the fixed interceptor stages around a
// command, outermost to innermost: logging, conflict retry, transaction
// boundary, context. Stage order is fixed at construction and visible in
// `execute`.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::command::{Command, CommandConfig, TxPropagation};
use crate::config::EngineConfig;
use crate::context::CommandContext;
use crate::error::{EngineError, EngineResult};
use crate::repository::StorageRepository;

pub struct CommandExecutor {
    repository: Arc<dyn StorageRepository>,
    default_conflict_retries: u32,
}

impl CommandExecutor {
    pub fn new(repository: Arc<dyn StorageRepository>, config: &EngineConfig) -> Self {
        Self {
            repository,
            default_conflict_retries: config.conflict_retries,
        }
    }

    /// Run a command through the full interceptor chain.
    pub async fn execute<C: Command>(
        &self,
        config: CommandConfig,
        command: C,
    ) -> EngineResult<C::Output> {
        // Logging stage: side-effect only, never alters control flow.
        let name = command.name();
        debug!(command = name, propagation = config.propagation.as_str(), "command starting");
        let result = self.retry_stage(&config, &command).await;
        match &result {
            Ok(_) => debug!(command = name, "command finished"),
            Err(err) => warn!(command = name, error = %err, "command failed"),
        }
        result
    }

    /// Run a command inside an already-open context: no new transaction
    /// boundary, no retry. The outer command owns both.
    pub async fn execute_in<C: Command>(
        &self,
        ctx: &mut CommandContext,
        command: C,
    ) -> EngineResult<C::Output> {
        command.execute(ctx).await
    }

    /// Retry stage: only optimistic-locking conflicts are retried, a
    /// bounded number of times; everything else propagates immediately.
    async fn retry_stage<C: Command>(
        &self,
        config: &CommandConfig,
        command: &C,
    ) -> EngineResult<C::Output> {
        let budget = config
            .conflict_retries
            .unwrap_or(self.default_conflict_retries);
        let mut attempt: u32 = 0;
        loop {
            match self.context_stage(config, command).await {
                Err(err) if err.is_conflict() && attempt < budget => {
                    attempt += 1;
                    debug!(
                        command = command.name(),
                        attempt,
                        budget,
                        "optimistic locking conflict, retrying command"
                    );
                }
                other => return other,
            }
        }
    }

    /// Transaction + context stage: open a context with the requested
    /// boundary, run the command, and always drive the close sequence,
    /// rethrowing the first captured failure after cleanup completes.
    async fn context_stage<C: Command>(
        &self,
        config: &CommandConfig,
        command: &C,
    ) -> EngineResult<C::Output> {
        let transactional = !matches!(config.propagation, TxPropagation::NotSupported);
        let mut ctx = CommandContext::new(Arc::clone(&self.repository), transactional);

        let mut output = None;
        match command.execute(&mut ctx).await {
            Ok(value) => output = Some(value),
            Err(err) => ctx.capture_failure(err),
        }

        ctx.close().await?;

        // A clean close implies the command produced a value; the guard
        // only exists to avoid unwrap in the kernel.
        output.ok_or_else(|| {
            EngineError::Config("command closed cleanly without an output".to_string())
        })
    }
}
