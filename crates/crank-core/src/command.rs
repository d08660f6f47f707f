use async_trait::async_trait;

use crate::context::CommandContext;
use crate::error::EngineResult;

/// A single unit of work of business logic, executed atomically within a
/// command context. Implementations are free-standing and independent of
/// how the context was opened.
#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send;

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Self::Output>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Transaction boundary policy for a command invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPropagation {
    /// Open a transactional context; nested engine services share it by
    /// taking the context as a parameter.
    Required,
    /// Always open a fresh transactional context, even from inside an
    /// already-open one (used by the job-failure path so the retry
    /// bookkeeping survives the rollback of the handler's own writes).
    RequiresNew,
    /// Run outside any transaction: session writes apply immediately and
    /// are not rolled back on failure.
    NotSupported,
}

impl TxPropagation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::RequiresNew => "requires-new",
            Self::NotSupported => "not-supported",
        }
    }
}

/// Per-call overrides for the command executor.
#[derive(Debug, Clone, Copy)]
pub struct CommandConfig {
    pub propagation: TxPropagation,
    /// Optimistic-lock retry budget for this call; `None` uses the
    /// engine default. Distinct from the job retry budget.
    pub conflict_retries: Option<u32>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            propagation: TxPropagation::Required,
            conflict_retries: None,
        }
    }
}

impl CommandConfig {
    /// Conflicts propagate to the caller instead of being retried; the
    /// acquisition loop uses this to treat a lost race as a skip.
    pub fn no_retry() -> Self {
        Self {
            propagation: TxPropagation::Required,
            conflict_retries: Some(0),
        }
    }

    pub fn requires_new() -> Self {
        Self {
            propagation: TxPropagation::RequiresNew,
            conflict_retries: None,
        }
    }

    pub fn not_supported() -> Self {
        Self {
            propagation: TxPropagation::NotSupported,
            conflict_retries: Some(0),
        }
    }
}
