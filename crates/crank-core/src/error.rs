use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("optimistic locking conflict on {entity} {id}")]
    OptimisticLocking { entity: &'static str, id: Uuid },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("lock '{name}' not acquired within {waited_ms}ms")]
    LockTimeout { name: String, waited_ms: u64 },

    #[error("no handler registered for type '{handler_type}'")]
    HandlerNotFound { handler_type: String },

    #[error("handler failed for job {job_id}: {source}")]
    Handler {
        job_id: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid repeat expression '{expr}': {message}")]
    RepeatExpression { expr: String, message: String },

    #[error("storage error: {source}")]
    Storage {
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid engine configuration: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Concurrency conflicts are routine and retried at the interceptor
    /// layer; every other kind propagates immediately.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::OptimisticLocking { .. })
    }

    pub fn storage(source: impl Into<anyhow::Error>) -> Self {
        Self::Storage {
            source: source.into(),
        }
    }
}
