// The per-unit-of-work object: owns the open sessions, an attribute bag,
// the deferred first-failure slot and the ordered close-listener list.
// Exclusively owned by the task executing the command; never shared and
// never outlives the command.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::repository::StorageRepository;
use crate::session::{SessionRegistry, StorageSession};

/// First failure wins; later failures during cleanup are logged and
/// discarded, never allowed to mask the original.
#[derive(Default)]
pub struct FailureSlot {
    first: Option<EngineError>,
}

impl FailureSlot {
    pub fn capture(&mut self, err: EngineError) {
        if self.first.is_some() {
            warn!(error = %err, "secondary failure during unit of work, keeping the first");
            return;
        }
        self.first = Some(err);
    }

    pub fn has_failure(&self) -> bool {
        self.first.is_some()
    }

    pub fn take(&mut self) -> Option<EngineError> {
        self.first.take()
    }
}

/// Hook points around the end of a unit of work. Writes made in
/// `on_closing` join the flush and commit; `on_closed` runs after the
/// transaction is finalized and must be idempotent and best-effort.
#[async_trait]
pub trait CloseListener: Send {
    async fn on_closing(&mut self, ctx: &mut CommandContext) -> EngineResult<()>;

    async fn on_closed(&mut self, ctx: &mut CommandContext) -> EngineResult<()> {
        let _ = ctx;
        Ok(())
    }
}

pub struct CommandContext {
    sessions: SessionRegistry,
    repository: Arc<dyn StorageRepository>,
    attributes: HashMap<String, serde_json::Value>,
    close_listeners: Vec<Box<dyn CloseListener>>,
    failure: FailureSlot,
    transactional: bool,
}

impl CommandContext {
    pub fn new(repository: Arc<dyn StorageRepository>, transactional: bool) -> Self {
        Self {
            sessions: SessionRegistry::new(Arc::clone(&repository), transactional),
            repository,
            attributes: HashMap::new(),
            close_listeners: Vec::new(),
            failure: FailureSlot::default(),
            transactional,
        }
    }

    pub fn storage(&mut self) -> &mut StorageSession {
        self.sessions.storage()
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    /// Listeners run in registration order at both hook points.
    pub fn add_close_listener(&mut self, listener: Box<dyn CloseListener>) {
        self.close_listeners.push(listener);
    }

    pub fn capture_failure(&mut self, err: EngineError) {
        self.failure.capture(err);
    }

    pub fn has_failure(&self) -> bool {
        self.failure.has_failure()
    }

    /// Close sequence; every step runs even when earlier steps fail:
    ///   1. notify listeners of "closing" (their writes join the flush),
    ///   2. flush open sessions if no failure was captured,
    ///   3. commit the batch, or roll the buffers back on failure,
    ///   4. notify listeners of "closed" (post-commit, best-effort),
    ///   5. close sessions, capturing close-time errors,
    ///   6. rethrow the first captured failure, if any.
    pub async fn close(mut self) -> EngineResult<()> {
        let mut listeners = std::mem::take(&mut self.close_listeners);

        for listener in listeners.iter_mut() {
            if let Err(err) = listener.on_closing(&mut self).await {
                self.failure.capture(err);
            }
        }

        if self.failure.has_failure() {
            let dropped = self.sessions.rollback_all();
            if dropped > 0 {
                debug!(dropped, "unit of work failed, rolled back pending writes");
            }
        } else {
            let ops = self.sessions.flush_all();
            if !ops.is_empty() {
                if let Err(err) = self.repository.apply(ops).await {
                    self.failure.capture(err);
                }
            }
        }

        for listener in listeners.iter_mut() {
            if let Err(err) = listener.on_closed(&mut self).await {
                self.failure.capture(err);
            }
        }

        if let Err(err) = self.sessions.close_all().await {
            self.failure.capture(err);
        }

        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
