// Job handler contract and registry. Handlers are resolved by the opaque
// handler type string stored on the job; a missing registration is a
// configuration failure, not a transient one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::CommandContext;
use crate::models::Job;

/// Business logic behind a job. Errors are interpreted as transient and
/// routed to the retry/backoff path. Handlers must tolerate at-least-once
/// execution: a lapsed lease can hand the same job to a second node.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn handler_type(&self) -> &str;

    async fn execute(
        &self,
        job: &Job,
        config: &serde_json::Value,
        ctx: &mut CommandContext,
    ) -> anyhow::Result<()>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let handler_type = handler.handler_type().to_string();
        self.handlers.insert(handler_type, handler);
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(handler_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
