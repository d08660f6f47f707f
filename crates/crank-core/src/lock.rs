// Cluster-wide mutual exclusion over a named lock row in the storage
// backend. Used directly for singleton maintenance tasks; job locking
// uses optimistic per-row locking instead, for scalability.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::repository::StorageRepository;

pub struct LockManager {
    repository: Arc<dyn StorageRepository>,
    owner: String,
    lease: chrono::Duration,
    poll: Duration,
}

impl LockManager {
    pub fn new(
        repository: Arc<dyn StorageRepository>,
        owner: impl Into<String>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            repository,
            owner: owner.into(),
            lease: chrono::Duration::seconds(config.lock_lease_secs as i64),
            poll: Duration::from_millis(config.lock_poll_millis.max(1)),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Acquire the named lock (polling until `wait_timeout` elapses), run
    /// the action, and release the lock on every exit path.
    pub async fn with_lock<T, F, Fut>(
        &self,
        name: &str,
        wait_timeout: Duration,
        action: F,
    ) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        self.acquire(name, wait_timeout).await?;
        debug!(lock = name, owner = %self.owner, "lock acquired");

        let result = action().await;

        if let Err(err) = self.repository.release_lock(name, &self.owner).await {
            // The lease still expires; a failed release delays but never
            // prevents the next acquisition.
            warn!(lock = name, error = %err, "failed to release lock");
        } else {
            debug!(lock = name, "lock released");
        }

        result
    }

    async fn acquire(&self, name: &str, wait_timeout: Duration) -> EngineResult<()> {
        let deadline = tokio::time::Instant::now() + wait_timeout;
        loop {
            let expires_at = Utc::now() + self.lease;
            if self
                .repository
                .try_acquire_lock(name, &self.owner, expires_at)
                .await?
            {
                return Ok(());
            }
            if tokio::time::Instant::now() + self.poll > deadline {
                return Err(EngineError::LockTimeout {
                    name: name.to_string(),
                    waited_ms: wait_timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}
