// Persisted engine entities. Every entity carries a revision counter used
// for optimistic concurrency: an update whose submitted revision does not
// match the stored revision fails atomically and applies nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Ready as soon as it is created (asynchronous continuation).
    Message,
    /// Becomes ready once its due date passes.
    Timer,
}

impl JobKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "message" => Some(Self::Message),
            "timer" => Some(Self::Timer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Timer => "timer",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(())
    }
}

/// A unit of deferred work. Lives in the job table while ready, timed or
/// locked, and in the dead-letter namespace once its retry budget is spent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub revision: i32,
    pub kind: JobKind,
    pub handler_type: String,
    pub handler_config: serde_json::Value,
    pub due_date: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub retries: i32,
    pub attempts: i32,
    pub exception_message: Option<String>,
    pub exception_stacktrace: Option<String>,
    pub correlation_id: Option<String>,
    pub repeat: Option<String>,
    pub suspended: bool,
    pub created: DateTime<Utc>,
}

impl Job {
    /// A lock is live until its lease expires; a lapsed lease means the
    /// owner is presumed dead and the job is reacquirable.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expiration_time) {
            (Some(_), Some(expiration)) => expiration > now,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.due_date.map_or(true, |due| due <= now)
    }

    pub fn is_acquirable_at(&self, now: DateTime<Utc>) -> bool {
        !self.suspended && self.is_due_at(now) && !self.is_locked_at(now)
    }

    /// Sort key for the acquisition scan: oldest-due first, jobs without a
    /// due date rank by creation time.
    pub fn due_sort_key(&self) -> DateTime<Utc> {
        self.due_date.unwrap_or(self.created)
    }

    /// The follow-up occurrence of a repeating timer job: fresh identity
    /// and retry budget, same handler and repeat expression.
    pub fn next_occurrence(&self, due: DateTime<Utc>, retries: i32) -> Job {
        Job {
            id: Uuid::new_v4(),
            revision: 1,
            kind: JobKind::Timer,
            handler_type: self.handler_type.clone(),
            handler_config: self.handler_config.clone(),
            due_date: Some(due),
            lock_owner: None,
            lock_expiration_time: None,
            retries,
            attempts: 0,
            exception_message: None,
            exception_stacktrace: None,
            correlation_id: self.correlation_id.clone(),
            repeat: self.repeat.clone(),
            suspended: false,
            created: Utc::now(),
        }
    }
}

/// Builder for jobs handed to `JobService::schedule`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub handler_type: String,
    pub handler_config: serde_json::Value,
    pub due_date: Option<DateTime<Utc>>,
    pub retries: Option<i32>,
    pub correlation_id: Option<String>,
    pub repeat: Option<String>,
}

impl NewJob {
    pub fn message(handler_type: impl Into<String>, handler_config: serde_json::Value) -> Self {
        Self {
            kind: JobKind::Message,
            handler_type: handler_type.into(),
            handler_config,
            due_date: None,
            retries: None,
            correlation_id: None,
            repeat: None,
        }
    }

    pub fn timer(
        handler_type: impl Into<String>,
        handler_config: serde_json::Value,
        due_date: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: JobKind::Timer,
            handler_type: handler_type.into(),
            handler_config,
            due_date: Some(due_date),
            retries: None,
            correlation_id: None,
            repeat: None,
        }
    }

    pub fn with_retries(mut self, retries: i32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_repeat(mut self, repeat: impl Into<String>) -> Self {
        self.repeat = Some(repeat.into());
        self
    }

    pub fn into_job(self, default_retries: i32) -> Job {
        Job {
            id: Uuid::new_v4(),
            revision: 1,
            kind: self.kind,
            handler_type: self.handler_type,
            handler_config: self.handler_config,
            due_date: self.due_date,
            lock_owner: None,
            lock_expiration_time: None,
            retries: self.retries.unwrap_or(default_retries).max(0),
            attempts: 0,
            exception_message: None,
            exception_stacktrace: None,
            correlation_id: self.correlation_id,
            repeat: self.repeat,
            suspended: false,
            created: Utc::now(),
        }
    }
}

/// A named cluster-wide mutual-exclusion row. At most one live
/// (non-expired) owner may exist per name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub name: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_job_kind_round_trip() {
        assert_eq!(JobKind::parse("timer"), Some(JobKind::Timer));
        assert_eq!(JobKind::parse("MESSAGE"), Some(JobKind::Message));
        assert_eq!(JobKind::parse("bogus"), None);
        assert_eq!(JobKind::Timer.as_str(), "timer");
    }

    #[test]
    fn test_lapsed_lease_makes_job_acquirable() {
        let now = Utc::now();
        let mut job = NewJob::message("noop", serde_json::json!({})).into_job(3);
        job.lock_owner = Some("node-a".to_string());
        job.lock_expiration_time = Some(now - Duration::seconds(1));
        assert!(job.is_acquirable_at(now));

        job.lock_expiration_time = Some(now + Duration::seconds(30));
        assert!(!job.is_acquirable_at(now));
    }

    #[test]
    fn test_suspended_job_is_not_acquirable() {
        let now = Utc::now();
        let mut job = NewJob::message("noop", serde_json::json!({})).into_job(3);
        assert!(job.is_acquirable_at(now));
        job.suspended = true;
        assert!(!job.is_acquirable_at(now));
    }

    #[test]
    fn test_timer_job_becomes_due() {
        let now = Utc::now();
        let job =
            NewJob::timer("noop", serde_json::json!({}), now + Duration::seconds(60)).into_job(3);
        assert!(!job.is_due_at(now));
        assert!(job.is_due_at(now + Duration::seconds(61)));
    }

    #[test]
    fn test_next_occurrence_resets_identity_and_diagnostics() {
        let now = Utc::now();
        let mut job = NewJob::timer("sweep", serde_json::json!({}), now)
            .with_repeat("0 0 * * * *")
            .into_job(3);
        job.exception_message = Some("boom".to_string());
        job.attempts = 2;

        let next = job.next_occurrence(now + Duration::hours(1), 3);
        assert_ne!(next.id, job.id);
        assert_eq!(next.revision, 1);
        assert_eq!(next.attempts, 0);
        assert!(next.exception_message.is_none());
        assert_eq!(next.repeat.as_deref(), Some("0 0 * * * *"));
    }
}
