// Repeat-expression evaluation for recurring timer jobs. The engine only
// ever asks "when is the next occurrence after this instant"; expression
// syntax is the resolver's business.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{EngineError, EngineResult};

pub trait DueDateResolver: Send + Sync {
    /// Next due date strictly after `after`, or `None` when the
    /// expression has no further occurrences.
    fn next_after(&self, expr: &str, after: DateTime<Utc>)
        -> EngineResult<Option<DateTime<Utc>>>;
}

/// Cron-expression resolver (seconds-resolution, 6/7-field syntax).
#[derive(Debug, Default, Clone, Copy)]
pub struct CronResolver;

impl DueDateResolver for CronResolver {
    fn next_after(
        &self,
        expr: &str,
        after: DateTime<Utc>,
    ) -> EngineResult<Option<DateTime<Utc>>> {
        let schedule = cron::Schedule::from_str(expr).map_err(|err| {
            EngineError::RepeatExpression {
                expr: expr.to_string(),
                message: err.to_string(),
            }
        })?;
        Ok(schedule.after(&after).next())
    }
}
