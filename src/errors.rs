// Error handling framework

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Schedule-related errors.
///
/// Bad input never panics: every constructor on [`crate::Scheduler`] reports
/// it through this type and leaves the registry untouched.
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("unrecognized schedule input: {0}")]
    UnrecognizedInput(String),

    #[error("fire date {0} is already in the past")]
    FireDateInPast(DateTime<Utc>),

    #[error("schedule has no upcoming fire date")]
    NoUpcomingFireDate,

    #[error("recurrence rule has out-of-range fields")]
    InvalidRecurrenceRule,

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job '{0}' is anonymous and cannot be rescheduled by name")]
    AnonymousJobName(String),

    #[error("a job named '{0}' is already registered")]
    DuplicateJobName(String),

    #[error("scheduler is no longer running")]
    SchedulerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_cron_expression_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "* * * *".to_string(),
            reason: "invalid format".to_string(),
        };
        assert!(err.to_string().contains("invalid cron expression"));
        assert!(err.to_string().contains("* * * *"));
    }

    #[test]
    fn test_duplicate_job_name_display() {
        let err = ScheduleError::DuplicateJobName("nightly-report".to_string());
        assert!(err.to_string().contains("nightly-report"));
    }
}
