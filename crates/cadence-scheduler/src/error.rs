use thiserror::Error;

/// A schedule definition that cannot produce run times.
///
/// Never retried automatically: the owning schedule is moved to the `error`
/// status with this message as its reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleConfigError {
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("{field} is required for {kind} schedules")]
    MissingField { field: &'static str, kind: String },

    #[error("interval must be at least 1, got {0}")]
    InvalidInterval(i64),

    #[error("invalid time of day '{0}', expected HH:MM")]
    InvalidTime(String),

    #[error("day of week {0} is out of range 0-6")]
    InvalidDayOfWeek(u8),

    #[error("day of month {0} is out of range 1-31")]
    InvalidDayOfMonth(u32),

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
}

/// The task system refused or did not answer an enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueFailure {
    #[error("task queue unavailable: {0}")]
    Unavailable(String),

    #[error("enqueue timed out after {ms}ms")]
    Timeout { ms: u64 },
}

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The schedule definition is invalid; see [`ScheduleConfigError`].
    #[error("Invalid schedule: {0}")]
    ScheduleConfig(#[from] ScheduleConfigError),

    /// Another poller already claimed this occurrence. Benign.
    #[error("Schedule {schedule_id} already claimed")]
    DispatchConflict { schedule_id: i64 },

    /// The schedule already ran `max_executions` times; it is now exhausted.
    #[error("Schedule {schedule_id} reached its execution cap")]
    ScheduleExhausted { schedule_id: i64 },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: i64 },

    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: i64 },

    /// Requested status change is not a legal transition.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A thread panicked while holding the connection mutex.
    #[error("Database connection lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
