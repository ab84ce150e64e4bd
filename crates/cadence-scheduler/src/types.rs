use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `Display` / `FromStr` over the snake_case names stored in SQLite.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($ty), ": {}"), other)),
                }
            }
        }
    };
}

/// Which family of rules decides the run times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Fire exactly once at `execute_at`.
    Once,
    /// Repeat on a minute/hour/day/week/month cadence.
    Recurring,
    /// Follow a 5-field cron expression.
    Cron,
}

text_enum!(ScheduleType {
    Once => "once",
    Recurring => "recurring",
    Cron => "cron",
});

/// Granularity of a `Recurring` schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurringType {
    Minutes,
    Hours,
    Daily,
    Weekly,
    Monthly,
}

text_enum!(RecurringType {
    Minutes => "minutes",
    Hours => "hours",
    Daily => "daily",
    Weekly => "weekly",
    Monthly => "monthly",
});

/// Why a schedule is or is not being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Evaluated by the poller.
    Active,
    /// `max_executions`, `end_date` or a single `Once` run used up.
    Exhausted,
    /// Turned off by an operator.
    Disabled,
    /// Turned off by the scheduler; `status_reason` says why.
    Error,
}

text_enum!(ScheduleStatus {
    Active => "active",
    Exhausted => "exhausted",
    Disabled => "disabled",
    Error => "error",
});

/// Persisted description of when a job should run.
///
/// Wall-clock fields (`time`, `days_of_week`, `day_of_month`) are local to
/// `timezone`; every instant is UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub id: i64,
    pub job_id: i64,
    pub schedule_type: ScheduleType,
    pub enabled: bool,
    pub status: ScheduleStatus,
    pub status_reason: Option<String>,
    /// IANA zone name, e.g. `America/New_York`.
    pub timezone: String,
    pub execute_at: Option<DateTime<Utc>>,
    pub recurring_type: Option<RecurringType>,
    /// Units of `recurring_type` between runs. `None` means 1.
    pub interval: Option<i64>,
    /// Local time of day, `HH:MM`.
    pub time: Option<String>,
    /// 0 = Monday … 6 = Sunday.
    #[serde(default)]
    pub days_of_week: Vec<u8>,
    pub day_of_month: Option<u32>,
    pub cron_expression: Option<String>,
    pub max_executions: Option<u32>,
    pub execution_count: u32,
    pub end_date: Option<DateTime<Utc>>,
    /// Cached result of the next-run calculation; `None` once exhausted.
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleSpec {
    fn blank(job_id: i64, schedule_type: ScheduleType, created_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            job_id,
            schedule_type,
            enabled: true,
            status: ScheduleStatus::Active,
            status_reason: None,
            timezone: String::new(),
            execute_at: None,
            recurring_type: None,
            interval: None,
            time: None,
            days_of_week: Vec::new(),
            day_of_month: None,
            cron_expression: None,
            max_executions: None,
            execution_count: 0,
            end_date: None,
            next_run: None,
            last_run: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// A schedule that fires once at `at`.
    pub fn once(job_id: i64, at: DateTime<Utc>, created_at: DateTime<Utc>) -> Self {
        Self {
            execute_at: Some(at),
            ..Self::blank(job_id, ScheduleType::Once, created_at)
        }
    }

    /// A recurring schedule; add `time` / days with the `with_*` helpers.
    pub fn recurring(
        job_id: i64,
        recurring_type: RecurringType,
        interval: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            recurring_type: Some(recurring_type),
            interval: Some(interval),
            ..Self::blank(job_id, ScheduleType::Recurring, created_at)
        }
    }

    pub fn cron(job_id: i64, expression: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            cron_expression: Some(expression.to_string()),
            ..Self::blank(job_id, ScheduleType::Cron, created_at)
        }
    }

    pub fn with_timezone(mut self, timezone: &str) -> Self {
        self.timezone = timezone.to_string();
        self
    }

    pub fn with_time(mut self, time: &str) -> Self {
        self.time = Some(time.to_string());
        self
    }

    pub fn with_days_of_week(mut self, days: &[u8]) -> Self {
        self.days_of_week = days.to_vec();
        self
    }

    pub fn with_day_of_month(mut self, day: u32) -> Self {
        self.day_of_month = Some(day);
        self
    }

    pub fn with_max_executions(mut self, max: u32) -> Self {
        self.max_executions = Some(max);
        self
    }

    pub fn with_end_date(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }

    /// Whether the poller should look at this schedule at all.
    pub fn is_live(&self) -> bool {
        self.enabled && self.status == ScheduleStatus::Active
    }
}

/// Lifecycle state of a job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created and handed to the task queue, not yet picked up.
    Pending,
    /// A worker is executing it.
    Running,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(ExecutionStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// One dispatched occurrence of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: i64,
    pub job_id: i64,
    /// Schedule that produced the execution; `None` for manual runs or
    /// after the schedule was deleted.
    pub schedule_id: Option<i64>,
    /// Monotonic per job, starting at 1.
    pub execution_number: i64,
    pub status: ExecutionStatus,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Targets resolved at dispatch time.
    pub target_ids: Vec<i64>,
    /// Handle id returned by the task queue.
    pub task_id: Option<String>,
    pub error_message: Option<String>,
}

/// Progress of one target inside an execution, written by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRun {
    pub id: i64,
    pub execution_id: i64,
    pub target_id: i64,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// The part of a job definition the scheduler needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    /// Opaque action list forwarded untouched to workers.
    pub actions: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_roundtrip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            let parsed: ExecutionStatus = status.to_string().parse().expect("parse failed");
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "paused".parse::<ScheduleStatus>().unwrap_err();
        assert!(err.contains("paused"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }
}
