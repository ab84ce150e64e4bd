//! `cadence-scheduler`: job scheduling core with SQLite persistence.
//!
//! # Overview
//!
//! Schedules live in the `job_schedules` table with a cached `next_run`.
//! The [`engine::SchedulerEngine`] polls for schedules whose `next_run` has
//! arrived and hands each occurrence to the [`dispatch::Dispatcher`], which
//! claims it atomically, records a [`types::JobExecution`] and enqueues a task
//! on a [`queue::TaskQueue`]. The [`reconcile::Reconciler`] fails executions
//! whose worker stopped reporting.
//!
//! # Schedule types
//!
//! | Type                  | Behaviour                                            |
//! |-----------------------|------------------------------------------------------|
//! | `once`                | Single fire at `execute_at`                          |
//! | `recurring` minutes   | Every N minutes from the previous run                |
//! | `recurring` hours     | Every N hours from the previous run                  |
//! | `recurring` daily     | `time` local, every N days                           |
//! | `recurring` weekly    | `time` local on `days_of_week`, every N weeks        |
//! | `recurring` monthly   | `time` local on `day_of_month` (clamped), every N months |
//! | `cron`                | 5-field cron expression evaluated in `timezone`      |

pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod queue;
pub mod reconcile;
pub mod repository;
pub mod schedule;
pub mod types;

pub use dispatch::Dispatcher;
pub use engine::{SchedulerEngine, SweepReport};
pub use error::{EnqueueFailure, Result, ScheduleConfigError, SchedulerError};
pub use queue::{ChannelTaskQueue, QueuedTask, TaskHandle, TaskQueue};
pub use reconcile::{ReconcileReport, Reconciler};
pub use repository::{JobRepository, SqliteJobRepository};
pub use schedule::{compute_next_run, evaluate};
pub use types::{
    ExecutionStatus, Job, JobExecution, RecurringType, ScheduleSpec, ScheduleStatus, ScheduleType,
    TargetRun,
};
