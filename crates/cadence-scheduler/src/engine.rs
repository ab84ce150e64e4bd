use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::SchedulerConfig;
use chrono::{DateTime, Utc};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    dispatch::Dispatcher,
    error::{Result, SchedulerError},
    queue::TaskQueue,
    repository::JobRepository,
    schedule,
    types::ExecutionStatus,
};

/// Outcome counts of one poll.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Schedules that got their first `next_run`.
    pub initialized: usize,
    /// Occurrences handed to the task queue.
    pub dispatched: usize,
    /// Occurrences recorded as failed executions (no targets, enqueue failure).
    pub failed: usize,
    /// Occurrences another poller claimed first.
    pub skipped: usize,
    /// Schedules disabled or left untouched because of an error.
    pub errors: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Polls for due schedules and dispatches them.
///
/// Safe to run in several processes against the same database: every
/// occurrence is claimed atomically, so a losing poller just skips it.
pub struct SchedulerEngine<R, Q> {
    repo: Arc<R>,
    dispatcher: Dispatcher<R, Q>,
    poll_interval: Duration,
}

impl<R: JobRepository, Q: TaskQueue> SchedulerEngine<R, Q> {
    pub fn new(
        repo: Arc<R>,
        queue: Arc<Q>,
        poll_interval: Duration,
        enqueue_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(repo.clone(), queue, enqueue_timeout),
            repo,
            poll_interval,
        }
    }

    pub fn from_config(repo: Arc<R>, queue: Arc<Q>, config: &SchedulerConfig) -> Self {
        Self::new(
            repo,
            queue,
            Duration::from_secs(config.poll_interval_secs),
            Duration::from_millis(config.enqueue_timeout_ms),
        )
    }

    /// Run one poll at `now`.
    ///
    /// Only fails if the due query itself fails; a problem with one schedule
    /// is logged and counted and the sweep moves on.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        self.initialize_schedules(now, &mut report)?;

        let due = self.repo.get_due_schedules(now)?;
        if !due.is_empty() {
            debug!(count = due.len(), "due schedules found");
        }

        for (job, spec) in due {
            match self.dispatcher.dispatch(&job, &spec, now).await {
                Ok(execution) if execution.status == ExecutionStatus::Failed => report.failed += 1,
                Ok(_) => report.dispatched += 1,
                Err(SchedulerError::DispatchConflict { .. })
                | Err(SchedulerError::ScheduleNotFound { .. }) => {
                    debug!(schedule_id = spec.id, "occurrence claimed elsewhere; skipping");
                    report.skipped += 1;
                }
                Err(SchedulerError::ScheduleExhausted { .. }) => {
                    info!(schedule_id = spec.id, "execution cap reached; schedule exhausted");
                    report.skipped += 1;
                }
                Err(SchedulerError::JobNotFound { id }) => {
                    warn!(schedule_id = spec.id, job_id = id, "job no longer exists");
                    if let Err(e) = self.repo.mark_schedule_error(spec.id, "job not found", now) {
                        error!(schedule_id = spec.id, error = %e, "failed to disable schedule");
                    }
                    report.errors += 1;
                }
                Err(SchedulerError::ScheduleConfig(e)) => {
                    // The dispatcher already moved the schedule to `error`.
                    warn!(schedule_id = spec.id, error = %e, "invalid schedule disabled");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(schedule_id = spec.id, error = %e, "dispatch failed");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Compute `next_run` for active schedules that were stored without one.
    fn initialize_schedules(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        for spec in self.repo.get_unscheduled()? {
            let outcome = match schedule::evaluate(&spec, now) {
                Ok(next) => self
                    .repo
                    .initialize_next_run(spec.id, next, now)
                    .map(|updated| {
                        if updated {
                            report.initialized += 1;
                        }
                    }),
                Err(e) => {
                    warn!(schedule_id = spec.id, error = %e, "invalid schedule disabled");
                    report.errors += 1;
                    self.repo.mark_schedule_error(spec.id, &e.to_string(), now)
                }
            };
            if let Err(e) = outcome {
                error!(schedule_id = spec.id, error = %e, "schedule initialisation failed");
                report.errors += 1;
            }
        }
        Ok(())
    }

    /// Main loop. Polls every `poll_interval` until `shutdown` broadcasts `true`.
    ///
    /// A sweep in progress always completes before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "scheduler engine started"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report.is_empty() => {}
                        Ok(report) => info!(
                            initialized = report.initialized,
                            dispatched = report.dispatched,
                            failed = report.failed,
                            skipped = report.skipped,
                            errors = report.errors,
                            "scheduler sweep finished"
                        ),
                        Err(e) => error!("scheduler tick error: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }
}
