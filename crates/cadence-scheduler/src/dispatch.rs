use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use crate::{
    error::{EnqueueFailure, Result, SchedulerError},
    queue::TaskQueue,
    repository::{DispatchCommit, JobRepository, OccurrenceClaim},
    schedule,
    types::{ExecutionStatus, Job, JobExecution, ScheduleSpec},
};

/// Turns one due schedule occurrence into exactly one execution and one task.
///
/// The claim, the execution row and a provisional `next_run` advance are a
/// single transaction, so a crash or a failed enqueue never leaves the
/// occurrence due again. Bookkeeping for a successful run (`execution_count`,
/// `last_run`) is only written once the queue accepted the task.
pub struct Dispatcher<R, Q> {
    repo: Arc<R>,
    queue: Arc<Q>,
    enqueue_timeout: Duration,
}

impl<R: JobRepository, Q: TaskQueue> Dispatcher<R, Q> {
    pub fn new(repo: Arc<R>, queue: Arc<Q>, enqueue_timeout: Duration) -> Self {
        Self {
            repo,
            queue,
            enqueue_timeout,
        }
    }

    /// Dispatch the occurrence of `spec` at its stored `next_run`.
    ///
    /// Returns the execution as it stands afterwards: PENDING with a task id on
    /// success, FAILED when the job had no targets or the enqueue failed.
    /// [`SchedulerError::DispatchConflict`] means another poller got there
    /// first and nothing was written.
    #[instrument(skip_all, fields(job_id = job.id, schedule_id = spec.id))]
    pub async fn dispatch(
        &self,
        job: &Job,
        spec: &ScheduleSpec,
        now: DateTime<Utc>,
    ) -> Result<JobExecution> {
        let expected_next_run = spec.next_run.ok_or(SchedulerError::DispatchConflict {
            schedule_id: spec.id,
        })?;

        // The next occurrence after `now` with the run not counted. This is
        // where the schedule stays if the enqueue never succeeds.
        let provisional_next_run = match schedule::evaluate(spec, now) {
            Ok(next) => next,
            Err(e) => {
                self.repo.mark_schedule_error(spec.id, &e.to_string(), now)?;
                return Err(e.into());
            }
        };

        let execution = self.repo.claim_occurrence(&OccurrenceClaim {
            schedule_id: spec.id,
            expected_next_run,
            expected_count: spec.execution_count,
            provisional_next_run,
            now,
        })?;

        if execution.status == ExecutionStatus::Failed {
            warn!(
                execution_id = execution.id,
                job = %job.name,
                "job has no targets; execution recorded as failed"
            );
            return Ok(execution);
        }

        let enqueued = tokio::time::timeout(
            self.enqueue_timeout,
            self.queue.enqueue(execution.id, &execution.target_ids),
        )
        .await
        .unwrap_or_else(|_| {
            Err(EnqueueFailure::Timeout {
                ms: u64::try_from(self.enqueue_timeout.as_millis()).unwrap_or(u64::MAX),
            })
        });

        match enqueued {
            Ok(handle) => {
                let mut advanced = spec.clone();
                advanced.execution_count += 1;
                advanced.last_run = Some(now);
                let next_run = schedule::compute_next_run(&advanced, now);

                self.repo.commit_dispatch(&DispatchCommit {
                    schedule_id: spec.id,
                    execution_id: execution.id,
                    task_id: handle.id.clone(),
                    execution_count: advanced.execution_count,
                    last_run: now,
                    next_run,
                    now,
                })?;

                info!(
                    execution_id = execution.id,
                    execution_number = execution.execution_number,
                    task_id = %handle.id,
                    job = %job.name,
                    next_run = ?next_run,
                    "job dispatched"
                );
                Ok(JobExecution {
                    task_id: Some(handle.id),
                    ..execution
                })
            }
            Err(failure) => {
                let reason = failure.to_string();
                warn!(
                    execution_id = execution.id,
                    job = %job.name,
                    error = %reason,
                    "enqueue failed; execution marked failed"
                );
                // The occurrence is already claimed, so the outcome stands even
                // if the row cannot be updated; it then stays PENDING.
                if let Err(e) = self.repo.fail_execution(execution.id, &reason, now) {
                    error!(
                        execution_id = execution.id,
                        error = %e,
                        "could not record enqueue failure"
                    );
                }
                Ok(JobExecution {
                    status: ExecutionStatus::Failed,
                    completed_at: Some(execution.scheduled_at),
                    error_message: Some(reason),
                    ..execution
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ChannelTaskQueue, TaskHandle};
    use crate::repository::{SqliteJobRepository, NO_TARGETS_REASON};
    use crate::types::{RecurringType, ScheduleStatus};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    struct StuckQueue;

    #[async_trait]
    impl TaskQueue for StuckQueue {
        async fn enqueue(
            &self,
            _execution_id: i64,
            _target_ids: &[i64],
        ) -> std::result::Result<TaskHandle, EnqueueFailure> {
            std::future::pending().await
        }
    }

    /// Delegates to SQLite but cannot record failed executions.
    struct UnwritableFailures(SqliteJobRepository);

    impl JobRepository for UnwritableFailures {
        fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<(Job, ScheduleSpec)>> {
            self.0.get_due_schedules(now)
        }

        fn get_job_target_ids(&self, job_id: i64) -> Result<Vec<i64>> {
            self.0.get_job_target_ids(job_id)
        }

        fn get_unscheduled(&self) -> Result<Vec<ScheduleSpec>> {
            self.0.get_unscheduled()
        }

        fn initialize_next_run(
            &self,
            schedule_id: i64,
            next_run: Option<DateTime<Utc>>,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            self.0.initialize_next_run(schedule_id, next_run, now)
        }

        fn claim_occurrence(&self, claim: &OccurrenceClaim) -> Result<JobExecution> {
            self.0.claim_occurrence(claim)
        }

        fn commit_dispatch(&self, commit: &DispatchCommit) -> Result<()> {
            self.0.commit_dispatch(commit)
        }

        fn fail_execution(&self, _: i64, _: &str, _: DateTime<Utc>) -> Result<bool> {
            Err(SchedulerError::LockPoisoned)
        }

        fn mark_schedule_error(
            &self,
            schedule_id: i64,
            reason: &str,
            now: DateTime<Utc>,
        ) -> Result<()> {
            self.0.mark_schedule_error(schedule_id, reason, now)
        }

        fn fail_stale_executions(
            &self,
            cutoff: DateTime<Utc>,
            reason: &str,
            now: DateTime<Utc>,
        ) -> Result<usize> {
            self.0.fail_stale_executions(cutoff, reason, now)
        }

        fn fail_stale_target_runs(
            &self,
            cutoff: DateTime<Utc>,
            reason: &str,
            now: DateTime<Utc>,
        ) -> Result<usize> {
            self.0.fail_stale_target_runs(cutoff, reason, now)
        }
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("bad test timestamp")
            .with_timezone(&Utc)
    }

    fn setup(targets: &[i64]) -> (Arc<SqliteJobRepository>, Job, ScheduleSpec) {
        let repo = Arc::new(SqliteJobRepository::open_in_memory("UTC").expect("open"));
        let job = repo
            .create_job("report", &serde_json::json!([]), targets)
            .expect("job");
        let created = utc("2026-05-01T00:00:00Z");
        let spec = repo
            .create_schedule(
                &ScheduleSpec::recurring(job.id, RecurringType::Minutes, 10, created),
                created,
            )
            .expect("schedule");
        (repo, job, spec)
    }

    #[tokio::test]
    async fn successful_dispatch_advances_schedule() {
        let (repo, job, spec) = setup(&[5]);
        let (queue, mut rx) = ChannelTaskQueue::bounded(8);
        let dispatcher = Dispatcher::new(repo.clone(), Arc::new(queue), Duration::from_secs(1));
        let now = spec.next_run.expect("next_run");

        let execution = dispatcher.dispatch(&job, &spec, now).await.expect("dispatch");
        assert_eq!(execution.status, ExecutionStatus::Pending);
        let task = rx.recv().await.expect("task");
        assert_eq!(task.execution_id, execution.id);
        assert_eq!(Some(task.task_id), execution.task_id);

        let stored = repo.get_schedule(spec.id).expect("get").expect("exists");
        assert_eq!(stored.execution_count, 1);
        assert_eq!(stored.last_run, Some(now));
        assert_eq!(stored.next_run, Some(now + ChronoDuration::minutes(10)));
    }

    #[tokio::test]
    async fn enqueue_timeout_fails_execution_but_advances_schedule() {
        let (repo, job, spec) = setup(&[5]);
        let dispatcher =
            Dispatcher::new(repo.clone(), Arc::new(StuckQueue), Duration::from_millis(20));
        let now = spec.next_run.expect("next_run");

        let execution = dispatcher.dispatch(&job, &spec, now).await.expect("dispatch");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("timed out")));

        let stored = repo.get_schedule(spec.id).expect("get").expect("exists");
        assert_eq!(stored.execution_count, 0);
        assert_eq!(stored.last_run, None);
        assert_eq!(stored.status, ScheduleStatus::Active);
        assert!(stored.next_run.is_some_and(|next| next > now));

        let persisted = repo.get_execution(execution.id).expect("get").expect("exists");
        assert_eq!(persisted.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn unrecorded_enqueue_failure_still_reports_failed() {
        let (repo, job, spec) = setup(&[5]);
        let repo = Arc::try_unwrap(repo).ok().expect("sole owner");
        let dispatcher = Dispatcher::new(
            Arc::new(UnwritableFailures(repo)),
            Arc::new(StuckQueue),
            Duration::from_millis(20),
        );
        let now = spec.next_run.expect("next_run");

        let execution = dispatcher.dispatch(&job, &spec, now).await.expect("dispatch");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let stored = dispatcher.repo.0.get_schedule(spec.id).expect("get").expect("exists");
        assert!(stored.next_run.is_some_and(|next| next > now));
    }

    #[tokio::test]
    async fn job_without_targets_never_reaches_queue() {
        let (repo, job, spec) = setup(&[]);
        let (queue, mut rx) = ChannelTaskQueue::bounded(8);
        let dispatcher = Dispatcher::new(repo.clone(), Arc::new(queue), Duration::from_secs(1));
        let now = spec.next_run.expect("next_run");

        let execution = dispatcher.dispatch(&job, &spec, now).await.expect("dispatch");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_message.as_deref(), Some(NO_TARGETS_REASON));
        assert!(rx.try_recv().is_err());

        let stored = repo.get_schedule(spec.id).expect("get").expect("exists");
        assert_eq!(stored.execution_count, 0);
        assert!(stored.next_run.is_some_and(|next| next > now));
    }

    #[tokio::test]
    async fn stale_snapshot_is_a_conflict() {
        let (repo, job, spec) = setup(&[5]);
        let (queue, _rx) = ChannelTaskQueue::bounded(8);
        let dispatcher = Dispatcher::new(repo.clone(), Arc::new(queue), Duration::from_secs(1));
        let now = spec.next_run.expect("next_run");

        dispatcher.dispatch(&job, &spec, now).await.expect("first");
        let err = dispatcher.dispatch(&job, &spec, now).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DispatchConflict { .. }));
        assert_eq!(repo.list_executions(job.id).expect("list").len(), 1);
    }
}
