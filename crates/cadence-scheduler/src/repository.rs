use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    schedule,
    types::{ExecutionStatus, Job, JobExecution, ScheduleSpec, ScheduleStatus, TargetRun},
};

/// `error_message` of executions failed by the staleness sweep.
pub const STALE_REASON: &str = "execution timed out";
/// `error_message` of executions dispatched for a job without targets.
pub const NO_TARGETS_REASON: &str = "no targets";
/// `status_reason` when an operator turns a schedule off.
pub const OPERATOR_DISABLED_REASON: &str = "disabled by operator";

/// Compare-and-swap request for one due occurrence.
#[derive(Debug, Clone)]
pub struct OccurrenceClaim {
    pub schedule_id: i64,
    /// `next_run` the caller saw; the claim fails if the row moved on.
    pub expected_next_run: DateTime<Utc>,
    pub expected_count: u32,
    /// Where `next_run` goes if the enqueue never succeeds.
    pub provisional_next_run: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Schedule bookkeeping after a successful enqueue.
#[derive(Debug, Clone)]
pub struct DispatchCommit {
    pub schedule_id: i64,
    pub execution_id: i64,
    pub task_id: String,
    pub execution_count: u32,
    pub last_run: DateTime<Utc>,
    pub next_run: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Store operations the poller, dispatcher and reconciler depend on.
pub trait JobRepository: Send + Sync {
    /// Enabled schedules of enabled jobs whose `next_run <= now`, oldest first.
    fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<(Job, ScheduleSpec)>>;

    fn get_job_target_ids(&self, job_id: i64) -> Result<Vec<i64>>;

    /// Active schedules that never had a `next_run` computed.
    fn get_unscheduled(&self) -> Result<Vec<ScheduleSpec>>;

    /// Set the first `next_run` of an unscheduled schedule; `None` exhausts it.
    fn initialize_next_run(
        &self,
        schedule_id: i64,
        next_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Atomically claim a due occurrence and create its execution.
    ///
    /// Fails with [`SchedulerError::DispatchConflict`] when the schedule no
    /// longer matches the claim, and with [`SchedulerError::ScheduleExhausted`]
    /// (after marking it so) when `max_executions` is already reached.
    fn claim_occurrence(&self, claim: &OccurrenceClaim) -> Result<JobExecution>;

    fn commit_dispatch(&self, commit: &DispatchCommit) -> Result<()>;

    /// PENDING/RUNNING → FAILED. Returns false if the execution had already ended.
    fn fail_execution(&self, execution_id: i64, reason: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Disable a schedule that cannot run, keeping `reason` for operators.
    fn mark_schedule_error(&self, schedule_id: i64, reason: &str, now: DateTime<Utc>)
        -> Result<()>;

    /// RUNNING executions started before `cutoff` → FAILED.
    fn fail_stale_executions(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// RUNNING target runs started before `cutoff` → FAILED.
    fn fail_stale_target_runs(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize>;
}

const SCHEDULE_COLUMNS: &str = "s.id, s.job_id, s.schedule_type, s.enabled, s.status, s.status_reason,
     s.timezone, s.execute_at, s.recurring_type, s.interval_value, s.time_of_day,
     s.days_of_week, s.day_of_month, s.cron_expression, s.max_executions,
     s.execution_count, s.end_date, s.next_run, s.last_run, s.created_at, s.updated_at";
const SCHEDULE_COLUMN_COUNT: usize = 21;

const JOB_COLUMNS: &str = "j.id, j.name, j.enabled, j.actions, j.created_at, j.updated_at";

const EXECUTION_COLUMNS: &str = "id, job_id, schedule_id, execution_number, status, scheduled_at,
     started_at, completed_at, target_ids, task_id, error_message";

const TARGET_RUN_COLUMNS: &str =
    "id, execution_id, target_id, status, started_at, completed_at, error_message";

/// SQLite-backed repository.
///
/// Wraps one connection in a `Mutex`; run one instance per loop so the poller
/// and the reconciler never queue behind each other. Several instances (or
/// processes) may share a database file: claims use `BEGIN IMMEDIATE`, and the
/// busy timeout makes a second claimant wait instead of erroring.
pub struct SqliteJobRepository {
    conn: Mutex<Connection>,
    default_timezone: String,
}

impl SqliteJobRepository {
    /// Wrap an open connection, enabling foreign keys and running migrations.
    pub fn new(conn: Connection, default_timezone: &str) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            default_timezone: default_timezone.to_string(),
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(
        path: &str,
        busy_timeout: std::time::Duration,
        default_timezone: &str,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn, default_timezone)
    }

    pub fn open_in_memory(default_timezone: &str) -> Result<Self> {
        Self::new(Connection::open_in_memory()?, default_timezone)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::LockPoisoned)
    }

    // --- jobs --------------------------------------------------------------

    /// Insert a job and its target associations.
    #[instrument(skip(self, actions))]
    pub fn create_job(
        &self,
        name: &str,
        actions: &serde_json::Value,
        target_ids: &[i64],
    ) -> Result<Job> {
        let now = Utc::now().trunc_subsecs(6);
        let now_str = ts(now);
        let actions_json = serde_json::to_string(actions)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO jobs (name, enabled, actions, created_at, updated_at)
             VALUES (?1, 1, ?2, ?3, ?3)",
            params![name, actions_json, now_str],
        )?;
        let id = tx.last_insert_rowid();
        replace_targets(&tx, id, target_ids)?;
        tx.commit()?;

        info!(job_id = id, %name, targets = target_ids.len(), "job created");
        Ok(Job {
            id,
            name: name.to_string(),
            enabled: true,
            actions: actions.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs j WHERE j.id = ?1"),
                [job_id],
                |row| row_to_job(row, 0),
            )
            .optional()?;
        Ok(job)
    }

    /// Replace the job's target associations. Later dispatches snapshot the new set.
    #[instrument(skip(self))]
    pub fn set_job_targets(&self, job_id: i64, target_ids: &[i64]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !job_exists(&tx, job_id)? {
            return Err(SchedulerError::JobNotFound { id: job_id });
        }
        replace_targets(&tx, job_id, target_ids)?;
        tx.execute(
            "UPDATE jobs SET updated_at = ?1 WHERE id = ?2",
            params![ts(Utc::now()), job_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Disabled jobs keep their schedules but are never returned as due.
    pub fn set_job_enabled(&self, job_id: i64, enabled: bool) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE jobs SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled, ts(Utc::now()), job_id],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: job_id });
        }
        info!(job_id, enabled, "job enabled state changed");
        Ok(())
    }

    /// Delete a job together with its schedules, executions and targets.
    pub fn delete_job(&self, job_id: i64) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [job_id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: job_id });
        }
        info!(job_id, "job deleted");
        Ok(())
    }

    // --- schedules ---------------------------------------------------------

    /// Validate and insert a schedule, computing its first `next_run`.
    ///
    /// Caller-supplied `id`, counters and cached run times are ignored. An
    /// empty timezone becomes the configured default.
    #[instrument(skip(self, spec), fields(job_id = spec.job_id, schedule_type = %spec.schedule_type))]
    pub fn create_schedule(&self, spec: &ScheduleSpec, now: DateTime<Utc>) -> Result<ScheduleSpec> {
        let mut spec = spec.clone();
        if spec.timezone.trim().is_empty() {
            spec.timezone = self.default_timezone.clone();
        }
        schedule::validate(&spec)?;

        spec.execution_count = 0;
        spec.last_run = None;
        spec.status_reason = None;
        spec.status = if spec.enabled {
            ScheduleStatus::Active
        } else {
            ScheduleStatus::Disabled
        };
        spec.next_run = schedule::evaluate(&spec, now)?;
        if spec.enabled && spec.next_run.is_none() {
            spec.status = ScheduleStatus::Exhausted;
        }

        let id = {
            let conn = self.lock()?;
            if !job_exists(&conn, spec.job_id)? {
                return Err(SchedulerError::JobNotFound { id: spec.job_id });
            }
            conn.execute(
                "INSERT INTO job_schedules
                 (job_id, schedule_type, enabled, status, status_reason, timezone, execute_at,
                  recurring_type, interval_value, time_of_day, days_of_week, day_of_month,
                  cron_expression, max_executions, execution_count, end_date, next_run,
                  last_run, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, ?14,
                         ?15, NULL, ?16, ?17)",
                params![
                    spec.job_id,
                    spec.schedule_type.as_str(),
                    spec.enabled,
                    spec.status.as_str(),
                    spec.timezone,
                    opt_ts(spec.execute_at),
                    spec.recurring_type.map(|r| r.as_str()),
                    spec.interval,
                    spec.time,
                    serde_json::to_string(&spec.days_of_week)?,
                    spec.day_of_month,
                    spec.cron_expression,
                    spec.max_executions,
                    opt_ts(spec.end_date),
                    opt_ts(spec.next_run),
                    ts(spec.created_at),
                    ts(now),
                ],
            )?;
            conn.last_insert_rowid()
        };

        info!(schedule_id = id, next_run = ?spec.next_run, "schedule created");
        self.get_schedule(id)?
            .ok_or(SchedulerError::ScheduleNotFound { id })
    }

    pub fn get_schedule(&self, schedule_id: i64) -> Result<Option<ScheduleSpec>> {
        let conn = self.lock()?;
        select_schedule(&conn, schedule_id)
    }

    /// Turn a schedule on or off.
    ///
    /// Re-enabling clears any error and recomputes `next_run` from `now`; a
    /// schedule that still cannot run goes straight back to `error`.
    #[instrument(skip(self))]
    pub fn set_schedule_enabled(
        &self,
        schedule_id: i64,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<ScheduleSpec> {
        let mut conn = self.lock()?;
        // Read and write under one write lock so a concurrent dispatch commit
        // cannot land between them.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut spec = select_schedule(&tx, schedule_id)?
            .ok_or(SchedulerError::ScheduleNotFound { id: schedule_id })?;
        let seen_status = spec.status;
        let seen_count = spec.execution_count;

        if enabled {
            spec.enabled = true;
            spec.status = ScheduleStatus::Active;
            spec.status_reason = None;
            match schedule::evaluate(&spec, now) {
                Ok(Some(next)) => spec.next_run = Some(next),
                Ok(None) => {
                    spec.next_run = None;
                    spec.status = ScheduleStatus::Exhausted;
                }
                Err(e) => {
                    spec.enabled = false;
                    spec.next_run = None;
                    spec.status = ScheduleStatus::Error;
                    spec.status_reason = Some(e.to_string());
                }
            }
        } else {
            spec.enabled = false;
            spec.next_run = None;
            spec.status = ScheduleStatus::Disabled;
            spec.status_reason = Some(OPERATOR_DISABLED_REASON.to_string());
        }
        spec.updated_at = now.trunc_subsecs(6);

        let n = tx.execute(
            "UPDATE job_schedules
             SET enabled = ?1, status = ?2, status_reason = ?3, next_run = ?4, updated_at = ?5
             WHERE id = ?6 AND status = ?7 AND execution_count = ?8",
            params![
                spec.enabled,
                spec.status.as_str(),
                spec.status_reason,
                opt_ts(spec.next_run),
                ts(now),
                schedule_id,
                seen_status.as_str(),
                seen_count,
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::DispatchConflict { schedule_id });
        }
        tx.commit()?;
        info!(schedule_id, status = %spec.status, "schedule state changed");
        Ok(spec)
    }

    pub fn delete_schedule(&self, schedule_id: i64) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM job_schedules WHERE id = ?1", [schedule_id])?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: schedule_id });
        }
        info!(schedule_id, "schedule deleted");
        Ok(())
    }

    // --- executions --------------------------------------------------------

    pub fn get_execution(&self, execution_id: i64) -> Result<Option<JobExecution>> {
        let conn = self.lock()?;
        let execution = conn
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE id = ?1"),
                [execution_id],
                row_to_execution,
            )
            .optional()?;
        Ok(execution)
    }

    /// All executions of a job in `execution_number` order.
    pub fn list_executions(&self, job_id: i64) -> Result<Vec<JobExecution>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions
             WHERE job_id = ?1 ORDER BY execution_number"
        ))?;
        let rows = stmt.query_map([job_id], row_to_execution)?;
        let executions = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(executions)
    }

    /// PENDING → RUNNING, called by the worker when it picks the task up.
    #[instrument(skip(self))]
    pub fn mark_execution_running(&self, execution_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE job_executions SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![ts(now), execution_id],
        )?;
        Ok(n > 0)
    }

    /// RUNNING → terminal status, called by the worker.
    ///
    /// Returns false when the execution is no longer RUNNING, e.g. because the
    /// staleness sweep already failed it.
    #[instrument(skip(self, error_message))]
    pub fn finish_execution(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(SchedulerError::InvalidTransition(format!(
                "cannot finish execution {execution_id} as {status}"
            )));
        }
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE job_executions SET status = ?1, completed_at = ?2, error_message = ?3
             WHERE id = ?4 AND status = 'running'",
            params![status.as_str(), ts(now), error_message, execution_id],
        )?;
        if n == 0 {
            debug!(execution_id, "finish ignored; execution not running");
        }
        Ok(n > 0)
    }

    /// PENDING/RUNNING → CANCELLED.
    pub fn cancel_execution(&self, execution_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE job_executions SET status = 'cancelled', completed_at = ?1
             WHERE id = ?2 AND status IN ('pending', 'running')",
            params![ts(now), execution_id],
        )?;
        Ok(n > 0)
    }

    /// Record that the worker started on one target of a RUNNING execution.
    pub fn start_target_run(
        &self,
        execution_id: i64,
        target_id: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.lock()?;
        let n = conn.execute(
            "INSERT INTO target_runs (execution_id, target_id, status, started_at)
             SELECT id, ?2, 'running', ?3 FROM job_executions
             WHERE id = ?1 AND status = 'running'",
            params![execution_id, target_id, ts(now)],
        )?;
        if n == 0 {
            return Err(SchedulerError::InvalidTransition(format!(
                "execution {execution_id} is not running"
            )));
        }
        Ok(conn.last_insert_rowid())
    }

    /// RUNNING → terminal status for one target run.
    pub fn finish_target_run(
        &self,
        run_id: i64,
        status: ExecutionStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(SchedulerError::InvalidTransition(format!(
                "cannot finish target run {run_id} as {status}"
            )));
        }
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE target_runs SET status = ?1, completed_at = ?2, error_message = ?3
             WHERE id = ?4 AND status = 'running'",
            params![status.as_str(), ts(now), error_message, run_id],
        )?;
        Ok(n > 0)
    }

    pub fn list_target_runs(&self, execution_id: i64) -> Result<Vec<TargetRun>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TARGET_RUN_COLUMNS} FROM target_runs WHERE execution_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([execution_id], row_to_target_run)?;
        let runs = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}

impl JobRepository for SqliteJobRepository {
    fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<(Job, ScheduleSpec)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SCHEDULE_COLUMNS}, {JOB_COLUMNS}
             FROM job_schedules s JOIN jobs j ON j.id = s.job_id
             WHERE s.enabled = 1 AND s.status = 'active' AND j.enabled = 1
               AND s.next_run IS NOT NULL AND s.next_run <= ?1
             ORDER BY s.next_run"
        ))?;
        let rows = stmt.query_map([ts(now)], |row| {
            Ok((row_to_job(row, SCHEDULE_COLUMN_COUNT)?, row_to_schedule(row)?))
        })?;

        let mut due = Vec::new();
        for row in rows {
            match row {
                Ok(pair) => due.push(pair),
                Err(e) => warn!(error = %e, "skipping unreadable schedule row"),
            }
        }
        Ok(due)
    }

    fn get_job_target_ids(&self, job_id: i64) -> Result<Vec<i64>> {
        let conn = self.lock()?;
        select_target_ids(&conn, job_id)
    }

    fn get_unscheduled(&self) -> Result<Vec<ScheduleSpec>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM job_schedules s
             WHERE s.enabled = 1 AND s.status = 'active' AND s.next_run IS NULL"
        ))?;
        let rows = stmt.query_map([], row_to_schedule)?;

        let mut specs = Vec::new();
        for row in rows {
            match row {
                Ok(spec) => specs.push(spec),
                Err(e) => warn!(error = %e, "skipping unreadable schedule row"),
            }
        }
        Ok(specs)
    }

    fn initialize_next_run(
        &self,
        schedule_id: i64,
        next_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE job_schedules
             SET next_run = ?1,
                 status = CASE WHEN ?1 IS NULL THEN 'exhausted' ELSE status END,
                 updated_at = ?2
             WHERE id = ?3 AND status = 'active' AND next_run IS NULL",
            params![opt_ts(next_run), ts(now), schedule_id],
        )?;
        Ok(n > 0)
    }

    #[instrument(skip_all, fields(schedule_id = claim.schedule_id))]
    fn claim_occurrence(&self, claim: &OccurrenceClaim) -> Result<JobExecution> {
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front, so two claimants serialise
        // here and the second one sees the first one's advance.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                "SELECT job_id, enabled, status, next_run, execution_count, max_executions
                 FROM job_schedules WHERE id = ?1",
                [claim.schedule_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,            // job_id
                        row.get::<_, bool>(1)?,           // enabled
                        row.get::<_, String>(2)?,         // status
                        row.get::<_, Option<String>>(3)?, // next_run
                        row.get::<_, u32>(4)?,            // execution_count
                        row.get::<_, Option<u32>>(5)?,    // max_executions
                    ))
                },
            )
            .optional()?;
        let Some((job_id, enabled, status, next_run, count, max)) = current else {
            return Err(SchedulerError::ScheduleNotFound {
                id: claim.schedule_id,
            });
        };

        let expected = ts(claim.expected_next_run);
        if !enabled
            || status != ScheduleStatus::Active.as_str()
            || next_run.as_deref() != Some(expected.as_str())
            || count != claim.expected_count
        {
            return Err(SchedulerError::DispatchConflict {
                schedule_id: claim.schedule_id,
            });
        }
        if max.is_some_and(|max| count >= max) {
            tx.execute(
                "UPDATE job_schedules
                 SET status = 'exhausted', next_run = NULL, updated_at = ?1
                 WHERE id = ?2",
                params![ts(claim.now), claim.schedule_id],
            )?;
            tx.commit()?;
            warn!(count, "execution cap already reached; schedule exhausted");
            return Err(SchedulerError::ScheduleExhausted {
                schedule_id: claim.schedule_id,
            });
        }
        if !job_exists(&tx, job_id)? {
            return Err(SchedulerError::JobNotFound { id: job_id });
        }

        let target_ids = select_target_ids(&tx, job_id)?;
        let execution_number: i64 = tx.query_row(
            "SELECT COALESCE(MAX(execution_number), 0) + 1 FROM job_executions WHERE job_id = ?1",
            [job_id],
            |row| row.get(0),
        )?;

        let now = claim.now.trunc_subsecs(6);
        let (state, error_message, completed_at) = if target_ids.is_empty() {
            (
                ExecutionStatus::Failed,
                Some(NO_TARGETS_REASON.to_string()),
                Some(now),
            )
        } else {
            (ExecutionStatus::Pending, None, None)
        };

        tx.execute(
            "INSERT INTO job_executions
             (job_id, schedule_id, execution_number, status, scheduled_at, completed_at,
              target_ids, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job_id,
                claim.schedule_id,
                execution_number,
                state.as_str(),
                ts(now),
                opt_ts(completed_at),
                serde_json::to_string(&target_ids)?,
                error_message,
            ],
        )?;
        let execution_id = tx.last_insert_rowid();

        // Move next_run off the claimed value; this is what makes the claim stick.
        tx.execute(
            "UPDATE job_schedules
             SET next_run = ?1,
                 status = CASE WHEN ?1 IS NULL THEN 'exhausted' ELSE status END,
                 updated_at = ?2
             WHERE id = ?3",
            params![opt_ts(claim.provisional_next_run), ts(now), claim.schedule_id],
        )?;
        tx.commit()?;

        debug!(execution_id, execution_number, "occurrence claimed");
        Ok(JobExecution {
            id: execution_id,
            job_id,
            schedule_id: Some(claim.schedule_id),
            execution_number,
            status: state,
            scheduled_at: now,
            started_at: None,
            completed_at,
            target_ids,
            task_id: None,
            error_message,
        })
    }

    #[instrument(skip_all, fields(schedule_id = commit.schedule_id, execution_id = commit.execution_id))]
    fn commit_dispatch(&self, commit: &DispatchCommit) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE job_executions SET task_id = ?1 WHERE id = ?2",
            params![commit.task_id, commit.execution_id],
        )?;
        // An operator may have disabled the schedule since the claim; keep that.
        tx.execute(
            "UPDATE job_schedules
             SET execution_count = ?1,
                 last_run = ?2,
                 next_run = CASE WHEN status IN ('active', 'exhausted') THEN ?3 ELSE NULL END,
                 status = CASE
                     WHEN status NOT IN ('active', 'exhausted') THEN status
                     WHEN ?3 IS NULL THEN 'exhausted'
                     ELSE 'active'
                 END,
                 updated_at = ?4
             WHERE id = ?5",
            params![
                commit.execution_count,
                ts(commit.last_run),
                opt_ts(commit.next_run),
                ts(commit.now),
                commit.schedule_id,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn fail_execution(&self, execution_id: i64, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE job_executions SET status = 'failed', error_message = ?1, completed_at = ?2
             WHERE id = ?3 AND status IN ('pending', 'running')",
            params![reason, ts(now), execution_id],
        )?;
        Ok(n > 0)
    }

    fn mark_schedule_error(
        &self,
        schedule_id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE job_schedules
             SET enabled = 0, status = 'error', status_reason = ?1, next_run = NULL, updated_at = ?2
             WHERE id = ?3",
            params![reason, ts(now), schedule_id],
        )?;
        warn!(schedule_id, %reason, "schedule disabled");
        Ok(())
    }

    fn fail_stale_executions(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE job_executions SET status = 'failed', error_message = ?1, completed_at = ?2
             WHERE status = 'running' AND started_at IS NOT NULL AND started_at < ?3",
            params![reason, ts(now), ts(cutoff)],
        )?;
        Ok(n)
    }

    fn fail_stale_target_runs(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE target_runs SET status = 'failed', error_message = ?1, completed_at = ?2
             WHERE status = 'running' AND started_at IS NOT NULL AND started_at < ?3",
            params![reason, ts(now), ts(cutoff)],
        )?;
        Ok(n)
    }
}

// --- row helpers -----------------------------------------------------------

/// Fixed-width RFC 3339 (microseconds, `Z`), so stored values sort as text.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_ts(idx, &raw))
        .transpose()
}

fn get_enum<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| conversion_error(idx, e))
}

fn get_opt_enum<T: FromStr<Err = String>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| raw.parse().map_err(|e: String| conversion_error(idx, e)))
        .transpose()
}

fn get_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<ScheduleSpec> {
    Ok(ScheduleSpec {
        id: row.get(0)?,
        job_id: row.get(1)?,
        schedule_type: get_enum(row, 2)?,
        enabled: row.get(3)?,
        status: get_enum(row, 4)?,
        status_reason: row.get(5)?,
        timezone: row.get(6)?,
        execute_at: get_opt_ts(row, 7)?,
        recurring_type: get_opt_enum(row, 8)?,
        interval: row.get(9)?,
        time: row.get(10)?,
        days_of_week: get_json(row, 11)?,
        day_of_month: row.get(12)?,
        cron_expression: row.get(13)?,
        max_executions: row.get(14)?,
        execution_count: row.get(15)?,
        end_date: get_opt_ts(row, 16)?,
        next_run: get_opt_ts(row, 17)?,
        last_run: get_opt_ts(row, 18)?,
        created_at: get_ts(row, 19)?,
        updated_at: get_ts(row, 20)?,
    })
}

/// Map the six job columns starting at `base`.
fn row_to_job(row: &Row<'_>, base: usize) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(base)?,
        name: row.get(base + 1)?,
        enabled: row.get(base + 2)?,
        actions: get_json(row, base + 3)?,
        created_at: get_ts(row, base + 4)?,
        updated_at: get_ts(row, base + 5)?,
    })
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<JobExecution> {
    Ok(JobExecution {
        id: row.get(0)?,
        job_id: row.get(1)?,
        schedule_id: row.get(2)?,
        execution_number: row.get(3)?,
        status: get_enum(row, 4)?,
        scheduled_at: get_ts(row, 5)?,
        started_at: get_opt_ts(row, 6)?,
        completed_at: get_opt_ts(row, 7)?,
        target_ids: get_json(row, 8)?,
        task_id: row.get(9)?,
        error_message: row.get(10)?,
    })
}

fn row_to_target_run(row: &Row<'_>) -> rusqlite::Result<TargetRun> {
    Ok(TargetRun {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        target_id: row.get(2)?,
        status: get_enum(row, 3)?,
        started_at: get_opt_ts(row, 4)?,
        completed_at: get_opt_ts(row, 5)?,
        error_message: row.get(6)?,
    })
}

fn select_schedule(conn: &Connection, schedule_id: i64) -> Result<Option<ScheduleSpec>> {
    let spec = conn
        .query_row(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM job_schedules s WHERE s.id = ?1"),
            [schedule_id],
            row_to_schedule,
        )
        .optional()?;
    Ok(spec)
}

fn job_exists(conn: &Connection, job_id: i64) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM jobs WHERE id = ?1)",
        [job_id],
        |row| row.get(0),
    )
}

fn select_target_ids(conn: &Connection, job_id: i64) -> Result<Vec<i64>> {
    let mut stmt =
        conn.prepare_cached("SELECT target_id FROM job_targets WHERE job_id = ?1 ORDER BY target_id")?;
    let ids = stmt
        .query_map([job_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

fn replace_targets(conn: &Connection, job_id: i64, target_ids: &[i64]) -> Result<()> {
    conn.execute("DELETE FROM job_targets WHERE job_id = ?1", [job_id])?;
    let mut stmt =
        conn.prepare_cached("INSERT OR IGNORE INTO job_targets (job_id, target_id) VALUES (?1, ?2)")?;
    for target_id in target_ids {
        stmt.execute(params![job_id, target_id])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecurringType;
    use chrono::Duration;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("bad test timestamp")
            .with_timezone(&Utc)
    }

    fn repo() -> SqliteJobRepository {
        SqliteJobRepository::open_in_memory("UTC").expect("open")
    }

    fn job_with_targets(repo: &SqliteJobRepository, targets: &[i64]) -> Job {
        repo.create_job("backup", &serde_json::json!([{"action": "noop"}]), targets)
            .expect("create job")
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let a = ts(utc("2026-01-01T00:00:00Z"));
        let b = ts(utc("2026-01-01T00:00:00.5Z"));
        assert_eq!(a, "2026-01-01T00:00:00.000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    #[test]
    fn create_schedule_fills_default_timezone_and_next_run() {
        let repo = SqliteJobRepository::open_in_memory("Europe/Berlin").expect("open");
        let job = job_with_targets(&repo, &[1]);
        let now = utc("2026-07-01T00:00:00Z");
        let spec = ScheduleSpec::recurring(job.id, RecurringType::Daily, 1, now).with_time("09:00");

        let stored = repo.create_schedule(&spec, now).expect("create");
        assert_eq!(stored.timezone, "Europe/Berlin");
        assert_eq!(stored.status, ScheduleStatus::Active);
        assert_eq!(stored.next_run, Some(utc("2026-07-01T07:00:00Z")));
    }

    #[test]
    fn create_schedule_rejects_bad_config() {
        let repo = repo();
        let job = job_with_targets(&repo, &[1]);
        let now = utc("2026-07-01T00:00:00Z");
        let spec = ScheduleSpec::cron(job.id, "not a cron", now);
        let err = repo.create_schedule(&spec, now).unwrap_err();
        assert!(matches!(err, SchedulerError::ScheduleConfig(_)));
    }

    #[test]
    fn create_schedule_for_missing_job_fails() {
        let repo = repo();
        let now = utc("2026-07-01T00:00:00Z");
        let spec = ScheduleSpec::recurring(42, RecurringType::Minutes, 5, now);
        let err = repo.create_schedule(&spec, now).unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound { id: 42 }));
    }

    #[test]
    fn past_once_schedule_is_created_exhausted() {
        let repo = repo();
        let job = job_with_targets(&repo, &[1]);
        let now = utc("2026-07-01T00:00:00Z");
        let spec = ScheduleSpec::once(job.id, now - Duration::hours(1), now);
        let stored = repo.create_schedule(&spec, now).expect("create");
        assert_eq!(stored.status, ScheduleStatus::Exhausted);
        assert_eq!(stored.next_run, None);
    }

    #[test]
    fn due_query_respects_time_and_enabled_flags() {
        let repo = repo();
        let job = job_with_targets(&repo, &[1]);
        let now = utc("2026-07-01T00:00:00Z");
        let spec = ScheduleSpec::recurring(job.id, RecurringType::Minutes, 5, now);
        let stored = repo.create_schedule(&spec, now).expect("create");

        assert!(repo.get_due_schedules(now).expect("due").is_empty());
        let later = now + Duration::minutes(5);
        let due = repo.get_due_schedules(later).expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0.id, job.id);
        assert_eq!(due[0].1.id, stored.id);

        repo.set_job_enabled(job.id, false).expect("disable job");
        assert!(repo.get_due_schedules(later).expect("due").is_empty());
    }

    #[test]
    fn claim_snapshots_targets_and_numbers_executions() {
        let repo = repo();
        let job = job_with_targets(&repo, &[3, 1, 2]);
        let now = utc("2026-07-01T00:00:00Z");
        let spec = repo
            .create_schedule(&ScheduleSpec::recurring(job.id, RecurringType::Minutes, 5, now), now)
            .expect("create");
        let due_at = spec.next_run.expect("next_run");

        let execution = repo
            .claim_occurrence(&OccurrenceClaim {
                schedule_id: spec.id,
                expected_next_run: due_at,
                expected_count: 0,
                provisional_next_run: Some(due_at + Duration::minutes(5)),
                now: due_at,
            })
            .expect("claim");
        assert_eq!(execution.execution_number, 1);
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.target_ids, vec![1, 2, 3]);

        // later target changes do not touch the snapshot
        repo.set_job_targets(job.id, &[9]).expect("targets");
        assert_eq!(repo.get_job_target_ids(job.id).expect("targets"), vec![9]);
        let stored = repo.get_execution(execution.id).expect("get").expect("exists");
        assert_eq!(stored.target_ids, vec![1, 2, 3]);

        let again = repo.claim_occurrence(&OccurrenceClaim {
            schedule_id: spec.id,
            expected_next_run: due_at,
            expected_count: 0,
            provisional_next_run: None,
            now: due_at,
        });
        assert!(matches!(again, Err(SchedulerError::DispatchConflict { .. })));
    }

    #[test]
    fn worker_transitions_are_status_checked() {
        let repo = repo();
        let job = job_with_targets(&repo, &[1]);
        let now = utc("2026-07-01T00:00:00Z");
        let spec = repo
            .create_schedule(&ScheduleSpec::recurring(job.id, RecurringType::Minutes, 5, now), now)
            .expect("create");
        let due_at = spec.next_run.expect("next_run");
        let execution = repo
            .claim_occurrence(&OccurrenceClaim {
                schedule_id: spec.id,
                expected_next_run: due_at,
                expected_count: 0,
                provisional_next_run: Some(due_at + Duration::minutes(5)),
                now: due_at,
            })
            .expect("claim");

        // finishing before starting is ignored
        assert!(!repo
            .finish_execution(execution.id, ExecutionStatus::Completed, None, due_at)
            .expect("finish"));
        assert!(repo.mark_execution_running(execution.id, due_at).expect("start"));
        assert!(!repo.mark_execution_running(execution.id, due_at).expect("restart"));

        let run = repo.start_target_run(execution.id, 1, due_at).expect("target run");
        assert!(repo
            .finish_target_run(run, ExecutionStatus::Completed, None, due_at)
            .expect("finish run"));

        assert!(repo
            .finish_execution(execution.id, ExecutionStatus::Completed, None, due_at)
            .expect("finish"));
        // a late failure must not clobber the completed state
        assert!(!repo.fail_execution(execution.id, "late", due_at).expect("fail"));
        assert!(!repo.cancel_execution(execution.id, due_at).expect("cancel"));

        let stored = repo.get_execution(execution.id).expect("get").expect("exists");
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(repo.list_target_runs(execution.id).expect("runs").len(), 1);

        let err = repo
            .finish_execution(execution.id, ExecutionStatus::Running, None, due_at)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition(_)));
    }

    #[test]
    fn disable_and_reenable_schedule() {
        let repo = repo();
        let job = job_with_targets(&repo, &[1]);
        let now = utc("2026-07-01T00:00:00Z");
        let spec = repo
            .create_schedule(&ScheduleSpec::recurring(job.id, RecurringType::Hours, 1, now), now)
            .expect("create");

        let disabled = repo.set_schedule_enabled(spec.id, false, now).expect("disable");
        assert_eq!(disabled.status, ScheduleStatus::Disabled);
        assert_eq!(disabled.next_run, None);
        assert_eq!(disabled.status_reason.as_deref(), Some(OPERATOR_DISABLED_REASON));

        let later = now + Duration::minutes(90);
        let enabled = repo.set_schedule_enabled(spec.id, true, later).expect("enable");
        assert_eq!(enabled.status, ScheduleStatus::Active);
        assert_eq!(enabled.next_run, Some(now + Duration::hours(2)));

        let stored = repo.get_schedule(spec.id).expect("get").expect("exists");
        assert_eq!(stored.next_run, enabled.next_run);
    }

    #[test]
    fn schedule_error_is_distinguishable() {
        let repo = repo();
        let job = job_with_targets(&repo, &[1]);
        let now = utc("2026-07-01T00:00:00Z");
        let spec = repo
            .create_schedule(&ScheduleSpec::recurring(job.id, RecurringType::Hours, 1, now), now)
            .expect("create");

        repo.mark_schedule_error(spec.id, "job not found", now).expect("mark");
        let stored = repo.get_schedule(spec.id).expect("get").expect("exists");
        assert_eq!(stored.status, ScheduleStatus::Error);
        assert!(!stored.enabled);
        assert_eq!(stored.status_reason.as_deref(), Some("job not found"));
    }

    #[test]
    fn deleting_job_cascades_to_schedules() {
        let repo = repo();
        let job = job_with_targets(&repo, &[1]);
        let now = utc("2026-07-01T00:00:00Z");
        let spec = repo
            .create_schedule(&ScheduleSpec::recurring(job.id, RecurringType::Hours, 1, now), now)
            .expect("create");

        let other = repo
            .create_schedule(
                &ScheduleSpec::recurring(job.id, RecurringType::Daily, 1, now).with_time("03:00"),
                now,
            )
            .expect("create");
        repo.delete_schedule(other.id).expect("delete schedule");
        assert!(repo.get_schedule(other.id).expect("get").is_none());

        repo.delete_job(job.id).expect("delete");
        assert!(repo.get_schedule(spec.id).expect("get").is_none());
        assert!(repo.get_job(job.id).expect("get").is_none());
        assert!(matches!(
            repo.delete_job(job.id),
            Err(SchedulerError::JobNotFound { .. })
        ));
    }
}
