use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::ReconcilerConfig;
use chrono::{DateTime, Utc};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{error, info, warn};

use crate::{
    error::Result,
    repository::{JobRepository, STALE_REASON},
};

/// Rows failed by one staleness sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub executions: usize,
    pub target_runs: usize,
}

/// Fails executions whose worker went away.
///
/// Only RUNNING rows older than the timeout are touched, so a sweep is
/// idempotent and never overwrites a terminal status a worker wrote.
pub struct Reconciler<R> {
    repo: Arc<R>,
    interval: Duration,
    job_timeout: chrono::Duration,
    execution_timeout: chrono::Duration,
}

fn minutes(value: u64) -> chrono::Duration {
    chrono::Duration::minutes(i64::from(u32::try_from(value).unwrap_or(u32::MAX)))
}

impl<R: JobRepository> Reconciler<R> {
    pub fn new(
        repo: Arc<R>,
        interval: Duration,
        job_timeout: chrono::Duration,
        execution_timeout: chrono::Duration,
    ) -> Self {
        Self {
            repo,
            interval,
            job_timeout,
            execution_timeout,
        }
    }

    pub fn from_config(repo: Arc<R>, config: &ReconcilerConfig) -> Self {
        Self::new(
            repo,
            Duration::from_secs(config.interval_secs),
            minutes(config.job_timeout_minutes),
            minutes(config.execution_timeout_minutes),
        )
    }

    /// Fail RUNNING executions that started more than `timeout` ago.
    pub fn reconcile(&self, timeout: chrono::Duration) -> Result<usize> {
        self.reconcile_at(timeout, Utc::now())
    }

    pub fn reconcile_at(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> Result<usize> {
        let count = self
            .repo
            .fail_stale_executions(cutoff(now, timeout), STALE_REASON, now)?;
        if count > 0 {
            warn!(count, "stale executions marked failed");
        }
        Ok(count)
    }

    /// Fail RUNNING target runs that started more than `timeout` ago.
    pub fn reconcile_target_runs(&self, timeout: chrono::Duration) -> Result<usize> {
        self.reconcile_target_runs_at(timeout, Utc::now())
    }

    pub fn reconcile_target_runs_at(
        &self,
        timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let count = self
            .repo
            .fail_stale_target_runs(cutoff(now, timeout), STALE_REASON, now)?;
        if count > 0 {
            warn!(count, "stale target runs marked failed");
        }
        Ok(count)
    }

    /// Both sweeps with the configured timeouts.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        Ok(ReconcileReport {
            target_runs: self.reconcile_target_runs_at(self.execution_timeout, now)?,
            executions: self.reconcile_at(self.job_timeout, now)?,
        })
    }

    /// Sweep every `interval` until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            job_timeout_minutes = self.job_timeout.num_minutes(),
            "reconciler started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep(Utc::now()) {
                        error!("reconcile sweep error: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn cutoff(now: DateTime<Utc>, timeout: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(timeout)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
