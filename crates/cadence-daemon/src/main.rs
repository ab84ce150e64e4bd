use std::sync::Arc;
use std::time::Duration;

use cadence_core::CadenceConfig;
use cadence_scheduler::{
    ChannelTaskQueue, QueuedTask, Reconciler, SchedulerEngine, SqliteJobRepository,
};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(about = "Cadence - polls job schedules, dispatches executions, fails stale runs")]
#[command(version)]
struct Args {
    /// Config file path (default ~/.cadence/cadence.toml).
    #[arg(short, long, env = "CADENCE_CONFIG")]
    config: Option<String>,

    /// Run a single poll and reconcile sweep, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the task stream, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_daemon=info,cadence_scheduler=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = CadenceConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });
    config.validate()?;

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    // poller and reconciler each get their own connection
    let busy_timeout = Duration::from_millis(config.database.busy_timeout_ms);
    let timezone = &config.scheduler.default_timezone;
    let poller_repo = Arc::new(SqliteJobRepository::open(db_path, busy_timeout, timezone)?);
    let reconciler_repo = Arc::new(SqliteJobRepository::open(db_path, busy_timeout, timezone)?);
    info!("database migrations complete");

    let (queue, task_rx) = ChannelTaskQueue::bounded(config.queue.capacity);
    let engine = SchedulerEngine::from_config(poller_repo, Arc::new(queue), &config.scheduler);
    let reconciler = Reconciler::from_config(reconciler_repo, &config.reconciler);
    let relay = tokio::spawn(relay_tasks(task_rx));

    if args.once {
        let now = chrono::Utc::now();
        let sweep = engine.tick(now).await?;
        let reconciled = reconciler.sweep(now)?;
        info!(
            dispatched = sweep.dispatched,
            failed = sweep.failed,
            skipped = sweep.skipped,
            errors = sweep.errors,
            stale_executions = reconciled.executions,
            stale_target_runs = reconciled.target_runs,
            "single sweep complete"
        );
        // dropping the engine closes the queue, which ends the relay
        drop(engine);
        relay.await??;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx.clone()));
    let reconciler_task = tokio::spawn(reconciler.run(shutdown_rx));
    info!("cadence running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    engine_task.await?;
    reconciler_task.await?;
    relay.await??;
    info!("cadence stopped");
    Ok(())
}

/// Hand queued tasks to workers as JSON lines on stdout.
///
/// Returns once every sender is gone and the buffered tasks are written.
async fn relay_tasks(mut rx: mpsc::Receiver<QueuedTask>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(task) = rx.recv().await {
        stdout.write_all(task_line(&task)?.as_bytes()).await?;
        stdout.flush().await?;
        debug!(execution_id = task.execution_id, task_id = %task.task_id, "task relayed");
    }
    Ok(())
}

fn task_line(task: &QueuedTask) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(task)?;
    line.push('\n');
    Ok(line)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_accept_config_and_once() {
        let args = Args::try_parse_from(["cadence", "--config", "/etc/cadence.toml", "--once"])
            .expect("parse");
        assert_eq!(args.config.as_deref(), Some("/etc/cadence.toml"));
        assert!(args.once);
    }

    #[test]
    fn task_line_is_one_json_object() {
        let task = QueuedTask {
            task_id: "t-1".to_string(),
            execution_id: 9,
            target_ids: vec![4, 5],
        };
        let line = task_line(&task).expect("serialize");
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let parsed: QueuedTask = serde_json::from_str(line.trim_end()).expect("parse");
        assert_eq!(parsed, task);
    }

    #[test]
    fn parent_dir_is_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("nested/deeper/cadence.db");
        ensure_parent_dir(db.to_str().expect("utf-8 path"));
        assert!(dir.path().join("nested/deeper").is_dir());
    }

    #[tokio::test]
    async fn relay_finishes_when_queue_closes() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(QueuedTask {
            task_id: "t-2".to_string(),
            execution_id: 1,
            target_ids: vec![1],
        })
        .await
        .expect("send");
        drop(tx);
        relay_tasks(rx).await.expect("relay");
    }
}
