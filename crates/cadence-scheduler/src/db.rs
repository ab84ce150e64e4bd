use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the job, schedule, execution and target-run tables (idempotent).
/// Timestamps are fixed-width RFC 3339 strings, so text comparison orders
/// them chronologically and the `next_run` index serves the polling query.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT    NOT NULL,
            enabled     INTEGER NOT NULL DEFAULT 1,
            actions     TEXT    NOT NULL DEFAULT '[]',  -- opaque JSON list
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS job_targets (
            job_id      INTEGER NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            target_id   INTEGER NOT NULL,
            PRIMARY KEY (job_id, target_id)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS job_schedules (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id          INTEGER NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            schedule_type   TEXT    NOT NULL,
            enabled         INTEGER NOT NULL DEFAULT 1,
            status          TEXT    NOT NULL DEFAULT 'active',
            status_reason   TEXT,
            timezone        TEXT    NOT NULL,
            execute_at      TEXT,
            recurring_type  TEXT,
            interval_value  INTEGER,
            time_of_day     TEXT,               -- HH:MM local to timezone
            days_of_week    TEXT    NOT NULL DEFAULT '[]',
            day_of_month    INTEGER,
            cron_expression TEXT,
            max_executions  INTEGER,            -- NULL means unlimited
            execution_count INTEGER NOT NULL DEFAULT 0,
            end_date        TEXT,
            next_run        TEXT,               -- NULL once exhausted/disabled
            last_run        TEXT,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        -- Efficient polling: SELECT … WHERE status = 'active' AND next_run <= ?
        CREATE INDEX IF NOT EXISTS idx_job_schedules_due
            ON job_schedules (status, next_run);

        CREATE TABLE IF NOT EXISTS job_executions (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id           INTEGER NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            schedule_id      INTEGER REFERENCES job_schedules (id) ON DELETE SET NULL,
            execution_number INTEGER NOT NULL,
            status           TEXT    NOT NULL,
            scheduled_at     TEXT    NOT NULL,
            started_at       TEXT,
            completed_at     TEXT,
            target_ids       TEXT    NOT NULL,  -- JSON snapshot taken at dispatch
            task_id          TEXT,
            error_message    TEXT,
            UNIQUE (job_id, execution_number)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_executions_status
            ON job_executions (status, started_at);

        CREATE TABLE IF NOT EXISTS target_runs (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id  INTEGER NOT NULL REFERENCES job_executions (id) ON DELETE CASCADE,
            target_id     INTEGER NOT NULL,
            status        TEXT    NOT NULL,
            started_at    TEXT,
            completed_at  TEXT,
            error_message TEXT,
            UNIQUE (execution_id, target_id)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_target_runs_status
            ON target_runs (status, started_at);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        init_db(&conn).expect("first init");
        init_db(&conn).expect("second init");

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('jobs', 'job_targets', 'job_schedules', 'job_executions', 'target_runs')",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(tables, 5);
    }
}
