//! Task run rows: append-only history.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use sqlx::SqlitePool;

use runinator_core::model::{NewTaskRun, TaskRun};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRow {
    pub id: i64,
    pub task_id: i64,
    pub start_time: i64,
    pub duration_ms: i64,
}

impl From<RunRow> for TaskRun {
    fn from(row: RunRow) -> Self {
        TaskRun {
            id: row.id,
            task_id: row.task_id,
            start_time: Utc
                .timestamp_opt(row.start_time, 0)
                .single()
                .unwrap_or_else(Utc::now),
            duration_ms: row.duration_ms,
        }
    }
}

impl RunRow {
    pub async fn insert(run: &NewTaskRun, pool: &SqlitePool) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO task_runs (task_id, start_time, duration_ms) VALUES (?, ?, ?)",
        )
        .bind(run.task_id)
        .bind(run.start_time.timestamp())
        .bind(run.duration_ms)
        .execute(pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn find_for_task(task_id: i64, pool: &SqlitePool) -> Result<Vec<TaskRun>> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM task_runs WHERE task_id = ? ORDER BY start_time DESC, id DESC",
        )
        .bind(task_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
