//! Task rows: the SQL shape and CRUD over the pool.
//!
//! On disk, datetimes are epoch seconds (`next_execution INTEGER NULL`) and
//! the handler payload is a BLOB; the API surface converts to the shared
//! `ScheduledTask` with chrono datetimes.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;

use runinator_core::model::{NewScheduledTask, ScheduledTask, TaskPatch};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub name: String,
    pub cron_schedule: String,
    pub action_name: String,
    pub action_function: String,
    pub action_configuration: Vec<u8>,
    pub timeout: i64,
    pub next_execution: Option<i64>,
    pub enabled: bool,
}

impl From<TaskRow> for ScheduledTask {
    fn from(row: TaskRow) -> Self {
        ScheduledTask {
            id: row.id,
            name: row.name,
            cron_schedule: row.cron_schedule,
            action_name: row.action_name,
            action_function: row.action_function,
            action_configuration: row.action_configuration,
            timeout_ms: row.timeout,
            next_execution: row
                .next_execution
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            enabled: row.enabled,
        }
    }
}

impl TaskRow {
    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM scheduled_tasks ORDER BY id ASC",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn find_by_id(id: i64, pool: &SqlitePool) -> Result<Option<ScheduledTask>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row.map(Into::into))
    }

    /// Insert a task; returns the assigned id.
    pub async fn insert(
        task: &NewScheduledTask,
        next_execution: Option<DateTime<Utc>>,
        pool: &SqlitePool,
    ) -> std::result::Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_tasks
                (name, cron_schedule, action_name, action_function,
                 action_configuration, timeout, next_execution, enabled)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.name)
        .bind(&task.cron_schedule)
        .bind(&task.action_name)
        .bind(&task.action_function)
        .bind(&task.action_configuration)
        .bind(task.timeout_ms)
        .bind(next_execution.map(|t| t.timestamp()))
        .bind(task.enabled)
        .execute(pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Overwrite a task with its patched state. Returns false when the row
    /// is gone.
    pub async fn update(
        task: &ScheduledTask,
        pool: &SqlitePool,
    ) -> std::result::Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET name = ?,
                cron_schedule = ?,
                action_name = ?,
                action_function = ?,
                action_configuration = ?,
                timeout = ?,
                next_execution = ?,
                enabled = ?
            WHERE id = ?
            "#,
        )
        .bind(&task.name)
        .bind(&task.cron_schedule)
        .bind(&task.action_name)
        .bind(&task.action_function)
        .bind(&task.action_configuration)
        .bind(task.timeout_ms)
        .bind(task.next_execution.map(|t| t.timestamp()))
        .bind(task.enabled)
        .bind(task.id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Apply a partial update on top of a task.
pub fn apply_patch(task: &mut ScheduledTask, patch: TaskPatch) {
    if let Some(name) = patch.name {
        task.name = name;
    }
    if let Some(cron_schedule) = patch.cron_schedule {
        task.cron_schedule = cron_schedule;
    }
    if let Some(action_name) = patch.action_name {
        task.action_name = action_name;
    }
    if let Some(action_function) = patch.action_function {
        task.action_function = action_function;
    }
    if let Some(action_configuration) = patch.action_configuration {
        task.action_configuration = action_configuration;
    }
    if let Some(timeout_ms) = patch.timeout_ms {
        task.timeout_ms = timeout_ms;
    }
    if let Some(next_execution) = patch.next_execution {
        task.next_execution = next_execution;
    }
    if let Some(enabled) = patch.enabled {
        task.enabled = enabled;
    }
}
