//! Task endpoints: list, create, patch, request an immediate run.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use runinator_core::cron::CronSchedule;
use runinator_core::model::{NewScheduledTask, ScheduledTask, TaskPatch};

use crate::app::{ApiError, AppState};
use crate::models::{apply_patch, TaskRow};

/// Mutation reply: `{"success", "message", "id"?}`.
#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

pub async fn list_tasks_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScheduledTask>>, ApiError> {
    Ok(Json(TaskRow::find_all(&state.pool).await?))
}

pub async fn create_task_handler(
    State(state): State<AppState>,
    Json(task): Json<NewScheduledTask>,
) -> Result<Json<MutationResponse>, ApiError> {
    let schedule = validate_task_fields(&task.name, &task.cron_schedule, task.timeout_ms)?;

    // Seed the schedule so the scheduler picks the task up at its first
    // future slot.
    let next_execution = schedule.next_after(Utc::now());
    let id = TaskRow::insert(&task, Some(next_execution), &state.pool).await?;

    tracing::info!(id, name = %task.name, cron = %task.cron_schedule, "task created");
    Ok(Json(MutationResponse {
        success: true,
        message: "task created".to_string(),
        id: Some(id),
    }))
}

pub async fn patch_task_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<MutationResponse>, ApiError> {
    let mut task = TaskRow::find_by_id(id, &state.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;

    apply_patch(&mut task, patch);
    validate_task_fields(&task.name, &task.cron_schedule, task.timeout_ms)?;

    if !TaskRow::update(&task, &state.pool).await? {
        return Err(ApiError::NotFound(format!("task {id} not found")));
    }
    tracing::debug!(id, "task updated");
    Ok(Json(MutationResponse {
        success: true,
        message: "task updated".to_string(),
        id: None,
    }))
}

/// Pull the task's next slot to now so the next scheduler tick publishes an
/// out-of-schedule firing through the normal pipeline.
pub async fn request_run_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<MutationResponse>, ApiError> {
    let mut task = TaskRow::find_by_id(id, &state.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;

    task.next_execution = Some(Utc::now());
    TaskRow::update(&task, &state.pool).await?;

    tracing::info!(id, name = %task.name, "immediate run requested");
    Ok(Json(MutationResponse {
        success: true,
        message: "run requested".to_string(),
        id: None,
    }))
}

fn validate_task_fields(
    name: &str,
    cron_schedule: &str,
    timeout_ms: i64,
) -> Result<CronSchedule, ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    if timeout_ms <= 0 {
        return Err(ApiError::BadRequest(
            "timeout_ms must be positive".to_string(),
        ));
    }
    CronSchedule::parse(cron_schedule).map_err(|e| ApiError::BadRequest(e.to_string()))
}
