//! Run history endpoints: record (worker-internal) and list per task.

use axum::extract::{Path, State};
use axum::Json;

use runinator_core::model::{NewTaskRun, TaskRun};

use crate::app::{ApiError, AppState};
use crate::models::RunRow;
use crate::routes::tasks::MutationResponse;

pub async fn record_run_handler(
    State(state): State<AppState>,
    Json(run): Json<NewTaskRun>,
) -> Result<Json<MutationResponse>, ApiError> {
    if run.duration_ms < 0 {
        return Err(ApiError::BadRequest(
            "duration_ms must not be negative".to_string(),
        ));
    }
    let id = RunRow::insert(&run, &state.pool).await?;
    tracing::debug!(id, task_id = run.task_id, duration_ms = run.duration_ms, "run recorded");
    Ok(Json(MutationResponse {
        success: true,
        message: "run recorded".to_string(),
        id: Some(id),
    }))
}

pub async fn list_task_runs_handler(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> Result<Json<Vec<TaskRun>>, ApiError> {
    Ok(Json(RunRow::find_for_task(task_id, &state.pool).await?))
}
