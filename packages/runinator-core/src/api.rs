//! Client surface of the web service, plus the in-memory double for tests.
//!
//! The scheduler and worker never talk SQL; they consume the narrow
//! [`TaskSource`] / [`RunSink`] traits. In production both are implemented
//! by [`ApiClient`] over the web service's JSON API; tests swap in
//! [`TestApi`], which records everything in memory.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::broker::remote_error;
use crate::error::RuninatorError;
use crate::model::{NewScheduledTask, NewTaskRun, ScheduledTask, TaskPatch, TaskRun};

/// Where a client finds its server: a fixed URL from the CLI, or whatever
/// gossip currently considers the freshest announcement.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Fixed(String),
    Discovered(watch::Receiver<Option<String>>),
}

impl Endpoint {
    /// Normalize a CLI-provided URL into a fixed endpoint.
    pub fn fixed(url: &str) -> Self {
        Endpoint::Fixed(format!("{}/", url.trim_end_matches('/')))
    }

    /// The current base URL, trailing slash included.
    pub fn base_url(&self) -> Result<String, RuninatorError> {
        match self {
            Endpoint::Fixed(url) => Ok(url.clone()),
            Endpoint::Discovered(rx) => rx.borrow().clone().ok_or_else(|| {
                RuninatorError::Network("no service announcement received yet".to_string())
            }),
        }
    }
}

/// Read side the scheduler depends on.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Enabled tasks whose `next_execution` is at or before `now`.
    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, RuninatorError>;

    /// Persist a task's advanced `next_execution`.
    async fn advance_task(
        &self,
        task_id: i64,
        next_execution: DateTime<Utc>,
    ) -> Result<(), RuninatorError>;
}

/// Write side the worker depends on.
#[async_trait]
pub trait RunSink: Send + Sync {
    /// Append one run record.
    async fn record_run(&self, run: NewTaskRun) -> Result<(), RuninatorError>;
}

/// JSON API client for the web service.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    endpoint: Endpoint,
}

impl ApiClient {
    pub fn new(endpoint: Endpoint, request_timeout: Duration) -> Result<Self, RuninatorError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RuninatorError::Config(format!("http client: {e}")))?;
        Ok(Self { client, endpoint })
    }

    fn url(&self, path: &str) -> Result<String, RuninatorError> {
        Ok(format!("{}{}", self.endpoint.base_url()?, path))
    }

    /// All tasks, as served by `GET /tasks`.
    pub async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, RuninatorError> {
        let response = self.client.get(self.url("tasks")?).send().await?;
        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Create a task; returns the assigned id.
    pub async fn create_task(&self, task: &NewScheduledTask) -> Result<i64, RuninatorError> {
        let response = self
            .client
            .post(self.url("tasks")?)
            .json(task)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }
        #[derive(serde::Deserialize)]
        struct Created {
            id: Option<i64>,
        }
        let body: Created = response.json().await?;
        body.id
            .ok_or_else(|| RuninatorError::Network("create response carried no id".to_string()))
    }

    /// Partially update a task via `PATCH /tasks/{id}`.
    pub async fn patch_task(&self, task_id: i64, patch: &TaskPatch) -> Result<(), RuninatorError> {
        let response = self
            .client
            .patch(self.url(&format!("tasks/{task_id}"))?)
            .json(patch)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }
        Ok(())
    }
}

#[async_trait]
impl TaskSource for ApiClient {
    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, RuninatorError> {
        let tasks = self.list_tasks().await?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.enabled && t.next_execution.is_some_and(|at| at <= now))
            .collect())
    }

    async fn advance_task(
        &self,
        task_id: i64,
        next_execution: DateTime<Utc>,
    ) -> Result<(), RuninatorError> {
        self.patch_task(
            task_id,
            &TaskPatch {
                next_execution: Some(Some(next_execution)),
                ..Default::default()
            },
        )
        .await
    }
}

#[async_trait]
impl RunSink for ApiClient {
    async fn record_run(&self, run: NewTaskRun) -> Result<(), RuninatorError> {
        let response = self
            .client
            .post(self.url("task_runs")?)
            .json(&run)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }
        Ok(())
    }
}

/// In-memory task store and run recorder for tests.
///
/// Plays both [`TaskSource`] and [`RunSink`], and records every call so
/// assertions can inspect what a scheduler or worker did.
#[derive(Default)]
pub struct TestApi {
    tasks: Mutex<HashMap<i64, ScheduledTask>>,
    runs: Mutex<Vec<TaskRun>>,
    fail_advances: Mutex<bool>,
    fail_run_reports: Mutex<u32>,
}

impl TestApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a task.
    pub fn insert_task(&self, task: ScheduledTask) {
        self.tasks.lock().unwrap().insert(task.id, task);
    }

    /// Snapshot a task by id.
    pub fn task(&self, task_id: i64) -> Option<ScheduledTask> {
        self.tasks.lock().unwrap().get(&task_id).cloned()
    }

    /// All runs recorded so far.
    pub fn runs(&self) -> Vec<TaskRun> {
        self.runs.lock().unwrap().clone()
    }

    /// Make subsequent `advance_task` calls fail, as a persistence outage
    /// would.
    pub fn set_fail_advances(&self, fail: bool) {
        *self.fail_advances.lock().unwrap() = fail;
    }

    /// Make the next `n` `record_run` calls fail.
    pub fn fail_next_run_reports(&self, n: u32) {
        *self.fail_run_reports.lock().unwrap() = n;
    }
}

#[async_trait]
impl TaskSource for TestApi {
    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, RuninatorError> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.enabled && t.next_execution.is_some_and(|at| at <= now))
            .cloned()
            .collect())
    }

    async fn advance_task(
        &self,
        task_id: i64,
        next_execution: DateTime<Utc>,
    ) -> Result<(), RuninatorError> {
        if *self.fail_advances.lock().unwrap() {
            return Err(RuninatorError::Remote {
                status: 500,
                message: "persistence unavailable".to_string(),
            });
        }
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(&task_id).ok_or(RuninatorError::Remote {
            status: 404,
            message: format!("task {task_id} not found"),
        })?;
        task.next_execution = Some(next_execution);
        Ok(())
    }
}

#[async_trait]
impl RunSink for TestApi {
    async fn record_run(&self, run: NewTaskRun) -> Result<(), RuninatorError> {
        {
            let mut remaining = self.fail_run_reports.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RuninatorError::Network("injected failure".to_string()));
            }
        }
        let mut runs = self.runs.lock().unwrap();
        let id = runs.len() as i64 + 1;
        runs.push(TaskRun {
            id,
            task_id: run.task_id,
            start_time: run.start_time,
            duration_ms: run.duration_ms,
        });
        Ok(())
    }
}
