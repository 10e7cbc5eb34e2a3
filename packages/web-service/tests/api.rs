//! Admin API against a live listener and an in-memory database.

use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;

use runinator_core::api::{ApiClient, Endpoint, RunSink, TaskSource};
use runinator_core::model::{NewScheduledTask, NewTaskRun, TaskPatch};
use runinator_web_service::build_app;

async fn start_service() -> (ApiClient, reqwest::Client, String) {
    // One connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let app = build_app(pool);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let base = format!("http://{addr}");
    let client = ApiClient::new(Endpoint::fixed(&base), Duration::from_secs(5)).unwrap();
    (client, reqwest::Client::new(), base)
}

fn task(name: &str) -> NewScheduledTask {
    NewScheduledTask {
        name: name.to_string(),
        cron_schedule: "*/5 * * * *".to_string(),
        action_name: "Console".to_string(),
        action_function: "run_console".to_string(),
        action_configuration: b"echo hi".to_vec(),
        timeout_ms: 1_000,
        enabled: true,
    }
}

#[tokio::test]
async fn test_create_and_list_round_trip() {
    let (client, _, _) = start_service().await;

    let id = client.create_task(&task("report")).await.unwrap();
    assert!(id > 0);

    let tasks = client.list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    let created = &tasks[0];
    assert_eq!(created.id, id);
    assert_eq!(created.name, "report");
    assert_eq!(created.action_configuration, b"echo hi");
    // The service seeds the first future slot at insert.
    assert!(created.next_execution.is_some());
    assert!(created.next_execution.unwrap() > chrono::Utc::now());
    assert!(created.enabled);
}

#[tokio::test]
async fn test_create_rejects_bad_input() {
    let (client, http, base) = start_service().await;

    let mut bad_cron = task("bad-cron");
    bad_cron.cron_schedule = "not a cron".to_string();
    let err = client.create_task(&bad_cron).await.unwrap_err();
    assert!(matches!(
        err,
        runinator_core::RuninatorError::Remote { status: 400, .. }
    ));

    let mut bad_timeout = task("bad-timeout");
    bad_timeout.timeout_ms = 0;
    let err = client.create_task(&bad_timeout).await.unwrap_err();
    assert!(matches!(
        err,
        runinator_core::RuninatorError::Remote { status: 400, .. }
    ));

    // Empty name, checked over raw HTTP to also pin the error body shape.
    let mut empty = serde_json::to_value(task("x")).unwrap();
    empty["name"] = serde_json::json!("  ");
    let response = http
        .post(format!("{base}/tasks"))
        .json(&empty)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("name"));
}

#[tokio::test]
async fn test_duplicate_name_conflicts() {
    let (client, _, _) = start_service().await;

    client.create_task(&task("unique")).await.unwrap();
    let err = client.create_task(&task("unique")).await.unwrap_err();
    assert!(matches!(
        err,
        runinator_core::RuninatorError::Remote { status: 409, .. }
    ));
}

#[tokio::test]
async fn test_patch_updates_and_validates() {
    let (client, _, _) = start_service().await;
    let id = client.create_task(&task("patchable")).await.unwrap();

    client
        .patch_task(
            id,
            &TaskPatch {
                enabled: Some(false),
                timeout_ms: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let tasks = client.list_tasks().await.unwrap();
    assert!(!tasks[0].enabled);
    assert_eq!(tasks[0].timeout_ms, 2_000);

    // A patch may not break the cron invariant.
    let err = client
        .patch_task(
            id,
            &TaskPatch {
                cron_schedule: Some("99 * * * *".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        runinator_core::RuninatorError::Remote { status: 400, .. }
    ));

    let missing = client
        .patch_task(
            9999,
            &TaskPatch {
                enabled: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        missing,
        runinator_core::RuninatorError::Remote { status: 404, .. }
    ));
}

#[tokio::test]
async fn test_request_run_makes_task_due_now() {
    let (client, http, base) = start_service().await;
    let id = client.create_task(&task("run-me")).await.unwrap();

    // Freshly created: first slot is in the future, nothing is due.
    assert!(client.due_tasks(chrono::Utc::now()).await.unwrap().is_empty());

    let response = http
        .post(format!("{base}/tasks/{id}/request_run"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);

    let due = client.due_tasks(chrono::Utc::now()).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, id);
}

#[tokio::test]
async fn test_record_and_list_runs() {
    let (client, http, base) = start_service().await;
    let id = client.create_task(&task("history")).await.unwrap();

    let start = chrono::Utc::now();
    for duration_ms in [5, 10] {
        client
            .record_run(NewTaskRun {
                task_id: id,
                start_time: start,
                duration_ms,
            })
            .await
            .unwrap();
    }

    let response = http
        .get(format!("{base}/tasks/{id}/runs"))
        .send()
        .await
        .unwrap();
    let runs: Vec<runinator_core::model::TaskRun> = response.json().await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.task_id == id));
}

#[tokio::test]
async fn test_health_reports_ok() {
    let (_, http, base) = start_service().await;
    let response = http.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}
