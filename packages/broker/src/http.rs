//! HTTP control plane over the firing queue.
//!
//! Routes:
//! - `POST /publish` — enqueue a firing; 200 with the id, 409 with the
//!   existing id on an idempotency hit
//! - `POST /lease?consumer_id=&wait_ms=` — claim a firing; 204 when none
//!   became available within the wait
//! - `POST /ack/{firing_id}` — remove a leased firing; 410 on a stale token
//! - `POST /nack/{firing_id}` — requeue or drop; 410 on a stale token
//! - `GET /dead` — dead-lettered firings
//! - `GET /health` — queue depth

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use runinator_core::broker::{AckOutcome, AckRequest, NackRequest, PublishOutcome, PublishResponse};
use runinator_core::model::NewFiring;

use crate::queue::FiringQueue;

/// Longest the lease endpoint will hold a request open.
const MAX_LEASE_WAIT_MS: u64 = 30_000;

#[derive(Clone)]
pub struct BrokerState {
    pub queue: Arc<FiringQueue>,
}

/// Build the control-plane router.
pub fn build_router(queue: Arc<FiringQueue>) -> Router {
    Router::new()
        .route("/publish", post(publish_handler))
        .route("/lease", post(lease_handler))
        .route("/ack/:firing_id", post(ack_handler))
        .route("/nack/:firing_id", post(nack_handler))
        .route("/dead", get(dead_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(BrokerState { queue })
}

async fn publish_handler(
    State(state): State<BrokerState>,
    Json(firing): Json<NewFiring>,
) -> impl IntoResponse {
    match state.queue.publish(firing) {
        PublishOutcome::Created(id) => (StatusCode::OK, Json(PublishResponse { id })),
        PublishOutcome::Duplicate(id) => (StatusCode::CONFLICT, Json(PublishResponse { id })),
    }
}

#[derive(Debug, Deserialize)]
struct LeaseParams {
    consumer_id: String,
    #[serde(default)]
    wait_ms: u64,
}

async fn lease_handler(
    State(state): State<BrokerState>,
    Query(params): Query<LeaseParams>,
) -> impl IntoResponse {
    let wait = Duration::from_millis(params.wait_ms.min(MAX_LEASE_WAIT_MS));
    match state.queue.lease(&params.consumer_id, wait).await {
        Some(leased) => (StatusCode::OK, Json(leased)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn ack_handler(
    State(state): State<BrokerState>,
    Path(firing_id): Path<u64>,
    Json(request): Json<AckRequest>,
) -> impl IntoResponse {
    match state.queue.ack(firing_id, &request.lease_token) {
        AckOutcome::Acked => (StatusCode::OK, Json(json!({ "success": true }))),
        AckOutcome::Stale => (
            StatusCode::GONE,
            Json(json!({ "message": "lease token is no longer valid" })),
        ),
    }
}

async fn nack_handler(
    State(state): State<BrokerState>,
    Path(firing_id): Path<u64>,
    Json(request): Json<NackRequest>,
) -> impl IntoResponse {
    match state
        .queue
        .nack(firing_id, &request.lease_token, request.requeue, request.reason)
    {
        AckOutcome::Acked => (StatusCode::OK, Json(json!({ "success": true }))),
        AckOutcome::Stale => (
            StatusCode::GONE,
            Json(json!({ "message": "lease token is no longer valid" })),
        ),
    }
}

async fn dead_handler(State(state): State<BrokerState>) -> impl IntoResponse {
    Json(state.queue.list_dead())
}

async fn health_handler(State(state): State<BrokerState>) -> impl IntoResponse {
    let depth = state.queue.depth();
    Json(json!({
        "status": "ok",
        "pending": depth.pending,
        "leased": depth.leased,
        "dead": depth.dead,
    }))
}
