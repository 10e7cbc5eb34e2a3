//! The claim-once broker contract and its HTTP binding.
//!
//! `FiringBroker` is the logical queue every producer and consumer codes
//! against. Two bindings exist: the in-memory queue in the `broker` package
//! (embedded in tests and single-process setups) and [`HttpBroker`] here,
//! which speaks the broker binary's control plane.
//!
//! Publishing is idempotent on `(task_id, scheduled_for)` for as long as the
//! firing is not terminal, so a slow scheduler tick cannot double-queue.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::api::Endpoint;
use crate::error::RuninatorError;
use crate::model::{Firing, NewFiring};

/// Outcome of a publish: either a fresh firing or the idempotency hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A new firing was enqueued.
    Created(u64),
    /// A live firing with the same `(task_id, scheduled_for)` already
    /// exists; its id is returned and nothing was enqueued.
    Duplicate(u64),
}

impl PublishOutcome {
    /// The firing id regardless of which way the publish went.
    pub fn firing_id(&self) -> u64 {
        match self {
            PublishOutcome::Created(id) | PublishOutcome::Duplicate(id) => *id,
        }
    }
}

/// Outcome of an ack or nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The token matched and the state transition happened.
    Acked,
    /// The token no longer matches (the lease expired and was reassigned);
    /// nothing was mutated.
    Stale,
}

/// A firing handed to a worker together with its lease token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedFiring {
    pub firing: Firing,
    pub lease_token: String,
}

/// The logical broker: publish, lease, ack, nack.
///
/// At any instant at most one live lease exists per firing; the lease is
/// identified by an opaque token minted per lease, so an ack from a worker
/// whose lease was swept and reassigned is rejected as [`AckOutcome::Stale`].
#[async_trait]
pub trait FiringBroker: Send + Sync {
    /// Enqueue a firing, idempotent on `(task_id, scheduled_for)`.
    async fn publish(&self, firing: NewFiring) -> Result<PublishOutcome, RuninatorError>;

    /// Claim the next pending firing, waiting up to `max_wait` for one to
    /// appear. Ordering is FIFO by `(scheduled_for, publish order)`.
    async fn lease(
        &self,
        consumer_id: &str,
        max_wait: Duration,
    ) -> Result<Option<LeasedFiring>, RuninatorError>;

    /// Remove a leased firing iff the token matches.
    async fn ack(&self, firing_id: u64, lease_token: &str) -> Result<AckOutcome, RuninatorError>;

    /// Return a leased firing to the queue (`requeue`) or drop it with a
    /// recorded reason, iff the token matches.
    async fn nack(
        &self,
        firing_id: u64,
        lease_token: &str,
        requeue: bool,
        reason: Option<String>,
    ) -> Result<AckOutcome, RuninatorError>;
}

// Wire types shared by the control plane and this client.

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckRequest {
    pub lease_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NackRequest {
    pub lease_token: String,
    pub requeue: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// HTTP binding of [`FiringBroker`] against the broker binary.
///
/// The endpoint is either a fixed `--broker-endpoint` URL or the freshest
/// broker announcement from gossip.
#[derive(Debug, Clone)]
pub struct HttpBroker {
    client: reqwest::Client,
    endpoint: Endpoint,
}

impl HttpBroker {
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
}

#[async_trait]
impl FiringBroker for HttpBroker {
    async fn publish(&self, firing: NewFiring) -> Result<PublishOutcome, RuninatorError> {
        let response = self
            .client
            .post(self.url("publish")?)
            .json(&firing)
            .send()
            .await?;
        let status = response.status();
        match status.as_u16() {
            200 => Ok(PublishOutcome::Created(
                response.json::<PublishResponse>().await?.id,
            )),
            409 => Ok(PublishOutcome::Duplicate(
                response.json::<PublishResponse>().await?.id,
            )),
            _ => Err(remote_error(response).await),
        }
    }

    async fn lease(
        &self,
        consumer_id: &str,
        max_wait: Duration,
    ) -> Result<Option<LeasedFiring>, RuninatorError> {
        let response = self
            .client
            .post(self.url("lease")?)
            .query(&[
                ("consumer_id", consumer_id.to_string()),
                ("wait_ms", max_wait.as_millis().to_string()),
            ])
            // The server holds the request open for up to `max_wait`; give
            // the transport room on top of it.
            .timeout(max_wait + Duration::from_secs(10))
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(Some(response.json::<LeasedFiring>().await?)),
            204 => Ok(None),
            _ => Err(remote_error(response).await),
        }
    }

    async fn ack(&self, firing_id: u64, lease_token: &str) -> Result<AckOutcome, RuninatorError> {
        let response = self
            .client
            .post(self.url(&format!("ack/{firing_id}"))?)
            .json(&AckRequest {
                lease_token: lease_token.to_string(),
            })
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(AckOutcome::Acked),
            410 => Ok(AckOutcome::Stale),
            _ => Err(remote_error(response).await),
        }
    }

    async fn nack(
        &self,
        firing_id: u64,
        lease_token: &str,
        requeue: bool,
        reason: Option<String>,
    ) -> Result<AckOutcome, RuninatorError> {
        let response = self
            .client
            .post(self.url(&format!("nack/{firing_id}"))?)
            .json(&NackRequest {
                lease_token: lease_token.to_string(),
                requeue,
                reason,
            })
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(AckOutcome::Acked),
            410 => Ok(AckOutcome::Stale),
            _ => Err(remote_error(response).await),
        }
    }
}

/// Turn a non-success reply into `RuninatorError::Remote`, pulling the
/// `{"message": ...}` body when there is one.
pub(crate) async fn remote_error(response: reqwest::Response) -> RuninatorError {
    let status = response.status().as_u16();
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.message,
        Err(_) => "no error detail".to_string(),
    };
    RuninatorError::Remote { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_outcome_id() {
        assert_eq!(PublishOutcome::Created(4).firing_id(), 4);
        assert_eq!(PublishOutcome::Duplicate(9).firing_id(), 9);
    }

    #[test]
    fn test_nack_request_omits_missing_reason() {
        let json = serde_json::to_value(NackRequest {
            lease_token: "t".into(),
            requeue: true,
            reason: None,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "lease_token": "t", "requeue": true })
        );
    }
}
