//! The worker pool: N cooperative slots over one broker handle.
//!
//! Each slot loops lease → resolve → invoke → report → ack/nack:
//!
//! ```text
//! slot
//!  ├─► FiringBroker::lease(consumer_id, poll_timeout)
//!  ├─► ActionRegistry::resolve(action_name, action_function)
//!  │       └─ unknown → nack(drop, "handler_not_found")
//!  ├─► handler(configuration, budget) under tokio::time::timeout
//!  ├─► RunSink::record_run (fire-and-forget, bounded retries)
//!  └─► ack on success / nack(requeue) on retryable failure or timeout
//! ```
//!
//! The broker enforces cross-worker exclusivity; within the process at most
//! `pool_size` firings run at once. Shutdown nacks the in-flight firing for
//! requeue and each slot exits within one poll cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use runinator_core::api::RunSink;
use runinator_core::broker::{AckOutcome, FiringBroker, LeasedFiring};
use runinator_core::handler::{ActionRegistry, HandlerOutcome};
use runinator_core::model::NewTaskRun;

use crate::report;

/// Ceiling for the per-slot error backoff.
pub const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent slots.
    pub pool_size: usize,
    /// How long each lease call waits for a firing.
    pub poll_timeout: Duration,
    /// Initial pause after a broker error; doubles per consecutive error up
    /// to [`MAX_ERROR_BACKOFF`].
    pub error_backoff: Duration,
    /// Consumer id prefix recorded on leases.
    pub consumer_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            poll_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            consumer_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl WorkerConfig {
    pub fn with_consumer_id(consumer_id: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            ..Default::default()
        }
    }
}

/// A pool of lease→run→report slots.
pub struct WorkerPool {
    broker: Arc<dyn FiringBroker>,
    registry: Arc<ActionRegistry>,
    runs: Arc<dyn RunSink>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn FiringBroker>,
        registry: Arc<ActionRegistry>,
        runs: Arc<dyn RunSink>,
    ) -> Self {
        Self::with_config(broker, registry, runs, WorkerConfig::default())
    }

    pub fn with_config(
        broker: Arc<dyn FiringBroker>,
        registry: Arc<ActionRegistry>,
        runs: Arc<dyn RunSink>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            registry,
            runs,
            config,
        }
    }

    /// Run all slots until the shutdown token fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            consumer_id = %self.config.consumer_id,
            pool_size = self.config.pool_size,
            "worker pool starting"
        );

        let pool = Arc::new(self);
        let mut handles = Vec::with_capacity(pool.config.pool_size);
        for slot in 0..pool.config.pool_size {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.run_slot(slot, shutdown).await;
            }));
        }
        futures::future::join_all(handles).await;
        info!("worker pool stopped");
    }

    async fn run_slot(&self, slot: usize, shutdown: CancellationToken) {
        let consumer_id = format!("{}/{}", self.config.consumer_id, slot);
        let mut backoff = self.config.error_backoff;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let leased = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.broker.lease(&consumer_id, self.config.poll_timeout) => result,
            };
            match leased {
                Ok(Some(leased)) => {
                    backoff = self.config.error_backoff;
                    self.process_firing(slot, leased, &shutdown).await;
                }
                Ok(None) => {
                    backoff = self.config.error_backoff;
                }
                Err(e) => {
                    warn!(slot, error = %e, "lease failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_ERROR_BACKOFF);
                }
            }
        }
    }

    /// Execute one leased firing through its handler and settle it with the
    /// broker.
    async fn process_firing(&self, slot: usize, leased: LeasedFiring, shutdown: &CancellationToken) {
        let firing = leased.firing;
        let token = leased.lease_token;
        debug!(
            slot,
            firing_id = firing.firing_id,
            task_id = firing.task_id,
            attempt = firing.attempt,
            action = %format!("{}/{}", firing.action_name, firing.action_function),
            "executing firing"
        );

        let Some(handler) = self
            .registry
            .resolve(&firing.action_name, &firing.action_function)
        else {
            warn!(
                firing_id = firing.firing_id,
                action_name = %firing.action_name,
                action_function = %firing.action_function,
                "no handler registered, dropping firing"
            );
            self.settle_nack(firing.firing_id, &token, false, "handler_not_found")
                .await;
            return;
        };

        let budget = Duration::from_millis(firing.timeout_ms.max(0) as u64);
        let started = Utc::now();
        let clock = tokio::time::Instant::now();

        let invocation = tokio::time::timeout(budget, handler(firing.configuration.clone(), budget));
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                // Hand the firing back rather than finishing it mid-shutdown;
                // dropping the invocation future tears down any child process.
                self.settle_nack(firing.firing_id, &token, true, "worker shutdown").await;
                return;
            }
            result = invocation => match result {
                Ok(outcome) => outcome,
                Err(_) => HandlerOutcome::Timeout,
            },
        };
        let duration_ms = clock.elapsed().as_millis() as i64;

        report::spawn_report(
            self.runs.clone(),
            NewTaskRun {
                task_id: firing.task_id,
                start_time: started,
                duration_ms,
            },
        );

        match outcome {
            HandlerOutcome::Success { stdout } => {
                debug!(
                    firing_id = firing.firing_id,
                    duration_ms,
                    stdout_len = stdout.as_ref().map(|s| s.len()).unwrap_or(0),
                    "handler succeeded"
                );
                match self.broker.ack(firing.firing_id, &token).await {
                    Ok(AckOutcome::Acked) => {}
                    Ok(AckOutcome::Stale) => {
                        warn!(firing_id = firing.firing_id, "ack rejected, lease was reassigned");
                    }
                    Err(e) => error!(firing_id = firing.firing_id, error = %e, "ack failed"),
                }
            }
            HandlerOutcome::Failure { message, retryable } => {
                warn!(
                    firing_id = firing.firing_id,
                    retryable,
                    error = %message,
                    "handler failed"
                );
                self.settle_nack(firing.firing_id, &token, retryable, &message)
                    .await;
            }
            HandlerOutcome::Timeout => {
                warn!(
                    firing_id = firing.firing_id,
                    timeout_ms = firing.timeout_ms,
                    "handler timed out"
                );
                self.settle_nack(firing.firing_id, &token, true, "timeout")
                    .await;
            }
        }
    }

    async fn settle_nack(&self, firing_id: u64, token: &str, requeue: bool, reason: &str) {
        match self
            .broker
            .nack(firing_id, token, requeue, Some(reason.to_string()))
            .await
        {
            Ok(AckOutcome::Acked) => {}
            Ok(AckOutcome::Stale) => {
                warn!(firing_id, "nack rejected, lease was reassigned");
            }
            Err(e) => error!(firing_id, error = %e, "nack failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runinator_broker::FiringQueue;
    use runinator_core::api::TestApi;
    use runinator_core::model::NewFiring;

    fn firing(task_id: i64, timeout_ms: i64) -> NewFiring {
        NewFiring {
            task_id,
            scheduled_for: Utc::now(),
            attempt: 0,
            action_name: "Test".to_string(),
            action_function: "probe".to_string(),
            configuration: Vec::new(),
            timeout_ms,
        }
    }

    async fn drive_pool(
        queue: Arc<FiringQueue>,
        registry: ActionRegistry,
        api: Arc<TestApi>,
    ) -> CancellationToken {
        let pool = WorkerPool::with_config(
            queue,
            Arc::new(registry),
            api,
            WorkerConfig {
                pool_size: 1,
                poll_timeout: Duration::from_millis(50),
                error_backoff: Duration::from_millis(10),
                consumer_id: "test-worker".to_string(),
            },
        );
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { pool.run(token).await });
        shutdown
    }

    async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_success_is_acked_and_run_recorded() {
        let queue = Arc::new(FiringQueue::new());
        let api = Arc::new(TestApi::new());
        let mut registry = ActionRegistry::new();
        registry.register("Test", "probe", |_c, _b| async {
            HandlerOutcome::Success { stdout: None }
        });

        queue.publish(firing(1, 1_000));
        let shutdown = drive_pool(queue.clone(), registry, api.clone()).await;

        assert!(wait_until(|| !api.runs().is_empty()).await);
        assert!(wait_until(|| {
            let depth = queue.depth();
            depth.pending == 0 && depth.leased == 0
        })
        .await);
        assert!(queue.list_dead().is_empty());
        assert_eq!(api.runs()[0].task_id, 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_timeout_outcome_requeues() {
        let queue = Arc::new(FiringQueue::with_max_attempts(0));
        let api = Arc::new(TestApi::new());
        let mut registry = ActionRegistry::new();
        registry.register("Test", "probe", |_c, _b| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            HandlerOutcome::Success { stdout: None }
        });

        // A 1 ms budget against a 1 s handler: Timeout, requeued, and with
        // zero allowed attempts the requeue dead-letters it.
        queue.publish(firing(1, 1));
        let shutdown = drive_pool(queue.clone(), registry, api.clone()).await;

        assert!(wait_until(|| !queue.list_dead().is_empty()).await);
        let dead = queue.list_dead();
        assert!(dead[0].reason.starts_with("timeout"));
        // The timed-out invocation still produced a run record.
        assert!(wait_until(|| !api.runs().is_empty()).await);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_handler_drops_without_a_run() {
        let queue = Arc::new(FiringQueue::new());
        let api = Arc::new(TestApi::new());
        let registry = ActionRegistry::new();

        queue.publish(firing(1, 1_000));
        let shutdown = drive_pool(queue.clone(), registry, api.clone()).await;

        assert!(wait_until(|| !queue.list_dead().is_empty()).await);
        assert_eq!(queue.list_dead()[0].reason, "handler_not_found");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(api.runs().is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_retryable_failure_exhausts_to_dead() {
        let queue = Arc::new(FiringQueue::with_max_attempts(2));
        let api = Arc::new(TestApi::new());
        let mut registry = ActionRegistry::new();
        registry.register("Test", "probe", |_c, _b| async {
            HandlerOutcome::Failure {
                message: "flaky dependency".to_string(),
                retryable: true,
            }
        });

        queue.publish(firing(1, 1_000));
        let shutdown = drive_pool(queue.clone(), registry, api.clone()).await;

        assert!(wait_until(|| !queue.list_dead().is_empty()).await);
        let dead = queue.list_dead();
        assert_eq!(dead[0].firing.attempt, 3);
        // One run per attempt.
        assert!(wait_until(|| api.runs().len() >= 3).await);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_non_retryable_failure_drops_immediately() {
        let queue = Arc::new(FiringQueue::new());
        let api = Arc::new(TestApi::new());
        let mut registry = ActionRegistry::new();
        registry.register("Test", "probe", |_c, _b| async {
            HandlerOutcome::Failure {
                message: "bad configuration".to_string(),
                retryable: false,
            }
        });

        queue.publish(firing(1, 1_000));
        let shutdown = drive_pool(queue.clone(), registry, api.clone()).await;

        assert!(wait_until(|| !queue.list_dead().is_empty()).await);
        assert_eq!(queue.list_dead()[0].firing.attempt, 0);
        assert_eq!(queue.list_dead()[0].reason, "bad configuration");
        shutdown.cancel();
    }
}
