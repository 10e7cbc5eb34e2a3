//! The in-memory claim-once firing queue.
//!
//! One mutex guards all queue state and is held only to mutate it; the
//! blocking part of `lease` waits on a `Notify` outside the lock. Firings
//! move `PENDING → LEASED → removed`, back to `PENDING` on requeue or lease
//! expiry, or to the dead bucket once their attempts run out.
//!
//! ```text
//! PENDING --lease--> LEASED --ack--> (removed)
//! LEASED --nack(requeue)/sweep--> PENDING
//! LEASED --nack(drop)/attempts exhausted--> DEAD
//! ```
//!
//! Publishing is idempotent on `(task_id, scheduled_for)` for as long as
//! that firing is live (pending or leased), so concurrent or repeated
//! scheduler ticks collapse to one enqueued firing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use runinator_core::broker::{AckOutcome, FiringBroker, LeasedFiring, PublishOutcome};
use runinator_core::error::RuninatorError;
use runinator_core::model::{DeadFiring, Firing, NewFiring};

/// Floor for lease durations, so a task with a tiny timeout still gets a
/// workable lease.
pub const MIN_LEASE_MS: i64 = 1_000;
/// Slack added on top of the handler timeout before a lease is considered
/// abandoned.
pub const LEASE_GRACE_MS: i64 = 5_000;
/// How often the sweeper reclaims expired leases.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Attempts after which a firing is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Queue depth snapshot for health reporting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueDepth {
    pub pending: usize,
    pub leased: usize,
    pub dead: usize,
}

/// FIFO position: earlier scheduled wins, publish order breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingKey {
    scheduled_for: i64,
    seq: u64,
}

struct Lease {
    firing: Firing,
    seq: u64,
    token: Uuid,
    deadline: DateTime<Utc>,
    consumer_id: String,
}

#[derive(Default)]
struct QueueState {
    next_firing_id: u64,
    next_seq: u64,
    pending: BTreeMap<PendingKey, Firing>,
    live_keys: HashMap<(i64, i64), u64>,
    leased: HashMap<u64, Lease>,
    dead: Vec<DeadFiring>,
}

/// The claim-once queue. Cheap to share behind an `Arc`.
pub struct FiringQueue {
    max_attempts: u32,
    min_lease_ms: i64,
    grace_ms: i64,
    state: Mutex<QueueState>,
    available: Notify,
}

impl FiringQueue {
    pub fn new() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_lease_ms: MIN_LEASE_MS,
            grace_ms: LEASE_GRACE_MS,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    /// Override the lease floor and grace period.
    pub fn with_lease_bounds(mut self, min_lease_ms: i64, grace_ms: i64) -> Self {
        self.min_lease_ms = min_lease_ms;
        self.grace_ms = grace_ms;
        self
    }

    /// Enqueue a firing, idempotent on `(task_id, scheduled_for)`.
    pub fn publish(&self, firing: NewFiring) -> PublishOutcome {
        let key = (firing.task_id, firing.scheduled_for.timestamp());
        let mut state = self.state.lock().unwrap();

        if let Some(&existing) = state.live_keys.get(&key) {
            debug!(
                task_id = firing.task_id,
                scheduled_for = %firing.scheduled_for,
                firing_id = existing,
                "duplicate publish collapsed"
            );
            return PublishOutcome::Duplicate(existing);
        }

        state.next_firing_id += 1;
        state.next_seq += 1;
        let firing_id = state.next_firing_id;
        let seq = state.next_seq;

        let firing = Firing {
            firing_id,
            task_id: firing.task_id,
            scheduled_for: firing.scheduled_for,
            attempt: firing.attempt,
            action_name: firing.action_name,
            action_function: firing.action_function,
            configuration: firing.configuration,
            timeout_ms: firing.timeout_ms,
        };
        state.live_keys.insert(key, firing_id);
        state.pending.insert(
            PendingKey {
                scheduled_for: firing.scheduled_for.timestamp(),
                seq,
            },
            firing,
        );
        drop(state);

        self.available.notify_one();
        PublishOutcome::Created(firing_id)
    }

    /// Claim the next pending firing without waiting.
    pub fn try_lease(&self, consumer_id: &str) -> Option<LeasedFiring> {
        let mut state = self.state.lock().unwrap();
        let (&key, _) = state.pending.first_key_value()?;
        let firing = state.pending.remove(&key).unwrap();

        let token = Uuid::new_v4();
        let lease_ms = firing.timeout_ms.max(self.min_lease_ms) + self.grace_ms;
        let deadline = Utc::now() + chrono::Duration::milliseconds(lease_ms);
        let leased = LeasedFiring {
            firing: firing.clone(),
            lease_token: token.to_string(),
        };
        state.leased.insert(
            firing.firing_id,
            Lease {
                firing,
                seq: key.seq,
                token,
                deadline,
                consumer_id: consumer_id.to_string(),
            },
        );
        let more_pending = !state.pending.is_empty();
        drop(state);

        if more_pending {
            // Pass the wakeup on so a concurrent waiter is not stranded.
            self.available.notify_one();
        }
        Some(leased)
    }

    /// Claim the next pending firing, waiting up to `max_wait` for one.
    pub async fn lease(&self, consumer_id: &str, max_wait: Duration) -> Option<LeasedFiring> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(leased) = self.try_lease(consumer_id) {
                return Some(leased);
            }
            let notified = self.available.notified();
            // A publish may have landed between the check and registering
            // the waiter.
            if let Some(leased) = self.try_lease(consumer_id) {
                return Some(leased);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.try_lease(consumer_id);
                }
            }
        }
    }

    /// Remove a leased firing iff the token matches.
    pub fn ack(&self, firing_id: u64, lease_token: &str) -> AckOutcome {
        let mut state = self.state.lock().unwrap();
        let Some(lease) = state.leased.get(&firing_id) else {
            return AckOutcome::Stale;
        };
        if !token_matches(&lease.token, lease_token) {
            return AckOutcome::Stale;
        }
        let lease = state.leased.remove(&firing_id).unwrap();
        state
            .live_keys
            .remove(&(lease.firing.task_id, lease.firing.scheduled_for.timestamp()));
        debug!(firing_id, consumer_id = %lease.consumer_id, "firing acked");
        AckOutcome::Acked
    }

    /// Requeue or drop a leased firing iff the token matches.
    pub fn nack(
        &self,
        firing_id: u64,
        lease_token: &str,
        requeue: bool,
        reason: Option<String>,
    ) -> AckOutcome {
        let mut state = self.state.lock().unwrap();
        let Some(lease) = state.leased.get(&firing_id) else {
            return AckOutcome::Stale;
        };
        if !token_matches(&lease.token, lease_token) {
            return AckOutcome::Stale;
        }
        let lease = state.leased.remove(&firing_id).unwrap();

        if requeue {
            let reason = reason.unwrap_or_else(|| "requeued by consumer".to_string());
            let requeued =
                Self::requeue_or_bury(&mut state, lease.firing, lease.seq, self.max_attempts, reason);
            drop(state);
            if requeued {
                self.available.notify_one();
            }
        } else {
            let reason = reason.unwrap_or_else(|| "dropped by consumer".to_string());
            warn!(firing_id, reason = %reason, "firing dropped");
            Self::bury(&mut state, lease.firing, reason);
        }
        AckOutcome::Acked
    }

    /// Reclaim expired leases; returns how many were touched.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let expired: Vec<u64> = state
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline < now)
            .map(|(&id, _)| id)
            .collect();

        let mut requeued_any = false;
        for firing_id in &expired {
            let lease = state.leased.remove(firing_id).unwrap();
            info!(
                firing_id,
                consumer_id = %lease.consumer_id,
                "lease expired, reclaiming firing"
            );
            requeued_any |= Self::requeue_or_bury(
                &mut state,
                lease.firing,
                lease.seq,
                self.max_attempts,
                "lease expired".to_string(),
            );
        }
        let count = expired.len();
        drop(state);

        if requeued_any {
            self.available.notify_one();
        }
        count
    }

    /// Dead firings, oldest first.
    pub fn list_dead(&self) -> Vec<DeadFiring> {
        self.state.lock().unwrap().dead.clone()
    }

    pub fn depth(&self) -> QueueDepth {
        let state = self.state.lock().unwrap();
        QueueDepth {
            pending: state.pending.len(),
            leased: state.leased.len(),
            dead: state.dead.len(),
        }
    }

    /// Bump the attempt and either return the firing to PENDING or bury it.
    /// Returns true when it went back to PENDING.
    fn requeue_or_bury(
        state: &mut QueueState,
        mut firing: Firing,
        seq: u64,
        max_attempts: u32,
        reason: String,
    ) -> bool {
        firing.attempt += 1;
        if firing.attempt > max_attempts {
            warn!(
                firing_id = firing.firing_id,
                attempt = firing.attempt,
                "attempts exhausted, dead-lettering"
            );
            Self::bury(state, firing, format!("{reason} (attempts exhausted)"));
            return false;
        }
        let key = PendingKey {
            scheduled_for: firing.scheduled_for.timestamp(),
            seq,
        };
        state.pending.insert(key, firing);
        true
    }

    fn bury(state: &mut QueueState, firing: Firing, reason: String) {
        state
            .live_keys
            .remove(&(firing.task_id, firing.scheduled_for.timestamp()));
        state.dead.push(DeadFiring {
            firing,
            reason,
            failed_at: Utc::now(),
        });
    }
}

impl Default for FiringQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `sweep` every `interval` until shutdown.
pub async fn sweep_loop(
    queue: std::sync::Arc<FiringQueue>,
    interval: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                queue.sweep();
            }
        }
    }
}

fn token_matches(expected: &Uuid, provided: &str) -> bool {
    let Ok(provided) = Uuid::parse_str(provided) else {
        return false;
    };
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

#[async_trait]
impl FiringBroker for FiringQueue {
    async fn publish(&self, firing: NewFiring) -> Result<PublishOutcome, RuninatorError> {
        Ok(FiringQueue::publish(self, firing))
    }

    async fn lease(
        &self,
        consumer_id: &str,
        max_wait: Duration,
    ) -> Result<Option<LeasedFiring>, RuninatorError> {
        Ok(FiringQueue::lease(self, consumer_id, max_wait).await)
    }

    async fn ack(&self, firing_id: u64, lease_token: &str) -> Result<AckOutcome, RuninatorError> {
        Ok(FiringQueue::ack(self, firing_id, lease_token))
    }

    async fn nack(
        &self,
        firing_id: u64,
        lease_token: &str,
        requeue: bool,
        reason: Option<String>,
    ) -> Result<AckOutcome, RuninatorError> {
        Ok(FiringQueue::nack(self, firing_id, lease_token, requeue, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn firing_for(task_id: i64, scheduled_secs: i64) -> NewFiring {
        NewFiring {
            task_id,
            scheduled_for: Utc.timestamp_opt(scheduled_secs, 0).unwrap(),
            attempt: 0,
            action_name: "Console".to_string(),
            action_function: "run_console".to_string(),
            configuration: b"echo hi".to_vec(),
            timeout_ms: 1_000,
        }
    }

    #[test]
    fn test_publish_then_try_lease() {
        let queue = FiringQueue::new();
        let id = match queue.publish(firing_for(1, 100)) {
            PublishOutcome::Created(id) => id,
            other => panic!("expected Created, got {other:?}"),
        };
        let leased = queue.try_lease("w1").unwrap();
        assert_eq!(leased.firing.firing_id, id);
        assert_eq!(leased.firing.task_id, 1);
        assert!(!leased.lease_token.is_empty());
    }

    #[test]
    fn test_duplicate_publish_is_collapsed() {
        let queue = FiringQueue::new();
        let first = queue.publish(firing_for(1, 100));
        let second = queue.publish(firing_for(1, 100));
        assert!(matches!(first, PublishOutcome::Created(_)));
        assert_eq!(second, PublishOutcome::Duplicate(first.firing_id()));
        assert_eq!(queue.depth().pending, 1);
    }

    #[test]
    fn test_idempotency_key_survives_lease_but_not_ack() {
        let queue = FiringQueue::new();
        queue.publish(firing_for(1, 100));
        let leased = queue.try_lease("w1").unwrap();

        // Still live while leased.
        assert!(matches!(
            queue.publish(firing_for(1, 100)),
            PublishOutcome::Duplicate(_)
        ));

        assert_eq!(
            queue.ack(leased.firing.firing_id, &leased.lease_token),
            AckOutcome::Acked
        );
        // Terminal: the same key may be published again.
        assert!(matches!(
            queue.publish(firing_for(1, 100)),
            PublishOutcome::Created(_)
        ));
    }

    #[test]
    fn test_lease_order_is_scheduled_then_publish_order() {
        let queue = FiringQueue::new();
        queue.publish(firing_for(1, 200));
        queue.publish(firing_for(2, 100));
        queue.publish(firing_for(3, 200));

        let order: Vec<i64> = (0..3)
            .map(|_| queue.try_lease("w1").unwrap().firing.task_id)
            .collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn test_at_most_one_lease_per_firing() {
        let queue = FiringQueue::new();
        queue.publish(firing_for(1, 100));
        assert!(queue.try_lease("w1").is_some());
        assert!(queue.try_lease("w2").is_none());
    }

    #[test]
    fn test_ack_with_wrong_token_is_stale_and_mutates_nothing() {
        let queue = FiringQueue::new();
        queue.publish(firing_for(1, 100));
        let leased = queue.try_lease("w1").unwrap();

        let bogus = Uuid::new_v4().to_string();
        assert_eq!(queue.ack(leased.firing.firing_id, &bogus), AckOutcome::Stale);
        assert_eq!(queue.ack(leased.firing.firing_id, "not-a-token"), AckOutcome::Stale);
        assert_eq!(queue.depth().leased, 1);

        assert_eq!(
            queue.ack(leased.firing.firing_id, &leased.lease_token),
            AckOutcome::Acked
        );
        assert_eq!(queue.depth().leased, 0);
    }

    #[test]
    fn test_nack_requeue_bumps_attempt() {
        let queue = FiringQueue::new();
        queue.publish(firing_for(1, 100));
        let leased = queue.try_lease("w1").unwrap();
        assert_eq!(leased.firing.attempt, 0);

        queue.nack(leased.firing.firing_id, &leased.lease_token, true, None);
        let again = queue.try_lease("w1").unwrap();
        assert_eq!(again.firing.firing_id, leased.firing.firing_id);
        assert_eq!(again.firing.attempt, 1);
    }

    #[test]
    fn test_nack_drop_goes_dead_with_reason() {
        let queue = FiringQueue::new();
        queue.publish(firing_for(1, 100));
        let leased = queue.try_lease("w1").unwrap();

        queue.nack(
            leased.firing.firing_id,
            &leased.lease_token,
            false,
            Some("handler_not_found".to_string()),
        );
        let dead = queue.list_dead();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "handler_not_found");
        assert_eq!(queue.depth().pending, 0);
    }

    #[test]
    fn test_attempts_exhaust_into_dead() {
        let queue = FiringQueue::with_max_attempts(2);
        queue.publish(firing_for(1, 100));

        // attempt goes 0 -> 1 -> 2 -> (3 > 2) dead
        for _ in 0..2 {
            let leased = queue.try_lease("w1").unwrap();
            queue.nack(leased.firing.firing_id, &leased.lease_token, true, None);
        }
        let leased = queue.try_lease("w1").unwrap();
        assert_eq!(leased.firing.attempt, 2);
        queue.nack(leased.firing.firing_id, &leased.lease_token, true, None);

        assert!(queue.try_lease("w1").is_none());
        let dead = queue.list_dead();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].firing.attempt, 3);
    }

    #[test]
    fn test_sweep_reclaims_expired_leases() {
        // Zero lease bounds make the lease deadline the lease instant
        // itself, so the next sweep sees it as expired.
        let queue = FiringQueue::new().with_lease_bounds(0, 0);
        let mut firing = firing_for(1, 100);
        firing.timeout_ms = 0;
        queue.publish(firing);

        let leased = queue.try_lease("w1").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.sweep(), 1);

        // Back to PENDING with a bumped attempt; the old token is stale.
        assert_eq!(
            queue.ack(leased.firing.firing_id, &leased.lease_token),
            AckOutcome::Stale
        );
        let again = queue.try_lease("w2").unwrap();
        assert_eq!(again.firing.attempt, 1);
    }

    #[test]
    fn test_sweep_leaves_live_leases_alone() {
        let queue = FiringQueue::new();
        queue.publish(firing_for(1, 100));
        let leased = queue.try_lease("w1").unwrap();

        assert_eq!(queue.sweep(), 0);
        assert_eq!(
            queue.ack(leased.firing.firing_id, &leased.lease_token),
            AckOutcome::Acked
        );
    }

    #[tokio::test]
    async fn test_lease_waits_for_publish() {
        let queue = std::sync::Arc::new(FiringQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.lease("w1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.publish(firing_for(1, 100));

        let leased = waiter.await.unwrap();
        assert!(leased.is_some());
    }

    #[tokio::test]
    async fn test_lease_times_out_empty() {
        let queue = FiringQueue::new();
        let leased = queue.lease("w1", Duration::from_millis(50)).await;
        assert!(leased.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_leases_hand_out_distinct_firings() {
        let queue = std::sync::Arc::new(FiringQueue::new());
        for task_id in 0..8 {
            queue.publish(firing_for(task_id, 100));
        }

        let mut handles = Vec::new();
        for slot in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .lease(&format!("w{slot}"), Duration::from_secs(1))
                    .await
                    .map(|l| l.firing.firing_id)
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            if let Some(id) = handle.await.unwrap() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        let before = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), before, "a firing was leased twice");
        assert_eq!(ids.len(), 8);
    }
}
