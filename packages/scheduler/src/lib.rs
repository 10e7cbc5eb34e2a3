//! The scheduler: a single cooperative tick loop.
//!
//! Each tick loads the enabled tasks whose `next_execution` has arrived,
//! publishes one firing per task to the broker, and advances
//! `next_execution` past now. Publish and persist failures leave the task
//! untouched so the next tick retries it; an idempotency hit at the broker
//! counts as success.
//!
//! ```text
//! SchedulerService (every SCHEDULER_TICK)
//!     │
//!     ├─► TaskSource::due_tasks(now)
//!     ├─► FiringBroker::publish(firing) per task, oldest slot first
//!     └─► TaskSource::advance_task(id, next slot > now)
//! ```
//!
//! Catch-up: a task whose `next_execution` is far in the past fires once
//! for the most recent elapsed slot and then jumps to the next future slot.
//! Missed slots are not backfilled; a scheduler returning from hours of
//! downtime must not flood the broker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use runinator_core::api::TaskSource;
use runinator_core::broker::FiringBroker;
use runinator_core::cron::CronSchedule;
use runinator_core::model::{NewFiring, ScheduledTask};

/// Default tick cadence.
pub const SCHEDULER_TICK: Duration = Duration::from_secs(1);
/// Ceiling for the error backoff between ticks.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Configuration for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to look for due tasks.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: SCHEDULER_TICK,
        }
    }
}

/// The tick loop over a task source and a broker.
pub struct SchedulerService {
    tasks: Arc<dyn TaskSource>,
    broker: Arc<dyn FiringBroker>,
    config: SchedulerConfig,
}

impl SchedulerService {
    pub fn new(tasks: Arc<dyn TaskSource>, broker: Arc<dyn FiringBroker>) -> Self {
        Self::with_config(tasks, broker, SchedulerConfig::default())
    }

    pub fn with_config(
        tasks: Arc<dyn TaskSource>,
        broker: Arc<dyn FiringBroker>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            tasks,
            broker,
            config,
        }
    }

    /// Run until the shutdown token fires. A failing tick backs off
    /// exponentially up to [`MAX_BACKOFF`] and never terminates the loop.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "scheduler starting"
        );
        let mut delay = self.config.tick_interval;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.tick(Utc::now()).await {
                Ok(published) => {
                    if published > 0 {
                        debug!(published, "tick complete");
                    }
                    delay = self.config.tick_interval;
                }
                Err(e) => {
                    error!(error = %e, "tick failed");
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
        info!("scheduler stopped");
    }

    /// One pass: publish every due task's firing and advance it.
    ///
    /// Returns how many firings were published. Per-task failures are
    /// logged and skipped so one broken task cannot starve the rest; only a
    /// failure to load the task list is returned as a tick error.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, runinator_core::RuninatorError> {
        let mut due = self.tasks.due_tasks(now).await?;
        due.sort_by_key(|t| t.next_execution);

        let mut published = 0;
        for task in due {
            match self.fire_task(&task, now).await {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!(task_id = task.id, task = %task.name, error = %e, "task not advanced, will retry next tick");
                }
            }
        }
        Ok(published)
    }

    async fn fire_task(
        &self,
        task: &ScheduledTask,
        now: DateTime<Utc>,
    ) -> Result<(), runinator_core::RuninatorError> {
        let schedule = CronSchedule::parse(&task.cron_schedule)?;
        let stored = task.next_execution.unwrap_or(now);
        let (slot, next) = catch_up(&schedule, stored, now);

        let outcome = self
            .broker
            .publish(NewFiring::for_task(task, slot))
            .await?;
        debug!(
            task_id = task.id,
            scheduled_for = %slot,
            firing_id = outcome.firing_id(),
            "firing published"
        );

        // Only a persisted advance moves the task forward; if this fails
        // the broker's idempotent publish absorbs the re-fire next tick.
        self.tasks.advance_task(task.id, next).await
    }
}

/// Resolve the catch-up policy for a task due at `stored`.
///
/// Returns `(slot, next)`: the single slot to fire now (the most recent
/// elapsed one) and the first slot strictly after `now` to store back.
pub fn catch_up(
    schedule: &CronSchedule,
    stored: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let mut slot = stored;
    loop {
        let next = schedule.next_after(slot);
        if next > now {
            return (slot, next);
        }
        slot = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 16, h, mi, 0).unwrap()
    }

    #[test]
    fn test_catch_up_recent_slot_advances_one_step() {
        let schedule = CronSchedule::parse("*/1 * * * *").unwrap();
        let (slot, next) = catch_up(&schedule, at(12, 0), at(12, 0));
        assert_eq!(slot, at(12, 0));
        assert_eq!(next, at(12, 1));
    }

    #[test]
    fn test_catch_up_skips_missed_slots() {
        let schedule = CronSchedule::parse("*/1 * * * *").unwrap();
        // Due at 10:00 but it is already 12:30:00: fire only the most
        // recent slot and continue from there.
        let (slot, next) = catch_up(&schedule, at(10, 0), at(12, 30));
        assert_eq!(slot, at(12, 30));
        assert_eq!(next, at(12, 31));
    }

    #[test]
    fn test_catch_up_most_recent_slot_is_before_now_when_between_slots() {
        let schedule = CronSchedule::parse("0 */2 * * *").unwrap();
        let (slot, next) = catch_up(&schedule, at(2, 0), at(13, 15));
        assert_eq!(slot, at(12, 0));
        assert_eq!(next, at(14, 0));
    }
}
