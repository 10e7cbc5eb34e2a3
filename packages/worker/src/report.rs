//! Run reporting with bounded retries.
//!
//! Reporting is fire-and-forget from the slot's point of view: the post
//! happens on its own task so a slow web service never blocks the ack. The
//! initial attempt is followed by at most three retries at 100 ms, 500 ms,
//! and 2 s; after that the failure is logged and the record is gone.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use runinator_core::api::RunSink;
use runinator_core::model::NewTaskRun;

/// Delays between retry attempts.
pub const REPORT_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
];

/// Post a run record on a detached task.
pub fn spawn_report(runs: Arc<dyn RunSink>, run: NewTaskRun) {
    tokio::spawn(async move {
        report_with_retries(runs.as_ref(), run).await;
    });
}

/// Post a run record, retrying per [`REPORT_BACKOFF`]. Returns whether the
/// record made it.
pub async fn report_with_retries(runs: &dyn RunSink, run: NewTaskRun) -> bool {
    let mut retries = 0;
    loop {
        match runs.record_run(run.clone()).await {
            Ok(()) => return true,
            Err(e) if retries < REPORT_BACKOFF.len() => {
                warn!(
                    task_id = run.task_id,
                    retry = retries + 1,
                    error = %e,
                    "run report failed, retrying"
                );
                tokio::time::sleep(REPORT_BACKOFF[retries]).await;
                retries += 1;
            }
            Err(e) => {
                error!(
                    task_id = run.task_id,
                    error = %e,
                    "run report failed after all retries, dropping record"
                );
                return false;
            }
        }
    }
}
