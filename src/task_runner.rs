//! Polling-Worker Loop
//!
//! Shared driver for background workers that poll durable state (the
//! quarantine retry worker). Successful iterations run on a fixed cadence;
//! failing iterations back off exponentially up to a cap, then keep trying.
//! Workers are long-lived by contract: a burst of failures slows the loop
//! down but never kills it.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct WorkerSchedule {
    /// Delay between successful iterations.
    pub poll_interval: Duration,
    /// First backoff delay after a failed iteration.
    pub initial_retry_delay: Duration,
    /// Backoff cap.
    pub max_retry_delay: Duration,
    /// Consecutive failures before logging escalates from warn to error.
    pub failures_before_escalation: u32,
}

impl Default for WorkerSchedule {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            initial_retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(60),
            failures_before_escalation: 5,
        }
    }
}

/// Run one iteration function forever under the given schedule.
///
/// The iteration reports `Err(reason)` for a failed pass; the loop applies
/// backoff and continues. State (backoff delay, failure streak) resets on
/// the first success.
pub async fn run_polling_worker<F, Fut>(worker_name: &str, schedule: WorkerSchedule, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut retry_delay = schedule.initial_retry_delay;
    let mut consecutive_failures: u32 = 0;

    loop {
        match tick().await {
            Ok(()) => {
                if consecutive_failures > 0 {
                    warn!(
                        "Worker '{}' recovered after {} failed iterations",
                        worker_name, consecutive_failures
                    );
                }
                consecutive_failures = 0;
                retry_delay = schedule.initial_retry_delay;
                sleep(schedule.poll_interval).await;
            }
            Err(reason) => {
                consecutive_failures += 1;
                if consecutive_failures >= schedule.failures_before_escalation {
                    error!(
                        "Worker '{}' failing persistently ({} in a row): {}",
                        worker_name, consecutive_failures, reason
                    );
                } else {
                    warn!(
                        "Worker '{}' iteration failed: {}; retrying in {:?}",
                        worker_name, reason, retry_delay
                    );
                }
                sleep(retry_delay).await;
                retry_delay = std::cmp::min(retry_delay * 2, schedule.max_retry_delay);
            }
        }
    }
}
