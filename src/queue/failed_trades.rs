//! Failed-Trade Quarantine Queue
//!
//! Deals that fail ledger reconciliation are quarantined here instead of
//! blocking or corrupting the rest of their batch. A background worker
//! replays them through the exact same trade-processor path the live sync
//! uses, with a bounded retry budget and exponential backoff. Jobs that
//! exhaust the budget stay in the table, flagged `exhausted`, for operator
//! inspection — failure is surfaced, never silently dropped.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{QueueBackend, QueueError, QueueStats};
use crate::domain::entities::deal::{DealEvent, SyncSource};
use crate::domain::services::trade_processor::{DealContext, TradeProcessor};
use crate::persistence::models::FailedTradeRecord;
use crate::persistence::terminal_repository::{AccountRepository, TerminalRepository};
use crate::persistence::trade_repository::TradeStore;
use crate::persistence::DbPool;
use crate::task_runner::{run_polling_worker, WorkerSchedule};

/// Retry budget: attempts are spaced by `base_delay * 2^attempt`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn delay_after(&self, attempts: i64) -> ChronoDuration {
        let factor = 1u32 << attempts.clamp(0, 16) as u32;
        ChronoDuration::from_std(self.base_delay * factor)
            .unwrap_or_else(|_| ChronoDuration::seconds(300))
    }
}

/// A quarantined deal event ready for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTradeJob {
    pub id: i64,
    pub terminal_id: String,
    pub deal: DealEvent,
    pub reason: Option<String>,
    pub attempts: i64,
}

/// Outcome of `reschedule`: retried later, or out of budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Rescheduled,
    Exhausted,
}

#[async_trait]
pub trait FailedTradeQueue: Send + Sync {
    /// Quarantine a failing deal event with its failure reason.
    async fn queue_failed_trade(
        &self,
        terminal_id: &str,
        deal: &DealEvent,
        reason: &str,
    ) -> Result<(), QueueError>;

    /// Jobs whose backoff has elapsed, oldest first.
    async fn claim_due(&self, limit: i64) -> Result<Vec<FailedTradeJob>, QueueError>;

    /// Drop a successfully replayed job.
    async fn discard(&self, job_id: i64) -> Result<(), QueueError>;

    /// Record another failed attempt; marks the job exhausted once the
    /// budget is spent.
    async fn reschedule(&self, job_id: i64, error: &str) -> Result<RetryDisposition, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    fn backend(&self) -> QueueBackend;
}

/// SQLite-backed quarantine queue.
pub struct SqliteFailedTradeQueue {
    pool: DbPool,
    policy: RetryPolicy,
}

impl SqliteFailedTradeQueue {
    pub fn new(pool: DbPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }
}

#[async_trait]
impl FailedTradeQueue for SqliteFailedTradeQueue {
    async fn queue_failed_trade(
        &self,
        terminal_id: &str,
        deal: &DealEvent,
        reason: &str,
    ) -> Result<(), QueueError> {
        let deal_json =
            serde_json::to_string(deal).map_err(|e| QueueError::Payload(e.to_string()))?;
        let now = Utc::now();
        let next_attempt = now + self.policy.delay_after(0);

        sqlx::query(
            r#"
            INSERT INTO failed_trade_jobs
                (terminal_id, deal_json, reason, attempts, next_attempt_at, received_at)
            VALUES (?1, ?2, ?3, 0, ?4, ?5)
            "#,
        )
        .bind(terminal_id)
        .bind(&deal_json)
        .bind(reason)
        .bind(next_attempt)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(
                "Failed to quarantine deal {} for terminal {}: {}",
                deal.ticket, terminal_id, e
            );
            QueueError::Backend(e.to_string())
        })?;

        warn!(
            "Quarantined deal {} from terminal {}: {}",
            deal.ticket, terminal_id, reason
        );
        Ok(())
    }

    async fn claim_due(&self, limit: i64) -> Result<Vec<FailedTradeJob>, QueueError> {
        let now = Utc::now();
        let records = sqlx::query_as::<_, FailedTradeRecord>(
            r#"
            SELECT * FROM failed_trade_jobs
            WHERE exhausted = 0 AND next_attempt_at <= ?1
            ORDER BY next_attempt_at
            LIMIT ?2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        let mut jobs = Vec::with_capacity(records.len());
        for record in records {
            match serde_json::from_str::<DealEvent>(&record.deal_json) {
                Ok(deal) => jobs.push(FailedTradeJob {
                    id: record.id,
                    terminal_id: record.terminal_id,
                    deal,
                    reason: record.reason,
                    attempts: record.attempts,
                }),
                Err(e) => {
                    // A job we cannot even decode will never replay; retire it.
                    error!(
                        "Discarding undecodable quarantine job {}: {}",
                        record.id, e
                    );
                    self.reschedule_to_exhausted(record.id).await?;
                }
            }
        }
        Ok(jobs)
    }

    async fn discard(&self, job_id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM failed_trade_jobs WHERE id = ?1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        debug!("Discarded replayed quarantine job {}", job_id);
        Ok(())
    }

    async fn reschedule(&self, job_id: i64, error: &str) -> Result<RetryDisposition, QueueError> {
        let record = sqlx::query_as::<_, FailedTradeRecord>(
            "SELECT * FROM failed_trade_jobs WHERE id = ?1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?
        .ok_or_else(|| QueueError::Backend(format!("quarantine job not found: {}", job_id)))?;

        let attempts = record.attempts + 1;
        if attempts >= self.policy.max_attempts as i64 {
            sqlx::query(
                "UPDATE failed_trade_jobs SET attempts = ?1, reason = ?2, exhausted = 1 WHERE id = ?3",
            )
            .bind(attempts)
            .bind(error)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
            return Ok(RetryDisposition::Exhausted);
        }

        let next_attempt = Utc::now() + self.policy.delay_after(attempts);
        sqlx::query(
            "UPDATE failed_trade_jobs SET attempts = ?1, reason = ?2, next_attempt_at = ?3 WHERE id = ?4",
        )
        .bind(attempts)
        .bind(error)
        .bind(next_attempt)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(RetryDisposition::Rescheduled)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN exhausted = 0 THEN 1 ELSE 0 END) as waiting,
                SUM(CASE WHEN exhausted = 1 THEN 1 ELSE 0 END) as exhausted
            FROM failed_trade_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        let waiting: Option<i64> = row.get("waiting");
        let exhausted: Option<i64> = row.get("exhausted");

        Ok(QueueStats {
            waiting: waiting.unwrap_or(0) as u64,
            active: 0,
            completed: 0,
            failed: exhausted.unwrap_or(0) as u64,
        })
    }

    fn backend(&self) -> QueueBackend {
        QueueBackend::Durable
    }
}

impl SqliteFailedTradeQueue {
    async fn reschedule_to_exhausted(&self, job_id: i64) -> Result<(), QueueError> {
        sqlx::query("UPDATE failed_trade_jobs SET exhausted = 1 WHERE id = ?1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[derive(Default)]
struct InMemoryFailedState {
    jobs: Vec<(FailedTradeJob, chrono::DateTime<Utc>)>,
    exhausted: u64,
    next_id: i64,
}

/// Process-local fallback with the identical contract; jobs die with the
/// process, which is why construction logs a persistent warning.
pub struct InMemoryFailedTradeQueue {
    state: Mutex<InMemoryFailedState>,
    policy: RetryPolicy,
}

impl InMemoryFailedTradeQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        warn!(
            "Failed-trade queue running in-memory: quarantined deals will NOT survive a restart. \
             Configure a durable queue database for production."
        );
        Self {
            state: Mutex::new(InMemoryFailedState::default()),
            policy,
        }
    }
}

#[async_trait]
impl FailedTradeQueue for InMemoryFailedTradeQueue {
    async fn queue_failed_trade(
        &self,
        terminal_id: &str,
        deal: &DealEvent,
        reason: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let job = FailedTradeJob {
            id: state.next_id,
            terminal_id: terminal_id.to_string(),
            deal: deal.clone(),
            reason: Some(reason.to_string()),
            attempts: 0,
        };
        let due = Utc::now() + self.policy.delay_after(0);
        state.jobs.push((job, due));
        warn!(
            "Quarantined deal {} from terminal {} (in-memory): {}",
            deal.ticket, terminal_id, reason
        );
        Ok(())
    }

    async fn claim_due(&self, limit: i64) -> Result<Vec<FailedTradeJob>, QueueError> {
        let state = self.state.lock().await;
        let now = Utc::now();
        Ok(state
            .jobs
            .iter()
            .filter(|(_, due)| *due <= now)
            .take(limit.max(0) as usize)
            .map(|(job, _)| job.clone())
            .collect())
    }

    async fn discard(&self, job_id: i64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.jobs.retain(|(job, _)| job.id != job_id);
        Ok(())
    }

    async fn reschedule(&self, job_id: i64, error: &str) -> Result<RetryDisposition, QueueError> {
        let mut state = self.state.lock().await;
        let policy = self.policy;

        let Some(index) = state.jobs.iter().position(|(job, _)| job.id == job_id) else {
            return Err(QueueError::Backend(format!(
                "quarantine job not found: {}",
                job_id
            )));
        };

        let attempts = {
            let (job, _) = &mut state.jobs[index];
            job.attempts += 1;
            job.reason = Some(error.to_string());
            job.attempts
        };

        if attempts >= policy.max_attempts as i64 {
            state.jobs.remove(index);
            state.exhausted += 1;
            return Ok(RetryDisposition::Exhausted);
        }

        state.jobs[index].1 = Utc::now() + policy.delay_after(attempts);
        Ok(RetryDisposition::Rescheduled)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            waiting: state.jobs.len() as u64,
            active: 0,
            completed: 0,
            failed: state.exhausted,
        })
    }

    fn backend(&self) -> QueueBackend {
        QueueBackend::InMemory
    }
}

/// Everything the retry worker needs to replay a quarantined deal through
/// the same reconciliation path the live sync uses.
pub struct RetryWorker {
    pub queue: Arc<dyn FailedTradeQueue>,
    pub terminals: Arc<TerminalRepository>,
    pub accounts: Arc<AccountRepository>,
    pub trades: Arc<dyn TradeStore>,
    pub processor: Arc<TradeProcessor>,
}

impl RetryWorker {
    /// Long-running worker loop; spawn onto the runtime.
    pub async fn run(self, schedule: WorkerSchedule) {
        info!("Failed-trade retry worker started");
        let worker = Arc::new(self);
        run_polling_worker("failed-trade-retry", schedule, move || {
            let worker = worker.clone();
            async move { worker.drain_due().await }
        })
        .await;
    }

    /// One drain pass: claim everything due and replay it. The worker loop
    /// calls this on a cadence; it can also be invoked directly to drain
    /// synchronously.
    pub async fn drain_due(&self) -> Result<(), String> {
        let jobs = self
            .queue
            .claim_due(20)
            .await
            .map_err(|e| format!("claim_due failed: {}", e))?;

        for job in jobs {
            match self.replay(&job).await {
                Ok(()) => {
                    info!(
                        "Quarantined deal {} replayed successfully (attempt {})",
                        job.deal.ticket,
                        job.attempts + 1
                    );
                    self.queue
                        .discard(job.id)
                        .await
                        .map_err(|e| format!("discard failed: {}", e))?;
                }
                Err(reason) => {
                    let disposition = self
                        .queue
                        .reschedule(job.id, &reason)
                        .await
                        .map_err(|e| format!("reschedule failed: {}", e))?;
                    match disposition {
                        RetryDisposition::Rescheduled => warn!(
                            "Replay of deal {} failed (attempt {}): {}",
                            job.deal.ticket,
                            job.attempts + 1,
                            reason
                        ),
                        RetryDisposition::Exhausted => error!(
                            "Giving up on deal {} after {} attempts: {}. \
                             Job retained for operator inspection.",
                            job.deal.ticket,
                            job.attempts + 1,
                            reason
                        ),
                    }
                }
            }
        }

        Ok(())
    }

    /// Re-resolve the owning terminal/account, re-read current ledger state,
    /// and re-invoke the same processor dispatch. No divergent logic.
    async fn replay(&self, job: &FailedTradeJob) -> Result<(), String> {
        let terminal = self
            .terminals
            .find(&job.terminal_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("terminal {} no longer exists", job.terminal_id))?;

        let account = self
            .accounts
            .find(&terminal.account_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("account {} no longer exists", terminal.account_id))?;

        let ctx = DealContext {
            terminal_id: terminal.id.clone(),
            account_id: account.id.clone(),
            user_id: account.user_id.clone(),
            sync_source: SyncSource::LocalEa,
        };

        let existing = match job.deal.position_id_string() {
            Some(position_id) => self
                .trades
                .find_by_external_id(&ctx.user_id, &ctx.account_id, &position_id)
                .await
                .map_err(|e| e.to_string())?,
            None => None,
        };

        self.processor
            .process_deal(&ctx, &job.deal, existing)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;

    fn deal() -> DealEvent {
        serde_json::from_value(serde_json::json!({
            "ticket": 77,
            "symbol": "EURUSD",
            "type": "BUY",
            "positionId": 4242,
            "entryType": 0,
            "volume": 1.0
        }))
        .unwrap()
    }

    fn instant_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(0),
        }
    }

    #[tokio::test]
    async fn test_quarantine_and_claim() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let queue = SqliteFailedTradeQueue::new(pool, instant_policy());

        queue
            .queue_failed_trade("term-1", &deal(), "boom")
            .await
            .unwrap();

        let due = queue.claim_due(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].deal.ticket, 77);
        assert_eq!(due[0].reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_backoff_delays_next_claim() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let queue = SqliteFailedTradeQueue::new(
            pool,
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(60),
            },
        );

        queue
            .queue_failed_trade("term-1", &deal(), "boom")
            .await
            .unwrap();

        // First attempt is a minute out; nothing due yet.
        let due = queue.claim_due(10).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_after_budget() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let queue = SqliteFailedTradeQueue::new(pool, instant_policy());

        queue
            .queue_failed_trade("term-1", &deal(), "boom")
            .await
            .unwrap();
        let job_id = queue.claim_due(1).await.unwrap()[0].id;

        assert_eq!(
            queue.reschedule(job_id, "still failing").await.unwrap(),
            RetryDisposition::Rescheduled
        );
        assert_eq!(
            queue.reschedule(job_id, "still failing").await.unwrap(),
            RetryDisposition::Rescheduled
        );
        assert_eq!(
            queue.reschedule(job_id, "still failing").await.unwrap(),
            RetryDisposition::Exhausted
        );

        // Exhausted jobs leave the retry pool but stay visible in stats.
        assert!(queue.claim_due(10).await.unwrap().is_empty());
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_discard_removes_job() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let queue = SqliteFailedTradeQueue::new(pool, instant_policy());

        queue
            .queue_failed_trade("term-1", &deal(), "boom")
            .await
            .unwrap();
        let job_id = queue.claim_due(1).await.unwrap()[0].id;
        queue.discard(job_id).await.unwrap();

        assert!(queue.claim_due(10).await.unwrap().is_empty());
        assert_eq!(queue.stats().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_in_memory_contract_matches() {
        let queue = InMemoryFailedTradeQueue::new(instant_policy());

        queue
            .queue_failed_trade("term-1", &deal(), "boom")
            .await
            .unwrap();
        let due = queue.claim_due(10).await.unwrap();
        assert_eq!(due.len(), 1);

        let job_id = due[0].id;
        queue.reschedule(job_id, "again").await.unwrap();
        queue.reschedule(job_id, "again").await.unwrap();
        assert_eq!(
            queue.reschedule(job_id, "again").await.unwrap(),
            RetryDisposition::Exhausted
        );
        assert_eq!(queue.stats().await.unwrap().failed, 1);
        assert!(queue.backend().is_degraded());
    }
}
