//! Terminal Command Queue
//!
//! Durable, per-terminal FIFO of outbound commands, drained by the
//! terminal's own heartbeat poll — terminals are not reachable directly, so
//! pull is the only delivery channel. Dispatch is at-most-once: a popped
//! command is removed before it is handed to the terminal. Commands are
//! advisory fetch requests, so losing one on a crash between pop and
//! delivery is the accepted tradeoff.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{command_key, QueueBackend, QueueError, QueueStats};
use crate::persistence::models::QueuedCommandRecord;
use crate::persistence::DbPool;

/// An outbound instruction for one terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalCommand {
    pub terminal_id: String,
    pub command: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl From<QueuedCommandRecord> for TerminalCommand {
    fn from(record: QueuedCommandRecord) -> Self {
        TerminalCommand {
            terminal_id: record.terminal_id,
            command: record.command,
            payload: record.payload,
            timestamp: record.created_at,
        }
    }
}

#[async_trait]
pub trait CommandQueue: Send + Sync {
    /// Enqueue a command. Re-issuing the same logical command before it is
    /// dispatched is a no-op, not a duplicate.
    async fn queue_command(
        &self,
        terminal_id: &str,
        command: &str,
        payload: &str,
    ) -> Result<(), QueueError>;

    /// Atomically pop the oldest pending command for a terminal.
    async fn next_command(&self, terminal_id: &str) -> Result<Option<TerminalCommand>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Bulk-cancel all pending commands for a terminal (teardown).
    async fn clear_terminal(&self, terminal_id: &str) -> Result<u64, QueueError>;

    fn backend(&self) -> QueueBackend;
}

/// SQLite-backed command queue. Waiting counts come from the table; the
/// dispatched counter is process-local since dispatched rows are deleted.
pub struct SqliteCommandQueue {
    pool: DbPool,
    dispatched: AtomicU64,
}

impl SqliteCommandQueue {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            dispatched: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl CommandQueue for SqliteCommandQueue {
    async fn queue_command(
        &self,
        terminal_id: &str,
        command: &str,
        payload: &str,
    ) -> Result<(), QueueError> {
        let key = command_key(terminal_id, command, payload);
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO queued_commands (terminal_id, command, payload, command_key, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(command_key) DO NOTHING
            "#,
        )
        .bind(terminal_id)
        .bind(command)
        .bind(payload)
        .bind(&key)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to queue command {} for {}: {}", command, terminal_id, e);
            QueueError::Backend(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            debug!(
                "Command {} for terminal {} already queued; skipping",
                command, terminal_id
            );
        } else {
            debug!("Queued command {} for terminal {}", command, terminal_id);
        }
        Ok(())
    }

    async fn next_command(&self, terminal_id: &str) -> Result<Option<TerminalCommand>, QueueError> {
        // Pop-and-remove in one statement so concurrent heartbeats cannot
        // dispatch the same command twice.
        let record = sqlx::query_as::<_, QueuedCommandRecord>(
            r#"
            DELETE FROM queued_commands
            WHERE id = (
                SELECT id FROM queued_commands WHERE terminal_id = ?1 ORDER BY id LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(terminal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to pop command for terminal {}: {}", terminal_id, e);
            QueueError::Backend(e.to_string())
        })?;

        if let Some(record) = record {
            self.dispatched.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Dispatched command {} to terminal {}",
                record.command, terminal_id
            );
            Ok(Some(record.into()))
        } else {
            Ok(None)
        }
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM queued_commands")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        let waiting: i64 = row.get("count");

        Ok(QueueStats {
            waiting: waiting as u64,
            active: 0,
            completed: self.dispatched.load(Ordering::Relaxed),
            failed: 0,
        })
    }

    async fn clear_terminal(&self, terminal_id: &str) -> Result<u64, QueueError> {
        let result = sqlx::query("DELETE FROM queued_commands WHERE terminal_id = ?1")
            .bind(terminal_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to clear commands for terminal {}: {}", terminal_id, e);
                QueueError::Backend(e.to_string())
            })?;

        let cleared = result.rows_affected();
        info!("Cleared {} commands for terminal {}", cleared, terminal_id);
        Ok(cleared)
    }

    fn backend(&self) -> QueueBackend {
        QueueBackend::Durable
    }
}

#[derive(Default)]
struct InMemoryState {
    queues: HashMap<String, VecDeque<TerminalCommand>>,
    pending_keys: HashSet<String>,
    dispatched: u64,
}

/// Process-local fallback with the identical external contract. Correctness
/// is reduced (nothing survives a restart), which is why construction logs
/// a persistent warning and `backend()` reports the degradation.
#[derive(Default)]
pub struct InMemoryCommandQueue {
    state: Mutex<InMemoryState>,
}

impl InMemoryCommandQueue {
    pub fn new() -> Self {
        warn!(
            "Command queue running in-memory: queued commands will NOT survive a restart. \
             Configure a durable queue database for production."
        );
        Self::default()
    }
}

#[async_trait]
impl CommandQueue for InMemoryCommandQueue {
    async fn queue_command(
        &self,
        terminal_id: &str,
        command: &str,
        payload: &str,
    ) -> Result<(), QueueError> {
        let key = command_key(terminal_id, command, payload);
        let mut state = self.state.lock().await;

        if !state.pending_keys.insert(key) {
            debug!(
                "Command {} for terminal {} already queued (in-memory); skipping",
                command, terminal_id
            );
            return Ok(());
        }

        state
            .queues
            .entry(terminal_id.to_string())
            .or_default()
            .push_back(TerminalCommand {
                terminal_id: terminal_id.to_string(),
                command: command.to_string(),
                payload: payload.to_string(),
                timestamp: Utc::now(),
            });

        debug!("Queued command {} for terminal {} (in-memory)", command, terminal_id);
        Ok(())
    }

    async fn next_command(&self, terminal_id: &str) -> Result<Option<TerminalCommand>, QueueError> {
        let mut state = self.state.lock().await;

        let popped = state
            .queues
            .get_mut(terminal_id)
            .and_then(|queue| queue.pop_front());

        if let Some(command) = popped {
            let key = command_key(terminal_id, &command.command, &command.payload);
            state.pending_keys.remove(&key);
            state.dispatched += 1;
            if state
                .queues
                .get(terminal_id)
                .map(|q| q.is_empty())
                .unwrap_or(false)
            {
                state.queues.remove(terminal_id);
            }
            Ok(Some(command))
        } else {
            Ok(None)
        }
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        let waiting: usize = state.queues.values().map(|q| q.len()).sum();
        Ok(QueueStats {
            waiting: waiting as u64,
            active: 0,
            completed: state.dispatched,
            failed: 0,
        })
    }

    async fn clear_terminal(&self, terminal_id: &str) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        let cleared = match state.queues.remove(terminal_id) {
            Some(queue) => {
                for command in &queue {
                    let key = command_key(terminal_id, &command.command, &command.payload);
                    state.pending_keys.remove(&key);
                }
                queue.len() as u64
            }
            None => 0,
        };
        info!(
            "Cleared {} commands for terminal {} (in-memory)",
            cleared, terminal_id
        );
        Ok(cleared)
    }

    fn backend(&self) -> QueueBackend {
        QueueBackend::InMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;

    async fn durable() -> SqliteCommandQueue {
        let pool = init_database("sqlite::memory:").await.unwrap();
        SqliteCommandQueue::new(pool)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = durable().await;
        queue.queue_command("t-1", "FETCH_CANDLES", "first").await.unwrap();
        queue.queue_command("t-1", "FETCH_CANDLES", "second").await.unwrap();

        let a = queue.next_command("t-1").await.unwrap().unwrap();
        let b = queue.next_command("t-1").await.unwrap().unwrap();
        assert_eq!(a.payload, "first");
        assert_eq!(b.payload, "second");
        assert!(queue.next_command("t-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dedup_before_dispatch() {
        let queue = durable().await;
        queue.queue_command("t-1", "FETCH_CANDLES", "same").await.unwrap();
        queue.queue_command("t-1", "FETCH_CANDLES", "same").await.unwrap();

        assert!(queue.next_command("t-1").await.unwrap().is_some());
        assert!(queue.next_command("t-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_per_terminal_isolation() {
        let queue = durable().await;
        queue.queue_command("t-1", "SYNC_TRADES", "").await.unwrap();

        assert!(queue.next_command("t-2").await.unwrap().is_none());
        assert!(queue.next_command("t-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_terminal() {
        let queue = durable().await;
        queue.queue_command("t-1", "FETCH_CANDLES", "a").await.unwrap();
        queue.queue_command("t-1", "FETCH_CANDLES", "b").await.unwrap();
        queue.queue_command("t-2", "FETCH_CANDLES", "c").await.unwrap();

        let cleared = queue.clear_terminal("t-1").await.unwrap();
        assert_eq!(cleared, 2);
        assert!(queue.next_command("t-1").await.unwrap().is_none());
        assert!(queue.next_command("t-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats() {
        let queue = durable().await;
        queue.queue_command("t-1", "FETCH_CANDLES", "a").await.unwrap();
        queue.queue_command("t-1", "FETCH_CANDLES", "b").await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 2);

        queue.next_command("t-1").await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_in_memory_contract_matches() {
        let queue = InMemoryCommandQueue::default();
        queue.queue_command("t-1", "FETCH_CANDLES", "same").await.unwrap();
        queue.queue_command("t-1", "FETCH_CANDLES", "same").await.unwrap();
        queue.queue_command("t-1", "FETCH_CANDLES", "other").await.unwrap();

        assert_eq!(queue.stats().await.unwrap().waiting, 2);
        let first = queue.next_command("t-1").await.unwrap().unwrap();
        assert_eq!(first.payload, "same");

        // Key released after dispatch: the same command may be queued again.
        queue.queue_command("t-1", "FETCH_CANDLES", "same").await.unwrap();
        assert_eq!(queue.stats().await.unwrap().waiting, 2);

        assert!(queue.backend().is_degraded());
        assert_eq!(queue.clear_terminal("t-1").await.unwrap(), 2);
    }
}
