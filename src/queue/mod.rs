//! Queues
//!
//! Two work queues connect the farm to its terminals: the outbound command
//! queue (drained by heartbeats) and the failed-trade quarantine queue
//! (replayed by a background worker). Both are traits with a durable SQLite
//! implementation and an in-memory twin used when the durable backend is
//! unavailable at startup — degraded but functional, and the degradation is
//! reported through the health endpoint rather than only logged.

pub mod command_queue;
pub mod failed_trades;

use serde::Serialize;
use thiserror::Error;

/// Which backing store a queue is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    /// SQLite-backed; entries survive restarts.
    Durable,
    /// Process-local fallback; entries die with the process.
    InMemory,
}

impl QueueBackend {
    pub fn is_degraded(&self) -> bool {
        matches!(self, QueueBackend::InMemory)
    }
}

/// Operational counters for health reporting.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("malformed queue payload: {0}")]
    Payload(String),
}

/// Deterministic idempotency key for a command: re-issuing the same logical
/// command collapses onto the same key instead of enqueueing a duplicate.
/// Mirrors what the terminal sees, so only the payload prefix participates.
pub(crate) fn command_key(terminal_id: &str, command: &str, payload: &str) -> String {
    let prefix: String = payload.chars().take(50).collect();
    let raw = format!("{}_{}_{}", terminal_id, command, prefix);
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
