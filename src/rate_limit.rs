//! Per-terminal rate limiting for the webhook surface.
//!
//! Terminals are untrusted external agents; each endpoint gets its own
//! keyed quota so one misbehaving EA cannot starve the others. Limits are
//! sized to the EA's expected cadence (heartbeat every 60s, position pushes
//! on change, candle uploads after closes).

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::config::FarmConfig;

pub type TerminalRateLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

fn per_minute(requests: u32) -> Arc<TerminalRateLimiter> {
    let quota = Quota::per_minute(
        NonZeroU32::new(requests).expect("rate limit must be non-zero"),
    );
    Arc::new(RateLimiter::keyed(quota))
}

/// One limiter per webhook endpoint, each keyed by terminal id.
pub struct WebhookRateLimits {
    pub heartbeat: Arc<TerminalRateLimiter>,
    pub trades: Arc<TerminalRateLimiter>,
    pub candles: Arc<TerminalRateLimiter>,
    pub positions: Arc<TerminalRateLimiter>,
}

impl WebhookRateLimits {
    pub fn from_config(config: &FarmConfig) -> Self {
        Self {
            heartbeat: per_minute(config.heartbeat_rate_per_minute),
            trades: per_minute(config.trades_rate_per_minute),
            candles: per_minute(config.candles_rate_per_minute),
            positions: per_minute(config.positions_rate_per_minute),
        }
    }
}

/// True when the call is within quota for this terminal.
pub fn check_terminal(limiter: &TerminalRateLimiter, terminal_id: &str) -> bool {
    limiter.check_key(&terminal_id.to_string()).is_ok()
}
