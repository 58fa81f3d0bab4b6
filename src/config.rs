//! Farm configuration, loaded from the environment with range validation.
//!
//! Secrets are explicit startup configuration: in production every secret
//! must be set or startup fails hard. In development a missing secret falls
//! back to a per-process generated value with a loud warning — convenient
//! locally, and impossible to ship silently because production refuses it.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "missing required configuration `{0}` (required when APP_ENV=production; \
         generate one with: openssl rand -base64 32)"
    )]
    MissingSecret(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

#[derive(Clone)]
pub struct FarmConfig {
    pub environment: AppEnv,
    pub port: u16,

    pub database_url: String,
    /// Queue tables may live in a separate database so queue durability can
    /// degrade independently of the ledger. Defaults to `database_url`.
    pub queue_database_url: String,

    /// Static shared secret expected in the `x-api-key` webhook header.
    pub webhook_secret: String,
    /// HS256 key for per-terminal signed tokens.
    pub terminal_token_secret: String,
    pub terminal_token_ttl_seconds: u64,
    /// Verification key for end-user session JWTs (issuance lives elsewhere).
    pub user_jwt_secret: String,
    /// Shared secret gating the orchestrator config feed.
    pub orchestrator_secret: String,

    /// External orchestrator base URL; None means simulated provisioning.
    pub orchestrator_url: Option<String>,
    pub orchestrator_timeout: Duration,

    /// RUNNING terminals without a heartbeat for this long count as stale.
    pub heartbeat_stale_seconds: i64,

    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_poll_interval: Duration,

    // Per-terminal webhook rate limits (requests per minute)
    pub heartbeat_rate_per_minute: u32,
    pub trades_rate_per_minute: u32,
    pub candles_rate_per_minute: u32,
    pub positions_rate_per_minute: u32,
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_parsed_in_range<T>(name: &str, range: std::ops::RangeInclusive<T>) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let value: T = env_parsed(name)?;
    if range.contains(&value) {
        Some(value)
    } else {
        tracing::warn!(
            "Ignoring {}={} (must be between {} and {})",
            name,
            value,
            range.start(),
            range.end()
        );
        None
    }
}

impl FarmConfig {
    pub fn from_env() -> Result<FarmConfig, ConfigError> {
        let environment = match std::env::var("APP_ENV").as_deref() {
            Ok("production") => AppEnv::Production,
            _ => AppEnv::Development,
        };

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://data/termfarm.db".to_string());
        let queue_database_url =
            std::env::var("QUEUE_DATABASE_URL").unwrap_or_else(|_| database_url.clone());

        let config = FarmConfig {
            environment,
            port: env_parsed("PORT").unwrap_or(3000),
            database_url,
            queue_database_url,
            webhook_secret: require_secret(environment, "TERMINAL_WEBHOOK_SECRET")?,
            terminal_token_secret: require_secret(environment, "TERMINAL_TOKEN_SECRET")?,
            terminal_token_ttl_seconds: env_parsed_in_range(
                "TERMINAL_TOKEN_TTL_SECONDS",
                300u64..=604_800,
            )
            .unwrap_or(86_400),
            user_jwt_secret: require_secret(environment, "USER_JWT_SECRET")?,
            orchestrator_secret: require_secret(environment, "ORCHESTRATOR_SECRET")?,
            orchestrator_url: std::env::var("TERMINAL_ORCHESTRATOR_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            orchestrator_timeout: Duration::from_millis(
                env_parsed_in_range("ORCHESTRATOR_TIMEOUT_MS", 1_000u64..=60_000).unwrap_or(10_000),
            ),
            heartbeat_stale_seconds: env_parsed_in_range("HEARTBEAT_STALE_SECONDS", 60i64..=3_600)
                .unwrap_or(300),
            retry_max_attempts: env_parsed_in_range("RETRY_MAX_ATTEMPTS", 1u32..=10).unwrap_or(3),
            retry_base_delay: Duration::from_millis(
                env_parsed_in_range("RETRY_BASE_DELAY_MS", 100u64..=60_000).unwrap_or(5_000),
            ),
            retry_poll_interval: Duration::from_secs(
                env_parsed_in_range("RETRY_POLL_INTERVAL_SECONDS", 1u64..=300).unwrap_or(5),
            ),
            heartbeat_rate_per_minute: env_parsed_in_range("HEARTBEAT_RATE_PER_MINUTE", 1u32..=60)
                .unwrap_or(2),
            trades_rate_per_minute: env_parsed_in_range("TRADES_RATE_PER_MINUTE", 1u32..=120)
                .unwrap_or(10),
            candles_rate_per_minute: env_parsed_in_range("CANDLES_RATE_PER_MINUTE", 1u32..=240)
                .unwrap_or(20),
            positions_rate_per_minute: env_parsed_in_range("POSITIONS_RATE_PER_MINUTE", 1u32..=240)
                .unwrap_or(30),
        };

        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment == AppEnv::Production
    }
}

/// Secret policy: hard failure in production, generated-with-warning in
/// development. A generated secret means tokens and webhook auth do not
/// survive a restart, which is acceptable only on a developer machine.
fn require_secret(environment: AppEnv, name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => {
            if environment == AppEnv::Production {
                return Err(ConfigError::MissingSecret(name));
            }
            tracing::warn!(
                "{} not set; using a generated per-process secret. \
                 Anything signed with it becomes invalid on restart. \
                 Set {} explicitly outside development.",
                name,
                name
            );
            Ok(format!(
                "{}{}",
                Uuid::new_v4().simple(),
                Uuid::new_v4().simple()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_requires_secrets() {
        let result = require_secret(AppEnv::Production, "TEST_SECRET_THAT_IS_NOT_SET");
        assert!(matches!(result, Err(ConfigError::MissingSecret(_))));
    }

    #[test]
    fn test_development_generates_fallback() {
        let secret = require_secret(AppEnv::Development, "TEST_SECRET_THAT_IS_NOT_SET").unwrap();
        assert!(secret.len() >= 32);
    }

    #[test]
    fn test_present_secret_is_used() {
        std::env::set_var("TEST_SECRET_PRESENT", "a-configured-secret-value-12345678");
        let secret = require_secret(AppEnv::Production, "TEST_SECRET_PRESENT").unwrap();
        assert_eq!(secret, "a-configured-secret-value-12345678");
        std::env::remove_var("TEST_SECRET_PRESENT");
    }

    #[test]
    fn test_range_validation_rejects_out_of_range() {
        std::env::set_var("TEST_RANGE_VAR", "99999");
        let value = env_parsed_in_range::<u32>("TEST_RANGE_VAR", 1..=10);
        assert!(value.is_none());
        std::env::remove_var("TEST_RANGE_VAR");
    }
}
