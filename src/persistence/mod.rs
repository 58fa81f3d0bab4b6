//! Persistence Layer
//!
//! SQLite-backed storage for trading accounts, terminal instances, the trade
//! ledger, and the durable queue tables. Async access via sqlx; schema is
//! created on startup with idempotent migrations.
//!
//! # Tables
//! - `mt5_accounts`: trading accounts (ownership anchor for terminals/trades)
//! - `terminals`: one row per auto-sync account, lifecycle + liveness state
//! - `trades`: the canonical trade ledger, reconciled from deal events
//! - `queued_commands`: durable per-terminal outbound command FIFO
//! - `failed_trade_jobs`: quarantined deal events awaiting retry

pub mod models;
pub mod terminal_repository;
pub mod trade_repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization/query error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),
}

/// Initialize the database connection pool and run migrations.
///
/// # Arguments
/// - `database_url`: SQLite URL (e.g. "sqlite://data/termfarm.db" or
///   "sqlite::memory:" in tests)
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    // Ensure the data directory exists for file-backed databases
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .log_statements(tracing::log::LevelFilter::Debug);

    // An in-memory SQLite database exists per connection, so the pool must
    // stay at one connection there or each checkout sees an empty schema.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mt5_accounts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            account_name TEXT NOT NULL,
            server TEXT,
            login TEXT,
            balance REAL,
            equity REAL,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create mt5_accounts table: {}", e))
    })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS terminals (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL
                CHECK(status IN ('PENDING','STARTING','RUNNING','STOPPING','STOPPED','ERROR')),
            container_id TEXT,
            error_message TEXT,
            last_heartbeat DATETIME,
            last_sync_at DATETIME,
            metadata TEXT,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            FOREIGN KEY (account_id) REFERENCES mt5_accounts(id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create terminals table: {}", e))
    })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            asset_type TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('LONG','SHORT')),
            status TEXT NOT NULL CHECK(status IN ('OPEN','CLOSED')),
            origin TEXT NOT NULL DEFAULT 'normal'
                CHECK(origin IN ('normal','orphan_exit','partial_remainder')),
            sync_source TEXT CHECK(sync_source IN ('local_ea','metaapi')),
            external_id TEXT,
            external_deal_id INTEGER,
            open_time DATETIME,
            close_time DATETIME,
            open_price REAL,
            close_price REAL,
            quantity REAL,
            contract_size REAL,
            profit_or_loss REAL,
            commission REAL,
            swap REAL,
            stop_loss REAL,
            take_profit REAL,
            mt5_magic INTEGER,
            notes TEXT,
            execution_candles TEXT,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create trades table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queued_commands (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            terminal_id TEXT NOT NULL,
            command TEXT NOT NULL,
            payload TEXT NOT NULL,
            command_key TEXT NOT NULL UNIQUE,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create queued_commands table: {}", e))
    })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS failed_trade_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            terminal_id TEXT NOT NULL,
            deal_json TEXT NOT NULL,
            reason TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at DATETIME NOT NULL,
            received_at DATETIME NOT NULL,
            exhausted BOOLEAN NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create failed_trade_jobs table: {}", e))
    })?;

    // Indexes for the hot query paths
    for (name, stmt) in [
        (
            "idx_terminals_account",
            "CREATE INDEX IF NOT EXISTS idx_terminals_account ON terminals(account_id)",
        ),
        (
            "idx_terminals_status",
            "CREATE INDEX IF NOT EXISTS idx_terminals_status ON terminals(status)",
        ),
        (
            "idx_trades_external",
            "CREATE INDEX IF NOT EXISTS idx_trades_external ON trades(user_id, external_id)",
        ),
        (
            "idx_trades_status",
            "CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status)",
        ),
        (
            "idx_commands_terminal",
            "CREATE INDEX IF NOT EXISTS idx_commands_terminal ON queued_commands(terminal_id, id)",
        ),
        (
            "idx_failed_due",
            "CREATE INDEX IF NOT EXISTS idx_failed_due ON failed_trade_jobs(exhausted, next_attempt_at)",
        ),
    ] {
        sqlx::query(stmt).execute(pool).await.map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to create index {}: {}", name, e))
        })?;
    }

    info!("Database migrations completed");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_init() {
        let pool = init_database("sqlite::memory:").await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let pool = init_database("sqlite::memory:").await.unwrap();

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
             ('mt5_accounts', 'terminals', 'trades', 'queued_commands', 'failed_trade_jobs')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 5);
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
    }
}
