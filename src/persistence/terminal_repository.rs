//! Terminal & Account Repositories
//!
//! Data access for terminal instances and their owning trading accounts.
//! Status writes go through the lifecycle state machine so an illegal
//! transition is refused at the storage boundary too.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::models::{AccountRecord, TerminalRecord};
use super::{DatabaseError, DbPool};
use crate::domain::entities::terminal::TerminalStatus;

/// Terminal instance repository
pub struct TerminalRepository {
    pool: DbPool,
}

impl TerminalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create a PENDING terminal for an account. The UNIQUE constraint on
    /// `account_id` enforces at most one terminal per account.
    pub async fn create(&self, account_id: &str) -> Result<TerminalRecord, DatabaseError> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let record = sqlx::query_as::<_, TerminalRecord>(
            r#"
            INSERT INTO terminals (id, account_id, status, created_at, updated_at)
            VALUES (?1, ?2, 'PENDING', ?3, ?3)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(account_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create terminal for account {}: {}", account_id, e);
            DatabaseError::QueryError(format!("Failed to create terminal: {}", e))
        })?;

        debug!("Created terminal {} for account {}", record.id, account_id);
        Ok(record)
    }

    pub async fn find(&self, id: &str) -> Result<Option<TerminalRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, TerminalRecord>("SELECT * FROM terminals WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get terminal {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to get terminal: {}", e))
            })?;

        Ok(record)
    }

    pub async fn find_by_account(
        &self,
        account_id: &str,
    ) -> Result<Option<TerminalRecord>, DatabaseError> {
        let record =
            sqlx::query_as::<_, TerminalRecord>("SELECT * FROM terminals WHERE account_id = ?1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to get terminal for account {}: {}", account_id, e);
                    DatabaseError::QueryError(format!("Failed to get terminal: {}", e))
                })?;

        Ok(record)
    }

    pub async fn list_all(&self) -> Result<Vec<TerminalRecord>, DatabaseError> {
        let records =
            sqlx::query_as::<_, TerminalRecord>("SELECT * FROM terminals ORDER BY created_at")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to list terminals: {}", e);
                    DatabaseError::QueryError(format!("Failed to list terminals: {}", e))
                })?;

        Ok(records)
    }

    /// Move a terminal to `next`, refusing illegal transitions.
    pub async fn transition(
        &self,
        id: &str,
        next: TerminalStatus,
    ) -> Result<TerminalRecord, DatabaseError> {
        let current = self
            .find(id)
            .await?
            .ok_or_else(|| DatabaseError::QueryError(format!("Terminal not found: {}", id)))?;

        if !current.status().can_transition(next) {
            warn!(
                "Refusing illegal terminal transition {} -> {} for {}",
                current.status(),
                next,
                id
            );
            return Err(DatabaseError::QueryError(format!(
                "Illegal transition {} -> {}",
                current.status(),
                next
            )));
        }

        self.force_status(id, next).await
    }

    async fn force_status(
        &self,
        id: &str,
        status: TerminalStatus,
    ) -> Result<TerminalRecord, DatabaseError> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, TerminalRecord>(
            "UPDATE terminals SET status = ?1, updated_at = ?2 WHERE id = ?3 RETURNING *",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update terminal {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to update terminal: {}", e))
        })?;

        record.ok_or_else(|| DatabaseError::QueryError(format!("Terminal not found: {}", id)))
    }

    /// Record a provisioning/teardown failure: ERROR state plus the message.
    pub async fn record_error(&self, id: &str, message: &str) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE terminals SET status = 'ERROR', error_message = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(message)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record error for terminal {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to record terminal error: {}", e))
        })?;

        Ok(())
    }

    /// Reset a STOPPED/ERROR terminal back to PENDING for re-provisioning.
    pub async fn reset_pending(&self, id: &str) -> Result<TerminalRecord, DatabaseError> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, TerminalRecord>(
            r#"
            UPDATE terminals
            SET status = 'PENDING', error_message = NULL, updated_at = ?1
            WHERE id = ?2 AND status IN ('STOPPED', 'ERROR')
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to reset terminal {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to reset terminal: {}", e))
        })?;

        record.ok_or_else(|| {
            DatabaseError::QueryError(format!("Terminal not resettable from current state: {}", id))
        })
    }

    /// Mark RUNNING with a fresh heartbeat, optionally recording the
    /// container handle returned by the orchestrator.
    pub async fn mark_running(
        &self,
        id: &str,
        container_id: Option<&str>,
    ) -> Result<TerminalRecord, DatabaseError> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, TerminalRecord>(
            r#"
            UPDATE terminals
            SET status = 'RUNNING',
                container_id = COALESCE(?1, container_id),
                error_message = NULL,
                last_heartbeat = ?2,
                updated_at = ?2
            WHERE id = ?3
            RETURNING *
            "#,
        )
        .bind(container_id)
        .bind(now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to mark terminal {} running: {}", id, e);
            DatabaseError::QueryError(format!("Failed to mark terminal running: {}", e))
        })?;

        record.ok_or_else(|| DatabaseError::QueryError(format!("Terminal not found: {}", id)))
    }

    /// Mark STOPPED and clear the container handle.
    pub async fn mark_stopped(&self, id: &str) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE terminals SET status = 'STOPPED', container_id = NULL, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to mark terminal {} stopped: {}", id, e);
            DatabaseError::QueryError(format!("Failed to mark terminal stopped: {}", e))
        })?;

        Ok(())
    }

    /// Heartbeat touch: fresh liveness timestamp and promotion to RUNNING.
    pub async fn touch_heartbeat(&self, id: &str) -> Result<TerminalRecord, DatabaseError> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, TerminalRecord>(
            r#"
            UPDATE terminals
            SET last_heartbeat = ?1, status = 'RUNNING', error_message = NULL, updated_at = ?1
            WHERE id = ?2
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record heartbeat for terminal {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to record heartbeat: {}", e))
        })?;

        record.ok_or_else(|| DatabaseError::QueryError(format!("Terminal not found: {}", id)))
    }

    pub async fn touch_sync(&self, id: &str) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query("UPDATE terminals SET last_sync_at = ?1, updated_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to record sync time for terminal {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to record sync time: {}", e))
            })?;

        Ok(())
    }

    pub async fn set_metadata(&self, id: &str, metadata: &str) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query("UPDATE terminals SET metadata = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(metadata)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to set metadata for terminal {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to set metadata: {}", e))
            })?;

        Ok(())
    }

    /// Status -> count map for health reporting.
    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>, DatabaseError> {
        let rows = sqlx::query("SELECT status, COUNT(*) as count FROM terminals GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to count terminals by status: {}", e);
                DatabaseError::QueryError(format!("Failed to count terminals: {}", e))
            })?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("status"), row.get("count")))
            .collect())
    }

    /// RUNNING terminals whose last heartbeat is older than `cutoff`.
    pub async fn count_stale_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM terminals
            WHERE status = 'RUNNING' AND (last_heartbeat IS NULL OR last_heartbeat < ?1)
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count stale terminals: {}", e);
            DatabaseError::QueryError(format!("Failed to count stale terminals: {}", e))
        })?;

        Ok(row.get("count"))
    }
}

/// Trading account repository
pub struct AccountRepository {
    pool: DbPool,
}

impl AccountRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        id: &str,
        user_id: &str,
        account_name: &str,
    ) -> Result<AccountRecord, DatabaseError> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, AccountRecord>(
            r#"
            INSERT INTO mt5_accounts (id, user_id, account_name, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(account_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create account {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to create account: {}", e))
        })?;

        Ok(record)
    }

    pub async fn find(&self, id: &str) -> Result<Option<AccountRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, AccountRecord>("SELECT * FROM mt5_accounts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get account {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to get account: {}", e))
            })?;

        Ok(record)
    }

    /// Ownership-checked lookup for the management surface.
    pub async fn find_for_user(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<AccountRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, AccountRecord>(
            "SELECT * FROM mt5_accounts WHERE id = ?1 AND user_id = ?2",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get account {} for user {}: {}", id, user_id, e);
            DatabaseError::QueryError(format!("Failed to get account: {}", e))
        })?;

        Ok(record)
    }

    /// Persist the broker server/login used for provisioning. The password
    /// is deliberately not stored.
    pub async fn update_credentials(
        &self,
        id: &str,
        server: &str,
        login: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE mt5_accounts SET server = ?1, login = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(server)
        .bind(login)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update credentials for account {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to update credentials: {}", e))
        })?;

        Ok(())
    }

    /// Balance/equity snapshot attached to a heartbeat.
    pub async fn update_balance(
        &self,
        id: &str,
        balance: f64,
        equity: f64,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query("UPDATE mt5_accounts SET balance = ?1, equity = ?2, updated_at = ?3 WHERE id = ?4")
            .bind(balance)
            .bind(equity)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to update balance for account {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to update balance: {}", e))
            })?;

        Ok(())
    }
}
