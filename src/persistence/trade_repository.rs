//! Trade Ledger Repository
//!
//! The `TradeStore` trait is the ledger seam used by the trade processor,
//! the batch sync path, and the quarantine retry worker; the SQLite
//! implementation is the production backend. Keeping the trait narrow means
//! reconciliation can be exercised end-to-end against `sqlite::memory:`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use tracing::{debug, error};
use uuid::Uuid;

use super::models::{CreateTrade, TradePatch, TradeRecord};
use super::{DatabaseError, DbPool};

/// Ledger access used by reconciliation.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Look up the ledger row joined to a broker position id.
    async fn find_by_external_id(
        &self,
        user_id: &str,
        account_id: &str,
        external_id: &str,
    ) -> Result<Option<TradeRecord>, DatabaseError>;

    /// Bulk prefetch for batch sync; one query for the whole batch.
    async fn find_many_by_external_ids(
        &self,
        user_id: &str,
        account_id: &str,
        external_ids: &[String],
    ) -> Result<Vec<TradeRecord>, DatabaseError>;

    async fn create(&self, input: CreateTrade) -> Result<TradeRecord, DatabaseError>;

    /// Apply a field-wise patch; `None` fields stay untouched.
    async fn apply_patch(
        &self,
        trade_id: &str,
        patch: TradePatch,
    ) -> Result<TradeRecord, DatabaseError>;

    /// Legacy ticket-based duplicate probe for deals without a position id.
    async fn find_ticket_duplicate(
        &self,
        user_id: &str,
        account_id: &str,
        symbol: &str,
        ticket: i64,
    ) -> Result<Option<TradeRecord>, DatabaseError>;

    /// Attach execution candles (JSON) to a trade row.
    async fn save_execution_candles(
        &self,
        trade_id: &str,
        candles_json: &str,
    ) -> Result<(), DatabaseError>;

    async fn find_open_by_account(
        &self,
        user_id: &str,
        account_id: &str,
    ) -> Result<Vec<TradeRecord>, DatabaseError>;
}

/// SQLite ledger backend
pub struct SqliteTradeStore {
    pool: DbPool,
}

impl SqliteTradeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TradeStore for SqliteTradeStore {
    async fn find_by_external_id(
        &self,
        user_id: &str,
        account_id: &str,
        external_id: &str,
    ) -> Result<Option<TradeRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE user_id = ?1 AND account_id = ?2 AND external_id = ?3",
        )
        .bind(user_id)
        .bind(account_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find trade for position {}: {}", external_id, e);
            DatabaseError::QueryError(format!("Failed to find trade: {}", e))
        })?;

        Ok(record)
    }

    async fn find_many_by_external_ids(
        &self,
        user_id: &str,
        account_id: &str,
        external_ids: &[String],
    ) -> Result<Vec<TradeRecord>, DatabaseError> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; external_ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM trades WHERE user_id = ? AND account_id = ? AND external_id IN ({})",
            placeholders
        );

        let mut query = sqlx::query_as::<_, TradeRecord>(&sql)
            .bind(user_id)
            .bind(account_id);
        for id in external_ids {
            query = query.bind(id);
        }

        let records = query.fetch_all(&self.pool).await.map_err(|e| {
            error!("Failed to prefetch trades by position ids: {}", e);
            DatabaseError::QueryError(format!("Failed to prefetch trades: {}", e))
        })?;

        Ok(records)
    }

    async fn create(&self, input: CreateTrade) -> Result<TradeRecord, DatabaseError> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let record = sqlx::query_as::<_, TradeRecord>(
            r#"
            INSERT INTO trades (
                id, user_id, account_id, symbol, asset_type, side, status, origin,
                sync_source, external_id, external_deal_id, open_time, close_time,
                open_price, close_price, quantity, contract_size, profit_or_loss,
                commission, swap, stop_loss, take_profit, mt5_magic, notes,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?25)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&input.user_id)
        .bind(&input.account_id)
        .bind(&input.symbol)
        .bind(input.asset_type.as_str())
        .bind(input.side.as_str())
        .bind(input.status.as_str())
        .bind(input.origin.as_str())
        .bind(input.sync_source.map(|s| s.as_str()))
        .bind(&input.external_id)
        .bind(input.external_deal_id)
        .bind(input.open_time)
        .bind(input.close_time)
        .bind(input.open_price)
        .bind(input.close_price)
        .bind(input.quantity)
        .bind(input.contract_size)
        .bind(input.profit_or_loss)
        .bind(input.commission)
        .bind(input.swap)
        .bind(input.stop_loss)
        .bind(input.take_profit)
        .bind(input.mt5_magic)
        .bind(&input.notes)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create trade for {}: {}", input.symbol, e);
            DatabaseError::QueryError(format!("Failed to create trade: {}", e))
        })?;

        debug!("Created trade {} for {}", record.id, record.symbol);
        Ok(record)
    }

    async fn apply_patch(
        &self,
        trade_id: &str,
        patch: TradePatch,
    ) -> Result<TradeRecord, DatabaseError> {
        let now = Utc::now();

        // COALESCE(new, old): a bound NULL leaves the column as it was.
        let record = sqlx::query_as::<_, TradeRecord>(
            r#"
            UPDATE trades SET
                status = COALESCE(?1, status),
                open_time = COALESCE(?2, open_time),
                close_time = COALESCE(?3, close_time),
                open_price = COALESCE(?4, open_price),
                close_price = COALESCE(?5, close_price),
                quantity = COALESCE(?6, quantity),
                contract_size = COALESCE(?7, contract_size),
                profit_or_loss = COALESCE(?8, profit_or_loss),
                commission = COALESCE(?9, commission),
                swap = COALESCE(?10, swap),
                stop_loss = COALESCE(?11, stop_loss),
                take_profit = COALESCE(?12, take_profit),
                external_deal_id = COALESCE(?13, external_deal_id),
                mt5_magic = COALESCE(?14, mt5_magic),
                notes = COALESCE(?15, notes),
                updated_at = ?16
            WHERE id = ?17
            RETURNING *
            "#,
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.open_time)
        .bind(patch.close_time)
        .bind(patch.open_price)
        .bind(patch.close_price)
        .bind(patch.quantity)
        .bind(patch.contract_size)
        .bind(patch.profit_or_loss)
        .bind(patch.commission)
        .bind(patch.swap)
        .bind(patch.stop_loss)
        .bind(patch.take_profit)
        .bind(patch.external_deal_id)
        .bind(patch.mt5_magic)
        .bind(patch.notes)
        .bind(now)
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to patch trade {}: {}", trade_id, e);
            DatabaseError::QueryError(format!("Failed to patch trade: {}", e))
        })?;

        record.ok_or_else(|| DatabaseError::QueryError(format!("Trade not found: {}", trade_id)))
    }

    async fn find_ticket_duplicate(
        &self,
        user_id: &str,
        account_id: &str,
        symbol: &str,
        ticket: i64,
    ) -> Result<Option<TradeRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, TradeRecord>(
            r#"
            SELECT * FROM trades
            WHERE user_id = ?1 AND account_id = ?2 AND symbol = ?3 AND external_deal_id = ?4
            "#,
        )
        .bind(user_id)
        .bind(account_id)
        .bind(symbol)
        .bind(ticket)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed duplicate probe for ticket {}: {}", ticket, e);
            DatabaseError::QueryError(format!("Failed duplicate probe: {}", e))
        })?;

        Ok(record)
    }

    async fn save_execution_candles(
        &self,
        trade_id: &str,
        candles_json: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now();
        let rows_affected =
            sqlx::query("UPDATE trades SET execution_candles = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(candles_json)
                .bind(now)
                .bind(trade_id)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to save candles for trade {}: {}", trade_id, e);
                    DatabaseError::QueryError(format!("Failed to save candles: {}", e))
                })?
                .rows_affected();

        if rows_affected == 0 {
            return Err(DatabaseError::QueryError(format!(
                "Trade not found: {}",
                trade_id
            )));
        }

        debug!("Saved execution candles for trade {}", trade_id);
        Ok(())
    }

    async fn find_open_by_account(
        &self,
        user_id: &str,
        account_id: &str,
    ) -> Result<Vec<TradeRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, TradeRecord>(
            r#"
            SELECT * FROM trades
            WHERE user_id = ?1 AND account_id = ?2 AND status = 'OPEN'
            ORDER BY open_time DESC
            "#,
        )
        .bind(user_id)
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list open trades for {}: {}", account_id, e);
            DatabaseError::QueryError(format!("Failed to list open trades: {}", e))
        })?;

        Ok(records)
    }
}

/// Count of ledger rows, used by operational health reporting.
pub async fn count_trades(pool: &DbPool) -> Result<i64, DatabaseError> {
    let row = sqlx::query("SELECT COUNT(*) as count FROM trades")
        .fetch_one(pool)
        .await
        .map_err(|e| DatabaseError::QueryError(format!("Failed to count trades: {}", e)))?;
    Ok(row.get("count"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::deal::SyncSource;
    use crate::domain::entities::trade::{TradeDirection, TradeOrigin, TradeStatus};
    use crate::domain::services::asset_type::AssetType;
    use crate::persistence::init_database;

    fn sample_trade(external_id: &str) -> CreateTrade {
        CreateTrade {
            user_id: "user-1".to_string(),
            account_id: "acct-1".to_string(),
            symbol: "EURUSD".to_string(),
            asset_type: AssetType::Forex,
            side: TradeDirection::Long,
            status: TradeStatus::Open,
            origin: TradeOrigin::Normal,
            sync_source: Some(SyncSource::LocalEa),
            external_id: Some(external_id.to_string()),
            external_deal_id: Some(1001),
            open_time: Utc::now(),
            close_time: None,
            open_price: 1.0850,
            close_price: None,
            quantity: 1.0,
            contract_size: Some(100_000.0),
            profit_or_loss: None,
            commission: Some(2.0),
            swap: None,
            stop_loss: Some(1.0800),
            take_profit: Some(1.0950),
            mt5_magic: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_find_by_external_id() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let store = SqliteTradeStore::new(pool);

        let created = store.create(sample_trade("555001")).await.unwrap();
        assert_eq!(created.status(), TradeStatus::Open);
        assert_eq!(created.sync_source(), Some(SyncSource::LocalEa));

        let found = store
            .find_by_external_id("user-1", "acct-1", "555001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);

        let missing = store
            .find_by_external_id("user-1", "acct-1", "999999")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_patch_leaves_unset_fields_alone() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let store = SqliteTradeStore::new(pool);
        let created = store.create(sample_trade("555002")).await.unwrap();

        let patch = TradePatch {
            status: Some(TradeStatus::Closed),
            close_price: Some(1.0900),
            commission: Some(3.5),
            ..Default::default()
        };
        let updated = store.apply_patch(&created.id, patch).await.unwrap();

        assert_eq!(updated.status(), TradeStatus::Closed);
        assert_eq!(updated.close_price, Some(1.0900));
        assert_eq!(updated.commission, Some(3.5));
        // Untouched fields survive
        assert_eq!(updated.open_price, Some(1.0850));
        assert_eq!(updated.stop_loss, Some(1.0800));
    }

    #[tokio::test]
    async fn test_bulk_prefetch() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let store = SqliteTradeStore::new(pool);
        store.create(sample_trade("700001")).await.unwrap();
        store.create(sample_trade("700002")).await.unwrap();

        let found = store
            .find_many_by_external_ids(
                "user-1",
                "acct-1",
                &["700001".to_string(), "700002".to_string(), "700003".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 2);

        let none = store
            .find_many_by_external_ids("user-1", "acct-1", &[])
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_ticket_duplicate_probe() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let store = SqliteTradeStore::new(pool);
        store.create(sample_trade("800001")).await.unwrap();

        let dup = store
            .find_ticket_duplicate("user-1", "acct-1", "EURUSD", 1001)
            .await
            .unwrap();
        assert!(dup.is_some());

        let none = store
            .find_ticket_duplicate("user-1", "acct-1", "EURUSD", 4242)
            .await
            .unwrap();
        assert!(none.is_none());
    }
}
