//! Database Models
//!
//! Persistent records plus the create/patch input structs the repositories
//! accept. Enumerated columns are stored as text and exposed through typed
//! accessors; an unreadable value degrades to a safe default instead of
//! panicking in a read path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::entities::deal::SyncSource;
use crate::domain::entities::terminal::TerminalStatus;
use crate::domain::entities::trade::{TradeDirection, TradeOrigin, TradeStatus};
use crate::domain::services::asset_type::AssetType;

/// Trading account record
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccountRecord {
    pub id: String,
    pub user_id: String,
    pub account_name: String,
    pub server: Option<String>,
    pub login: Option<String>,
    pub balance: Option<f64>,
    pub equity: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal instance record
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TerminalRecord {
    pub id: String,
    pub account_id: String,
    pub status: String,
    pub container_id: Option<String>,
    pub error_message: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Freeform JSON blob: live-positions snapshot, positions_updated_at.
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TerminalRecord {
    pub fn status(&self) -> TerminalStatus {
        TerminalStatus::parse(&self.status).unwrap_or(TerminalStatus::Error)
    }

    pub fn metadata_value(&self) -> serde_json::Value {
        self.metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Ledger trade record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TradeRecord {
    pub id: String,
    pub user_id: String,
    pub account_id: String,
    pub symbol: String,
    pub asset_type: String,
    pub side: String,
    pub status: String,
    pub origin: String,
    pub sync_source: Option<String>,
    /// Broker position id; the reconciliation join key. Never reassigned.
    pub external_id: Option<String>,
    /// Deal ticket that created or closed the position. Audit only.
    pub external_deal_id: Option<i64>,
    pub open_time: Option<DateTime<Utc>>,
    pub close_time: Option<DateTime<Utc>>,
    pub open_price: Option<f64>,
    pub close_price: Option<f64>,
    pub quantity: Option<f64>,
    pub contract_size: Option<f64>,
    pub profit_or_loss: Option<f64>,
    pub commission: Option<f64>,
    pub swap: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub mt5_magic: Option<i64>,
    pub notes: Option<String>,
    pub execution_candles: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn status(&self) -> TradeStatus {
        TradeStatus::parse(&self.status).unwrap_or(TradeStatus::Open)
    }

    pub fn origin(&self) -> TradeOrigin {
        TradeOrigin::parse(&self.origin).unwrap_or(TradeOrigin::Normal)
    }

    pub fn sync_source(&self) -> Option<SyncSource> {
        self.sync_source.as_deref().and_then(SyncSource::parse)
    }
}

/// Input for creating a ledger trade row
#[derive(Debug, Clone)]
pub struct CreateTrade {
    pub user_id: String,
    pub account_id: String,
    pub symbol: String,
    pub asset_type: AssetType,
    pub side: TradeDirection,
    pub status: TradeStatus,
    pub origin: TradeOrigin,
    pub sync_source: Option<SyncSource>,
    pub external_id: Option<String>,
    pub external_deal_id: Option<i64>,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub open_price: f64,
    pub close_price: Option<f64>,
    pub quantity: f64,
    pub contract_size: Option<f64>,
    pub profit_or_loss: Option<f64>,
    pub commission: Option<f64>,
    pub swap: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub mt5_magic: Option<i64>,
    pub notes: Option<String>,
}

/// Field-wise ledger patch. `Some` fields are written, `None` fields are
/// left untouched, so the same patch shape serves both "fill missing entry
/// fields" and "close this trade" mutations.
#[derive(Debug, Clone, Default)]
pub struct TradePatch {
    pub status: Option<TradeStatus>,
    pub open_time: Option<DateTime<Utc>>,
    pub close_time: Option<DateTime<Utc>>,
    pub open_price: Option<f64>,
    pub close_price: Option<f64>,
    pub quantity: Option<f64>,
    pub contract_size: Option<f64>,
    pub profit_or_loss: Option<f64>,
    pub commission: Option<f64>,
    pub swap: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub external_deal_id: Option<i64>,
    pub mt5_magic: Option<i64>,
    pub notes: Option<String>,
}

impl TradePatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.open_time.is_none()
            && self.close_time.is_none()
            && self.open_price.is_none()
            && self.close_price.is_none()
            && self.quantity.is_none()
            && self.contract_size.is_none()
            && self.profit_or_loss.is_none()
            && self.commission.is_none()
            && self.swap.is_none()
            && self.stop_loss.is_none()
            && self.take_profit.is_none()
            && self.external_deal_id.is_none()
            && self.mt5_magic.is_none()
            && self.notes.is_none()
    }
}

/// Queued command row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueuedCommandRecord {
    pub id: i64,
    pub terminal_id: String,
    pub command: String,
    pub payload: String,
    pub command_key: String,
    pub created_at: DateTime<Utc>,
}

/// Quarantined deal event row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FailedTradeRecord {
    pub id: i64,
    pub terminal_id: String,
    pub deal_json: String,
    pub reason: Option<String>,
    pub attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub exhausted: bool,
}
