//! End-to-end reconciliation tests.
//!
//! Drives the full batch sync path (webhook-shaped requests through
//! `TerminalFarmService::process_trades`) against an in-memory SQLite
//! ledger, and asserts the reconciliation invariants: idempotent entries,
//! cross-source conflict isolation, orphan exits, partial-close volume
//! conservation, and per-deal failure quarantine.

use std::sync::Arc;

use termfarm::application::services::farm_service::{TerminalFarmService, TradeSyncRequest};
use termfarm::auth::TerminalTokenService;
use termfarm::domain::entities::deal::{DealEvent, SyncSource};
use termfarm::domain::entities::trade::{TradeDirection, TradeOrigin, TradeStatus};
use termfarm::domain::services::asset_type::AssetType;
use termfarm::domain::services::trade_processor::TradeProcessor;
use termfarm::infrastructure::orchestrator_client::OrchestratorClient;
use termfarm::persistence::init_database;
use termfarm::persistence::models::{CreateTrade, TradeRecord};
use termfarm::persistence::terminal_repository::{AccountRepository, TerminalRepository};
use termfarm::persistence::trade_repository::{SqliteTradeStore, TradeStore};
use termfarm::queue::command_queue::{CommandQueue, SqliteCommandQueue};
use termfarm::queue::failed_trades::{FailedTradeQueue, RetryPolicy, SqliteFailedTradeQueue};

const USER: &str = "user-1";
const ACCOUNT: &str = "acct-1";

struct Harness {
    farm: Arc<TerminalFarmService>,
    trades: Arc<dyn TradeStore>,
    commands: Arc<dyn CommandQueue>,
    failed: Arc<dyn FailedTradeQueue>,
    terminal_id: String,
}

async fn harness() -> Harness {
    let pool = init_database("sqlite::memory:").await.unwrap();

    let terminals = Arc::new(TerminalRepository::new(pool.clone()));
    let accounts = Arc::new(AccountRepository::new(pool.clone()));
    let trades: Arc<dyn TradeStore> = Arc::new(SqliteTradeStore::new(pool.clone()));
    let commands: Arc<dyn CommandQueue> = Arc::new(SqliteCommandQueue::new(pool.clone()));
    let failed: Arc<dyn FailedTradeQueue> = Arc::new(SqliteFailedTradeQueue::new(
        pool.clone(),
        RetryPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(0),
        },
    ));
    let processor = Arc::new(TradeProcessor::new(trades.clone(), commands.clone()));
    let orchestrator = Arc::new(
        OrchestratorClient::new(None, std::time::Duration::from_secs(1)).unwrap(),
    );
    let tokens = Arc::new(TerminalTokenService::new("e2e-signing-secret-0123456789", 3600));

    accounts.create(ACCOUNT, USER, "Demo Account").await.unwrap();
    let terminal = terminals.create(ACCOUNT).await.unwrap();

    let farm = TerminalFarmService::new(
        terminals,
        accounts,
        trades.clone(),
        commands.clone(),
        failed.clone(),
        processor,
        orchestrator,
        tokens,
        300,
    );

    Harness {
        farm,
        trades,
        commands,
        failed,
        terminal_id: terminal.id,
    }
}

fn deal(json: serde_json::Value) -> DealEvent {
    serde_json::from_value(json).unwrap()
}

fn entry(position_id: i64) -> DealEvent {
    deal(serde_json::json!({
        "ticket": position_id * 10,
        "symbol": "EURUSD",
        "type": "BUY",
        "volume": 1.0,
        "openPrice": 1.0850,
        "openTime": 1_700_000_000,
        "commission": 2.0,
        "positionId": position_id,
        "entryType": 0,
        "contractSize": 100000.0
    }))
}

fn exit(position_id: i64) -> DealEvent {
    deal(serde_json::json!({
        "ticket": position_id * 10 + 1,
        "symbol": "EURUSD",
        "type": "SELL",
        "volume": 1.0,
        "openPrice": 1.0900,
        "openTime": 1_700_100_000,
        "commission": 1.5,
        "profit": 500.0,
        "positionId": position_id,
        "entryType": 1,
        "contractSize": 100000.0
    }))
}

impl Harness {
    async fn sync(&self, trades: Vec<DealEvent>) -> termfarm::application::services::farm_service::SyncSummary {
        self.farm
            .process_trades(TradeSyncRequest {
                terminal_id: self.terminal_id.clone(),
                auth_token: None,
                trades,
            })
            .await
            .unwrap()
    }

    async fn ledger_row(&self, position_id: &str) -> Option<TradeRecord> {
        self.trades
            .find_by_external_id(USER, ACCOUNT, position_id)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn entry_processing_is_idempotent_across_batches() {
    let h = harness().await;

    let first = h.sync(vec![entry(1001)]).await;
    assert_eq!(first.imported, 1);

    let second = h.sync(vec![entry(1001)]).await;
    assert_eq!(second.imported, 0);
    assert_eq!(second.skipped, 1);

    let row = h.ledger_row("1001").await.unwrap();
    assert_eq!(row.status(), TradeStatus::Open);

    // Exactly one row for the position
    let all = h
        .trades
        .find_many_by_external_ids(USER, ACCOUNT, &["1001".to_string()])
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn duplicate_entry_within_one_batch_creates_one_row() {
    let h = harness().await;

    let summary = h.sync(vec![entry(1002), entry(1002)]).await;
    assert_eq!(summary.imported, 1);
    assert_eq!(summary.skipped, 1);

    let all = h
        .trades
        .find_many_by_external_ids(USER, ACCOUNT, &["1002".to_string()])
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn cross_source_conflict_leaves_row_unchanged() {
    let h = harness().await;

    // Ledger row already owned by the MetaApi channel.
    let seeded = h
        .trades
        .create(CreateTrade {
            user_id: USER.to_string(),
            account_id: ACCOUNT.to_string(),
            symbol: "EURUSD".to_string(),
            asset_type: AssetType::Forex,
            side: TradeDirection::Long,
            status: TradeStatus::Open,
            origin: TradeOrigin::Normal,
            sync_source: Some(SyncSource::Metaapi),
            external_id: Some("2001".to_string()),
            external_deal_id: Some(555),
            open_time: chrono::Utc::now(),
            close_time: None,
            open_price: 1.0850,
            close_price: None,
            quantity: 1.0,
            contract_size: Some(100_000.0),
            profit_or_loss: None,
            commission: None,
            swap: None,
            stop_loss: None,
            take_profit: None,
            mt5_magic: None,
            notes: None,
        })
        .await
        .unwrap();

    // The local EA reports the same position: refused, not merged.
    let summary = h.sync(vec![entry(2001)]).await;
    assert_eq!(summary.imported, 0);
    assert_eq!(summary.skipped, 1);

    let after = h.ledger_row("2001").await.unwrap();
    assert_eq!(after, seeded, "conflict must leave the row byte-identical");
}

#[tokio::test]
async fn exit_without_entry_produces_orphan() {
    let h = harness().await;

    let summary = h.sync(vec![exit(3001)]).await;
    assert_eq!(summary.imported, 1);

    let orphan = h.ledger_row("3001").await.unwrap();
    assert_eq!(orphan.status(), TradeStatus::Closed);
    assert_eq!(orphan.open_price, Some(0.0));
    assert_eq!(orphan.origin(), TradeOrigin::OrphanExit);
    assert!(orphan.notes.as_deref().unwrap().contains("Orphan"));
    // Exit SELL means the position was LONG
    assert_eq!(orphan.side, "LONG");
}

#[tokio::test]
async fn exit_closes_and_queues_candle_fetch() {
    let h = harness().await;

    h.sync(vec![entry(4001)]).await;
    let summary = h.sync(vec![exit(4001)]).await;
    assert_eq!(summary.imported, 1);

    let closed = h.ledger_row("4001").await.unwrap();
    assert_eq!(closed.status(), TradeStatus::Closed);
    assert_eq!(closed.close_price, Some(1.0900));
    assert_eq!(closed.profit_or_loss, Some(500.0));
    assert_eq!(closed.commission, Some(3.5));

    let command = h.commands.next_command(&h.terminal_id).await.unwrap().unwrap();
    assert_eq!(command.command, "FETCH_CANDLES");
    assert!(command.payload.starts_with("EURUSD,1m,"));
    assert!(command.payload.ends_with(&closed.id));
}

#[tokio::test]
async fn entry_and_exit_in_one_batch_resolve_in_order() {
    let h = harness().await;

    // The exit must observe the entry created earlier in the same batch.
    let summary = h.sync(vec![entry(4500), exit(4500)]).await;
    assert_eq!(summary.imported, 2);

    let row = h.ledger_row("4500").await.unwrap();
    assert_eq!(row.status(), TradeStatus::Closed);
    assert_eq!(row.origin(), TradeOrigin::Normal, "not an orphan");
    assert_eq!(row.open_price, Some(1.0850));
}

#[tokio::test]
async fn partial_close_conserves_volume() {
    let h = harness().await;

    h.sync(vec![entry(5001)]).await;

    let mut partial = exit(5001);
    partial.entry_type = Some(2);
    partial.volume = Some(0.4);
    h.sync(vec![partial.clone()]).await;

    let closed = h.ledger_row("5001").await.unwrap();
    assert_eq!(closed.status(), TradeStatus::Closed);

    let remainder = h
        .ledger_row(&format!("5001_partial_{}", partial.ticket))
        .await
        .unwrap();
    assert_eq!(remainder.status(), TradeStatus::Open);
    assert_eq!(remainder.origin(), TradeOrigin::PartialRemainder);
    assert!((remainder.quantity.unwrap() - 0.6).abs() < 1e-5);

    // Closed volume plus remainder equals the original entry volume.
    let total = partial.volume.unwrap() + remainder.quantity.unwrap();
    assert!((total - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn full_inout_close_leaves_no_remainder() {
    let h = harness().await;

    h.sync(vec![entry(5002)]).await;

    let mut full = exit(5002);
    full.entry_type = Some(2);
    full.volume = Some(1.0);
    h.sync(vec![full.clone()]).await;

    assert_eq!(h.ledger_row("5002").await.unwrap().status(), TradeStatus::Closed);
    assert!(h
        .ledger_row(&format!("5002_partial_{}", full.ticket))
        .await
        .is_none());
}

#[tokio::test]
async fn malformed_deal_is_quarantined_and_batch_continues() {
    let h = harness().await;

    let mut bad = entry(6001);
    bad.open_time = Some(termfarm::domain::services::terminal_time::TimeField::Text(
        "not-a-timestamp".to_string(),
    ));

    let summary = h.sync(vec![bad, entry(6002)]).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.imported, 1, "good deal still lands");

    assert!(h.ledger_row("6002").await.is_some());
    assert_eq!(h.failed.stats().await.unwrap().waiting, 1);
}

#[tokio::test]
async fn deal_times_normalize_identically_across_encodings() {
    let h = harness().await;
    let expected = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();

    let mut seconds_string = entry(7001);
    seconds_string.open_time = Some(termfarm::domain::services::terminal_time::TimeField::Text(
        "1700000000".to_string(),
    ));
    let mut millis_number = entry(7002);
    millis_number.open_time = Some(termfarm::domain::services::terminal_time::TimeField::Numeric(
        1_700_000_000_000.0,
    ));
    let mut iso_string = entry(7003);
    iso_string.open_time = Some(termfarm::domain::services::terminal_time::TimeField::Text(
        "2023-11-14T22:13:20.000Z".to_string(),
    ));

    h.sync(vec![seconds_string, millis_number, iso_string]).await;

    for position in ["7001", "7002", "7003"] {
        let row = h.ledger_row(position).await.unwrap();
        assert_eq!(row.open_time, Some(expected), "position {}", position);
    }
}

#[tokio::test]
async fn legacy_ticket_deals_import_once() {
    let h = harness().await;

    let legacy = deal(serde_json::json!({
        "ticket": 8001,
        "symbol": "GBPUSD",
        "type": "SELL",
        "volume": 0.5,
        "openPrice": 1.2650,
        "openTime": 1_700_000_000,
        "closeTime": 1_700_050_000,
        "closePrice": 1.2600,
        "profit": 250.0
    }));

    let first = h.sync(vec![legacy.clone()]).await;
    assert_eq!(first.imported, 1);

    let second = h.sync(vec![legacy]).await;
    assert_eq!(second.skipped, 1);
}
