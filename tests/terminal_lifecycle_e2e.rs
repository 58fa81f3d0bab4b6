//! Terminal lifecycle, heartbeat/command delivery, quarantine replay, and
//! health reporting, end to end against in-memory SQLite with simulated
//! provisioning (no orchestrator URL configured).

use std::sync::Arc;
use std::time::Duration;

use termfarm::application::services::farm_service::{
    HeartbeatRequest, TerminalFarmService,
};
use termfarm::auth::TerminalTokenService;
use termfarm::domain::entities::deal::DealEvent;
use termfarm::domain::entities::terminal::TerminalStatus;
use termfarm::domain::entities::trade::TradeStatus;
use termfarm::domain::services::trade_processor::TradeProcessor;
use termfarm::infrastructure::orchestrator_client::{OrchestratorClient, TerminalCredentials};
use termfarm::persistence::init_database;
use termfarm::persistence::terminal_repository::{AccountRepository, TerminalRepository};
use termfarm::persistence::trade_repository::{SqliteTradeStore, TradeStore};
use termfarm::queue::command_queue::{CommandQueue, InMemoryCommandQueue, SqliteCommandQueue};
use termfarm::queue::failed_trades::{
    FailedTradeQueue, InMemoryFailedTradeQueue, RetryPolicy, RetryWorker, SqliteFailedTradeQueue,
};

const USER: &str = "user-1";
const ACCOUNT: &str = "acct-1";

struct Harness {
    farm: Arc<TerminalFarmService>,
    terminals: Arc<TerminalRepository>,
    accounts: Arc<AccountRepository>,
    trades: Arc<dyn TradeStore>,
    commands: Arc<dyn CommandQueue>,
    failed: Arc<dyn FailedTradeQueue>,
    processor: Arc<TradeProcessor>,
}

async fn harness(in_memory_queues: bool) -> Harness {
    let pool = init_database("sqlite::memory:").await.unwrap();

    let terminals = Arc::new(TerminalRepository::new(pool.clone()));
    let accounts = Arc::new(AccountRepository::new(pool.clone()));
    let trades: Arc<dyn TradeStore> = Arc::new(SqliteTradeStore::new(pool.clone()));

    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(0),
    };
    let commands: Arc<dyn CommandQueue> = if in_memory_queues {
        Arc::new(InMemoryCommandQueue::default())
    } else {
        Arc::new(SqliteCommandQueue::new(pool.clone()))
    };
    let failed: Arc<dyn FailedTradeQueue> = if in_memory_queues {
        Arc::new(InMemoryFailedTradeQueue::new(policy))
    } else {
        Arc::new(SqliteFailedTradeQueue::new(pool.clone(), policy))
    };

    let processor = Arc::new(TradeProcessor::new(trades.clone(), commands.clone()));
    let orchestrator =
        Arc::new(OrchestratorClient::new(None, Duration::from_secs(1)).unwrap());
    let tokens = Arc::new(TerminalTokenService::new("e2e-signing-secret-0123456789", 3600));

    accounts.create(ACCOUNT, USER, "Demo Account").await.unwrap();

    let farm = TerminalFarmService::new(
        terminals.clone(),
        accounts.clone(),
        trades.clone(),
        commands.clone(),
        failed.clone(),
        processor.clone(),
        orchestrator,
        tokens,
        300,
    );

    Harness {
        farm,
        terminals,
        accounts,
        trades,
        commands,
        failed,
        processor,
    }
}

fn credentials() -> TerminalCredentials {
    TerminalCredentials {
        server: "Broker-Demo".to_string(),
        login: "123456".to_string(),
        password: "hunter2".to_string(),
    }
}

/// Background provisioning is asynchronous; poll until the expected status
/// lands or the deadline passes.
async fn wait_for_status(
    terminals: &TerminalRepository,
    terminal_id: &str,
    expected: TerminalStatus,
) -> bool {
    for _ in 0..100 {
        let terminal = terminals.find(terminal_id).await.unwrap().unwrap();
        if terminal.status() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn enable_provisions_to_running() {
    let h = harness(false).await;

    let dto = h
        .farm
        .enable_auto_sync(ACCOUNT, USER, credentials())
        .await
        .unwrap();
    assert_eq!(dto.status, TerminalStatus::Pending);

    assert!(wait_for_status(&h.terminals, &dto.id, TerminalStatus::Running).await);

    let terminal = h.terminals.find(&dto.id).await.unwrap().unwrap();
    assert!(terminal.container_id.as_deref().unwrap().starts_with("sim-"));
    assert!(terminal.last_heartbeat.is_some());
}

#[tokio::test]
async fn enable_twice_rejected_while_running() {
    let h = harness(false).await;

    let dto = h
        .farm
        .enable_auto_sync(ACCOUNT, USER, credentials())
        .await
        .unwrap();
    assert!(wait_for_status(&h.terminals, &dto.id, TerminalStatus::Running).await);

    let second = h.farm.enable_auto_sync(ACCOUNT, USER, credentials()).await;
    assert!(second.is_err(), "already-enabled must be rejected");
}

#[tokio::test]
async fn disable_tears_down_and_clears_commands() {
    let h = harness(false).await;

    let dto = h
        .farm
        .enable_auto_sync(ACCOUNT, USER, credentials())
        .await
        .unwrap();
    assert!(wait_for_status(&h.terminals, &dto.id, TerminalStatus::Running).await);

    h.commands
        .queue_command(&dto.id, "FETCH_CANDLES", "EURUSD,1m,a,b,c")
        .await
        .unwrap();

    h.farm.disable_auto_sync(ACCOUNT, USER).await.unwrap();
    assert!(wait_for_status(&h.terminals, &dto.id, TerminalStatus::Stopped).await);

    let terminal = h.terminals.find(&dto.id).await.unwrap().unwrap();
    assert!(terminal.container_id.is_none());
    assert!(h.commands.next_command(&dto.id).await.unwrap().is_none());
}

#[tokio::test]
async fn stopped_terminal_can_be_reenabled() {
    let h = harness(false).await;

    let dto = h
        .farm
        .enable_auto_sync(ACCOUNT, USER, credentials())
        .await
        .unwrap();
    assert!(wait_for_status(&h.terminals, &dto.id, TerminalStatus::Running).await);

    h.farm.disable_auto_sync(ACCOUNT, USER).await.unwrap();
    assert!(wait_for_status(&h.terminals, &dto.id, TerminalStatus::Stopped).await);

    let again = h
        .farm
        .enable_auto_sync(ACCOUNT, USER, credentials())
        .await
        .unwrap();
    assert_eq!(again.id, dto.id, "same terminal row is reused");
    assert!(wait_for_status(&h.terminals, &dto.id, TerminalStatus::Running).await);
}

#[tokio::test]
async fn heartbeat_delivers_exactly_one_command() {
    let h = harness(false).await;
    let terminal = h.terminals.create(ACCOUNT).await.unwrap();

    h.commands
        .queue_command(&terminal.id, "SYNC_TRADES", "")
        .await
        .unwrap();
    // Same logical command again: collapses onto the queued one.
    h.commands
        .queue_command(&terminal.id, "SYNC_TRADES", "")
        .await
        .unwrap();

    let first = h
        .farm
        .process_heartbeat(HeartbeatRequest {
            terminal_id: terminal.id.clone(),
            auth_token: None,
            account_info: None,
        })
        .await
        .unwrap();
    assert_eq!(first.command.as_deref(), Some("SYNC_TRADES"));

    let second = h
        .farm
        .process_heartbeat(HeartbeatRequest {
            terminal_id: terminal.id.clone(),
            auth_token: None,
            account_info: None,
        })
        .await
        .unwrap();
    assert!(second.command.is_none(), "command dispatch is exactly-once");
}

#[tokio::test]
async fn heartbeat_self_heals_and_applies_account_snapshot() {
    let h = harness(false).await;
    let terminal = h.terminals.create(ACCOUNT).await.unwrap();
    h.terminals
        .record_error(&terminal.id, "orchestrator burp")
        .await
        .unwrap();

    let response = h
        .farm
        .process_heartbeat(HeartbeatRequest {
            terminal_id: terminal.id.clone(),
            auth_token: None,
            account_info: Some(serde_json::from_value(serde_json::json!({
                "balance": 10_000.0,
                "equity": 10_250.0
            })).unwrap()),
        })
        .await
        .unwrap();
    assert!(response.success);

    let healed = h.terminals.find(&terminal.id).await.unwrap().unwrap();
    assert_eq!(healed.status(), TerminalStatus::Running);
    assert!(healed.last_heartbeat.is_some());

    let account = h.accounts.find(ACCOUNT).await.unwrap().unwrap();
    assert_eq!(account.balance, Some(10_000.0));
    assert_eq!(account.equity, Some(10_250.0));
}

#[tokio::test]
async fn quarantine_replay_converges_to_same_ledger_state() {
    let h = harness(false).await;
    let terminal = h.terminals.create(ACCOUNT).await.unwrap();

    // A deal that failed in live processing (simulated transient error at
    // receive time) sits in quarantine...
    let deal: DealEvent = serde_json::from_value(serde_json::json!({
        "ticket": 9100,
        "symbol": "EURUSD",
        "type": "BUY",
        "volume": 1.0,
        "openPrice": 1.0850,
        "openTime": 1_700_000_000,
        "positionId": 910,
        "entryType": 0
    }))
    .unwrap();
    h.failed
        .queue_failed_trade(&terminal.id, &deal, "transient ledger error")
        .await
        .unwrap();
    assert_eq!(h.failed.stats().await.unwrap().waiting, 1);

    // ...and the retry worker replays it through the same processor path.
    let worker = RetryWorker {
        queue: h.failed.clone(),
        terminals: h.terminals.clone(),
        accounts: h.accounts.clone(),
        trades: h.trades.clone(),
        processor: h.processor.clone(),
    };
    worker.drain_due().await.unwrap();

    let row = h
        .trades
        .find_by_external_id(USER, ACCOUNT, "910")
        .await
        .unwrap()
        .expect("replayed deal must land in the ledger");
    assert_eq!(row.status(), TradeStatus::Open);
    assert_eq!(row.open_price, Some(1.0850));
    assert_eq!(h.failed.stats().await.unwrap().waiting, 0);

    // Replaying the same deal again (job re-queued by a confused terminal)
    // converges: no duplicate row.
    h.failed
        .queue_failed_trade(&terminal.id, &deal, "requeued")
        .await
        .unwrap();
    worker.drain_due().await.unwrap();

    let all = h
        .trades
        .find_many_by_external_ids(USER, ACCOUNT, &["910".to_string()])
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn farm_health_reports_counts_and_backend() {
    let h = harness(false).await;
    let terminal = h.terminals.create(ACCOUNT).await.unwrap();
    h.terminals.touch_heartbeat(&terminal.id).await.unwrap();

    let health = h.farm.farm_health().await.unwrap();
    assert_eq!(health.terminals.total, 1);
    assert_eq!(health.terminals.running, 1);
    assert!(!health.command_queue.degraded);
    assert!(!health.failed_trade_queue.degraded);
    assert!(health.orchestrator_simulated);
}

#[tokio::test]
async fn degraded_queues_are_visible_in_health() {
    let h = harness(true).await;

    let health = h.farm.farm_health().await.unwrap();
    assert!(health.command_queue.degraded);
    assert!(health.failed_trade_queue.degraded);
}

#[tokio::test]
async fn orchestrator_config_feeds_desired_state() {
    let h = harness(false).await;

    let dto = h
        .farm
        .enable_auto_sync(ACCOUNT, USER, credentials())
        .await
        .unwrap();
    assert!(wait_for_status(&h.terminals, &dto.id, TerminalStatus::Running).await);

    let entries = h.farm.orchestrator_config().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, "RUNNING");
    assert_eq!(entries[0].environment.server.as_deref(), Some("Broker-Demo"));
    assert_eq!(entries[0].environment.login.as_deref(), Some("123456"));
    assert!(entries[0].environment.terminal_token.is_some());

    h.farm.disable_auto_sync(ACCOUNT, USER).await.unwrap();
    assert!(wait_for_status(&h.terminals, &dto.id, TerminalStatus::Stopped).await);

    let entries = h.farm.orchestrator_config().await.unwrap();
    assert_eq!(entries[0].status, "STOPPED");
    assert!(entries[0].environment.terminal_token.is_none());
}
