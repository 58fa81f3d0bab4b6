//! Terminal Farm Service
//!
//! Owns the terminal lifecycle state machine and the batch sync path. The
//! HTTP handlers are thin wrappers around this service; background workers
//! (quarantine retry) share the same repositories and processor, so every
//! ledger mutation flows through one reconciliation path.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::domain::entities::deal::{DealEvent, SyncSource};
use crate::domain::entities::terminal::TerminalStatus;
use crate::domain::errors::LifecycleError;
use crate::domain::services::terminal_time::{normalize_optional, TimeField};
use crate::domain::services::trade_processor::{DealAction, DealContext, TradeProcessor};
use crate::infrastructure::orchestrator_client::{OrchestratorClient, TerminalCredentials};
use crate::persistence::models::{AccountRecord, TerminalRecord, TradePatch};
use crate::persistence::terminal_repository::{AccountRepository, TerminalRepository};
use crate::persistence::trade_repository::TradeStore;
use crate::queue::command_queue::CommandQueue;
use crate::queue::failed_trades::FailedTradeQueue;
use crate::queue::{QueueBackend, QueueStats};

// ─── Wire DTOs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfoDto {
    pub balance: f64,
    pub equity: f64,
    #[serde(default)]
    pub margin: Option<f64>,
    #[serde(default)]
    pub free_margin: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub terminal_id: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub account_info: Option<AccountInfoDto>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeSyncRequest {
    pub terminal_id: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub trades: Vec<DealEvent>,
}

#[derive(Debug, Default, Serialize)]
pub struct SyncSummary {
    pub imported: u32,
    pub skipped: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleDto {
    pub time: Option<TimeField>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleSyncRequest {
    pub terminal_id: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub trade_id: String,
    pub symbol: String,
    pub candles: Vec<CandleDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePositionDto {
    pub ticket: i64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: String,
    pub volume: f64,
    pub open_price: f64,
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub profit: Option<f64>,
    #[serde(default)]
    pub open_time: Option<TimeField>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionsRequest {
    pub terminal_id: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub positions: Vec<LivePositionDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalStatusDto {
    pub id: String,
    pub account_id: String,
    pub account_name: String,
    pub status: TerminalStatus,
    pub container_id: Option<String>,
    pub error_message: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePositionsDto {
    pub enabled: bool,
    pub account_id: String,
    pub account_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TerminalStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub positions_updated_at: Option<String>,
    pub positions: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct QueueHealth {
    pub backend: QueueBackend,
    pub degraded: bool,
    #[serde(flatten)]
    pub stats: QueueStats,
}

#[derive(Debug, Default, Serialize)]
pub struct TerminalCounts {
    pub total: i64,
    pub running: i64,
    pub pending: i64,
    pub starting: i64,
    pub stopping: i64,
    pub stopped: i64,
    pub error: i64,
    /// RUNNING terminals whose heartbeat has gone quiet.
    pub stale: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmHealth {
    pub terminals: TerminalCounts,
    pub command_queue: QueueHealth,
    pub failed_trade_queue: QueueHealth,
    pub orchestrator_simulated: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalHealthDto {
    pub id: String,
    pub account_id: String,
    pub status: TerminalStatus,
    pub container_id: Option<String>,
    pub error_message: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

/// One entry of the desired-state feed consumed by the external
/// orchestrator's reconciliation loop.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorEntry {
    pub id: String,
    pub account_id: String,
    pub status: &'static str,
    pub environment: OrchestratorEnvironment,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorEnvironment {
    pub server: Option<String>,
    pub login: Option<String>,
    /// Freshly signed webhook token for the terminal's EA.
    pub terminal_token: Option<String>,
}

// ─── Service ────────────────────────────────────────────────────────────

pub struct TerminalFarmService {
    terminals: Arc<TerminalRepository>,
    accounts: Arc<AccountRepository>,
    trades: Arc<dyn TradeStore>,
    commands: Arc<dyn CommandQueue>,
    failed_trades: Arc<dyn FailedTradeQueue>,
    processor: Arc<TradeProcessor>,
    orchestrator: Arc<OrchestratorClient>,
    tokens: Arc<crate::auth::TerminalTokenService>,
    stale_after: Duration,
}

impl TerminalFarmService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        terminals: Arc<TerminalRepository>,
        accounts: Arc<AccountRepository>,
        trades: Arc<dyn TradeStore>,
        commands: Arc<dyn CommandQueue>,
        failed_trades: Arc<dyn FailedTradeQueue>,
        processor: Arc<TradeProcessor>,
        orchestrator: Arc<OrchestratorClient>,
        tokens: Arc<crate::auth::TerminalTokenService>,
        stale_after_seconds: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            terminals,
            accounts,
            trades,
            commands,
            failed_trades,
            processor,
            orchestrator,
            tokens,
            stale_after: Duration::seconds(stale_after_seconds),
        })
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Enable auto-sync for an account: create or reset the terminal row and
    /// kick off provisioning in the background. Returns immediately with the
    /// PENDING record; the caller polls status for progress.
    pub async fn enable_auto_sync(
        self: &Arc<Self>,
        account_id: &str,
        user_id: &str,
        credentials: TerminalCredentials,
    ) -> Result<TerminalStatusDto, LifecycleError> {
        info!("Enabling auto-sync for account {}", account_id);

        let account = self
            .accounts
            .find_for_user(account_id, user_id)
            .await?
            .ok_or(LifecycleError::AccountNotFound)?;

        let terminal = match self.terminals.find_by_account(account_id).await? {
            Some(existing) if existing.status() == TerminalStatus::Running => {
                return Err(LifecycleError::AlreadyEnabled);
            }
            Some(existing)
                if matches!(
                    existing.status(),
                    TerminalStatus::Stopped | TerminalStatus::Error
                ) =>
            {
                self.terminals.reset_pending(&existing.id).await?
            }
            // PENDING/STARTING/STOPPING: leave the in-flight transition alone
            // and let provisioning run again from the current row.
            Some(existing) => existing,
            None => self.terminals.create(account_id).await?,
        };

        // Server/login are persisted for the orchestrator feed; the password
        // stays in memory for the provisioning call only.
        self.accounts
            .update_credentials(account_id, &credentials.server, &credentials.login)
            .await?;

        let service = Arc::clone(self);
        let terminal_id = terminal.id.clone();
        tokio::spawn(async move {
            if let Err(e) = service.provision_terminal(&terminal_id, credentials).await {
                error!("Failed to provision terminal {}: {}", terminal_id, e);
            }
        });

        Ok(self.status_dto(&terminal, &account))
    }

    /// PENDING -> STARTING -> RUNNING, or ERROR with the message recorded.
    /// No automatic re-provisioning: a failed attempt needs a fresh enable.
    pub async fn provision_terminal(
        &self,
        terminal_id: &str,
        credentials: TerminalCredentials,
    ) -> Result<(), LifecycleError> {
        let terminal = self
            .terminals
            .find(terminal_id)
            .await?
            .ok_or_else(|| LifecycleError::UnknownTerminal(terminal_id.to_string()))?;

        info!(
            "Provisioning terminal {} for account {}",
            terminal_id, terminal.account_id
        );

        if terminal.status() == TerminalStatus::Pending {
            self.terminals
                .transition(terminal_id, TerminalStatus::Starting)
                .await?;
        }

        match self
            .orchestrator
            .provision(terminal_id, &terminal.account_id, &credentials)
            .await
        {
            Ok(container_id) => {
                self.terminals
                    .mark_running(terminal_id, Some(&container_id))
                    .await?;
                info!("Terminal {} provisioned as {}", terminal_id, container_id);
                Ok(())
            }
            Err(e) => {
                self.terminals
                    .record_error(terminal_id, &e.to_string())
                    .await?;
                Err(LifecycleError::Orchestrator(e.to_string()))
            }
        }
    }

    /// Disable auto-sync: mark STOPPING and tear down in the background.
    pub async fn disable_auto_sync(
        self: &Arc<Self>,
        account_id: &str,
        user_id: &str,
    ) -> Result<(), LifecycleError> {
        info!("Disabling auto-sync for account {}", account_id);

        self.accounts
            .find_for_user(account_id, user_id)
            .await?
            .ok_or(LifecycleError::AccountNotFound)?;

        let terminal = self
            .terminals
            .find_by_account(account_id)
            .await?
            .ok_or(LifecycleError::NotEnabled)?;

        self.terminals
            .transition(&terminal.id, TerminalStatus::Stopping)
            .await?;

        let service = Arc::clone(self);
        let terminal_id = terminal.id.clone();
        tokio::spawn(async move {
            if let Err(e) = service.teardown_terminal(&terminal_id).await {
                error!("Failed to tear down terminal {}: {}", terminal_id, e);
            }
        });

        Ok(())
    }

    /// STOPPING -> STOPPED with the container handle cleared; ERROR on any
    /// orchestrator failure. Pending commands are cancelled once the
    /// teardown succeeds.
    pub async fn teardown_terminal(&self, terminal_id: &str) -> Result<(), LifecycleError> {
        let terminal = self
            .terminals
            .find(terminal_id)
            .await?
            .ok_or_else(|| LifecycleError::UnknownTerminal(terminal_id.to_string()))?;

        let result = match terminal.container_id.as_deref() {
            Some(container_id) => self.orchestrator.teardown(container_id).await,
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.terminals.mark_stopped(terminal_id).await?;
                if let Err(e) = self.commands.clear_terminal(terminal_id).await {
                    warn!(
                        "Failed to clear queued commands for terminal {}: {}",
                        terminal_id, e
                    );
                }
                info!("Terminal {} torn down", terminal_id);
                Ok(())
            }
            Err(e) => {
                self.terminals
                    .record_error(terminal_id, &e.to_string())
                    .await?;
                Err(LifecycleError::Orchestrator(e.to_string()))
            }
        }
    }

    // ─── Telemetry ingress ──────────────────────────────────────────

    /// Heartbeat: refresh liveness, apply the account snapshot if attached,
    /// and hand back the next queued command. This response is the only
    /// delivery channel to the terminal.
    pub async fn process_heartbeat(
        &self,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, LifecycleError> {
        debug!("Heartbeat from terminal {}", request.terminal_id);

        let terminal = self
            .terminals
            .find(&request.terminal_id)
            .await?
            .ok_or_else(|| LifecycleError::UnknownTerminal(request.terminal_id.clone()))?;

        self.terminals.touch_heartbeat(&terminal.id).await?;

        if let Some(info) = &request.account_info {
            self.accounts
                .update_balance(&terminal.account_id, info.balance, info.equity)
                .await?;
        }

        let next = match self.commands.next_command(&request.terminal_id).await {
            Ok(next) => next,
            Err(e) => {
                // A queue hiccup should not fail the heartbeat; the command
                // will be picked up on the next poll.
                warn!(
                    "Command pop failed for terminal {}: {}",
                    request.terminal_id, e
                );
                None
            }
        };

        if let Some(command) = next {
            info!(
                "Dispatching command {} to terminal {}",
                command.command, request.terminal_id
            );
            return Ok(HeartbeatResponse {
                success: true,
                command: Some(command.command),
                payload: Some(command.payload),
            });
        }

        Ok(HeartbeatResponse {
            success: true,
            command: None,
            payload: None,
        })
    }

    /// Batch trade sync. Existing ledger rows are prefetched in one query;
    /// deals are then processed strictly in order so that a later deal in
    /// the batch observes the mutations of an earlier one. A failing deal is
    /// quarantined and the batch continues.
    pub async fn process_trades(
        &self,
        request: TradeSyncRequest,
    ) -> Result<SyncSummary, LifecycleError> {
        info!(
            "Trade sync from terminal {}: {} deals",
            request.terminal_id,
            request.trades.len()
        );

        let terminal = self
            .terminals
            .find(&request.terminal_id)
            .await?
            .ok_or_else(|| LifecycleError::UnknownTerminal(request.terminal_id.clone()))?;
        let account = self
            .accounts
            .find(&terminal.account_id)
            .await?
            .ok_or(LifecycleError::AccountNotFound)?;

        let ctx = DealContext {
            terminal_id: terminal.id.clone(),
            account_id: account.id.clone(),
            user_id: account.user_id.clone(),
            sync_source: SyncSource::LocalEa,
        };

        let position_ids: Vec<String> = request
            .trades
            .iter()
            .filter_map(|deal| deal.position_id_string())
            .collect();

        let mut ledger_cache: HashMap<String, _> = self
            .trades
            .find_many_by_external_ids(&ctx.user_id, &ctx.account_id, &position_ids)
            .await?
            .into_iter()
            .filter_map(|trade| trade.external_id.clone().map(|id| (id, trade)))
            .collect();
        debug!(
            "Prefetched {} existing ledger rows for batch",
            ledger_cache.len()
        );

        let mut summary = SyncSummary::default();

        for deal in &request.trades {
            let existing = deal
                .position_id_string()
                .and_then(|position_id| ledger_cache.get(&position_id).cloned());

            match self.processor.process_deal(&ctx, deal, existing).await {
                Ok(outcome) => {
                    if let (Some(position_id), Some(trade)) =
                        (deal.position_id_string(), outcome.trade)
                    {
                        ledger_cache.insert(position_id, trade);
                    }
                    match outcome.action {
                        DealAction::Created | DealAction::Updated => summary.imported += 1,
                        DealAction::Skipped | DealAction::Conflict => summary.skipped += 1,
                    }
                }
                Err(e) => {
                    error!("Failed to process deal {}: {}", deal.ticket, e);
                    summary.failed += 1;
                    if let Err(queue_err) = self
                        .failed_trades
                        .queue_failed_trade(&terminal.id, deal, &e.to_string())
                        .await
                    {
                        error!(
                            "Failed to quarantine deal {}: {}",
                            deal.ticket, queue_err
                        );
                    }
                }
            }
        }

        self.terminals.touch_sync(&terminal.id).await?;

        info!(
            "Trade sync complete for terminal {}: {} imported, {} skipped, {} failed",
            terminal.id, summary.imported, summary.skipped, summary.failed
        );

        Ok(summary)
    }

    /// Live position snapshot: cached on the terminal row, plus a
    /// stop/target/size refresh of matching OPEN ledger rows. Pass-through
    /// persistence, not reconciliation.
    pub async fn process_positions(
        &self,
        request: PositionsRequest,
    ) -> Result<(), LifecycleError> {
        debug!(
            "Positions update from terminal {}: {} positions",
            request.terminal_id,
            request.positions.len()
        );

        let Some(terminal) = self.terminals.find(&request.terminal_id).await? else {
            return Ok(());
        };
        let account = self
            .accounts
            .find(&terminal.account_id)
            .await?
            .ok_or(LifecycleError::AccountNotFound)?;

        let normalized: Vec<serde_json::Value> = request
            .positions
            .iter()
            .map(|position| {
                serde_json::json!({
                    "ticket": position.ticket,
                    "symbol": position.symbol,
                    "type": position.side,
                    "volume": position.volume,
                    "openPrice": position.open_price,
                    "currentPrice": position.current_price,
                    "profit": position.profit,
                    "openTime": normalize_optional(position.open_time.as_ref()),
                    "stopLoss": scrub_target(position.stop_loss),
                    "takeProfit": scrub_target(position.take_profit),
                })
            })
            .collect();

        let metadata = serde_json::json!({
            "livePositions": normalized,
            "positionsUpdatedAt": Utc::now(),
        });
        self.terminals
            .set_metadata(&terminal.id, &metadata.to_string())
            .await?;

        let external_ids: Vec<String> = request
            .positions
            .iter()
            .map(|p| p.ticket.to_string())
            .collect();
        if external_ids.is_empty() {
            return Ok(());
        }

        let trades = self
            .trades
            .find_many_by_external_ids(&account.user_id, &account.id, &external_ids)
            .await?;
        let trade_map: HashMap<String, _> = trades
            .into_iter()
            .filter_map(|t| t.external_id.clone().map(|id| (id, t)))
            .collect();

        for position in &request.positions {
            let Some(trade) = trade_map.get(&position.ticket.to_string()) else {
                continue;
            };

            let mut patch = TradePatch::default();
            let next_stop = scrub_target(position.stop_loss);
            let next_target = scrub_target(position.take_profit);

            if next_stop.is_some() && trade.stop_loss != next_stop {
                patch.stop_loss = next_stop;
            }
            if next_target.is_some() && trade.take_profit != next_target {
                patch.take_profit = next_target;
            }
            if position.volume.is_finite()
                && position.volume > 0.0
                && trade.quantity != Some(position.volume)
            {
                patch.quantity = Some(position.volume);
            }
            if position.open_price.is_finite()
                && position.open_price > 0.0
                && trade.open_price != Some(position.open_price)
            {
                patch.open_price = Some(position.open_price);
            }

            if !patch.is_empty() {
                self.trades.apply_patch(&trade.id, patch).await?;
            }
        }

        Ok(())
    }

    /// Execution candles for a closed trade: attached verbatim to the row.
    pub async fn process_candles(&self, request: CandleSyncRequest) -> Result<(), LifecycleError> {
        info!(
            "Candle sync from terminal {}: {} candles for trade {}",
            request.terminal_id,
            request.candles.len(),
            request.trade_id
        );

        self.terminals
            .find(&request.terminal_id)
            .await?
            .ok_or_else(|| LifecycleError::UnknownTerminal(request.terminal_id.clone()))?;

        let candles_json = serde_json::to_string(&request.candles)
            .map_err(|e| LifecycleError::Orchestrator(format!("unencodable candles: {}", e)))?;

        self.trades
            .save_execution_candles(&request.trade_id, &candles_json)
            .await?;

        Ok(())
    }

    // ─── Management surface ─────────────────────────────────────────

    pub async fn get_terminal_status(
        &self,
        account_id: &str,
        user_id: &str,
    ) -> Result<Option<TerminalStatusDto>, LifecycleError> {
        let account = self
            .accounts
            .find_for_user(account_id, user_id)
            .await?
            .ok_or(LifecycleError::AccountNotFound)?;

        Ok(self
            .terminals
            .find_by_account(account_id)
            .await?
            .map(|terminal| self.status_dto(&terminal, &account)))
    }

    pub async fn terminal_auth_token(
        &self,
        account_id: &str,
        user_id: &str,
    ) -> Result<String, LifecycleError> {
        self.accounts
            .find_for_user(account_id, user_id)
            .await?
            .ok_or(LifecycleError::AccountNotFound)?;

        let terminal = self
            .terminals
            .find_by_account(account_id)
            .await?
            .ok_or(LifecycleError::NotEnabled)?;

        self.tokens
            .sign_terminal_token(&terminal.id)
            .map_err(|e| LifecycleError::Orchestrator(format!("token signing failed: {}", e)))
    }

    /// Ask the terminal to re-send its full trade history on its next poll.
    pub async fn request_manual_sync(
        &self,
        account_id: &str,
        user_id: &str,
    ) -> Result<(), LifecycleError> {
        self.accounts
            .find_for_user(account_id, user_id)
            .await?
            .ok_or(LifecycleError::AccountNotFound)?;

        let terminal = self
            .terminals
            .find_by_account(account_id)
            .await?
            .ok_or(LifecycleError::NotEnabled)?;

        if matches!(
            terminal.status(),
            TerminalStatus::Stopped | TerminalStatus::Error
        ) {
            return Err(LifecycleError::NotRunning);
        }

        self.commands
            .queue_command(&terminal.id, "SYNC_TRADES", "")
            .await?;
        info!(
            "Queued SYNC_TRADES for account {} (terminal {})",
            account_id, terminal.id
        );
        Ok(())
    }

    pub async fn get_live_positions(
        &self,
        account_id: &str,
        user_id: &str,
    ) -> Result<LivePositionsDto, LifecycleError> {
        let account = self
            .accounts
            .find_for_user(account_id, user_id)
            .await?
            .ok_or(LifecycleError::AccountNotFound)?;

        let Some(terminal) = self.terminals.find_by_account(account_id).await? else {
            return Ok(LivePositionsDto {
                enabled: false,
                account_id: account.id,
                account_name: account.account_name,
                terminal_id: None,
                status: None,
                last_heartbeat: None,
                positions_updated_at: None,
                positions: serde_json::json!([]),
            });
        };

        let metadata = terminal.metadata_value();
        let positions = metadata
            .get("livePositions")
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]));
        let positions_updated_at = metadata
            .get("positionsUpdatedAt")
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(LivePositionsDto {
            enabled: true,
            account_id: account.id,
            account_name: account.account_name,
            terminal_id: Some(terminal.id.clone()),
            status: Some(terminal.status()),
            last_heartbeat: terminal.last_heartbeat,
            positions_updated_at,
            positions,
        })
    }

    // ─── Operator surface ───────────────────────────────────────────

    pub async fn farm_health(&self) -> Result<FarmHealth, LifecycleError> {
        let mut counts = TerminalCounts::default();
        for (status, count) in self.terminals.status_counts().await? {
            counts.total += count;
            match TerminalStatus::parse(&status) {
                Some(TerminalStatus::Running) => counts.running = count,
                Some(TerminalStatus::Pending) => counts.pending = count,
                Some(TerminalStatus::Starting) => counts.starting = count,
                Some(TerminalStatus::Stopping) => counts.stopping = count,
                Some(TerminalStatus::Stopped) => counts.stopped = count,
                Some(TerminalStatus::Error) | None => counts.error += count,
            }
        }
        counts.stale = self
            .terminals
            .count_stale_running(Utc::now() - self.stale_after)
            .await?;

        Ok(FarmHealth {
            terminals: counts,
            command_queue: self.queue_health(self.commands.backend(), self.commands.stats().await),
            failed_trade_queue: self
                .queue_health(self.failed_trades.backend(), self.failed_trades.stats().await),
            orchestrator_simulated: self.orchestrator.is_simulated(),
        })
    }

    pub async fn terminal_health_details(
        &self,
    ) -> Result<Vec<TerminalHealthDto>, LifecycleError> {
        let cutoff = Utc::now() - self.stale_after;
        let terminals = self.terminals.list_all().await?;

        Ok(terminals
            .into_iter()
            .map(|terminal| {
                let stale = terminal.status() == TerminalStatus::Running
                    && terminal
                        .last_heartbeat
                        .map(|beat| beat < cutoff)
                        .unwrap_or(true);
                TerminalHealthDto {
                    id: terminal.id,
                    account_id: terminal.account_id,
                    status: TerminalStatus::parse(&terminal.status)
                        .unwrap_or(TerminalStatus::Error),
                    container_id: terminal.container_id,
                    error_message: terminal.error_message,
                    last_heartbeat: terminal.last_heartbeat,
                    last_sync_at: terminal.last_sync_at,
                    stale,
                }
            })
            .collect())
    }

    /// Desired-state feed for the external orchestrator's reconciliation
    /// loop: which terminals should have containers, with the environment
    /// they need. Passwords are not part of the feed; the terminal token is
    /// what the EA authenticates with.
    pub async fn orchestrator_config(&self) -> Result<Vec<OrchestratorEntry>, LifecycleError> {
        let terminals = self.terminals.list_all().await?;
        let mut entries = Vec::with_capacity(terminals.len());

        for terminal in terminals {
            let account = self.accounts.find(&terminal.account_id).await?;
            let desired = if terminal.status().wants_container() {
                "RUNNING"
            } else {
                "STOPPED"
            };
            let terminal_token = if terminal.status().wants_container() {
                self.tokens.sign_terminal_token(&terminal.id).ok()
            } else {
                None
            };

            entries.push(OrchestratorEntry {
                id: terminal.id,
                account_id: terminal.account_id,
                status: desired,
                environment: OrchestratorEnvironment {
                    server: account.as_ref().and_then(|a| a.server.clone()),
                    login: account.as_ref().and_then(|a| a.login.clone()),
                    terminal_token,
                },
            });
        }

        Ok(entries)
    }

    // ─── Helpers ────────────────────────────────────────────────────

    fn queue_health(
        &self,
        backend: QueueBackend,
        stats: Result<QueueStats, crate::queue::QueueError>,
    ) -> QueueHealth {
        let stats = stats.unwrap_or_else(|e| {
            warn!("Queue stats unavailable: {}", e);
            QueueStats::default()
        });
        QueueHealth {
            backend,
            degraded: backend.is_degraded(),
            stats,
        }
    }

    fn status_dto(&self, terminal: &TerminalRecord, account: &AccountRecord) -> TerminalStatusDto {
        TerminalStatusDto {
            id: terminal.id.clone(),
            account_id: terminal.account_id.clone(),
            account_name: account.account_name.clone(),
            status: terminal.status(),
            container_id: terminal.container_id.clone(),
            error_message: terminal.error_message.clone(),
            last_heartbeat: terminal.last_heartbeat,
            last_sync_at: terminal.last_sync_at,
            created_at: terminal.created_at,
        }
    }
}

/// MT5 reports "no stop/target" as 0; treat non-finite and zero as unset.
fn scrub_target(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v != 0.0)
}
