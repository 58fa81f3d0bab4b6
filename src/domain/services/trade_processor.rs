//! Trade Processor
//!
//! Pure reconciliation engine: one broker deal event in, exactly one ledger
//! mutation out, independent of delivery order or duplication. Two explicit
//! strategies sit behind one dispatch: the position-based path (deals
//! carrying a `position_id`, the one with real invariants) and the legacy
//! ticket-based path for old EA builds that report flat trades.
//!
//! The processor never retries internally. A failure for one deal is
//! returned to the caller, which quarantines the event and keeps going with
//! the rest of the batch.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::entities::deal::{DealEntryType, DealEvent, SyncSource};
use crate::domain::entities::trade::{TradeDirection, TradeOrigin, TradeStatus};
use crate::domain::errors::ProcessError;
use crate::domain::services::asset_type::detect_asset_type;
use crate::domain::services::terminal_time::normalize_terminal_time;
use crate::persistence::models::{CreateTrade, TradePatch, TradeRecord};
use crate::persistence::trade_repository::TradeStore;
use crate::queue::command_queue::CommandQueue;

/// Who and where a deal belongs to.
#[derive(Debug, Clone)]
pub struct DealContext {
    pub terminal_id: String,
    pub account_id: String,
    pub user_id: String,
    pub sync_source: SyncSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealAction {
    Created,
    Updated,
    Skipped,
    Conflict,
}

#[derive(Debug)]
pub struct DealOutcome {
    pub action: DealAction,
    pub trade: Option<TradeRecord>,
    pub reason: Option<String>,
}

impl DealOutcome {
    fn created(trade: TradeRecord) -> Self {
        DealOutcome {
            action: DealAction::Created,
            trade: Some(trade),
            reason: None,
        }
    }

    fn updated(trade: TradeRecord) -> Self {
        DealOutcome {
            action: DealAction::Updated,
            trade: Some(trade),
            reason: None,
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        DealOutcome {
            action: DealAction::Skipped,
            trade: None,
            reason: Some(reason.into()),
        }
    }

    fn conflict(reason: impl Into<String>) -> Self {
        DealOutcome {
            action: DealAction::Conflict,
            trade: None,
            reason: Some(reason.into()),
        }
    }
}

/// A wire value of 0 on price/volume/stop fields means "not set" in MT5
/// reports, so zero counts as absent for patch decisions.
fn absent(value: Option<f64>) -> bool {
    match value {
        None => true,
        Some(v) => v == 0.0,
    }
}

fn round5(value: f64) -> f64 {
    (value * 100_000.0).round() / 100_000.0
}

/// MT5 command-payload time format.
fn format_terminal_time(t: DateTime<Utc>) -> String {
    t.format("%Y.%m.%d %H:%M:%S").to_string()
}

pub struct TradeProcessor {
    store: Arc<dyn TradeStore>,
    commands: Arc<dyn CommandQueue>,
    /// Candle fetches bracket entry/exit by this much on both sides.
    candle_buffer: Duration,
}

impl TradeProcessor {
    pub fn new(store: Arc<dyn TradeStore>, commands: Arc<dyn CommandQueue>) -> Self {
        Self {
            store,
            commands,
            candle_buffer: Duration::hours(2),
        }
    }

    /// Single dispatch for one deal event. `existing` is the pre-fetched
    /// ledger row for the deal's position, when the caller has one.
    pub async fn process_deal(
        &self,
        ctx: &DealContext,
        deal: &DealEvent,
        existing: Option<TradeRecord>,
    ) -> Result<DealOutcome, ProcessError> {
        if deal.symbol.trim().is_empty() {
            return Err(ProcessError::MissingField {
                ticket: deal.ticket,
                field: "symbol",
            });
        }

        if deal.position_id.is_some() {
            self.process_position_deal(ctx, deal, existing).await
        } else {
            self.process_ticket_deal(ctx, deal).await
        }
    }

    async fn process_position_deal(
        &self,
        ctx: &DealContext,
        deal: &DealEvent,
        existing: Option<TradeRecord>,
    ) -> Result<DealOutcome, ProcessError> {
        match deal.entry_type.and_then(DealEntryType::from_code) {
            Some(DealEntryType::Entry) => self.process_entry_deal(ctx, deal, existing).await,
            Some(DealEntryType::Exit) => self.process_exit_deal(ctx, deal, existing).await,
            Some(DealEntryType::InOut) => self.process_in_out_deal(ctx, deal, existing).await,
            None => Ok(DealOutcome::skipped(format!(
                "unknown entry type {:?} on deal {}",
                deal.entry_type, deal.ticket
            ))),
        }
    }

    /// Entry deal (DEAL_ENTRY_IN): create a new OPEN trade, or patch missing
    /// fields on the existing row for this position.
    pub async fn process_entry_deal(
        &self,
        ctx: &DealContext,
        deal: &DealEvent,
        existing: Option<TradeRecord>,
    ) -> Result<DealOutcome, ProcessError> {
        let position_id = self.require_position_id(deal)?;
        let open_time = self.resolve_deal_time(deal)?;

        if let Some(existing) = existing {
            if let Some(conflict) = self.source_conflict(&existing, ctx, &position_id) {
                return Ok(conflict);
            }

            // Patch-update only absent fields; populated values are never
            // overwritten, which keeps reconciliation commutative across
            // reordered batches.
            let mut patch = TradePatch::default();
            if existing.open_time.is_none() {
                patch.open_time = open_time;
            }
            if absent(existing.open_price) {
                patch.open_price = deal.open_price.filter(|p| *p != 0.0);
            }
            if absent(existing.quantity) {
                patch.quantity = deal.volume.filter(|v| *v != 0.0);
            }
            if absent(existing.stop_loss) {
                patch.stop_loss = deal.stop_loss.filter(|v| *v != 0.0);
            }
            if absent(existing.take_profit) {
                patch.take_profit = deal.take_profit.filter(|v| *v != 0.0);
            }
            if absent(existing.contract_size) {
                patch.contract_size = deal.contract_size.filter(|v| *v != 0.0);
            }
            if existing.external_deal_id.is_none() {
                patch.external_deal_id = Some(deal.ticket);
            }
            if existing.mt5_magic.map(|m| m == 0).unwrap_or(true) {
                patch.mt5_magic = deal.magic.filter(|m| *m != 0);
            }

            if patch.is_empty() {
                return Ok(DealOutcome::skipped("entry already recorded"));
            }

            let updated = self.store.apply_patch(&existing.id, patch).await?;
            debug!("Patched entry fields on trade {} for position {}", updated.id, position_id);
            return Ok(DealOutcome::updated(updated));
        }

        let created = self
            .store
            .create(CreateTrade {
                user_id: ctx.user_id.clone(),
                account_id: ctx.account_id.clone(),
                symbol: deal.symbol.clone(),
                asset_type: detect_asset_type(&deal.symbol),
                side: deal.direction(),
                status: TradeStatus::Open,
                origin: TradeOrigin::Normal,
                sync_source: Some(ctx.sync_source),
                external_id: Some(position_id.clone()),
                external_deal_id: Some(deal.ticket),
                open_time: open_time.unwrap_or_else(Utc::now),
                close_time: None,
                open_price: deal.open_price.unwrap_or(0.0),
                close_price: None,
                quantity: deal.volume.unwrap_or(0.0),
                contract_size: deal.contract_size,
                profit_or_loss: None,
                commission: deal.commission,
                swap: deal.swap,
                stop_loss: deal.stop_loss,
                take_profit: deal.take_profit,
                mt5_magic: deal.magic,
                notes: Some(format!("Auto-synced via position ID: {}", position_id)),
            })
            .await?;

        info!("Opened trade {} for position {}", created.id, position_id);
        Ok(DealOutcome::created(created))
    }

    /// Exit deal (DEAL_ENTRY_OUT): close the OPEN row for this position, or
    /// fall through to the orphan path when no entry was ever observed.
    pub async fn process_exit_deal(
        &self,
        ctx: &DealContext,
        deal: &DealEvent,
        existing: Option<TradeRecord>,
    ) -> Result<DealOutcome, ProcessError> {
        let position_id = self.require_position_id(deal)?;
        let close_time = self.resolve_deal_time(deal)?;

        let Some(existing) = existing else {
            return self.process_orphan_exit(ctx, deal).await;
        };

        if let Some(conflict) = self.source_conflict(&existing, ctx, &position_id) {
            return Ok(conflict);
        }

        // Already fully closed with a contract size on record: true
        // duplicate. A CLOSED row missing contract_size is re-patched
        // (self-heal for rows closed before that field was reported).
        if existing.status() == TradeStatus::Closed && !absent(existing.contract_size) {
            return Ok(DealOutcome::skipped("position already closed"));
        }

        let patch = TradePatch {
            status: Some(TradeStatus::Closed),
            close_time,
            // An exit deal's price field is the execution (close) price.
            close_price: deal.open_price,
            profit_or_loss: deal.profit,
            // Accumulate, not overwrite: multi-fill exits report costs per fill.
            commission: Some(existing.commission.unwrap_or(0.0) + deal.commission.unwrap_or(0.0)),
            swap: Some(existing.swap.unwrap_or(0.0) + deal.swap.unwrap_or(0.0)),
            contract_size: deal.contract_size,
            ..Default::default()
        };

        let updated = self.store.apply_patch(&existing.id, patch).await?;
        info!("Closed trade {} for position {}", updated.id, position_id);

        self.queue_candle_fetch(
            &ctx.terminal_id,
            &deal.symbol,
            existing.open_time,
            close_time,
            &updated.id,
        )
        .await;

        Ok(DealOutcome::updated(updated))
    }

    /// Partial close / netting exit (DEAL_ENTRY_INOUT): run the exit path
    /// for the closed portion, then split an OPEN remainder row if volume
    /// remains.
    pub async fn process_in_out_deal(
        &self,
        ctx: &DealContext,
        deal: &DealEvent,
        existing: Option<TradeRecord>,
    ) -> Result<DealOutcome, ProcessError> {
        let position_id = self.require_position_id(deal)?;
        let exit_outcome = self
            .process_exit_deal(ctx, deal, existing.clone())
            .await?;

        if matches!(exit_outcome.action, DealAction::Conflict | DealAction::Skipped) {
            return Ok(exit_outcome);
        }

        let closed_volume = deal.volume.unwrap_or(0.0);
        let original_volume = existing.as_ref().and_then(|t| t.quantity).unwrap_or(0.0);
        let remaining_volume = round5(original_volume - closed_volume);

        if remaining_volume > 0.001 {
            info!(
                "Partial close on position {}: {} lots closed, reopening {} lot remainder for {}",
                position_id, closed_volume, remaining_volume, deal.symbol
            );

            let prior = existing.as_ref();
            let side = prior
                .and_then(|t| TradeDirection::parse(&t.side))
                .unwrap_or_else(|| deal.direction());
            let open_time = prior
                .and_then(|t| t.open_time)
                .or_else(|| {
                    deal.open_time
                        .as_ref()
                        .and_then(normalize_terminal_time)
                })
                .unwrap_or_else(Utc::now);

            self.store
                .create(CreateTrade {
                    user_id: ctx.user_id.clone(),
                    account_id: ctx.account_id.clone(),
                    symbol: deal.symbol.clone(),
                    asset_type: detect_asset_type(&deal.symbol),
                    side,
                    status: TradeStatus::Open,
                    origin: TradeOrigin::PartialRemainder,
                    sync_source: Some(ctx.sync_source),
                    // The closed position's id cannot be reused; the closing
                    // deal's ticket makes the synthesized id unique and
                    // stable under replay.
                    external_id: Some(format!("{}_partial_{}", position_id, deal.ticket)),
                    external_deal_id: None,
                    open_time,
                    close_time: None,
                    open_price: prior
                        .and_then(|t| t.open_price)
                        .or(deal.open_price)
                        .unwrap_or(0.0),
                    close_price: None,
                    quantity: remaining_volume,
                    contract_size: deal.contract_size,
                    profit_or_loss: None,
                    commission: None,
                    swap: None,
                    stop_loss: prior.and_then(|t| t.stop_loss),
                    take_profit: prior.and_then(|t| t.take_profit),
                    mt5_magic: deal.magic,
                    notes: Some(format!(
                        "Partial close remainder. Original position ID: {}. Closed {} lots.",
                        position_id, closed_volume
                    )),
                })
                .await?;
        } else {
            debug!(
                "INOUT treated as full close for position {} (remaining={})",
                position_id, remaining_volume
            );
        }

        Ok(exit_outcome)
    }

    /// Exit with no entry on record: a standalone CLOSED trade with an
    /// unknown (zero) entry price. Direction is inverted from the exit
    /// deal's side, since the exit trades against the position.
    pub async fn process_orphan_exit(
        &self,
        ctx: &DealContext,
        deal: &DealEvent,
    ) -> Result<DealOutcome, ProcessError> {
        let position_id = self.require_position_id(deal)?;
        let close_time = self.resolve_deal_time(deal)?;

        warn!(
            "Orphan exit for position {}: entry deal never observed",
            position_id
        );

        let created = self
            .store
            .create(CreateTrade {
                user_id: ctx.user_id.clone(),
                account_id: ctx.account_id.clone(),
                symbol: deal.symbol.clone(),
                asset_type: detect_asset_type(&deal.symbol),
                side: deal.inverted_direction(),
                status: TradeStatus::Closed,
                origin: TradeOrigin::OrphanExit,
                sync_source: Some(ctx.sync_source),
                external_id: Some(position_id.clone()),
                external_deal_id: Some(deal.ticket),
                open_time: close_time.unwrap_or_else(Utc::now),
                close_time,
                open_price: 0.0,
                close_price: deal.open_price,
                quantity: deal.volume.unwrap_or(0.0),
                contract_size: deal.contract_size,
                profit_or_loss: deal.profit,
                commission: deal.commission,
                swap: deal.swap,
                stop_loss: deal.stop_loss,
                take_profit: deal.take_profit,
                mt5_magic: deal.magic,
                notes: Some(format!(
                    "Orphan Exit (entry missing). Position ID: {}",
                    position_id
                )),
            })
            .await?;

        Ok(DealOutcome::created(created))
    }

    /// Legacy strategy for EA builds that report flat trades without a
    /// position id: duplicate-probe on the ticket, then create a single
    /// OPEN or CLOSED row.
    async fn process_ticket_deal(
        &self,
        ctx: &DealContext,
        deal: &DealEvent,
    ) -> Result<DealOutcome, ProcessError> {
        let open_time = self.resolve_deal_time(deal)?;
        let close_time = deal
            .close_time
            .as_ref()
            .and_then(normalize_terminal_time);

        if let Some(existing) = self
            .store
            .find_ticket_duplicate(&ctx.user_id, &ctx.account_id, &deal.symbol, deal.ticket)
            .await?
        {
            debug!(
                "Ticket {} already imported as trade {}; skipping",
                deal.ticket, existing.id
            );
            return Ok(DealOutcome::skipped("duplicate ticket"));
        }

        let status = if deal.close_time.is_some() {
            TradeStatus::Closed
        } else {
            TradeStatus::Open
        };

        let created = self
            .store
            .create(CreateTrade {
                user_id: ctx.user_id.clone(),
                account_id: ctx.account_id.clone(),
                symbol: deal.symbol.clone(),
                asset_type: detect_asset_type(&deal.symbol),
                side: deal.direction(),
                status,
                origin: TradeOrigin::Normal,
                sync_source: Some(ctx.sync_source),
                external_id: None,
                external_deal_id: Some(deal.ticket),
                open_time: open_time.unwrap_or_else(Utc::now),
                close_time,
                open_price: deal.open_price.unwrap_or(0.0),
                close_price: deal.close_price,
                quantity: deal.volume.unwrap_or(0.0),
                contract_size: deal.contract_size,
                profit_or_loss: deal.profit,
                commission: deal.commission,
                swap: deal.swap,
                stop_loss: deal.stop_loss,
                take_profit: deal.take_profit,
                mt5_magic: deal.magic,
                notes: Some(format!("Auto-synced from terminal. Ticket: {}", deal.ticket)),
            })
            .await?;

        Ok(DealOutcome::created(created))
    }

    fn require_position_id(&self, deal: &DealEvent) -> Result<String, ProcessError> {
        deal.position_id_string()
            .ok_or(ProcessError::MissingField {
                ticket: deal.ticket,
                field: "positionId",
            })
    }

    /// A present-but-unparseable timestamp is a malformed event; an absent
    /// one falls back to receipt time at the call sites.
    fn resolve_deal_time(&self, deal: &DealEvent) -> Result<Option<DateTime<Utc>>, ProcessError> {
        match deal.open_time.as_ref() {
            None => Ok(None),
            Some(field) => normalize_terminal_time(field)
                .map(Some)
                .ok_or(ProcessError::BadTimestamp { ticket: deal.ticket }),
        }
    }

    /// Cross-source guard: a row owned by the other telemetry channel is
    /// refused, never merged, so MetaApi streaming and the local EA cannot
    /// double-count one position.
    fn source_conflict(
        &self,
        existing: &TradeRecord,
        ctx: &DealContext,
        position_id: &str,
    ) -> Option<DealOutcome> {
        match existing.sync_source() {
            Some(owner) if owner != ctx.sync_source => {
                warn!(
                    "Sync source conflict for position {}: existing={}, incoming={}. Skipping.",
                    position_id, owner, ctx.sync_source
                );
                Some(DealOutcome::conflict(format!("already synced via {}", owner)))
            }
            _ => None,
        }
    }

    /// Queue a FETCH_CANDLES command bracketing the trade's lifetime. The
    /// command is advisory; a queue failure must not fail the deal.
    async fn queue_candle_fetch(
        &self,
        terminal_id: &str,
        symbol: &str,
        entry_time: Option<DateTime<Utc>>,
        exit_time: Option<DateTime<Utc>>,
        trade_id: &str,
    ) {
        let entry = entry_time.unwrap_or_else(Utc::now);
        let exit = exit_time.unwrap_or_else(Utc::now);
        let start = entry - self.candle_buffer;
        let end = exit + self.candle_buffer;

        let payload = format!(
            "{},1m,{},{},{}",
            symbol,
            format_terminal_time(start),
            format_terminal_time(end),
            trade_id
        );

        match self
            .commands
            .queue_command(terminal_id, "FETCH_CANDLES", &payload)
            .await
        {
            Ok(()) => debug!("Queued FETCH_CANDLES for closed trade {}", trade_id),
            Err(e) => warn!("Failed to queue candle fetch for trade {}: {}", trade_id, e),
        }
    }
}
