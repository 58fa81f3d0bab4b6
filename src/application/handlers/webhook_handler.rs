//! Webhook ingress for terminal Expert Advisors.
//!
//! Every endpoint authenticates first (per-terminal signed token or the
//! static farm secret), then rate-limits per terminal, then dispatches to
//! the farm service. The ingress itself is stateless. Auth failures reject
//! the whole call; there is no partial processing.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::application::services::farm_service::{
    CandleSyncRequest, HeartbeatRequest, HeartbeatResponse, PositionsRequest, TradeSyncRequest,
};
use crate::auth::authorize_terminal_call;
use crate::domain::errors::ApiError;
use crate::rate_limit::{check_terminal, TerminalRateLimiter};

#[derive(Serialize)]
pub struct AckResponse {
    pub success: bool,
}

#[derive(Serialize)]
pub struct SyncResponse {
    pub success: bool,
    pub imported: u32,
    pub skipped: u32,
    pub failed: u32,
}

fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    auth_token: Option<&str>,
    terminal_id: &str,
) -> Result<(), ApiError> {
    if authorize_terminal_call(
        &state.config.webhook_secret,
        &state.tokens,
        headers,
        auth_token,
        terminal_id,
    ) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("invalid webhook credentials".into()))
    }
}

fn check_rate(limiter: &TerminalRateLimiter, terminal_id: &str) -> Result<(), ApiError> {
    if check_terminal(limiter, terminal_id) {
        Ok(())
    } else {
        Err(ApiError::RateLimited)
    }
}

/// Heartbeat: liveness plus command delivery in the same response cycle.
pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    authorize(
        &state,
        &headers,
        request.auth_token.as_deref(),
        &request.terminal_id,
    )?;
    check_rate(&state.limits.heartbeat, &request.terminal_id)?;

    let response = state.farm.process_heartbeat(request).await?;
    Ok(Json(response))
}

/// Batch of deal events for reconciliation.
pub async fn sync_trades(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TradeSyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    authorize(
        &state,
        &headers,
        request.auth_token.as_deref(),
        &request.terminal_id,
    )?;
    check_rate(&state.limits.trades, &request.terminal_id)?;

    let summary = state.farm.process_trades(request).await?;
    Ok(Json(SyncResponse {
        success: true,
        imported: summary.imported,
        skipped: summary.skipped,
        failed: summary.failed,
    }))
}

/// Execution candles requested via FETCH_CANDLES.
pub async fn sync_candles(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CandleSyncRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    authorize(
        &state,
        &headers,
        request.auth_token.as_deref(),
        &request.terminal_id,
    )?;
    check_rate(&state.limits.candles, &request.terminal_id)?;

    state.farm.process_candles(request).await?;
    Ok(Json(AckResponse { success: true }))
}

/// Live position snapshot.
pub async fn update_positions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PositionsRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    authorize(
        &state,
        &headers,
        request.auth_token.as_deref(),
        &request.terminal_id,
    )?;
    check_rate(&state.limits.positions, &request.terminal_id)?;

    state.farm.process_positions(request).await?;
    Ok(Json(AckResponse { success: true }))
}
