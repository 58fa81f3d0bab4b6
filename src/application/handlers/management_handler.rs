//! User-facing management surface.
//!
//! All routes sit behind the bearer-JWT middleware; the authenticated user
//! id arrives via request extensions and every operation re-checks account
//! ownership in the service layer.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Serialize;

use super::AppState;
use crate::application::services::farm_service::{LivePositionsDto, TerminalStatusDto};
use crate::auth::AuthedUser;
use crate::domain::errors::ApiError;
use crate::infrastructure::orchestrator_client::TerminalCredentials;

#[derive(Serialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Serialize)]
pub struct SyncQueuedResponse {
    pub queued: bool,
    pub message: &'static str,
}

/// Provision a terminal for this account. Returns the PENDING/STARTING
/// record immediately; provisioning continues in the background.
pub async fn enable_auto_sync(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Extension(user): Extension<AuthedUser>,
    Json(credentials): Json<TerminalCredentials>,
) -> Result<Json<TerminalStatusDto>, ApiError> {
    let dto = state
        .farm
        .enable_auto_sync(&account_id, &user.0, credentials)
        .await?;
    Ok(Json(dto))
}

pub async fn disable_auto_sync(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Extension(user): Extension<AuthedUser>,
) -> Result<StatusCode, ApiError> {
    state.farm.disable_auto_sync(&account_id, &user.0).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Terminal status for the account, or `{"enabled": false}` when auto-sync
/// has never been enabled.
pub async fn terminal_status(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.farm.get_terminal_status(&account_id, &user.0).await?;
    match status {
        Some(dto) => serde_json::to_value(dto)
            .map(Json)
            .map_err(|e| ApiError::Internal(e.to_string())),
        None => Ok(Json(serde_json::json!({ "enabled": false }))),
    }
}

/// Signed per-terminal token for webhook auth; pasted into the EA config.
pub async fn terminal_token(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<TokenResponse>, ApiError> {
    let token = state.farm.terminal_auth_token(&account_id, &user.0).await?;
    Ok(Json(TokenResponse { token }))
}

pub async fn live_positions(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<LivePositionsDto>, ApiError> {
    let positions = state.farm.get_live_positions(&account_id, &user.0).await?;
    Ok(Json(positions))
}

pub async fn manual_sync(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<SyncQueuedResponse>, ApiError> {
    state.farm.request_manual_sync(&account_id, &user.0).await?;
    Ok(Json(SyncQueuedResponse {
        queued: true,
        message: "Sync command queued. Trades will appear shortly.",
    }))
}
