//! Operator surface: aggregate farm health, per-terminal detail, and the
//! secret-gated desired-state feed for the external orchestrator.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;

use super::AppState;
use crate::application::services::farm_service::{FarmHealth, OrchestratorEntry, TerminalHealthDto};
use crate::auth::authorize_orchestrator_call;
use crate::domain::errors::ApiError;

/// Aggregate counts plus queue depth and queue-backend degradation — an
/// in-memory queue backend is a correctness downgrade, so it is surfaced
/// here, not only in logs.
pub async fn farm_health(State(state): State<AppState>) -> Result<Json<FarmHealth>, ApiError> {
    let health = state.farm.farm_health().await?;
    Ok(Json(health))
}

pub async fn terminal_details(
    State(state): State<AppState>,
) -> Result<Json<Vec<TerminalHealthDto>>, ApiError> {
    let details = state.farm.terminal_health_details().await?;
    Ok(Json(details))
}

/// Desired container set for the orchestrator's reconciliation loop.
pub async fn orchestrator_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<OrchestratorEntry>>, ApiError> {
    if !authorize_orchestrator_call(&state.config.orchestrator_secret, &headers) {
        return Err(ApiError::Unauthorized("invalid orchestrator secret".into()));
    }

    let entries = state.farm.orchestrator_config().await?;
    Ok(Json(entries))
}
