//! HTTP surface: webhook ingress for terminal EAs, the user-facing
//! management endpoints, and the operator/orchestrator endpoints.

pub mod health_handler;
pub mod management_handler;
pub mod webhook_handler;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::application::services::farm_service::TerminalFarmService;
use crate::auth::{require_user_auth, TerminalTokenService, UserAuth};
use crate::config::FarmConfig;
use crate::rate_limit::WebhookRateLimits;

#[derive(Clone)]
pub struct AppState {
    pub farm: Arc<TerminalFarmService>,
    pub config: Arc<FarmConfig>,
    pub tokens: Arc<TerminalTokenService>,
    pub user_auth: Arc<UserAuth>,
    pub limits: Arc<WebhookRateLimits>,
}

pub fn router(state: AppState) -> Router {
    let management = Router::new()
        .route(
            "/mt5-accounts/:account_id/enable-autosync",
            post(management_handler::enable_auto_sync),
        )
        .route(
            "/mt5-accounts/:account_id/disable-autosync",
            delete(management_handler::disable_auto_sync),
        )
        .route(
            "/mt5-accounts/:account_id/terminal-status",
            get(management_handler::terminal_status),
        )
        .route(
            "/mt5-accounts/:account_id/terminal-token",
            get(management_handler::terminal_token),
        )
        .route(
            "/mt5-accounts/:account_id/positions",
            get(management_handler::live_positions),
        )
        .route(
            "/mt5-accounts/:account_id/sync",
            post(management_handler::manual_sync),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_user_auth,
        ));

    Router::new()
        .route("/", get(|| async { "Terminal farm service is running" }))
        .route(
            "/health",
            get(|| async { Json(serde_json::json!({"status": "ok"})) }),
        )
        .route(
            "/webhook/terminal/heartbeat",
            post(webhook_handler::heartbeat),
        )
        .route(
            "/webhook/terminal/trades",
            post(webhook_handler::sync_trades),
        )
        .route(
            "/webhook/terminal/candles",
            post(webhook_handler::sync_candles),
        )
        .route(
            "/webhook/terminal/positions",
            post(webhook_handler::update_positions),
        )
        .route("/terminal-farm/health", get(health_handler::farm_health))
        .route(
            "/terminal-farm/health/terminals",
            get(health_handler::terminal_details),
        )
        .route(
            "/orchestrator/config",
            get(health_handler::orchestrator_config),
        )
        .merge(management)
        // Terminals upload candle batches; cap bodies well above that but
        // below anything abusive.
        .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
