use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use termfarm::application::handlers::{self, AppState};
use termfarm::application::services::farm_service::TerminalFarmService;
use termfarm::auth::{TerminalTokenService, UserAuth};
use termfarm::config::FarmConfig;
use termfarm::domain::services::trade_processor::TradeProcessor;
use termfarm::infrastructure::orchestrator_client::OrchestratorClient;
use termfarm::persistence::terminal_repository::{AccountRepository, TerminalRepository};
use termfarm::persistence::trade_repository::{SqliteTradeStore, TradeStore};
use termfarm::persistence::{init_database, DbPool};
use termfarm::queue::command_queue::{CommandQueue, InMemoryCommandQueue, SqliteCommandQueue};
use termfarm::queue::failed_trades::{
    FailedTradeQueue, InMemoryFailedTradeQueue, RetryPolicy, RetryWorker, SqliteFailedTradeQueue,
};
use termfarm::rate_limit::WebhookRateLimits;
use termfarm::task_runner::WorkerSchedule;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "termfarm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(FarmConfig::from_env()?);
    info!(
        "Terminal farm starting (orchestrator: {})",
        if config.orchestrator_url.is_some() {
            "external"
        } else {
            "simulated"
        }
    );

    // The ledger database is required; without it there is nothing to serve.
    let pool = init_database(&config.database_url).await?;

    // Queue tables may live in a separate database. If that backend is
    // unavailable, degrade to in-memory queues: the feature keeps working,
    // durability is lost, and the health endpoint says so.
    let queue_pool: Option<DbPool> = if config.queue_database_url == config.database_url {
        Some(pool.clone())
    } else {
        match init_database(&config.queue_database_url).await {
            Ok(queue_pool) => Some(queue_pool),
            Err(e) => {
                warn!(
                    "Queue database unavailable ({}); falling back to in-memory queues. \
                     Queued work will NOT survive a restart.",
                    e
                );
                None
            }
        }
    };

    let retry_policy = RetryPolicy {
        max_attempts: config.retry_max_attempts,
        base_delay: config.retry_base_delay,
    };

    let command_queue: Arc<dyn CommandQueue> = match &queue_pool {
        Some(queue_pool) => Arc::new(SqliteCommandQueue::new(queue_pool.clone())),
        None => Arc::new(InMemoryCommandQueue::new()),
    };
    let failed_trades: Arc<dyn FailedTradeQueue> = match &queue_pool {
        Some(queue_pool) => Arc::new(SqliteFailedTradeQueue::new(queue_pool.clone(), retry_policy)),
        None => Arc::new(InMemoryFailedTradeQueue::new(retry_policy)),
    };

    let terminals = Arc::new(TerminalRepository::new(pool.clone()));
    let accounts = Arc::new(AccountRepository::new(pool.clone()));
    let trades: Arc<dyn TradeStore> = Arc::new(SqliteTradeStore::new(pool.clone()));

    let processor = Arc::new(TradeProcessor::new(trades.clone(), command_queue.clone()));
    let orchestrator = Arc::new(OrchestratorClient::new(
        config.orchestrator_url.clone(),
        config.orchestrator_timeout,
    )?);
    let tokens = Arc::new(TerminalTokenService::new(
        &config.terminal_token_secret,
        config.terminal_token_ttl_seconds,
    ));
    let user_auth = Arc::new(UserAuth::new(&config.user_jwt_secret));

    let farm = TerminalFarmService::new(
        terminals.clone(),
        accounts.clone(),
        trades.clone(),
        command_queue.clone(),
        failed_trades.clone(),
        processor.clone(),
        orchestrator,
        tokens.clone(),
        config.heartbeat_stale_seconds,
    );

    // Quarantine replay worker: re-runs failed deals through the same
    // reconciliation path the live sync uses.
    let retry_worker = RetryWorker {
        queue: failed_trades.clone(),
        terminals: terminals.clone(),
        accounts: accounts.clone(),
        trades: trades.clone(),
        processor: processor.clone(),
    };
    let worker_schedule = WorkerSchedule {
        poll_interval: config.retry_poll_interval,
        ..WorkerSchedule::default()
    };
    tokio::spawn(async move {
        retry_worker.run(worker_schedule).await;
    });

    let state = AppState {
        farm,
        config: config.clone(),
        tokens,
        user_auth,
        limits: Arc::new(WebhookRateLimits::from_config(&config)),
    };
    let app = handlers::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Terminal farm stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
