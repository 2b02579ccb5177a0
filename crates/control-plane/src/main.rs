//! NoETL Control Plane Server
//!
//! Async Rust server providing the playbook execution core: catalog,
//! event log, job queue, broker evaluation, keychain, and the worker-facing
//! REST API.

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use noetl_control_plane::{
    config::{AppConfig, DatabaseConfig},
    db::{create_pool, schema, DbPool},
    engine::broker::Broker,
    handlers,
    handlers::{EventsState, ExecuteState},
    services::{
        CatalogService, CredentialService, EventService, ExecutionService, KeychainProcessor,
        KeychainService, QueueService,
    },
    state::AppState,
};

/// Default encryption key for development (override in production).
const DEFAULT_ENCRYPTION_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

/// Initialize tracing/logging.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,noetl_control_plane=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the application router with all routes.
#[allow(clippy::too_many_arguments)]
fn build_router(
    state: AppState,
    db_pool: DbPool,
    catalog_service: CatalogService,
    credential_service: CredentialService,
    keychain_service: KeychainService,
    execution_service: ExecutionService,
    queue_service: QueueService,
    events_state: EventsState,
    execute_state: ExecuteState,
) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let health_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/api/health", get(handlers::health::api_health))
        .with_state(state);

    let catalog_routes = Router::new()
        .route("/api/catalog/register", post(handlers::catalog::register))
        .route("/api/catalog/list", post(handlers::catalog::list))
        .route(
            "/api/catalog/resource",
            post(handlers::catalog::get_resource),
        )
        .with_state(catalog_service);

    let credential_routes = Router::new()
        .route(
            "/api/credentials",
            post(handlers::credentials::create_or_update),
        )
        .route("/api/credentials", get(handlers::credentials::list))
        .route(
            "/api/credentials/{identifier}",
            get(handlers::credentials::get),
        )
        .route(
            "/api/credentials/{identifier}",
            delete(handlers::credentials::delete),
        )
        .with_state(credential_service);

    let keychain_routes = Router::new()
        .route(
            "/api/keychain/{catalog_id}/{keychain_name}",
            get(handlers::keychain::get),
        )
        .route(
            "/api/keychain/{catalog_id}/{keychain_name}",
            post(handlers::keychain::set),
        )
        .route(
            "/api/keychain/catalog/{catalog_id}",
            get(handlers::keychain::list_by_catalog),
        )
        .with_state(keychain_service);

    let execute_routes = Router::new()
        .route("/api/execute", post(handlers::execute::execute))
        .with_state(execute_state);

    let event_routes = Router::new()
        .route("/api/events", post(handlers::events::ingest))
        .route(
            "/api/events/by-execution/{execution_id}",
            get(handlers::events::by_execution),
        )
        .with_state(events_state);

    let executions_routes = Router::new()
        .route("/api/executions", get(handlers::executions::list))
        .route(
            "/api/executions/{execution_id}",
            get(handlers::executions::get),
        )
        .with_state(execution_service);

    let queue_routes = Router::new()
        .route("/api/queue/lease", post(handlers::queue::lease))
        .route(
            "/api/queue/{queue_id}/heartbeat",
            post(handlers::queue::heartbeat),
        )
        .route(
            "/api/queue/{queue_id}/complete",
            post(handlers::queue::complete),
        )
        .route("/api/queue/{queue_id}/fail", post(handlers::queue::fail))
        .route("/api/queue/size", get(handlers::queue::size))
        .route("/api/queue/list", get(handlers::queue::list))
        .with_state(queue_service);

    let database_routes = Router::new()
        .route("/api/db/init", post(handlers::database::init))
        .route("/api/db/validate", get(handlers::database::validate))
        .with_state(db_pool);

    Router::new()
        .merge(health_routes)
        .merge(catalog_routes)
        .merge(credential_routes)
        .merge(keychain_routes)
        .merge(execute_routes)
        .merge(event_routes)
        .merge(executions_routes)
        .merge(queue_routes)
        .merge(database_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Get the encryption key from the environment or use the dev default.
fn get_encryption_key() -> String {
    std::env::var("NOETL_ENCRYPTION_KEY").unwrap_or_else(|_| {
        tracing::warn!("NOETL_ENCRYPTION_KEY not set, using default (not secure for production)");
        DEFAULT_ENCRYPTION_KEY.to_string()
    })
}

/// Periodically reclaim expired queue leases.
fn spawn_queue_reaper(queue: QueueService, interval_seconds: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
        loop {
            ticker.tick().await;
            if let Err(e) = queue.reap().await {
                tracing::warn!(error = %e, "Queue reaper sweep failed");
            }
        }
    });
}

/// Periodically drop expired keychain entries and refresh auto-renew ones.
fn spawn_keychain_sweep(
    keychain: KeychainService,
    processor: KeychainProcessor,
    interval_seconds: u64,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
        loop {
            ticker.tick().await;
            match processor.renew_due(interval_seconds as i64 * 2).await {
                Ok(renewed) if renewed > 0 => {
                    tracing::info!(renewed, "Keychain entries renewed");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Keychain renewal sweep failed"),
            }
            if let Err(e) = keychain.cleanup_expired().await {
                tracing::warn!(error = %e, "Keychain cleanup sweep failed");
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting NoETL Control Plane"
    );

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });

    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        node_id = app_config.node_id,
        "Configuration loaded"
    );

    let db_pool = create_pool(&db_config).await?;
    schema::ensure_schema(&db_pool).await?;

    let encryption_key = get_encryption_key();

    let state = AppState::new(db_pool.clone(), app_config.clone());
    let ids = state.ids.clone();

    let catalog_service = CatalogService::new(db_pool.clone(), ids.clone());
    let credential_service = CredentialService::new(db_pool.clone(), ids.clone(), &encryption_key)?;
    let keychain_service = KeychainService::new(db_pool.clone(), &encryption_key)?;
    let keychain_processor =
        KeychainProcessor::new(keychain_service.clone(), credential_service.clone());
    let execution_service =
        ExecutionService::new(db_pool.clone(), ids.clone(), keychain_processor.clone());
    let broker = Broker::new(db_pool.clone(), ids.clone(), execution_service.clone());
    let event_service = EventService::new(db_pool.clone(), ids.clone());
    let queue_service = QueueService::new(
        db_pool.clone(),
        ids,
        broker.clone(),
        app_config.lease_seconds,
    );

    spawn_queue_reaper(queue_service.clone(), app_config.queue_reap_interval);
    spawn_keychain_sweep(
        keychain_service.clone(),
        keychain_processor,
        app_config.keychain_sweep_interval,
    );

    let events_state = EventsState {
        events: event_service,
        broker: broker.clone(),
    };
    let execute_state = ExecuteState {
        executions: execution_service.clone(),
        broker,
    };

    let app = build_router(
        state,
        db_pool,
        catalog_service,
        credential_service,
        keychain_service,
        execution_service,
        queue_service,
        events_state,
        execute_state,
    );

    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
