//! flowmesh engine server
//!
//! Wires storage, queue, catalogs and the runner together, consumes the
//! result and deployment channels and serves the engine HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowmesh_engine::{
    catalog::{HttpFunctionCatalog, HttpWorkflowCatalog},
    config::{AppConfig, DatabaseConfig, StorageKind},
    db::{create_pool, init_schema, DbPool},
    dispatch::DispatchGateway,
    engine::{EngineHandler, RunnerSettings, WorkflowRunner},
    handlers,
    queue::{self, nats::NatsTopology, Channel, MemoryQueue, MessageHandler, NatsQueue, QueueClient},
    state::AppState,
    store::{InstanceRepository, InstanceStore, MemoryInstanceRepository, PgInstanceRepository},
};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flowmesh_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// NATS when configured, otherwise the in-process queue.
async fn connect_queue(config: &AppConfig) -> anyhow::Result<(Arc<dyn QueueClient>, bool)> {
    match config.nats_url {
        Some(ref nats_url) => {
            let queue = NatsQueue::connect(nats_url, NatsTopology::from_config(config)).await?;
            tracing::info!(url = %nats_url, stream = %config.nats_stream, "Connected to NATS");
            Ok((Arc::new(queue), true))
        }
        None => {
            tracing::warn!("NATS not configured, using the in-process queue");
            Ok((Arc::new(MemoryQueue::new()), false))
        }
    }
}

async fn open_repository(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn InstanceRepository>, Option<DbPool>)> {
    match config.storage {
        StorageKind::Postgres => {
            let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load database config, using defaults");
                DatabaseConfig::default()
            });
            let pool = create_pool(&db_config).await?;
            init_schema(&pool).await?;
            Ok((Arc::new(PgInstanceRepository::new(pool.clone())), Some(pool)))
        }
        StorageKind::Memory => {
            tracing::warn!("Using the in-memory instance store; runs are lost on restart");
            Ok((Arc::new(MemoryInstanceRepository::new()), None))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting flowmesh engine");

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        dispatch_mode = ?app_config.dispatch_mode,
        storage = ?app_config.storage,
        "Configuration loaded"
    );

    let (queue, has_nats) = connect_queue(&app_config).await?;
    let (repository, db_pool) = open_repository(&app_config).await?;

    let store = InstanceStore::new(repository, queue.clone());
    let gateway = DispatchGateway::new(
        queue.clone(),
        app_config.dispatch_mode,
        &app_config.callback_url,
        app_config.http_timeout(),
    );
    let runner = Arc::new(WorkflowRunner::new(
        store,
        gateway,
        Arc::new(HttpFunctionCatalog::new(
            &app_config.function_catalog_url,
            app_config.http_timeout(),
        )),
        Arc::new(HttpWorkflowCatalog::new(
            &app_config.workflow_catalog_url,
            app_config.http_timeout(),
        )),
        queue.clone(),
        RunnerSettings::from_config(&app_config),
    ));

    let handler: Arc<dyn MessageHandler> = Arc::new(EngineHandler::new(runner.clone()));
    let permits = Arc::new(Semaphore::new(app_config.max_concurrent_messages.max(1)));
    for channel in [Channel::Results, Channel::Deployments] {
        let queue = queue.clone();
        let handler = handler.clone();
        let permits = permits.clone();
        tokio::spawn(async move {
            if let Err(e) = queue::run_consumer(queue, channel, handler, permits).await {
                tracing::error!(channel = %channel, error = %e, "Consumer exited");
            }
        });
    }

    let state = AppState::new(runner, app_config.clone(), db_pool, has_nats);
    let app = handlers::router(state);

    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
