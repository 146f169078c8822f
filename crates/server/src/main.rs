mod api;
mod metrics;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crawlforge_core::orchestrator::OrchestratorParts;
use crawlforge_core::{
    load_config, validate_config, ChunkRunner, Config, DatasetOrchestrator, FsObjectStorage,
    HttpItemPipeline, ItemPipeline, PolicyEngine, SqliteArtifactStore, SqliteJobStore,
    SqlitePolicyStore, StorageTierManager, WorkerPoolBroker,
};

use api::create_router;
use state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("CRAWLFORGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    validate_config(&config).context("Configuration validation failed")?;

    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(
        version = VERSION,
        config_hash = &config_hash[..16],
        "Configuration loaded"
    );
    info!("Database path: {:?}", config.database.path);
    info!("Budget: {:?}", config.budget.resolve());

    let (orchestrator, pool) = build_orchestrator(&config)?;

    let state = Arc::new(AppState::new(
        config.clone(),
        orchestrator.clone(),
        pool.clone(),
    ));
    let app = create_router(state);

    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");

    if let Some(ref orch) = orchestrator {
        if orch.is_running() {
            orch.stop().await;
        }
    }
    // Running stages finish before the pool exits.
    if let Some(ref pool) = pool {
        pool.shutdown().await;
    }

    Ok(())
}

/// Wire the stores, the local worker pool and the orchestrator.
///
/// Returns `None`s when no worker endpoint is configured: chunks would have
/// nothing to run on.
fn build_orchestrator(
    config: &Config,
) -> Result<(Option<Arc<DatasetOrchestrator>>, Option<Arc<WorkerPoolBroker>>)> {
    let db_path = &config.database.path;

    let job_store = Arc::new(SqliteJobStore::new(db_path).context("Failed to create job store")?);
    info!("Job store initialized");

    let artifact_store = Arc::new(
        SqliteArtifactStore::new(db_path).context("Failed to create artifact store")?,
    );
    let policy_store =
        Arc::new(SqlitePolicyStore::new(db_path).context("Failed to create policy store")?);

    let objects = Arc::new(FsObjectStorage::new(&config.storage));
    info!("Object storage rooted at {:?}", config.storage.root);

    let tiers = Arc::new(StorageTierManager::new(
        artifact_store,
        objects,
        config.storage.clone(),
    ));
    let policies = Arc::new(PolicyEngine::new(
        policy_store,
        Arc::clone(&tiers),
        config.policy.clone(),
    ));

    let pipeline: Arc<dyn ItemPipeline> = match HttpItemPipeline::from_config(&config.worker) {
        Some(Ok(pipeline)) => Arc::new(pipeline),
        Some(Err(e)) => return Err(e).context("Failed to create HTTP stage pipeline"),
        None => {
            warn!("No worker endpoint configured, orchestrator unavailable");
            return Ok((None, None));
        }
    };

    let budget = config.budget.resolve();
    if (config.worker.pool_size as u64) < budget.max_concurrent_chunks {
        warn!(
            pool_size = config.worker.pool_size,
            max_concurrent_chunks = budget.max_concurrent_chunks,
            "Worker pool is smaller than the concurrency ceiling; admitted chunks will queue"
        );
    }

    let (events_tx, events_rx) = mpsc::channel(config.orchestrator.event_buffer_size);
    let runner = Arc::new(ChunkRunner::new(
        pipeline,
        job_store.clone(),
        Duration::from_millis(config.worker.heartbeat_interval_ms),
    ));
    let pool = Arc::new(WorkerPoolBroker::start(
        config.worker.pool_size,
        runner,
        events_tx,
    ));

    let orchestrator = Arc::new(DatasetOrchestrator::new(
        config.orchestrator.clone(),
        OrchestratorParts {
            store: job_store,
            broker: pool.clone(),
            tiers,
            policies,
            budget,
            retry: config.retry.clone(),
            aggregation: config.aggregation.clone(),
        },
    ));

    if config.orchestrator.enabled {
        orchestrator.start(events_rx);
    } else {
        info!("Orchestrator disabled in config");
    }

    Ok((Some(orchestrator), Some(pool)))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
