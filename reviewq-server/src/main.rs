use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reviewq_core::OpenAIClient;
use reviewq_server::config::Config;
use reviewq_server::github::GitHubClient;
use reviewq_server::maintenance::Maintenance;
use reviewq_server::queue::SqliteQueue;
use reviewq_server::state_machine::JobTracker;
use reviewq_server::store::SqliteRecordStore;
use reviewq_server::worker::{Collaborators, Worker, WorkerPool};
use reviewq_server::{build_router, get_bot_version, AppState};

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("reviewq_server=info,tower_http=info")),
        )
        .init();

    info!("Starting reviewq {}", get_bot_version());

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!(
            "Failed to create state directory {}",
            config.state_dir.display()
        )
    })?;

    let record_db = config.record_db_path();
    info!("Using record database: {}", record_db.display());
    let store = Arc::new(
        SqliteRecordStore::new(&record_db).context("Failed to open record database")?,
    );

    let queue_db = config.queue_db_path();
    info!("Using queue database: {}", queue_db.display());
    let queue = Arc::new(
        SqliteQueue::new(&queue_db, config.queue.clone()).context("Failed to open queue database")?,
    );

    let mut github_client =
        GitHubClient::new(config.github_app_id, config.github_private_key.clone())
            .context("Failed to create GitHub client")?;
    if let Some(api_base) = &config.github_api_base {
        info!("Using GitHub API at {}", api_base);
        github_client = github_client.with_api_base(api_base.as_str());
    }
    let github_client = Arc::new(github_client);
    let openai_client = Arc::new(
        OpenAIClient::new(config.openai_api_key.clone(), config.openai_model.clone())
            .context("Failed to create OpenAI client")?,
    );

    let cancel = CancellationToken::new();

    let worker = Arc::new(Worker::new(
        queue.clone(),
        store.clone(),
        Collaborators {
            source: github_client.clone(),
            analyzer: openai_client,
            publisher: github_client,
        },
        get_bot_version(),
    ));
    let workers = WorkerPool::spawn(worker, config.worker_concurrency, cancel.clone());
    info!("Started {} review workers", workers.len());

    let maintenance = Maintenance::new(queue.clone(), JobTracker::new(store.clone()));
    let maintenance_cancel = cancel.clone();
    let maintenance_interval = config.maintenance_interval;
    let maintenance_task = tokio::spawn(async move {
        maintenance
            .run(maintenance_interval, maintenance_cancel)
            .await;
    });

    let app_state = Arc::new(AppState::new(
        store,
        queue,
        config.github_webhook_secret.clone().into_bytes(),
    ));
    let app = build_router(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // The server may also stop on its own; make sure background tasks follow.
    cancel.cancel();
    workers.join().await;
    if let Err(e) = maintenance_task.await {
        warn!("Maintenance task ended abnormally: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}
