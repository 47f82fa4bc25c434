use std::env;
use std::sync::Arc;
use std::time::Duration;

use mailroom_core::{
    Config, Database, FsBlobStore, JobDispatcher, JobQueue, TokenCipher, WorkerConfig,
    init_telemetry, migrations, run_worker,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    init_telemetry(&config.app)?;

    let db = Database::open(&config.paths.database).await?;
    migrations::run_migrations(&db).await?;

    let cipher = Arc::new(TokenCipher::from_base64_key(
        &config.crypto.encryption_key_base64,
    )?);
    let blob_store = Arc::new(FsBlobStore::new(config.paths.blob_root.clone()));

    let queue = JobQueue::new(db.clone());
    let dispatcher = JobDispatcher::new(
        db.clone(),
        reqwest::Client::new(),
        cipher,
        blob_store,
        config.google.clone(),
    );

    let worker_config = WorkerConfig {
        poll_interval: Duration::from_secs_f64(config.worker.poll_interval_seconds),
        history_poll_interval: Duration::from_secs(config.worker.history_poll_interval_seconds),
        ..WorkerConfig::default()
    };

    let shutdown = CancellationToken::new();
    let worker_handle = tokio::spawn(run_worker(
        db.clone(),
        queue,
        dispatcher,
        worker_config,
        shutdown.child_token(),
    ));

    info!(service = %config.app.service_name, "worker daemon running");
    shutdown_signal().await;
    shutdown.cancel();

    if let Err(err) = worker_handle.await {
        warn!("worker task join error: {err}");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
    }
}
