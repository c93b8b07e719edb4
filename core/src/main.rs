/// Huddle messaging server - Main entry point
use huddle_core::messaging_api::start_messaging_api;
use huddle_core::{Config, SyncEngine};
use std::env;
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let engine = SyncEngine::open(&config)
        .map_err(|e| anyhow::anyhow!("Failed to open messaging store: {}", e))?;
    info!("Starting Huddle messaging server");
    info!("   Data dir: {:?}", config.data_dir);
    info!("   Tombstone retention: {} days", config.tombstone_retention.as_secs() / 86_400);

    let purge_handle = {
        let engine = engine.clone();
        let every = config.purge_interval;
        tokio::spawn(async move { run_purge(engine, every).await })
    };

    let api_handle = {
        let engine = engine.clone();
        let port = config.port;
        tokio::spawn(async move { start_messaging_api(engine, port).await })
    };

    tokio::select! {
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
        }
        res = api_handle => {
            match res {
                Ok(Err(e)) => error!("Messaging API stopped: {}", e),
                Err(e) => error!("Messaging API task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    purge_handle.abort();
    engine
        .flush()
        .map_err(|e| anyhow::anyhow!("Failed to flush messaging store: {}", e))?;
    info!("Server stopped");
    Ok(())
}

/// Periodically drop tombstones past the retention window
async fn run_purge(engine: SyncEngine, every: std::time::Duration) {
    let mut interval = interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        if let Err(e) = engine.purge_expired_tombstones(chrono::Utc::now()) {
            error!("Tombstone purge failed: {}", e);
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await
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
