use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info};

use sqlgate::config::Config;
use sqlgate::dispatch::Dispatcher;
use sqlgate::session::SessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();

    // Initialize logging; stdout carries responses
    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .with_writer(std::io::stderr)
        .init();

    info!("sqlgate v{}", env!("CARGO_PKG_VERSION"));
    if config.in_memory {
        info!("Using in-memory SQLite databases (testing mode)");
    } else {
        info!("Using database {}", config.database);
    }

    let factory = Arc::new(config.connection_factory());
    let manager = Arc::new(
        SessionManager::from_config(&config, factory)
            .await
            .context("failed to initialize session manager")?,
    );
    manager.spawn_maintenance();

    let dispatcher = Arc::new(Dispatcher::new(
        manager.clone(),
        config.retry_policy(),
        !config.no_rate_limit,
    ));

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        served = dispatcher.serve(stdin, stdout) => {
            match served {
                Ok(()) => info!("Input closed"),
                Err(e) => error!("I/O error on stdin/stdout: {}", e),
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
    }

    manager.cleanup().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("Could not install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();
}
