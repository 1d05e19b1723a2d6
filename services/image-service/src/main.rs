//! Image factory service
//!
//! Keeps release artifacts warm for the image factory: installer assets,
//! the upstream version list, extension catalogs and extension images, all
//! pulled from the configured registry and cached for the process lifetime.
//!
//! ## Architecture
//!
//! - **Artifact Manager**: Caches and deduplicates registry fetches
//! - **Preload**: Fetches installer assets for configured versions at startup
//! - **Refresh Loop**: Keeps the version list fresh in the background

use std::sync::Arc;

use anyhow::{Context, Result};
use factory_artifacts::Manager;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod refresh;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting image factory service");
    info!(
        image_registry = %config.image_registry,
        min_version = %config.min_version,
        version_recheck_secs = config.version_recheck_secs,
        preload = config.preload_versions.len(),
        "Configuration loaded"
    );

    let manager = Arc::new(
        Manager::with_registry_source(config.manager_options())
            .context("failed to create artifact manager")?,
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Preload installer assets in the background
    let preload_handle = tokio::spawn({
        let manager = Arc::clone(&manager);
        let versions = config.preload_versions.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { refresh::preload_installers(&manager, &versions, shutdown_rx).await }
    });

    // Start the version refresh loop
    let refresh_handle = tokio::spawn({
        let manager = Arc::clone(&manager);
        let interval = config.version_recheck_interval();
        let shutdown_rx = shutdown_rx.clone();
        async move { refresh::run_refresh_loop(manager, interval, shutdown_rx).await }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = refresh_handle => {
            match result {
                Ok(Ok(())) => info!("Refresh loop exited normally"),
                Ok(Err(e)) => error!(error = %e, "Refresh loop error"),
                Err(e) => error!(error = %e, "Refresh task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    if let Err(e) = preload_handle.await {
        error!(error = %e, "Preload task panicked");
    }

    manager.close().context("failed to remove artifact workspace")?;

    info!("Image factory service shutdown complete");
    Ok(())
}
