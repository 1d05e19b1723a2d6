//! Background cache maintenance: startup preload and version list refresh.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use factory_artifacts::{kinds, Arch, Cancel, Kind, Manager};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Fetch installer assets for `versions` on every arch.
///
/// Failures are logged and skipped. Returns the number of versions loaded.
pub async fn preload_installers(
    manager: &Manager,
    versions: &[String],
    shutdown: watch::Receiver<bool>,
) -> usize {
    let cancel = Cancel::from_watch(shutdown);
    let kind = match Kind::new(kinds::INSTALLER) {
        Ok(kind) => kind,
        Err(e) => {
            error!(error = %e, "Invalid preload kind");
            return 0;
        }
    };

    let mut loaded = 0;
    'versions: for version in versions {
        for arch in Arch::ALL {
            match manager.get(&cancel, version, arch, &kind).await {
                Ok(path) => {
                    debug!(version = %version, arch = %arch, path = %path.display(), "Preloaded")
                }
                Err(e) if e.is_cancelled() => {
                    info!("Preload interrupted by shutdown");
                    return loaded;
                }
                Err(e) => {
                    warn!(version = %version, arch = %arch, error = %e, "Preload failed");
                    continue 'versions;
                }
            }
        }
        loaded += 1;
    }

    info!(requested = versions.len(), loaded, "Installer preload finished");
    loaded
}

/// Keep the version list no older than `interval` until shutdown.
///
/// Ticks at half the interval: a tick that lands just inside the interval
/// hits the cache, and the next one refreshes.
pub async fn run_refresh_loop(
    manager: Arc<Manager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let period = (interval / 2).max(Duration::from_millis(1));
    info!(
        interval_secs = interval.as_secs(),
        tick_ms = period.as_millis() as u64,
        "Starting version refresh loop"
    );

    let cancel = Cancel::from_watch(shutdown.clone());
    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                match manager.talos_versions(&cancel).await {
                    Ok(versions) => {
                        consecutive_failures = 0;
                        debug!(
                            count = versions.len(),
                            latest = ?versions.last(),
                            "Version list refreshed"
                        );
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(
                                error = %e,
                                consecutive_failures,
                                "Version refresh failed"
                            );
                        } else {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Version refresh failed repeatedly"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Version refresh loop shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use factory_artifacts::{ManagerOptions, MockSource, Version};

    fn manager(source: &Arc<MockSource>, recheck: Duration) -> Arc<Manager> {
        let options = ManagerOptions {
            min_version: Version::new(1, 5, 0),
            version_recheck_interval: recheck,
            ..Default::default()
        };
        Arc::new(Manager::new(options, source.clone()).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_ticks_until_shutdown() {
        let source = Arc::new(MockSource::new().with_versions(vec![Version::new(1, 6, 0)]));
        let manager = manager(&source, Duration::from_secs(10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_refresh_loop(
            Arc::clone(&manager),
            Duration::from_secs(10),
            shutdown_rx,
        ));

        // Ticks every 5s; only ticks at 0s, 10s and 20s find a stale snapshot.
        tokio::time::sleep(Duration::from_secs(22)).await;
        assert_eq!(source.versions_calls(), 3);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_refresh_keeps_list_within_interval() {
        let source = Arc::new(
            MockSource::new()
                .with_versions(vec![Version::new(1, 6, 0)])
                .with_delay(Duration::from_millis(100)),
        );
        let manager = manager(&source, Duration::from_secs(10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_refresh_loop(
            Arc::clone(&manager),
            Duration::from_secs(10),
            shutdown_rx,
        ));

        // Captured at 0.1s, the 10s tick still hits; the 15s tick refreshes,
        // then again at 30s.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(source.versions_calls(), 3);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_survives_failures() {
        let source = Arc::new(MockSource::failing());
        let manager = manager(&source, Duration::from_secs(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_refresh_loop(
            Arc::clone(&manager),
            Duration::from_secs(1),
            shutdown_rx,
        ));

        // Every tick retries: 0ms, 500ms, ..., 5000ms.
        tokio::time::sleep(Duration::from_millis(5250)).await;
        assert_eq!(source.versions_calls(), 11);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_preload_skips_bad_versions() {
        let source = Arc::new(MockSource::new());
        let manager = manager(&source, Duration::from_secs(60));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let versions = vec![
            "1.6.0".to_string(),
            "1.4.0".to_string(),
            "not-a-version".to_string(),
            "1.7.0".to_string(),
        ];
        let loaded = preload_installers(&manager, &versions, shutdown_rx).await;

        assert_eq!(loaded, 2);
        assert_eq!(source.installer_calls(), 2);
    }
}
