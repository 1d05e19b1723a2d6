//! Configuration for the image service.

use std::time::Duration;

use anyhow::{Context, Result};
use factory_artifacts::{ManagerOptions, RegistryOptions, Version};

/// Image service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Registry host serving release images.
    pub image_registry: String,

    /// Oldest release version served.
    pub min_version: Version,

    /// Version list refresh interval in seconds.
    pub version_recheck_secs: u64,

    /// Bearer token for the registry.
    pub registry_token: Option<String>,

    /// Use plain HTTP for the registry.
    pub registry_insecure: bool,

    /// Versions whose installer assets are fetched at startup.
    pub preload_versions: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let image_registry =
            var("FACTORY_IMAGE_REGISTRY").unwrap_or_else(|| "ghcr.io".to_string());

        let min_version = match var("FACTORY_MIN_VERSION") {
            Some(s) => Version::parse_tolerant(&s)
                .with_context(|| format!("invalid FACTORY_MIN_VERSION {s:?}"))?,
            None => Version::new(1, 2, 0),
        };

        let version_recheck_secs = match var("FACTORY_VERSION_RECHECK_SECS") {
            Some(s) => s
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid FACTORY_VERSION_RECHECK_SECS {s:?}"))?
                .max(1),
            None => 15 * 60,
        };

        let registry_token = var("FACTORY_REGISTRY_TOKEN").filter(|s| !s.is_empty());

        let registry_insecure = match var("FACTORY_REGISTRY_INSECURE") {
            Some(s) => parse_bool(&s)
                .with_context(|| format!("invalid FACTORY_REGISTRY_INSECURE {s:?}"))?,
            None => false,
        };

        let preload_versions = var("FACTORY_PRELOAD_VERSIONS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let log_level = var("FACTORY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            image_registry,
            min_version,
            version_recheck_secs,
            registry_token,
            registry_insecure,
            preload_versions,
            log_level,
        })
    }

    /// Version list refresh interval.
    pub fn version_recheck_interval(&self) -> Duration {
        Duration::from_secs(self.version_recheck_secs)
    }

    /// Options for the artifact manager.
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            image_registry: self.image_registry.clone(),
            min_version: self.min_version.clone(),
            version_recheck_interval: self.version_recheck_interval(),
            registry: RegistryOptions {
                auth_token: self.registry_token.clone(),
                insecure: self.registry_insecure,
                ..Default::default()
            },
        }
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other:?}"),
    }
}
