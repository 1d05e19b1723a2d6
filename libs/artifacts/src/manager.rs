//! Release artifact manager.
//!
//! Sits between request handlers and an [`ArtifactSource`]: validates and
//! gates versions, answers from the caches, and routes misses through the
//! per-domain coalescers so each artifact is fetched once no matter how many
//! callers ask for it concurrently.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::cancel::Cancel;
use crate::error::{ArtifactError, FetchError};
use crate::keyed_cache::{KeyedCache, OnDisk, Permanent, Ttl};
use crate::registry::{RegistryHost, RegistryOptions, RegistryPool};
use crate::source::{ArtifactSource, FetchContext, RegistrySource};
use crate::types::{Arch, ExtensionRef, Kind};
use crate::version::Version;
use crate::workspace::Workspace;

/// Key of the single version list snapshot.
const VERSIONS_KEY: &str = "talos-versions";

/// Configuration for the artifact manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Registry host serving the release images (e.g. "ghcr.io").
    pub image_registry: String,

    /// Oldest release version that is served.
    pub min_version: Version,

    /// How long a fetched version list stays fresh.
    pub version_recheck_interval: Duration,

    /// Options shared by the per-arch registry clients.
    pub registry: RegistryOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            image_registry: "ghcr.io".to_string(),
            min_version: Version::new(1, 2, 0),
            version_recheck_interval: Duration::from_secs(15 * 60),
            registry: RegistryOptions::default(),
        }
    }
}

/// Loads, caches and serves release artifacts.
///
/// Cheap to share behind an `Arc`; every operation takes `&self`.
pub struct Manager {
    min_version: Version,
    workspace: Workspace,
    ctx: Arc<FetchContext>,
    source: Arc<dyn ArtifactSource>,

    installers: KeyedCache<OnDisk>,
    versions: KeyedCache<Ttl<Vec<Version>>>,
    extensions: KeyedCache<Permanent<Vec<ExtensionRef>>>,
    images: KeyedCache<OnDisk>,
}

impl Manager {
    /// Create a manager with its own workspace and registry clients.
    pub fn new(
        options: ManagerOptions,
        source: Arc<dyn ArtifactSource>,
    ) -> Result<Self, ArtifactError> {
        let workspace = Workspace::create().map_err(ArtifactError::Workspace)?;

        let registry = RegistryHost::parse(&options.image_registry)?;
        let pool = RegistryPool::new(registry, &options.registry)?;

        let root = workspace.storage_path().to_path_buf();
        let ctx = Arc::new(FetchContext {
            storage_root: root.clone(),
            flavors: workspace.flavors_path().to_path_buf(),
            pool,
            min_version: options.min_version.clone(),
        });

        info!(
            root = %root.display(),
            registry = %ctx.pool.registry(),
            min_version = %options.min_version,
            recheck_secs = options.version_recheck_interval.as_secs(),
            "Artifact manager initialized"
        );

        Ok(Self {
            min_version: options.min_version,
            workspace,
            ctx,
            source,
            installers: KeyedCache::new("installer", OnDisk::new(&root)),
            versions: KeyedCache::new("versions", Ttl::new(options.version_recheck_interval)),
            extensions: KeyedCache::new("extensions", Permanent::new()),
            images: KeyedCache::new("extension-image", OnDisk::new(&root)),
        })
    }

    /// Create a manager that pulls from the configured registry.
    pub fn with_registry_source(options: ManagerOptions) -> Result<Self, ArtifactError> {
        Self::new(options, Arc::new(RegistrySource::new()))
    }

    /// Root of all cached artifacts.
    pub fn storage_path(&self) -> &Path {
        self.workspace.storage_path()
    }

    pub fn min_version(&self) -> &Version {
        &self.min_version
    }

    /// Path of an installer artifact, fetching the release on first use.
    ///
    /// `version` must be strict semver (`1.6.0`, not `v1.6.0`).
    pub async fn get(
        &self,
        cancel: &Cancel,
        version: &str,
        arch: Arch,
        kind: &Kind,
    ) -> Result<PathBuf, ArtifactError> {
        self.ensure_open()?;

        let version = Version::parse(version)?;
        self.check_supported(&version)?;
        let tag = version.tag();

        let source = Arc::clone(&self.source);
        let ctx = Arc::clone(&self.ctx);
        let owned_tag = tag.clone();
        self.installers
            .get_or_fetch(&tag, cancel, move || async move {
                source.fetch_installer(&ctx, &owned_tag).await
            })
            .await?;

        let path = self.workspace.artifact_path(&tag, arch, kind);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(path),
            Err(source) => Err(ArtifactError::NotFound { path, source }),
        }
    }

    /// Installer image reference for `version`, e.g.
    /// `ghcr.io/siderolabs/installer:v1.6.0`. The version is not validated.
    pub fn installer_image_ref(&self, version: &str) -> String {
        self.ctx.pool.installer_image_ref(version)
    }

    /// Available release versions, ascending, refreshed after the recheck
    /// interval.
    pub async fn talos_versions(&self, cancel: &Cancel) -> Result<Vec<Version>, ArtifactError> {
        self.ensure_open()?;

        let source = Arc::clone(&self.source);
        let ctx = Arc::clone(&self.ctx);
        self.versions
            .get_or_fetch(VERSIONS_KEY, cancel, move || async move {
                let mut versions = source.fetch_versions(&ctx).await?;
                versions.sort();
                Ok::<_, FetchError>(versions)
            })
            .await
    }

    /// Official extensions published for a release.
    ///
    /// Accepts loose version forms (`v1.6`, `1.6.0`).
    pub async fn official_extensions(
        &self,
        cancel: &Cancel,
        version: &str,
    ) -> Result<Vec<ExtensionRef>, ArtifactError> {
        self.ensure_open()?;

        let version = Version::parse_tolerant(version)?;
        self.check_supported(&version)?;
        let tag = version.tag();

        let source = Arc::clone(&self.source);
        let ctx = Arc::clone(&self.ctx);
        let owned_tag = tag.clone();
        self.extensions
            .get_or_fetch(&tag, cancel, move || async move {
                source.fetch_extensions(&ctx, &owned_tag).await
            })
            .await
    }

    /// Path of the exported tarball of an extension image for `arch`.
    ///
    /// Tarballs are content-addressed: refs sharing a digest share a file.
    pub async fn extension_image(
        &self,
        cancel: &Cancel,
        arch: Arch,
        extension: &ExtensionRef,
    ) -> Result<PathBuf, ArtifactError> {
        self.ensure_open()?;

        let file_name = extension.tarball_name(arch)?;
        let dest = self.images.policy().path(&file_name);

        let source = Arc::clone(&self.source);
        let ctx = Arc::clone(&self.ctx);
        let extension = extension.clone();
        self.images
            .get_or_fetch(&file_name, cancel, move || async move {
                source
                    .export_extension_image(&ctx, arch, &extension, &dest)
                    .await
            })
            .await
    }

    /// Remove the workspace. Every later operation fails with
    /// [`ArtifactError::Closed`].
    pub fn close(&self) -> Result<(), ArtifactError> {
        info!(root = %self.workspace.storage_path().display(), "Closing artifact manager");
        self.workspace.close().map_err(ArtifactError::Workspace)
    }

    fn ensure_open(&self) -> Result<(), ArtifactError> {
        if self.workspace.is_closed() {
            return Err(ArtifactError::Closed);
        }
        Ok(())
    }

    fn check_supported(&self, version: &Version) -> Result<(), ArtifactError> {
        if *version < self.min_version {
            debug!(version = %version, min = %self.min_version, "Rejecting unsupported version");
            return Err(ArtifactError::VersionTooOld {
                version: version.clone(),
                min: self.min_version.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockSource;

    fn manager(source: Arc<MockSource>) -> Manager {
        let options = ManagerOptions {
            min_version: Version::new(1, 5, 0),
            ..Default::default()
        };
        Manager::new(options, source).unwrap()
    }

    #[test]
    fn test_default_options() {
        let options = ManagerOptions::default();
        assert_eq!(options.image_registry, "ghcr.io");
        assert_eq!(options.min_version, Version::new(1, 2, 0));
        assert_eq!(options.version_recheck_interval, Duration::from_secs(900));
    }

    #[test]
    fn test_new_rejects_bad_registry() {
        let options = ManagerOptions {
            image_registry: "https://ghcr.io".to_string(),
            ..Default::default()
        };
        let result = Manager::new(options, Arc::new(MockSource::new()));
        assert!(matches!(result, Err(ArtifactError::Registry(_))));
    }

    #[test]
    fn test_installer_image_ref() {
        let manager = manager(Arc::new(MockSource::new()));
        assert_eq!(
            manager.installer_image_ref("1.6.0"),
            "ghcr.io/siderolabs/installer:v1.6.0"
        );
        manager.close().unwrap();
    }

    #[tokio::test]
    async fn test_get_rejects_invalid_version() {
        let source = Arc::new(MockSource::new());
        let manager = manager(Arc::clone(&source));
        let kind = Kind::new("vmlinuz").unwrap();

        let err = manager
            .get(&Cancel::never(), "v1.6.0", Arch::Amd64, &kind)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidVersion(_)));
        assert_eq!(source.installer_calls(), 0);
    }

    #[tokio::test]
    async fn test_get_missing_kind_is_not_found() {
        let source = Arc::new(MockSource::new().with_kinds(["vmlinuz"]));
        let manager = manager(Arc::clone(&source));
        let kind = Kind::new("initramfs.xz").unwrap();

        let err = manager
            .get(&Cancel::never(), "1.6.0", Arch::Arm64, &kind)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(source.installer_calls(), 1);
    }

    #[tokio::test]
    async fn test_extension_image_rejects_escaping_digest() {
        let source = Arc::new(MockSource::new());
        let manager = manager(Arc::clone(&source));
        let extension = ExtensionRef::new("ghcr.io/siderolabs/gvisor:v1", "../../etc/passwd");

        let err = manager
            .extension_image(&Cancel::never(), Arch::Amd64, &extension)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidDigest(_)));
        assert_eq!(source.export_calls(), 0);
    }
}
