//! Artifact sources: where cache misses are filled from.
//!
//! The manager decides *when* to fetch; an [`ArtifactSource`] decides *how*.
//! [`RegistrySource`] pulls from an OCI registry, [`MockSource`] is an
//! in-process stand-in for tests and development.

mod layers;
mod mock;
mod registry;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::FetchError;
use crate::registry::RegistryPool;
use crate::types::{Arch, ExtensionRef};
use crate::version::Version;

pub use mock::MockSource;
pub use registry::RegistrySource;

/// What a source may touch while fetching.
#[derive(Clone)]
pub struct FetchContext {
    /// Workspace root. Every output lands below it.
    pub storage_root: PathBuf,
    /// Scratch directory reserved for sources.
    pub flavors: PathBuf,
    pub pool: RegistryPool,
    pub min_version: Version,
}

impl FetchContext {
    /// `<root>/<tag>`, the directory `fetch_installer` must publish.
    pub fn installer_dir(&self, tag: &str) -> PathBuf {
        self.storage_root.join(tag)
    }
}

/// Fills cache misses for the manager.
///
/// Each call runs at most once per key at a time. Implementations must
/// publish their outputs atomically: a partially written installer
/// directory or tarball must never be visible at its final path.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Populate `<root>/<tag>/<arch>/<kind>` for every supported arch.
    async fn fetch_installer(&self, ctx: &FetchContext, tag: &str) -> Result<(), FetchError>;

    /// List available release versions at or above the configured minimum.
    async fn fetch_versions(&self, ctx: &FetchContext) -> Result<Vec<Version>, FetchError>;

    /// List the official extensions published for `tag`.
    async fn fetch_extensions(
        &self,
        ctx: &FetchContext,
        tag: &str,
    ) -> Result<Vec<ExtensionRef>, FetchError>;

    /// Export the filesystem of `extension` for `arch` as a tarball at `dest`.
    async fn export_extension_image(
        &self,
        ctx: &FetchContext,
        arch: Arch,
        extension: &ExtensionRef,
        dest: &Path,
    ) -> Result<(), FetchError>;
}
