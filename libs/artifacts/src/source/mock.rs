//! In-process artifact source for tests and development.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::debug;

use super::{ArtifactSource, FetchContext};
use crate::coalesce::lock;
use crate::error::FetchError;
use crate::types::{kinds, Arch, ExtensionRef, Kind};
use crate::version::Version;

/// Mock source that counts calls, optionally sleeps and can be made to fail.
///
/// Installer fetches write one small file per configured kind and arch,
/// published with the same staging-then-rename step as the real source.
pub struct MockSource {
    delay: Duration,
    fail: AtomicBool,
    kinds: Vec<String>,
    versions: Mutex<Vec<Version>>,
    extensions: Vec<ExtensionRef>,

    installer_calls: AtomicUsize,
    versions_calls: AtomicUsize,
    extensions_calls: AtomicUsize,
    export_calls: AtomicUsize,
}

impl MockSource {
    /// Create a mock that succeeds immediately with the well-known kinds.
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            kinds: [
                kinds::KERNEL,
                kinds::INITRAMFS,
                kinds::SYSTEMD_BOOT,
                kinds::SYSTEMD_STUB,
                kinds::INSTALLER,
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            versions: Mutex::new(Vec::new()),
            extensions: Vec::new(),
            installer_calls: AtomicUsize::new(0),
            versions_calls: AtomicUsize::new(0),
            extensions_calls: AtomicUsize::new(0),
            export_calls: AtomicUsize::new(0),
        }
    }

    /// Create a mock whose every fetch fails.
    pub fn failing() -> Self {
        let source = Self::new();
        source.set_failing(true);
        source
    }

    /// Sleep this long inside every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Kinds written for each arch on installer fetch.
    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Versions reported by `fetch_versions` (filtered by the minimum).
    pub fn with_versions(self, versions: Vec<Version>) -> Self {
        self.set_versions(versions);
        self
    }

    /// Catalog returned for every tag.
    pub fn with_extensions(mut self, extensions: Vec<ExtensionRef>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Replace the upstream version list.
    pub fn set_versions(&self, versions: Vec<Version>) {
        *lock(&self.versions) = versions;
    }

    pub fn installer_calls(&self) -> usize {
        self.installer_calls.load(Ordering::SeqCst)
    }

    pub fn versions_calls(&self) -> usize {
        self.versions_calls.load(Ordering::SeqCst)
    }

    pub fn extensions_calls(&self) -> usize {
        self.extensions_calls.load(Ordering::SeqCst)
    }

    pub fn export_calls(&self) -> usize {
        self.export_calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, counter: &AtomicUsize, what: &str) -> Result<(), FetchError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(FetchError::Other(anyhow!("mock {what} failed")));
        }
        Ok(())
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactSource for MockSource {
    async fn fetch_installer(&self, ctx: &FetchContext, tag: &str) -> Result<(), FetchError> {
        self.enter(&self.installer_calls, "installer fetch").await?;

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&ctx.storage_root)?;

        for arch in Arch::ALL {
            let dir = staging.path().join(arch.as_str());
            std::fs::create_dir_all(&dir)?;
            for kind in &self.kinds {
                let kind = Kind::new(kind.as_str())
                    .map_err(|e| FetchError::Other(anyhow!("mock kind: {e}")))?;
                std::fs::write(dir.join(kind.as_str()), format!("{tag}/{arch}/{kind}"))?;
            }
        }

        let staging = staging.keep();
        if let Err(e) = std::fs::rename(&staging, ctx.installer_dir(tag)) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        debug!(tag = %tag, "Mock installer published");
        Ok(())
    }

    async fn fetch_versions(&self, ctx: &FetchContext) -> Result<Vec<Version>, FetchError> {
        self.enter(&self.versions_calls, "version listing").await?;

        let mut versions: Vec<Version> = lock(&self.versions)
            .iter()
            .filter(|v| **v >= ctx.min_version)
            .cloned()
            .collect();
        versions.sort();
        Ok(versions)
    }

    async fn fetch_extensions(
        &self,
        _ctx: &FetchContext,
        _tag: &str,
    ) -> Result<Vec<ExtensionRef>, FetchError> {
        self.enter(&self.extensions_calls, "extensions fetch").await?;
        Ok(self.extensions.clone())
    }

    async fn export_extension_image(
        &self,
        ctx: &FetchContext,
        arch: Arch,
        extension: &ExtensionRef,
        dest: &Path,
    ) -> Result<(), FetchError> {
        self.enter(&self.export_calls, "extension export").await?;

        let mut temp = tempfile::NamedTempFile::new_in(&ctx.storage_root)?;
        writeln!(temp, "{}@{} {}", extension.name, extension.digest, arch)?;
        temp.persist(dest).map_err(|e| e.error)?;
        Ok(())
    }
}
