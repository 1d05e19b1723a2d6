//! Process-scoped storage directory.
//!
//! Layout:
//!
//! ```text
//! <root>/
//! ├── <tag>/<arch>/<kind>          installer artifacts
//! ├── <arch>-<digest>.tar          exported extension images
//! └── flavors/                     staging area for source implementations
//! ```
//!
//! The tree is removed by [`Workspace::close`] (or when dropped).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tempfile::TempDir;
use tracing::{debug, info};

use crate::coalesce::lock;
use crate::types::{Arch, Kind};

const TEMP_PREFIX: &str = "image-service";
const FLAVORS_DIR: &str = "flavors";

/// Private temporary directory tree owned by one manager.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    flavors: PathBuf,
    dir: Mutex<Option<TempDir>>,
    closed: AtomicBool,
}

impl Workspace {
    /// Create the temporary root and the reserved `flavors/` directory.
    pub fn create() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?;
        let root = dir.path().to_path_buf();
        let flavors = root.join(FLAVORS_DIR);

        create_private_dir(&flavors)?;

        info!(root = %root.display(), "Created artifact workspace");

        Ok(Self {
            root,
            flavors,
            dir: Mutex::new(Some(dir)),
            closed: AtomicBool::new(false),
        })
    }

    /// Root of all cached artifacts.
    pub fn storage_path(&self) -> &Path {
        &self.root
    }

    /// Directory reserved for source staging.
    pub fn flavors_path(&self) -> &Path {
        &self.flavors
    }

    /// `<root>/<tag>`.
    pub fn installer_dir(&self, tag: &str) -> PathBuf {
        self.root.join(tag)
    }

    /// `<root>/<tag>/<arch>/<kind>`.
    pub fn artifact_path(&self, tag: &str, arch: Arch, kind: &Kind) -> PathBuf {
        self.installer_dir(tag)
            .join(arch.as_str())
            .join(kind.as_str())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remove the whole tree. Later calls are no-ops.
    pub fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);

        let Some(dir) = lock(&self.dir).take() else {
            return Ok(());
        };

        debug!(root = %self.root.display(), "Removing artifact workspace");
        dir.close()
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new().mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir(path)
}
