//! Error types for the artifact manager.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::registry::RegistryError;
use crate::version::{Version, VersionError};

/// Failure of an artifact source (registry pull, extraction, export).
///
/// Shared between every waiter of a coalesced fetch, hence handed out as
/// `Arc<FetchError>`.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("extraction failed: {0}")]
    Extract(String),

    #[error("invalid extensions catalog: {0}")]
    InvalidCatalog(String),

    /// The fetch task ended without producing a result (panic or runtime shutdown).
    #[error("fetch abandoned before completion")]
    Abandoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors returned by [`Manager`](crate::Manager) operations.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to parse version: {0}")]
    InvalidVersion(#[from] VersionError),

    #[error("version {version} is not supported, minimum is {min}")]
    VersionTooOld { version: Version, min: Version },

    #[error("fetch failed: {0}")]
    Fetch(#[source] Arc<FetchError>),

    #[error("failed to find artifact {}: {source}", path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported architecture: {0}")]
    UnsupportedArch(String),

    #[error("invalid artifact kind: {0:?}")]
    InvalidKind(String),

    #[error("invalid extension digest: {0:?}")]
    InvalidDigest(String),

    #[error("artifact manager is closed")]
    Closed,

    #[error("workspace error: {0}")]
    Workspace(#[source] io::Error),

    #[error("registry setup failed: {0}")]
    Registry(#[from] RegistryError),
}

impl ArtifactError {
    /// Returns true if the caller's cancellation signal ended the wait.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ArtifactError::Cancelled)
    }

    /// Returns true if the requested version is below the configured floor.
    pub fn is_version_too_old(&self) -> bool {
        matches!(self, ArtifactError::VersionTooOld { .. })
    }

    /// Returns true if the source finished but the requested file is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArtifactError::NotFound { .. })
    }

    /// The underlying source failure, if this is a fetch error.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            ArtifactError::Fetch(e) => Some(e),
            _ => None,
        }
    }
}
