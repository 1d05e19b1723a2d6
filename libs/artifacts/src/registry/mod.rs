//! OCI registry access.
//!
//! This module handles:
//! - Parsing registry hosts and image references
//! - Resolving multi-platform indexes to a platform manifest
//! - Pulling blobs with digest verification
//! - Listing repository tags
//! - One client per architecture, shared by all fetches

mod client;
mod pool;
mod reference;

use std::io;

use thiserror::Error;

pub use client::{
    Descriptor, ImageIndex, IndexEntry, Manifest, Platform, PlatformSpec, RegistryClient,
    RegistryOptions,
};
pub use pool::RegistryPool;
pub use reference::{parse_image_ref, ImageRef, RegistryHost, DEFAULT_REGISTRY};

/// Repository holding the imager image (installer assets per arch).
pub const IMAGER_IMAGE: &str = "siderolabs/imager";
/// Repository of the published installer image.
pub const INSTALLER_IMAGE: &str = "siderolabs/installer";
/// Repository holding the official extensions catalog.
pub const EXTENSIONS_IMAGE: &str = "siderolabs/extensions";

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Blob too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Pull timeout")]
    Timeout,

    #[error("No manifest for platform {platform} in {image}")]
    PlatformNotFound { image: String, platform: String },

    #[error("Invalid registry host: {0:?}")]
    InvalidRegistry(String),

    #[error("Invalid image reference: {0:?}")]
    InvalidReference(String),

    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },
}
