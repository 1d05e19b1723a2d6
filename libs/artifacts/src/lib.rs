//! # factory-artifacts
//!
//! Release artifact manager for the image factory.
//!
//! ## Cache Domains
//!
//! | Domain            | Key             | Invalidation           |
//! |-------------------|-----------------|------------------------|
//! | Installer assets  | tag             | file exists on disk    |
//! | Version list      | constant        | recheck interval (TTL) |
//! | Extension catalog | tag             | never                  |
//! | Extension images  | arch + digest   | file exists on disk    |
//!
//! ## Guarantees
//!
//! - At most one fetch per key is in flight; concurrent callers share it
//! - Versions below the configured minimum are rejected before any I/O
//! - Cancelling a caller ends only that caller's wait
//! - Nothing is written outside the manager's private workspace
//!
//! ## Example
//!
//! ```no_run
//! use factory_artifacts::{kinds, Arch, Cancel, Kind, Manager, ManagerOptions};
//!
//! # async fn run() -> Result<(), factory_artifacts::ArtifactError> {
//! let manager = Manager::with_registry_source(ManagerOptions::default())?;
//! let kernel = Kind::new(kinds::KERNEL)?;
//! let path = manager.get(&Cancel::never(), "1.6.0", Arch::Amd64, &kernel).await?;
//! println!("{}", path.display());
//! manager.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod coalesce;
mod error;
pub mod keyed_cache;
mod manager;
pub mod registry;
pub mod source;
mod types;
mod version;
mod workspace;

pub use cancel::{Cancel, CancelHandle};
pub use error::{ArtifactError, FetchError};
pub use manager::{Manager, ManagerOptions};
pub use registry::{RegistryError, RegistryOptions};
pub use source::{ArtifactSource, FetchContext, MockSource, RegistrySource};
pub use types::{kinds, Arch, ExtensionRef, Kind};
pub use version::{Version, VersionError};
pub use workspace::Workspace;
