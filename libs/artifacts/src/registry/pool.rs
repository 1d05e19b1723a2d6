//! Per-architecture registry clients.

use std::sync::Arc;

use super::client::{Platform, RegistryClient, RegistryOptions};
use super::reference::{ImageRef, RegistryHost};
use super::{RegistryError, INSTALLER_IMAGE};
use crate::types::Arch;

/// One long-lived client per supported architecture, bound to one registry.
#[derive(Clone)]
pub struct RegistryPool {
    registry: RegistryHost,
    amd64: Arc<RegistryClient>,
    arm64: Arc<RegistryClient>,
}

impl RegistryPool {
    pub fn new(registry: RegistryHost, options: &RegistryOptions) -> Result<Self, RegistryError> {
        Ok(Self {
            registry,
            amd64: Arc::new(RegistryClient::new(
                Platform::linux(Arch::Amd64),
                options.clone(),
            )?),
            arm64: Arc::new(RegistryClient::new(
                Platform::linux(Arch::Arm64),
                options.clone(),
            )?),
        })
    }

    /// Client pinned to `arch`.
    pub fn client(&self, arch: Arch) -> &Arc<RegistryClient> {
        match arch {
            Arch::Amd64 => &self.amd64,
            Arch::Arm64 => &self.arm64,
        }
    }

    pub fn registry(&self) -> &RegistryHost {
        &self.registry
    }

    /// `repository` at `reference` on the pool's registry.
    pub fn image(&self, repository: &str, reference: &str) -> ImageRef {
        ImageRef::new(self.registry.as_str(), repository, reference)
    }

    /// `<registry>/siderolabs/installer:v<version>`. The version is not parsed.
    pub fn installer_image_ref(&self, version: &str) -> String {
        self.image(INSTALLER_IMAGE, &format!("v{version}")).to_string()
    }
}
