//! Architectures, artifact kinds and extension references.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;

/// A supported CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    /// Every supported architecture.
    pub const ALL: [Arch; 2] = [Arch::Amd64, Arch::Arm64];

    /// The architecture name as used in OCI platforms and storage paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" => Ok(Arch::Amd64),
            "arm64" => Ok(Arch::Arm64),
            other => Err(ArtifactError::UnsupportedArch(other.to_string())),
        }
    }
}

/// Well-known artifact kinds produced by the imager.
pub mod kinds {
    pub const KERNEL: &str = "vmlinuz";
    pub const INITRAMFS: &str = "initramfs.xz";
    pub const SYSTEMD_BOOT: &str = "systemd-boot.efi";
    pub const SYSTEMD_STUB: &str = "systemd-stub.efi";
    pub const INSTALLER: &str = "installer";
}

/// Name of one extracted artifact file within an architecture's output set.
///
/// Always a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Kind(String);

impl Kind {
    /// Validate and wrap a kind name.
    pub fn new(name: impl Into<String>) -> Result<Self, ArtifactError> {
        let name = name.into();
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            return Err(ArtifactError::InvalidKind(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Kind {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Kind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// An official extension image published for a release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtensionRef {
    /// Tagged image reference, e.g. `ghcr.io/siderolabs/gvisor:20231214.0-v1.6.0`.
    pub name: String,

    /// Content digest, e.g. `sha256:abc...`.
    pub digest: String,
}

impl ExtensionRef {
    pub fn new(name: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            digest: digest.into(),
        }
    }

    /// Parse one `name@digest` line of an extensions catalog.
    pub fn parse_pinned(line: &str) -> Option<Self> {
        let (name, digest) = line.trim().rsplit_once('@')?;
        if name.is_empty() || digest.is_empty() {
            return None;
        }
        Some(Self::new(name, digest))
    }

    /// File name of the exported tarball for an architecture.
    ///
    /// Fails if the digest could escape the storage directory.
    pub(crate) fn tarball_name(&self, arch: Arch) -> Result<String, ArtifactError> {
        if self.digest.is_empty()
            || self.digest.contains(['/', '\\', '\0'])
            || self.digest.starts_with('.')
        {
            return Err(ArtifactError::InvalidDigest(self.digest.clone()));
        }
        Ok(format!("{}-{}.tar", arch, self.digest))
    }
}
