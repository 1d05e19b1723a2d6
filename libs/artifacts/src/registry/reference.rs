//! Registry hosts and image references.

use std::fmt;

use super::RegistryError;

/// Registry used when a reference has no registry component.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Host that serves the Docker Hub registry API.
const DOCKER_HUB_API: &str = "registry-1.docker.io";

/// A validated registry host (`host[:port]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryHost(String);

impl RegistryHost {
    /// Parse a registry host. An empty string selects Docker Hub.
    pub fn parse(input: &str) -> Result<Self, RegistryError> {
        let host = input.trim();
        if host.is_empty() {
            return Ok(Self(DEFAULT_REGISTRY.to_string()));
        }

        let invalid = || RegistryError::InvalidRegistry(input.to_string());

        if host.contains("://") || host.contains(['/', '@', '?', '#']) || host.contains(char::is_whitespace)
        {
            return Err(invalid());
        }

        let url = reqwest::Url::parse(&format!("https://{host}/")).map_err(|_| invalid())?;
        if url.host_str().is_none() || url.path() != "/" {
            return Err(invalid());
        }

        Ok(Self(host.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistryHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host to send API requests to.
pub(crate) fn api_host(registry: &str) -> &str {
    match registry {
        "docker.io" | "index.docker.io" => DOCKER_HUB_API,
        other => other,
    }
}

/// A repository in a registry plus a tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    /// Tag (`v1.6.0`) or digest (`sha256:...`).
    pub reference: String,
}

impl ImageRef {
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
            reference: reference.into(),
        }
    }

    /// The same repository at another tag or digest.
    pub fn with_reference(&self, reference: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            reference: reference.into(),
        }
    }

    /// Whether the reference is a content digest.
    pub fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }

    /// Key used to scope auth tokens.
    pub(crate) fn scope_key(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}

/// Parse an image reference into registry, repository and tag/digest.
///
/// Examples:
/// - `alpine` -> (registry-1.docker.io, library/alpine, latest)
/// - `ghcr.io/siderolabs/gvisor:v1` -> (ghcr.io, siderolabs/gvisor, v1)
/// - `ghcr.io/siderolabs/gvisor:v1@sha256:abc` -> (ghcr.io, siderolabs/gvisor, sha256:abc)
pub fn parse_image_ref(image_ref: &str) -> Result<ImageRef, RegistryError> {
    let image_ref = image_ref.trim();
    if image_ref.is_empty() {
        return Err(RegistryError::InvalidReference(image_ref.to_string()));
    }

    // A digest wins over any tag that precedes it.
    let (name_part, digest) = match image_ref.rsplit_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (image_ref, None),
    };

    let (name_part, tag) = match name_part.rsplit_once(':') {
        // A colon followed by a slash belongs to a registry port.
        Some((name, tag)) if !tag.contains('/') && !name.ends_with(']') => (name, Some(tag)),
        _ => (name_part, None),
    };

    let reference = match (digest, tag) {
        (Some(digest), _) => digest,
        (None, Some(tag)) => tag,
        (None, None) => "latest",
    };

    if name_part.is_empty() || reference.is_empty() {
        return Err(RegistryError::InvalidReference(image_ref.to_string()));
    }

    let (registry, repository) = match name_part.split_once('/') {
        None => (DOCKER_HUB_API.to_string(), format!("library/{name_part}")),
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        Some(_) => (DOCKER_HUB_API.to_string(), name_part.to_string()),
    };

    if repository.is_empty() {
        return Err(RegistryError::InvalidReference(image_ref.to_string()));
    }

    Ok(ImageRef {
        registry,
        repository,
        reference: reference.to_string(),
    })
}
