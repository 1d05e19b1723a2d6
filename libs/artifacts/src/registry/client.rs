//! OCI distribution client pinned to one platform.
//!
//! Resolves tags to platform-specific manifests, pulls blobs with digest
//! verification and lists repository tags.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, LINK, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::reference::{api_host, ImageRef};
use super::RegistryError;
use crate::coalesce::lock;
use crate::types::Arch;

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// Options shared by every client in the pool.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Static bearer token. When unset, anonymous tokens are negotiated.
    pub auth_token: Option<String>,
    /// Talk plain HTTP instead of HTTPS.
    pub insecure: bool,
    /// Per-blob pull timeout.
    pub layer_timeout: Duration,
    /// Total request timeout.
    pub total_timeout: Duration,
    /// Max compressed blob size.
    pub max_compressed_size: u64,
    pub user_agent: String,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            auth_token: None,
            insecure: false,
            layer_timeout: Duration::from_secs(300),     // 5 minutes
            total_timeout: Duration::from_secs(1800),    // 30 minutes
            max_compressed_size: 10 * 1024 * 1024 * 1024, // 10 GiB
            user_agent: concat!("image-factory/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Target platform of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: &'static str,
    pub arch: Arch,
}

impl Platform {
    pub fn linux(arch: Arch) -> Self {
        Self { os: "linux", arch }
    }

    fn matches(&self, spec: &PlatformSpec) -> bool {
        spec.os == self.os && spec.architecture == self.arch.as_str()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// Registry client for one platform.
pub struct RegistryClient {
    platform: Platform,
    options: RegistryOptions,
    http: Client,
    /// Negotiated bearer tokens keyed by `registry/repository`.
    tokens: Mutex<HashMap<String, String>>,
}

impl RegistryClient {
    pub fn new(platform: Platform, options: RegistryOptions) -> Result<Self, RegistryError> {
        let http = Client::builder()
            .timeout(options.total_timeout)
            .user_agent(options.user_agent.clone())
            .build()?;

        Ok(Self {
            platform,
            options,
            http,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Resolve an image to the manifest for this client's platform.
    ///
    /// Image indexes are followed to the matching platform entry.
    pub async fn resolve_manifest(&self, image: &ImageRef) -> Result<Manifest, RegistryError> {
        let body = self.fetch_manifest(image).await?;
        let envelope: Envelope = serde_json::from_slice(&body)?;

        if !envelope.is_index() {
            return Ok(serde_json::from_slice(&body)?);
        }

        let index: ImageIndex = serde_json::from_slice(&body)?;
        let entry = index
            .manifests
            .iter()
            .find(|m| m.platform.as_ref().is_some_and(|p| self.platform.matches(p)))
            .ok_or_else(|| RegistryError::PlatformNotFound {
                image: image.to_string(),
                platform: self.platform.to_string(),
            })?;

        debug!(
            image = %image,
            platform = %self.platform,
            digest = %entry.digest,
            "Resolved platform manifest from index"
        );

        let pinned = image.with_reference(&entry.digest);
        let body = self.fetch_manifest(&pinned).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Pull a blob into memory, verifying its size limit and digest.
    pub async fn pull_blob(
        &self,
        image: &ImageRef,
        blob: &Descriptor,
    ) -> Result<Bytes, RegistryError> {
        if blob.size > self.options.max_compressed_size {
            return Err(RegistryError::TooLarge {
                size: blob.size,
                limit: self.options.max_compressed_size,
            });
        }

        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(&image.registry),
            image.repository,
            blob.digest
        );

        debug!(url = %url, size = blob.size, "Pulling blob");

        let response = tokio::time::timeout(self.options.layer_timeout, async {
            let response = self.send(image, &url, None).await?;
            let response = check_status(response, &blob.digest)?;
            if let Some(size) = response.content_length() {
                if size > self.options.max_compressed_size {
                    return Err(RegistryError::TooLarge {
                        size,
                        limit: self.options.max_compressed_size,
                    });
                }
            }
            Ok::<Bytes, RegistryError>(response.bytes().await?)
        })
        .await
        .map_err(|_| RegistryError::Timeout)??;

        verify_digest(&blob.digest, &response)?;

        Ok(response)
    }

    /// List every tag of a repository, following pagination links.
    pub async fn list_tags(&self, image: &ImageRef) -> Result<Vec<String>, RegistryError> {
        let base = self.base_url(&image.registry);
        let mut url = format!("{}/v2/{}/tags/list?n=1000", base, image.repository);
        let mut tags = Vec::new();

        loop {
            debug!(url = %url, "Listing tags");

            let response = self.send(image, &url, None).await?;
            let response = check_status(response, &image.repository)?;
            let next = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_link);

            let page: TagList = response.json().await?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(path) if path.starts_with("http://") || path.starts_with("https://") => {
                    url = path
                }
                Some(path) => url = format!("{base}{path}"),
                None => break,
            }
        }

        Ok(tags)
    }

    async fn fetch_manifest(&self, image: &ImageRef) -> Result<Bytes, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(&image.registry),
            image.repository,
            image.reference
        );

        debug!(url = %url, "Pulling manifest");

        let accept = [
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
        ]
        .join(", ");

        let response = self.send(image, &url, Some(&accept)).await?;
        let body = check_status(response, &image.to_string())?.bytes().await?;

        if image.is_digest() {
            verify_digest(&image.reference, &body)?;
        }

        Ok(body)
    }

    /// Send a GET, answering a bearer challenge once if needed.
    async fn send(
        &self,
        image: &ImageRef,
        url: &str,
        accept: Option<&str>,
    ) -> Result<Response, RegistryError> {
        let scope_key = image.scope_key();
        let token = match &self.options.auth_token {
            Some(token) => Some(token.clone()),
            None => lock(&self.tokens).get(&scope_key).cloned(),
        };

        let response = self.request(url, accept, token.as_deref()).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED || self.options.auth_token.is_some() {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse);
        let Some(challenge) = challenge else {
            return Ok(response);
        };

        let token = self.negotiate_token(&challenge, image).await?;
        lock(&self.tokens).insert(scope_key, token.clone());

        Ok(self.request(url, accept, Some(&token)).send().await?)
    }

    fn request(&self, url: &str, accept: Option<&str>, token: Option<&str>) -> reqwest::RequestBuilder {
        let mut request = self.http.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        request
    }

    async fn negotiate_token(
        &self,
        challenge: &BearerChallenge,
        image: &ImageRef,
    ) -> Result<String, RegistryError> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", image.repository));

        debug!(realm = %challenge.realm, scope = %scope, "Requesting registry token");

        let mut request = self.http.get(&challenge.realm).query(&[("scope", scope.as_str())]);
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service.as_str())]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::AuthRequired);
        }

        let token: TokenResponse = response.json().await?;
        token
            .token
            .or(token.access_token)
            .ok_or(RegistryError::AuthRequired)
    }

    fn base_url(&self, registry: &str) -> String {
        let scheme = if self.options.insecure { "http" } else { "https" };
        format!("{}://{}", scheme, api_host(registry))
    }
}

fn check_status(response: Response, what: &str) -> Result<Response, RegistryError> {
    match response.status() {
        StatusCode::OK => Ok(response),
        StatusCode::NOT_FOUND => Err(RegistryError::NotFound(what.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RegistryError::AuthRequired),
        status => Err(RegistryError::UnexpectedStatus {
            url: response.url().to_string(),
            status: status.as_u16(),
        }),
    }
}

fn verify_digest(expected: &str, body: &[u8]) -> Result<(), RegistryError> {
    // Only sha256 is verified; other algorithms are passed through.
    if !expected.starts_with("sha256:") {
        return Ok(());
    }

    let computed = format!("sha256:{}", hex::encode(Sha256::digest(body)));
    if computed != expected {
        return Err(RegistryError::DigestMismatch {
            expected: expected.to_string(),
            actual: computed,
        });
    }
    Ok(())
}

/// Extract the target of a `rel="next"` Link header.
fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|link| {
        let (target, params) = link.split_once(';')?;
        if !params.contains("rel=\"next\"") && !params.contains("rel=next") {
            return None;
        }
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        Some(target.to_string())
    })
}

/// Parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(header: &str) -> Option<Self> {
        let params = header.trim().strip_prefix("Bearer ")?;
        let mut values: HashMap<String, String> = HashMap::new();

        let mut rest = params.trim();
        while !rest.is_empty() {
            let (key, after) = rest.split_once('=')?;
            let after = after.trim_start();
            let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            } else {
                after.split_once(',').map_or((after, ""), |(v, r)| (v, r))
            };
            values.insert(key.trim().to_ascii_lowercase(), value.to_string());
            rest = remaining.trim_start_matches([',', ' ']);
        }

        Some(Self {
            realm: values.remove("realm")?,
            service: values.remove("service"),
            scope: values.remove("scope"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    tags: Option<Vec<String>>,
}

/// Just enough of a manifest to tell indexes from image manifests.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
}

impl Envelope {
    fn is_index(&self) -> bool {
        match self.media_type.as_deref() {
            Some(MEDIA_TYPE_OCI_INDEX | MEDIA_TYPE_DOCKER_MANIFEST_LIST) => true,
            Some(_) => false,
            None => self.manifests.is_some(),
        }
    }
}

/// OCI image index (or Docker manifest list).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<IndexEntry>,
}

/// One platform entry of an image index.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default)]
    pub platform: Option<PlatformSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlatformSpec {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

/// OCI image manifest.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version.
    pub schema_version: u32,
    /// Media type.
    #[serde(default)]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors.
    pub layers: Vec<Descriptor>,
}

/// Content descriptor.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the content.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
}

impl Manifest {
    /// Get total compressed size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}
