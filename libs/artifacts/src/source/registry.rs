//! Registry-backed artifact source.

use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::layers;
use super::{ArtifactSource, FetchContext};
use crate::error::FetchError;
use crate::registry::{parse_image_ref, ImageRef, RegistryClient, EXTENSIONS_IMAGE, IMAGER_IMAGE};
use crate::types::{Arch, ExtensionRef};
use crate::version::Version;

/// File in the extensions image listing `name@digest` per line.
const IMAGE_DIGESTS: &str = "image-digests";

/// Pulls installer assets, version lists, extension catalogs and extension
/// images from the configured registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistrySource;

impl RegistrySource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ArtifactSource for RegistrySource {
    async fn fetch_installer(&self, ctx: &FetchContext, tag: &str) -> Result<(), FetchError> {
        let start = Instant::now();
        let image = ctx.pool.image(IMAGER_IMAGE, tag);

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&ctx.storage_root)?;

        for arch in Arch::ALL {
            let layers = pull_layers(ctx.pool.client(arch), &image).await?;
            let dest = staging.path().join(arch.as_str());
            let prefix = PathBuf::from(format!("usr/install/{arch}"));

            let count = blocking(move || {
                std::fs::create_dir_all(&dest)?;
                layers::extract_dir(&layers, &prefix, &dest)
            })
            .await?;

            if count == 0 {
                return Err(FetchError::Extract(format!(
                    "no installer assets for {arch} in {image}"
                )));
            }

            debug!(tag = %tag, arch = %arch, files = count, "Extracted installer assets");
        }

        let target = ctx.installer_dir(tag);
        let staging = staging.keep();
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e.into());
        }

        info!(
            tag = %tag,
            path = %target.display(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Installer assets published"
        );

        Ok(())
    }

    async fn fetch_versions(&self, ctx: &FetchContext) -> Result<Vec<Version>, FetchError> {
        let image = ctx.pool.image(IMAGER_IMAGE, "latest");
        let tags = ctx.pool.client(Arch::Amd64).list_tags(&image).await?;

        let mut versions: Vec<Version> = tags
            .iter()
            .filter_map(|tag| Version::parse_tolerant(tag).ok())
            .filter(|version| *version >= ctx.min_version)
            .collect();
        versions.sort();
        versions.dedup();

        debug!(tags = tags.len(), versions = versions.len(), "Listed release versions");

        Ok(versions)
    }

    async fn fetch_extensions(
        &self,
        ctx: &FetchContext,
        tag: &str,
    ) -> Result<Vec<ExtensionRef>, FetchError> {
        let image = ctx.pool.image(EXTENSIONS_IMAGE, tag);
        let layers = pull_layers(ctx.pool.client(Arch::Amd64), &image).await?;

        let contents = blocking(move || layers::read_file(&layers, Path::new(IMAGE_DIGESTS)))
            .await?
            .ok_or_else(|| {
                FetchError::InvalidCatalog(format!("{IMAGE_DIGESTS} not found in {image}"))
            })?;

        let contents = String::from_utf8(contents)
            .map_err(|e| FetchError::InvalidCatalog(format!("{IMAGE_DIGESTS}: {e}")))?;

        let extensions = parse_catalog(&contents)?;
        debug!(tag = %tag, extensions = extensions.len(), "Parsed extensions catalog");

        Ok(extensions)
    }

    async fn export_extension_image(
        &self,
        ctx: &FetchContext,
        arch: Arch,
        extension: &ExtensionRef,
        dest: &Path,
    ) -> Result<(), FetchError> {
        let start = Instant::now();
        let image = parse_image_ref(&extension.name)?.with_reference(&extension.digest);
        let layers = pull_layers(ctx.pool.client(arch), &image).await?;

        let temp = tempfile::Builder::new()
            .prefix(".export-")
            .suffix(".tar")
            .tempfile_in(&ctx.storage_root)?;
        let dest_owned = dest.to_path_buf();

        let size = blocking(move || {
            let writer = layers::flatten(&layers, BufWriter::new(temp))?;
            // Flush explicitly; dropping a BufWriter swallows write errors.
            let temp = writer.into_inner().map_err(|e| e.into_error())?;
            temp.as_file().sync_all()?;
            let size = temp.as_file().metadata()?.len();
            temp.persist(&dest_owned).map_err(|e| e.error)?;
            Ok(size)
        })
        .await?;

        info!(
            image = %image,
            arch = %arch,
            size = size,
            duration_ms = start.elapsed().as_millis() as u64,
            "Extension image exported"
        );

        Ok(())
    }
}

async fn pull_layers(client: &RegistryClient, image: &ImageRef) -> Result<Vec<Bytes>, FetchError> {
    let manifest = client.resolve_manifest(image).await?;

    debug!(
        image = %image,
        platform = %client.platform(),
        layers = manifest.layers.len(),
        size = manifest.total_layer_size(),
        "Pulling image layers"
    );

    let mut layers = Vec::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        layers.push(client.pull_blob(image, layer).await?);
    }
    Ok(layers)
}

/// Parse `name@digest` lines; blank lines are skipped.
fn parse_catalog(contents: &str) -> Result<Vec<ExtensionRef>, FetchError> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            ExtensionRef::parse_pinned(line)
                .ok_or_else(|| FetchError::InvalidCatalog(format!("malformed line {line:?}")))
        })
        .collect()
}

/// Run archive work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, FetchError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, FetchError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        warn!(error = %e, "Archive task failed");
        FetchError::Extract(format!("archive task failed: {e}"))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryHost, RegistryOptions, RegistryPool};
    use crate::source::layers::tests::layer;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sha256(body: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(body)))
    }

    struct Fixture {
        server: MockServer,
        root: TempDir,
        ctx: FetchContext,
    }

    async fn fixture() -> Fixture {
        let server = MockServer::start().await;
        let root = TempDir::new().unwrap();
        let registry = RegistryHost::parse(server.uri().trim_start_matches("http://")).unwrap();
        let options = RegistryOptions {
            insecure: true,
            ..Default::default()
        };
        let ctx = FetchContext {
            storage_root: root.path().to_path_buf(),
            flavors: root.path().join("flavors"),
            pool: RegistryPool::new(registry, &options).unwrap(),
            min_version: Version::new(1, 5, 0),
        };
        Fixture { server, root, ctx }
    }

    /// Serve a single-layer image manifest for `repo:reference`, also
    /// addressable by its digest, which is returned.
    async fn serve_image(server: &MockServer, repo: &str, reference: &str, layer: Bytes) -> String {
        let layer_digest = sha256(&layer);
        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:config",
                "size": 2
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": layer_digest,
                "size": layer.len()
            }]
        }))
        .unwrap();
        let manifest_digest = sha256(&manifest);

        for reference in [reference, manifest_digest.as_str()] {
            Mock::given(method("GET"))
                .and(path(format!("/v2/{repo}/manifests/{reference}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest.clone()))
                .mount(server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path(format!("/v2/{repo}/blobs/{layer_digest}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(layer.to_vec()))
            .mount(server)
            .await;

        manifest_digest
    }

    #[tokio::test]
    async fn test_fetch_installer_publishes_tag_dir() {
        let f = fixture().await;
        serve_image(
            &f.server,
            IMAGER_IMAGE,
            "v1.6.0",
            layer(
                &[
                    ("usr/install/amd64/vmlinuz", "k-amd64"),
                    ("usr/install/arm64/vmlinuz", "k-arm64"),
                    ("usr/install/arm64/systemd-boot.efi", "boot"),
                ],
                true,
            ),
        )
        .await;

        RegistrySource.fetch_installer(&f.ctx, "v1.6.0").await.unwrap();

        let dir = f.root.path().join("v1.6.0");
        assert_eq!(std::fs::read(dir.join("amd64/vmlinuz")).unwrap(), b"k-amd64");
        assert_eq!(std::fs::read(dir.join("arm64/vmlinuz")).unwrap(), b"k-arm64");
        assert!(dir.join("arm64/systemd-boot.efi").is_file());

        // Only the published tag dir remains.
        let entries: Vec<_> = std::fs::read_dir(f.root.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_installer_missing_arch_fails_without_publishing() {
        let f = fixture().await;
        serve_image(
            &f.server,
            IMAGER_IMAGE,
            "v1.6.0",
            layer(&[("usr/install/amd64/vmlinuz", "k")], false),
        )
        .await;

        let err = RegistrySource.fetch_installer(&f.ctx, "v1.6.0").await.unwrap_err();
        assert!(matches!(err, FetchError::Extract(_)));
        assert!(!f.root.path().join("v1.6.0").exists());
    }

    #[tokio::test]
    async fn test_fetch_versions_filters_and_sorts() {
        let f = fixture().await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/{IMAGER_IMAGE}/tags/list")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tags": ["v1.6.1", "v1.4.0", "latest", "v1.5.0", "v1.6.0-alpha.1", "sha256-abc"]
            })))
            .mount(&f.server)
            .await;

        let versions = RegistrySource.fetch_versions(&f.ctx).await.unwrap();
        let tags: Vec<String> = versions.iter().map(Version::tag).collect();
        assert_eq!(tags, vec!["v1.5.0", "v1.6.0-alpha.1", "v1.6.1"]);
    }

    #[tokio::test]
    async fn test_fetch_extensions_parses_catalog() {
        let f = fixture().await;
        let catalog = "ghcr.io/siderolabs/gvisor:20231214.0-v1.6.0@sha256:aaa\n\n\
                       ghcr.io/siderolabs/iscsi-tools:v0.1.4@sha256:bbb\n";
        serve_image(
            &f.server,
            EXTENSIONS_IMAGE,
            "v1.6.0",
            layer(&[("image-digests", catalog), ("descriptions.yaml", "")], true),
        )
        .await;

        let extensions = RegistrySource.fetch_extensions(&f.ctx, "v1.6.0").await.unwrap();
        assert_eq!(
            extensions,
            vec![
                ExtensionRef::new("ghcr.io/siderolabs/gvisor:20231214.0-v1.6.0", "sha256:aaa"),
                ExtensionRef::new("ghcr.io/siderolabs/iscsi-tools:v0.1.4", "sha256:bbb"),
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_extensions_without_catalog_file() {
        let f = fixture().await;
        serve_image(
            &f.server,
            EXTENSIONS_IMAGE,
            "v1.6.0",
            layer(&[("descriptions.yaml", "")], false),
        )
        .await;

        let err = RegistrySource.fetch_extensions(&f.ctx, "v1.6.0").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidCatalog(_)));
    }

    #[tokio::test]
    async fn test_export_extension_image_writes_flat_tarball() {
        let f = fixture().await;
        let registry = f.ctx.pool.registry().to_string();
        let image_layer = layer(
            &[
                ("rootfs/usr/lib/modules/gvisor.ko", "module"),
                ("rootfs/usr/lib/.wh.old", ""),
                ("manifest.yaml", "name: gvisor"),
            ],
            true,
        );
        let digest =
            serve_image(&f.server, "siderolabs/gvisor", "20231214.0-v1.6.0", image_layer).await;

        let extension = ExtensionRef::new(
            format!("{registry}/siderolabs/gvisor:20231214.0-v1.6.0"),
            digest.clone(),
        );
        let dest = f.root.path().join(format!("amd64-{digest}.tar"));

        RegistrySource
            .export_extension_image(&f.ctx, Arch::Amd64, &extension, &dest)
            .await
            .unwrap();

        let mut archive = tar::Archive::new(std::fs::File::open(&dest).unwrap());
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(
            paths,
            vec!["rootfs/usr/lib/modules/gvisor.ko", "manifest.yaml"]
        );
    }

    #[test]
    fn test_parse_catalog_rejects_malformed_line() {
        assert!(matches!(
            parse_catalog("ghcr.io/siderolabs/gvisor:v1\n"),
            Err(FetchError::InvalidCatalog(_))
        ));
        assert!(parse_catalog("\n  \n").unwrap().is_empty());
    }
}
