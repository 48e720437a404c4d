//! Bundles and the images they depend on.
//!
//! A bundle is an image annotated with [`BUNDLE_ANNOTATION`] whose layers
//! carry an ImagesLock at [`IMAGES_LOCK_PATH`]. Expansion is one level deep:
//! bundles listed in that lock are copied as ordinary artifacts.

use std::collections::HashMap;
use std::io::Read;

use flate2::read::GzDecoder;
use imgpkg_core::error::{ImgpkgError, Result};
use tar::Archive;
use tokio::sync::OnceCell;

use crate::images::{UnprocessedImageUrl, UnprocessedImageUrls};
use crate::lock::ImagesLock;
use crate::oci::{ArtifactReference, Registry, BUNDLE_ANNOTATION};
use crate::resolve::{require_kind, ExpectedKind, ResolvedArtifact};

/// Location of the embedded lock inside a bundle layer.
pub const IMAGES_LOCK_PATH: &str = ".imgpkg/images.yml";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A resolved bundle. The embedded lock is fetched on first use and cached.
#[derive(Debug)]
pub struct Bundle {
    reference: ArtifactReference,
    images_lock: OnceCell<ImagesLock>,
}

impl Bundle {
    pub fn new(reference: ArtifactReference) -> Self {
        Self {
            reference,
            images_lock: OnceCell::new(),
        }
    }

    /// Wrap a resolved artifact, rejecting anything that is not a bundle.
    pub fn from_resolved(resolved: &ResolvedArtifact) -> Result<Self> {
        require_kind(resolved, ExpectedKind::Bundle)?;
        Ok(Self::new(resolved.reference.clone()))
    }

    pub fn reference(&self) -> &ArtifactReference {
        &self.reference
    }

    /// Digest-qualified bundle URL.
    pub fn url(&self) -> String {
        self.reference.url()
    }

    pub fn tag(&self) -> Option<&str> {
        self.reference.tag.as_deref()
    }

    /// The bundle's embedded ImagesLock.
    pub async fn images_lock(&self, registry: &dyn Registry) -> Result<&ImagesLock> {
        self.images_lock
            .get_or_try_init(|| fetch_images_lock(&self.reference, registry))
            .await
    }

    /// Every image the bundle depends on, then the bundle itself.
    pub async fn expand(&self, registry: &dyn Registry) -> Result<(ImagesLock, UnprocessedImageUrls)> {
        let lock = self.images_lock(registry).await?.clone();

        let mut urls = UnprocessedImageUrls::new();
        for image in &lock.images {
            urls.add(UnprocessedImageUrl::new(image.image.clone()));
        }
        urls.add(UnprocessedImageUrl::with_tag(
            self.url(),
            self.reference.tag.clone(),
        ));

        tracing::debug!(bundle = %self.reference, images = lock.images.len(), "Expanded bundle");
        Ok((lock, urls))
    }

    /// The embedded lock with every image pointed at its collocated copy.
    ///
    /// `located` maps each lock URL to where it was found. Only when every
    /// image sits in the bundle's own repository is a rewritten lock
    /// returned; annotations are kept.
    pub fn rewrite_images_lock(
        &self,
        lock: &ImagesLock,
        located: &HashMap<String, String>,
    ) -> Result<Option<ImagesLock>> {
        let mut rewritten = lock.clone();
        for image in &mut rewritten.images {
            let Some(url) = located.get(&image.image) else {
                return Ok(None);
            };
            if ArtifactReference::parse(url)?.repository != self.reference.repository {
                return Ok(None);
            }
            image.image = url.clone();
        }

        tracing::info!(bundle = %self.reference, "All images found in bundle repo, using collocated lock");
        Ok(Some(rewritten))
    }
}

async fn fetch_images_lock(reference: &ArtifactReference, registry: &dyn Registry) -> Result<ImagesLock> {
    let manifest = registry.fetch_manifest(reference).await?;
    if !manifest.annotations()?.contains_key(BUNDLE_ANNOTATION) {
        return Err(ImgpkgError::WrongArtifactKind {
            message: format!("Expected bundle image but found plain image '{}'", reference.url()),
            hint: "Did you use -i instead of -b?".to_string(),
        });
    }

    // The lock usually lives in the last layer.
    for layer in manifest.layer_descriptors()?.iter().rev() {
        let data = registry.fetch_blob(reference, &layer.digest).await?;
        if let Some(lock) = find_images_lock(&data)? {
            return Ok(lock);
        }
    }

    Err(ImgpkgError::LockNotFound(format!(
        "bundle '{}' has no {}",
        reference.url(),
        IMAGES_LOCK_PATH
    )))
}

/// Look for the embedded lock in one layer (plain or gzipped tar).
pub fn find_images_lock(layer: &[u8]) -> Result<Option<ImagesLock>> {
    if layer.starts_with(&GZIP_MAGIC) {
        read_lock_entry(GzDecoder::new(layer))
    } else {
        read_lock_entry(layer)
    }
}

fn read_lock_entry<R: Read>(reader: R) -> Result<Option<ImagesLock>> {
    let mut archive = Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| ImgpkgError::ArchiveError(format!("Failed to read bundle layer: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| ImgpkgError::ArchiveError(format!("Failed to read bundle layer: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| ImgpkgError::ArchiveError(format!("Invalid path in bundle layer: {}", e)))?
            .to_string_lossy()
            .into_owned();
        if path.trim_start_matches("./").trim_start_matches('/') != IMAGES_LOCK_PATH {
            continue;
        }

        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        return ImagesLock::from_bytes(&data).map(Some);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::ImageRef;
    use crate::oci::artifact::{fixtures, Blob, Manifest, OciArtifact, OCI_MANIFEST_MEDIA_TYPE};
    use crate::oci::MemoryRegistry;
    use std::io::Write;

    const BUNDLE_REPO: &str = "registry.example.com/repo-b";

    fn tar_with(path: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn bundle_image(layer: Vec<u8>) -> OciArtifact {
        let config = Blob::new(fixtures::CONFIG_MEDIA_TYPE, b"{}".to_vec());
        let layer = Blob::new(fixtures::LAYER_MEDIA_TYPE, layer);
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST_MEDIA_TYPE,
            "config": {"mediaType": config.media_type, "digest": config.digest, "size": config.data.len()},
            "layers": [{"mediaType": layer.media_type, "digest": layer.digest, "size": layer.data.len()}],
            "annotations": {(BUNDLE_ANNOTATION): "true"},
        });
        let manifest = Manifest::from_bytes(serde_json::to_vec(&manifest).unwrap()).unwrap();
        OciArtifact::new(manifest, vec![config, layer], vec![])
    }

    fn lock_for(image: &OciArtifact) -> ImagesLock {
        ImagesLock::new(vec![ImageRef::new(format!(
            "registry.example.com/repo-a@{}",
            image.digest
        ))])
    }

    #[tokio::test]
    async fn test_expand_lists_images_then_bundle() {
        let registry = MemoryRegistry::new();
        let app = fixtures::image(b"app", &[]);
        let lock = lock_for(&app);
        let layer = tar_with(IMAGES_LOCK_PATH, &lock.to_bytes().unwrap());
        let reference = registry.insert(BUNDLE_REPO, Some("v1"), &bundle_image(layer));

        let bundle = Bundle::new(reference.clone());
        let (found, urls) = bundle.expand(&registry).await.unwrap();

        assert_eq!(found, lock);
        assert_eq!(urls.len(), 2);
        assert_eq!(urls.all()[0].url, lock.images[0].image);
        assert_eq!(urls.all()[0].tag, None);
        assert_eq!(urls.all()[1].url, reference.url());
        assert_eq!(urls.all()[1].tag.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_gzipped_layer_with_dot_prefix() {
        let registry = MemoryRegistry::new();
        let lock = lock_for(&fixtures::image(b"app", &[]));
        let layer = gzip(&tar_with("./.imgpkg/images.yml", &lock.to_bytes().unwrap()));
        let reference = registry.insert(BUNDLE_REPO, None, &bundle_image(layer));

        let bundle = Bundle::new(reference);
        assert_eq!(bundle.images_lock(&registry).await.unwrap(), &lock);
        // Cached after the first fetch.
        assert_eq!(bundle.images_lock(&registry).await.unwrap(), &lock);
    }

    #[tokio::test]
    async fn test_missing_lock() {
        let registry = MemoryRegistry::new();
        let layer = tar_with("README.md", b"no lock here");
        let reference = registry.insert(BUNDLE_REPO, None, &bundle_image(layer));

        let err = Bundle::new(reference).expand(&registry).await.unwrap_err();
        assert!(matches!(err, ImgpkgError::LockNotFound(_)));
    }

    #[tokio::test]
    async fn test_invalid_embedded_lock_is_schema_error() {
        let registry = MemoryRegistry::new();
        let yaml = b"apiVersion: imgpkg.example/v1alpha1\nkind: ImagesLock\nimages:\n- image: nginx:v1\n";
        let layer = tar_with(IMAGES_LOCK_PATH, yaml);
        let reference = registry.insert(BUNDLE_REPO, None, &bundle_image(layer));

        let err = Bundle::new(reference).expand(&registry).await.unwrap_err();
        assert!(matches!(err, ImgpkgError::Schema(_)));
    }

    #[tokio::test]
    async fn test_plain_image_is_not_a_bundle() {
        let registry = MemoryRegistry::new();
        let reference = registry.insert(BUNDLE_REPO, None, &fixtures::image(b"plain", &[]));

        let err = Bundle::new(reference).expand(&registry).await.unwrap_err();
        assert!(matches!(err, ImgpkgError::WrongArtifactKind { .. }));
    }

    fn located(pairs: &[(&str, String)]) -> HashMap<String, String> {
        pairs.iter().map(|(from, to)| (from.to_string(), to.clone())).collect()
    }

    #[test]
    fn test_rewrite_images_lock_when_all_collocated() {
        let digest = fixtures::image(b"app", &[]).digest;
        let original = format!("registry.example.com/repo-a@{}", digest);
        let mut entry = ImageRef::new(original.clone());
        entry.annotations.insert("kbld.carvel.dev/id".to_string(), "app".to_string());
        let lock = ImagesLock::new(vec![entry]);
        let bundle = Bundle::new(ArtifactReference::new(BUNDLE_REPO, digest.clone()));

        let collocated = format!("{}@{}", BUNDLE_REPO, digest);
        let rewritten = bundle
            .rewrite_images_lock(&lock, &located(&[(&original, collocated.clone())]))
            .unwrap()
            .unwrap();
        assert_eq!(rewritten.images[0].image, collocated);
        assert_eq!(
            rewritten.images[0].annotations.get("kbld.carvel.dev/id").map(String::as_str),
            Some("app")
        );
        assert_eq!(rewritten.kind, lock.kind);
    }

    #[test]
    fn test_rewrite_images_lock_needs_every_image() {
        let app = fixtures::image(b"app", &[]).digest;
        let db = fixtures::image(b"db", &[]).digest;
        let app_url = format!("registry.example.com/repo-a@{}", app);
        let db_url = format!("registry.example.com/repo-a@{}", db);
        let lock = ImagesLock::new(vec![ImageRef::new(app_url.clone()), ImageRef::new(db_url.clone())]);
        let bundle = Bundle::new(ArtifactReference::new(BUNDLE_REPO, app.clone()));

        // db was not found next to the bundle
        let partial = located(&[
            (&app_url, format!("{}@{}", BUNDLE_REPO, app)),
            (&db_url, db_url.clone()),
        ]);
        assert!(bundle.rewrite_images_lock(&lock, &partial).unwrap().is_none());

        let missing = located(&[(&app_url, format!("{}@{}", BUNDLE_REPO, app))]);
        assert!(bundle.rewrite_images_lock(&lock, &missing).unwrap().is_none());
    }

    #[test]
    fn test_find_images_lock_ignores_other_files() {
        assert!(find_images_lock(&tar_with("etc/config.yml", b"a: b")).unwrap().is_none());
    }
}
