//! In-memory registry.
//!
//! Holds manifests per repository and blobs in one content-addressed map.
//! Backs the tar archive adapter and doubles as a registry in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use imgpkg_core::error::{ImgpkgError, Result};
use parking_lot::RwLock;

use super::artifact::{Blob, Manifest, OciArtifact};
use super::reference::{ArtifactReference, ImageReference};
use super::registry::{ImageDestination, ImageSource, Registry};

/// One stored manifest, as listed by [`MemoryRegistry::entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub repository: String,
    pub digest: String,
    pub media_type: String,
    pub tags: Vec<String>,
}

#[derive(Default)]
struct Repository {
    manifests: BTreeMap<String, Manifest>,
    tags: BTreeMap<String, String>,
}

#[derive(Default)]
struct Inner {
    repositories: BTreeMap<String, Repository>,
    blobs: HashMap<String, Blob>,
}

/// Registry kept entirely in memory. Cloning shares the storage.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `artifact` under `repository` and return its reference.
    pub fn insert(&self, repository: &str, tag: Option<&str>, artifact: &OciArtifact) -> ArtifactReference {
        let mut inner = self.inner.write();
        let digest = store_artifact(&mut inner, repository, artifact);
        if let Some(tag) = tag {
            inner
                .repositories
                .entry(repository.to_string())
                .or_default()
                .tags
                .insert(tag.to_string(), digest.clone());
        }
        ArtifactReference::new(repository, digest).with_tag(tag.map(str::to_string))
    }

    pub fn put_blob(&self, blob: Blob) {
        self.inner.write().blobs.insert(blob.digest.clone(), blob);
    }

    /// Store a bare manifest; its blobs must be added separately.
    pub fn put_manifest(&self, repository: &str, manifest: Manifest) -> String {
        let digest = manifest.digest();
        self.inner
            .write()
            .repositories
            .entry(repository.to_string())
            .or_default()
            .manifests
            .insert(digest.clone(), manifest);
        digest
    }

    pub fn tag(&self, repository: &str, tag: &str, digest: &str) {
        self.inner
            .write()
            .repositories
            .entry(repository.to_string())
            .or_default()
            .tags
            .insert(tag.to_string(), digest.to_string());
    }

    /// Every stored manifest, ordered by repository then digest.
    pub fn entries(&self) -> Vec<ManifestEntry> {
        let inner = self.inner.read();
        let mut entries = Vec::new();
        for (name, repository) in &inner.repositories {
            for (digest, manifest) in &repository.manifests {
                let tags = repository
                    .tags
                    .iter()
                    .filter(|(_, d)| *d == digest)
                    .map(|(t, _)| t.clone())
                    .collect();
                entries.push(ManifestEntry {
                    repository: name.clone(),
                    digest: digest.clone(),
                    media_type: manifest.media_type.clone(),
                    tags,
                });
            }
        }
        entries
    }

    pub fn manifest(&self, repository: &str, digest: &str) -> Option<Manifest> {
        self.inner
            .read()
            .repositories
            .get(repository)
            .and_then(|r| r.manifests.get(digest))
            .cloned()
    }

    pub fn blob(&self, digest: &str) -> Option<Blob> {
        self.inner.read().blobs.get(digest).cloned()
    }

    pub fn blob_digests(&self) -> Vec<String> {
        let mut digests: Vec<String> = self.inner.read().blobs.keys().cloned().collect();
        digests.sort();
        digests
    }

    /// Digest a tag currently points at.
    pub fn tagged(&self, repository: &str, tag: &str) -> Option<String> {
        self.inner
            .read()
            .repositories
            .get(repository)
            .and_then(|r| r.tags.get(tag))
            .cloned()
    }

    pub fn contains(&self, repository: &str, digest: &str) -> bool {
        self.manifest(repository, digest).is_some()
    }

    fn load(&self, repository: &str, digest: &str) -> Result<OciArtifact> {
        let manifest = self.manifest(repository, digest).ok_or_else(|| ImgpkgError::NotFound {
            reference: format!("{}@{}", repository, digest),
            message: "manifest unknown".to_string(),
        })?;

        let mut blobs = Vec::new();
        for descriptor in manifest.blob_descriptors()? {
            let blob = self.blob(&descriptor.digest).ok_or_else(|| ImgpkgError::NotFound {
                reference: format!("{}@{}", repository, descriptor.digest),
                message: "blob unknown".to_string(),
            })?;
            blobs.push(blob);
        }

        let mut children = Vec::new();
        for descriptor in manifest.child_descriptors()? {
            children.push(self.load(repository, &descriptor.digest)?);
        }

        Ok(OciArtifact::new(manifest, blobs, children))
    }
}

/// Stores under the digest of the manifest bytes, not the digest the caller claims.
fn store_artifact(inner: &mut Inner, repository: &str, artifact: &OciArtifact) -> String {
    for child in &artifact.children {
        store_artifact(inner, repository, child);
    }
    for blob in &artifact.blobs {
        inner.blobs.insert(blob.digest.clone(), blob.clone());
    }
    let digest = artifact.manifest.digest();
    inner
        .repositories
        .entry(repository.to_string())
        .or_default()
        .manifests
        .insert(digest.clone(), artifact.manifest.clone());
    digest
}

#[async_trait]
impl ImageSource for MemoryRegistry {
    async fn fetch_image(&self, reference: &ArtifactReference) -> Result<OciArtifact> {
        let artifact = self.load(&reference.repository, &reference.digest)?;
        artifact.verify(&reference.url(), &reference.digest)?;
        Ok(artifact)
    }
}

#[async_trait]
impl ImageDestination for MemoryRegistry {
    async fn exists(&self, reference: &ArtifactReference) -> Result<bool> {
        Ok(self.contains(&reference.repository, &reference.digest))
    }

    async fn write_image(
        &self,
        target: &ArtifactReference,
        tag: Option<&str>,
        artifact: &OciArtifact,
    ) -> Result<String> {
        let stored = self.insert(&target.repository, tag, artifact);
        Ok(stored.digest)
    }

    async fn tagged_digest(&self, repository: &str, tag: &str) -> Result<Option<String>> {
        Ok(self.tagged(repository, tag))
    }

    async fn write_tag(&self, target: &ArtifactReference, tag: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let repository = inner
            .repositories
            .get_mut(&target.repository)
            .filter(|r| r.manifests.contains_key(&target.digest))
            .ok_or_else(|| ImgpkgError::NotFound {
                reference: target.url(),
                message: "manifest unknown".to_string(),
            })?;
        repository.tags.insert(tag.to_string(), target.digest.clone());
        Ok(())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn resolve_digest(&self, reference: &ImageReference) -> Result<String> {
        let repository = reference.context();
        let digest = match reference.digest {
            Some(ref digest) => self.contains(&repository, digest).then(|| digest.clone()),
            None => self.tagged(&repository, reference.effective_tag()),
        };
        digest.ok_or_else(|| ImgpkgError::NotFound {
            reference: reference.to_string(),
            message: "manifest unknown".to_string(),
        })
    }

    async fn fetch_manifest(&self, reference: &ArtifactReference) -> Result<Manifest> {
        self.manifest(&reference.repository, &reference.digest)
            .ok_or_else(|| ImgpkgError::NotFound {
                reference: reference.url(),
                message: "manifest unknown".to_string(),
            })
    }

    async fn fetch_blob(&self, reference: &ArtifactReference, digest: &str) -> Result<Vec<u8>> {
        if !self.contains(&reference.repository, &reference.digest) {
            return Err(ImgpkgError::NotFound {
                reference: reference.url(),
                message: "manifest unknown".to_string(),
            });
        }
        self.blob(digest)
            .map(|blob| blob.data)
            .ok_or_else(|| ImgpkgError::NotFound {
                reference: format!("{}@{}", reference.repository, digest),
                message: "blob unknown".to_string(),
            })
    }
}
