//! Local tar archives standing in for a registry.
//!
//! Layout of an archive:
//!
//! ```text
//! images.tar
//! ├── index.json            (top-level artifacts: digest, media type, repository, tag)
//! └── blobs/
//!     └── sha256/
//!         └── <hex>         (manifests, configs and layers, one file per digest)
//! ```
//!
//! The whole archive is loaded into a [`MemoryRegistry`], so reading from
//! or writing to an archive goes through the same `ImageSource` /
//! `ImageDestination` traits as a remote registry.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use imgpkg_core::error::{ImgpkgError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder, Header};

use crate::images::{UnprocessedImageUrl, UnprocessedImageUrls};
use crate::oci::{
    sha256_digest, ArtifactReference, Blob, ImageDestination, ImageSource, Manifest, MemoryRegistry,
    OciArtifact,
};

const INDEX_FILE: &str = "index.json";
const INDEX_SCHEMA_VERSION: u32 = 1;

/// One top-level artifact recorded in `index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub digest: String,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Repository the artifact came from
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl ArchiveEntry {
    pub fn reference(&self) -> ArtifactReference {
        ArtifactReference::new(self.repository.clone(), self.digest.clone()).with_tag(self.tag.clone())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveIndex {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    entries: Vec<ArchiveEntry>,
}

/// An image archive held in memory. Cloning shares the contents.
#[derive(Clone, Default)]
pub struct ImageArchive {
    store: MemoryRegistry,
    entries: Arc<RwLock<Vec<ArchiveEntry>>>,
}

impl ImageArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an archive from disk, checking every blob against its digest.
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            ImgpkgError::ArchiveError(format!("Failed to open archive {}: {}", path.display(), e))
        })?;
        let mut archive = Archive::new(file);

        let mut index: Option<ArchiveIndex> = None;
        let mut contents: HashMap<String, Vec<u8>> = HashMap::new();

        let entries = archive
            .entries()
            .map_err(|e| ImgpkgError::ArchiveError(format!("Failed to read archive: {}", e)))?;
        for entry in entries {
            let mut entry =
                entry.map_err(|e| ImgpkgError::ArchiveError(format!("Failed to read archive: {}", e)))?;
            let entry_path = entry
                .path()
                .map_err(|e| ImgpkgError::ArchiveError(format!("Invalid path in archive: {}", e)))?
                .to_string_lossy()
                .into_owned();
            let entry_path = entry_path.trim_start_matches("./").to_string();

            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;

            if entry_path == INDEX_FILE {
                index = Some(serde_json::from_slice(&data)?);
            } else if let Some(digest) = digest_from_blob_path(&entry_path) {
                contents.insert(digest, data);
            }
        }

        let index = index.ok_or_else(|| {
            ImgpkgError::ArchiveError(format!("Archive {} has no {}", path.display(), INDEX_FILE))
        })?;
        if index.schema_version != INDEX_SCHEMA_VERSION {
            return Err(ImgpkgError::ArchiveError(format!(
                "Unsupported archive index version {}",
                index.schema_version
            )));
        }

        let loaded = Self::new();
        for entry in &index.entries {
            load_manifest(&loaded.store, &contents, &entry.repository, &entry.digest)?;
            if let Some(ref tag) = entry.tag {
                loaded.store.tag(&entry.repository, tag, &entry.digest);
            }
        }
        *loaded.entries.write() = index.entries;

        tracing::debug!(path = %path.display(), images = loaded.len(), "Read image archive");
        Ok(loaded)
    }

    /// Write the archive to disk.
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| {
            ImgpkgError::ArchiveError(format!("Failed to create archive {}: {}", path.display(), e))
        })?;
        let mut builder = Builder::new(file);

        let index = ArchiveIndex {
            schema_version: INDEX_SCHEMA_VERSION,
            entries: self.entries(),
        };
        append_file(&mut builder, INDEX_FILE, &serde_json::to_vec_pretty(&index)?)?;

        let mut written: Vec<String> = Vec::new();
        for entry in self.store.entries() {
            if let Some(manifest) = self.store.manifest(&entry.repository, &entry.digest) {
                if !written.contains(&entry.digest) {
                    append_file(&mut builder, &blob_path(&entry.digest), &manifest.bytes)?;
                    written.push(entry.digest);
                }
            }
        }
        for digest in self.store.blob_digests() {
            if let Some(blob) = self.store.blob(&digest) {
                append_file(&mut builder, &blob_path(&digest), &blob.data)?;
            }
        }

        builder
            .finish()
            .map_err(|e| ImgpkgError::ArchiveError(format!("Failed to finish archive: {}", e)))?;

        tracing::debug!(path = %path.display(), images = self.len(), "Wrote image archive");
        Ok(())
    }

    /// Top-level artifacts, in the order they were added.
    pub fn entries(&self) -> Vec<ArchiveEntry> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// One copy request per top-level artifact.
    pub fn urls(&self) -> UnprocessedImageUrls {
        self.entries
            .read()
            .iter()
            .map(|entry| UnprocessedImageUrl::with_tag(entry.reference().url(), entry.tag.clone()))
            .collect()
    }

    /// Entries whose manifest carries the bundle annotation.
    pub fn bundles(&self) -> Result<Vec<ArchiveEntry>> {
        let mut bundles = Vec::new();
        for entry in self.entries() {
            if let Some(manifest) = self.store.manifest(&entry.repository, &entry.digest) {
                if manifest.is_bundle()? {
                    bundles.push(entry);
                }
            }
        }
        Ok(bundles)
    }

    /// Read side of the archive.
    pub fn as_source(&self) -> Arc<dyn ImageSource> {
        Arc::new(self.store.clone())
    }

    /// Write side of the archive; writes are recorded as top-level entries.
    pub fn as_destination(&self) -> Arc<dyn ImageDestination> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl ImageDestination for ImageArchive {
    async fn exists(&self, reference: &ArtifactReference) -> Result<bool> {
        self.store.exists(reference).await
    }

    async fn write_image(
        &self,
        target: &ArtifactReference,
        tag: Option<&str>,
        artifact: &OciArtifact,
    ) -> Result<String> {
        let digest = self.store.write_image(target, tag, artifact).await?;

        let mut entries = self.entries.write();
        let known = entries
            .iter()
            .any(|e| e.repository == target.repository && e.digest == digest);
        if !known {
            entries.push(ArchiveEntry {
                digest: digest.clone(),
                media_type: artifact.media_type().to_string(),
                repository: target.repository.clone(),
                tag: tag.map(str::to_string),
            });
        }
        Ok(digest)
    }

    async fn tagged_digest(&self, repository: &str, tag: &str) -> Result<Option<String>> {
        self.store.tagged_digest(repository, tag).await
    }

    async fn write_tag(&self, target: &ArtifactReference, tag: &str) -> Result<()> {
        self.store.write_tag(target, tag).await?;
        let mut entries = self.entries.write();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.repository == target.repository && e.digest == target.digest)
        {
            entry.tag = Some(tag.to_string());
        }
        Ok(())
    }
}

/// Load an archive from `path`.
pub fn read_archive(path: &Path) -> Result<ImageArchive> {
    ImageArchive::read(path)
}

/// Write `artifacts` (target reference and content) to a new archive at `path`.
pub async fn write_archive(path: &Path, artifacts: &[(ArtifactReference, OciArtifact)]) -> Result<()> {
    let archive = ImageArchive::new();
    for (target, artifact) in artifacts {
        archive
            .write_image(target, target.tag.as_deref(), artifact)
            .await?;
    }
    archive.write(path)
}

fn load_manifest(
    store: &MemoryRegistry,
    contents: &HashMap<String, Vec<u8>>,
    repository: &str,
    digest: &str,
) -> Result<()> {
    let manifest = Manifest::from_bytes(read_blob(contents, digest)?)?;

    for descriptor in manifest.blob_descriptors()? {
        let data = read_blob(contents, &descriptor.digest)?;
        store.put_blob(Blob {
            digest: descriptor.digest,
            media_type: descriptor.media_type,
            data,
        });
    }
    for child in manifest.child_descriptors()? {
        load_manifest(store, contents, repository, &child.digest)?;
    }

    store.put_manifest(repository, manifest);
    Ok(())
}

fn read_blob(contents: &HashMap<String, Vec<u8>>, digest: &str) -> Result<Vec<u8>> {
    let data = contents
        .get(digest)
        .ok_or_else(|| ImgpkgError::ArchiveError(format!("Archive is missing blob {}", digest)))?;
    if !digest.starts_with("sha256:") {
        return Err(ImgpkgError::ReferenceParse {
            reference: blob_path(digest),
            message: "unsupported digest algorithm".to_string(),
        });
    }
    let actual = sha256_digest(data);
    if actual != digest {
        return Err(ImgpkgError::IntegrityError {
            reference: blob_path(digest),
            expected: digest.to_string(),
            actual,
        });
    }
    Ok(data.clone())
}

fn blob_path(digest: &str) -> String {
    match digest.split_once(':') {
        Some((algorithm, hex)) => format!("blobs/{}/{}", algorithm, hex),
        None => format!("blobs/{}", digest),
    }
}

fn digest_from_blob_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix("blobs/")?;
    let (algorithm, hex) = rest.split_once('/')?;
    if hex.is_empty() || hex.contains('/') {
        return None;
    }
    Some(format!("{}:{}", algorithm, hex))
}

fn append_file<W: std::io::Write>(builder: &mut Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, data)
        .map_err(|e| ImgpkgError::ArchiveError(format!("Failed to add {} to archive: {}", path, e)))
}
