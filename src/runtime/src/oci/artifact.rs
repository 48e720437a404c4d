//! In-memory representation of OCI artifacts being copied.
//!
//! An [`OciArtifact`] is the opaque image handle moved between a source and a
//! destination: the raw manifest bytes (never re-serialized, so the digest
//! survives the copy), every blob the manifest references, and for an index
//! the child manifests.

use std::collections::HashMap;

use imgpkg_core::error::{ImgpkgError, Result};
use oci_spec::image::{ImageIndex, ImageManifest};
use sha2::{Digest, Sha256};

/// Manifest annotation marking an image as a bundle.
pub const BUNDLE_ANNOTATION: &str = "dev.carvel.imgpkg.bundle";

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Manifest media types accepted when fetching.
pub const ACCEPTED_MANIFEST_MEDIA_TYPES: &[&str] = &[
    OCI_MANIFEST_MEDIA_TYPE,
    OCI_INDEX_MEDIA_TYPE,
    DOCKER_MANIFEST_MEDIA_TYPE,
    DOCKER_MANIFEST_LIST_MEDIA_TYPE,
];

/// `sha256:<hex>` of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// A content-addressed blob (config or layer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub digest: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

impl Blob {
    /// Build a blob, computing its digest.
    pub fn new(media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            digest: sha256_digest(&data),
            media_type: media_type.into(),
            data,
        }
    }
}

/// Descriptor of something a manifest points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDescriptor {
    pub digest: String,
    pub media_type: String,
    pub size: i64,
}

/// Raw manifest bytes plus the media type they were served with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

impl Manifest {
    /// Wrap raw bytes, reading the media type from the document when present.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let media_type = match value.get("mediaType").and_then(|v| v.as_str()) {
            Some(media_type) => media_type.to_string(),
            None if value.get("manifests").is_some() => OCI_INDEX_MEDIA_TYPE.to_string(),
            None => OCI_MANIFEST_MEDIA_TYPE.to_string(),
        };
        Ok(Self { bytes, media_type })
    }

    pub fn digest(&self) -> String {
        sha256_digest(&self.bytes)
    }

    pub fn is_index(&self) -> bool {
        self.media_type == OCI_INDEX_MEDIA_TYPE || self.media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE
    }

    /// Manifest-level annotations (empty when absent).
    pub fn annotations(&self) -> Result<HashMap<String, String>> {
        let annotations = if self.is_index() {
            self.as_index()?.annotations().clone()
        } else {
            self.as_image()?.annotations().clone()
        };
        Ok(annotations.unwrap_or_default())
    }

    /// Whether the manifest carries the bundle marker annotation.
    pub fn is_bundle(&self) -> Result<bool> {
        if self.is_index() {
            return Ok(false);
        }
        Ok(self.annotations()?.contains_key(BUNDLE_ANNOTATION))
    }

    /// Config and layer descriptors of an image manifest, config first.
    pub fn blob_descriptors(&self) -> Result<Vec<ContentDescriptor>> {
        if self.is_index() {
            return Ok(Vec::new());
        }
        let manifest = self.as_image()?;
        let config = manifest.config();
        let mut descriptors = vec![ContentDescriptor {
            digest: config.digest().to_string(),
            media_type: config.media_type().to_string(),
            size: config.size(),
        }];
        descriptors.extend(manifest.layers().iter().map(|layer| ContentDescriptor {
            digest: layer.digest().to_string(),
            media_type: layer.media_type().to_string(),
            size: layer.size(),
        }));
        Ok(descriptors)
    }

    /// Layer descriptors only.
    pub fn layer_descriptors(&self) -> Result<Vec<ContentDescriptor>> {
        let mut descriptors = self.blob_descriptors()?;
        if !descriptors.is_empty() {
            descriptors.remove(0);
        }
        Ok(descriptors)
    }

    /// Child manifest descriptors of an index.
    pub fn child_descriptors(&self) -> Result<Vec<ContentDescriptor>> {
        if !self.is_index() {
            return Ok(Vec::new());
        }
        Ok(self
            .as_index()?
            .manifests()
            .iter()
            .map(|entry| ContentDescriptor {
                digest: entry.digest().to_string(),
                media_type: entry.media_type().to_string(),
                size: entry.size(),
            })
            .collect())
    }

    fn as_image(&self) -> Result<ImageManifest> {
        serde_json::from_slice(&self.bytes).map_err(|e| ImgpkgError::ManifestError {
            reference: self.digest(),
            message: format!("Failed to parse image manifest: {}", e),
        })
    }

    fn as_index(&self) -> Result<ImageIndex> {
        serde_json::from_slice(&self.bytes).map_err(|e| ImgpkgError::ManifestError {
            reference: self.digest(),
            message: format!("Failed to parse image index: {}", e),
        })
    }
}

/// A complete image or index, ready to be written somewhere else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciArtifact {
    /// Digest of `manifest.bytes`
    pub digest: String,
    pub manifest: Manifest,
    /// Config and layers (image) or nothing (index)
    pub blobs: Vec<Blob>,
    /// Child artifacts of an index, in manifest order
    pub children: Vec<OciArtifact>,
}

impl OciArtifact {
    /// Assemble an artifact, computing the digest from the manifest bytes.
    pub fn new(manifest: Manifest, blobs: Vec<Blob>, children: Vec<OciArtifact>) -> Self {
        Self {
            digest: manifest.digest(),
            manifest,
            blobs,
            children,
        }
    }

    pub fn media_type(&self) -> &str {
        &self.manifest.media_type
    }

    pub fn is_index(&self) -> bool {
        self.manifest.is_index()
    }

    /// Recompute every digest and compare with `expected` and with the
    /// digests the manifests declare.
    pub fn verify(&self, reference: &str, expected: &str) -> Result<()> {
        let actual = self.manifest.digest();
        if actual != expected {
            return Err(ImgpkgError::IntegrityError {
                reference: reference.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        for blob in &self.blobs {
            let actual = sha256_digest(&blob.data);
            if actual != blob.digest {
                return Err(ImgpkgError::IntegrityError {
                    reference: format!("{} (blob)", reference),
                    expected: blob.digest.clone(),
                    actual,
                });
            }
        }
        for child in &self.children {
            child.verify(reference, &child.digest)?;
        }
        Ok(())
    }
}
