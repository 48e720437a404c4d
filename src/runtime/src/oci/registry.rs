//! Registry boundary and the network client behind it.
//!
//! The copy engine only sees the [`ImageSource`], [`ImageDestination`] and
//! [`Registry`] traits. [`OciRegistry`] implements them on top of the
//! `oci-distribution` crate; in-memory and archive-backed implementations
//! live next to it.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use imgpkg_core::config::RegistryConfig;
use imgpkg_core::error::{ImgpkgError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};

use super::artifact::{Blob, Manifest, OciArtifact, ACCEPTED_MANIFEST_MEDIA_TYPES};
use super::reference::{ArtifactReference, ImageReference};

/// Where artifacts are read from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Fetch a complete artifact (manifest, blobs and index children).
    async fn fetch_image(&self, reference: &ArtifactReference) -> Result<OciArtifact>;
}

/// Where artifacts are written to.
#[async_trait]
pub trait ImageDestination: Send + Sync {
    /// Whether the digest is already present in the reference's repository.
    async fn exists(&self, reference: &ArtifactReference) -> Result<bool>;

    /// Write `artifact` under `target.repository`, optionally tagging it.
    /// Returns the digest the destination stored.
    async fn write_image(
        &self,
        target: &ArtifactReference,
        tag: Option<&str>,
        artifact: &OciArtifact,
    ) -> Result<String>;

    /// Digest `repository:tag` currently points at, if the tag exists.
    async fn tagged_digest(&self, repository: &str, tag: &str) -> Result<Option<String>>;

    /// Point `tag` at a manifest that is already present at `target`.
    async fn write_tag(&self, target: &ArtifactReference, tag: &str) -> Result<()>;
}

/// Full registry access: lookup plus read and write.
#[async_trait]
pub trait Registry: ImageSource + ImageDestination {
    /// Resolve a (possibly tag-only) reference to its manifest digest.
    async fn resolve_digest(&self, reference: &ImageReference) -> Result<String>;

    /// Fetch only the manifest.
    async fn fetch_manifest(&self, reference: &ArtifactReference) -> Result<Manifest>;

    /// Fetch one blob from the reference's repository.
    async fn fetch_blob(&self, reference: &ArtifactReference, digest: &str) -> Result<Vec<u8>>;
}

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    /// Convert to oci-distribution auth type.
    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Registry client speaking the OCI distribution API.
pub struct OciRegistry {
    client: Client,
    auth: RegistryAuth,
}

impl OciRegistry {
    /// Create a client with anonymous authentication.
    pub fn new(config: &RegistryConfig) -> Self {
        Self::with_auth(config, RegistryAuth::anonymous())
    }

    /// Create a client with the given authentication.
    pub fn with_auth(config: &RegistryConfig, auth: RegistryAuth) -> Self {
        let protocol = if config.plain_http {
            ClientProtocol::Http
        } else if config.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(config.insecure_registries.clone())
        };
        let client = Client::new(ClientConfig {
            protocol,
            ..Default::default()
        });
        Self { client, auth }
    }

    fn fetch_artifact<'a>(&'a self, reference: &'a ArtifactReference) -> BoxFuture<'a, Result<OciArtifact>> {
        async move {
            let manifest = self.fetch_manifest(reference).await?;
            let oci_ref = to_oci_reference(&reference.url())?;

            let mut blobs = Vec::new();
            for descriptor in manifest.blob_descriptors()? {
                tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "Pulling blob");
                let oci_descriptor = OciDescriptor {
                    media_type: descriptor.media_type.clone(),
                    digest: descriptor.digest.clone(),
                    size: descriptor.size,
                    ..Default::default()
                };
                let mut data: Vec<u8> = Vec::new();
                self.client
                    .pull_blob(&oci_ref, &oci_descriptor, &mut data)
                    .await
                    .map_err(|e| registry_error(reference, "Failed to pull blob", e))?;
                blobs.push(Blob {
                    digest: descriptor.digest,
                    media_type: descriptor.media_type,
                    data,
                });
            }

            let mut children = Vec::new();
            for descriptor in manifest.child_descriptors()? {
                let child = ArtifactReference::new(reference.repository.clone(), descriptor.digest);
                children.push(self.fetch_artifact(&child).await?);
            }

            let artifact = OciArtifact::new(manifest, blobs, children);
            artifact.verify(&reference.url(), &reference.digest)?;
            Ok(artifact)
        }
        .boxed()
    }

    fn write_artifact<'a>(
        &'a self,
        target: &'a ArtifactReference,
        artifact: &'a OciArtifact,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            // Children first so the index never points at missing manifests.
            for child in &artifact.children {
                let child_target = ArtifactReference::new(target.repository.clone(), child.digest.clone());
                self.write_artifact(&child_target, child).await?;
            }

            let oci_ref = to_oci_reference(&target.url())?;
            for blob in &artifact.blobs {
                self.client
                    .push_blob(&oci_ref, &blob.data, &blob.digest)
                    .await
                    .map_err(|e| registry_error(target, "Failed to push blob", e))?;
            }

            self.push_manifest(&oci_ref, target, &artifact.manifest).await
        }
        .boxed()
    }

    async fn push_manifest(
        &self,
        oci_ref: &Reference,
        target: &ArtifactReference,
        manifest: &Manifest,
    ) -> Result<()> {
        // Header type comes from the client's own http dependency.
        let content_type = manifest.media_type.parse().map_err(|e| ImgpkgError::ManifestError {
            reference: target.url(),
            message: format!("Invalid media type '{}': {}", manifest.media_type, e),
        })?;
        self.client
            .push_manifest_raw(oci_ref, manifest.bytes.clone(), content_type)
            .await
            .map_err(|e| registry_error(target, "Failed to push manifest", e))?;
        Ok(())
    }
}

#[async_trait]
impl ImageSource for OciRegistry {
    async fn fetch_image(&self, reference: &ArtifactReference) -> Result<OciArtifact> {
        tracing::debug!(reference = %reference, "Fetching image");
        self.fetch_artifact(reference).await
    }
}

#[async_trait]
impl ImageDestination for OciRegistry {
    async fn exists(&self, reference: &ArtifactReference) -> Result<bool> {
        let oci_ref = to_oci_reference(&reference.url())?;
        match self
            .client
            .fetch_manifest_digest(&oci_ref, &self.auth.to_oci_auth())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(registry_error(reference, "Failed to check manifest", e)),
        }
    }

    async fn write_image(
        &self,
        target: &ArtifactReference,
        tag: Option<&str>,
        artifact: &OciArtifact,
    ) -> Result<String> {
        let oci_ref = to_oci_reference(&target.url())?;
        self.client
            .auth(&oci_ref, &self.auth.to_oci_auth(), RegistryOperation::Push)
            .await
            .map_err(|e| registry_error(target, "Failed to authenticate", e))?;

        self.write_artifact(target, artifact).await?;

        if let Some(tag) = tag {
            let tagged = to_oci_reference(&format!("{}:{}", target.repository, tag))?;
            self.push_manifest(&tagged, target, &artifact.manifest).await?;
        }

        let written = self
            .client
            .fetch_manifest_digest(&oci_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| registry_error(target, "Failed to confirm manifest", e))?;

        tracing::debug!(target = %target, digest = %written, "Image written");
        Ok(written)
    }

    async fn tagged_digest(&self, repository: &str, tag: &str) -> Result<Option<String>> {
        let tagged = format!("{}:{}", repository, tag);
        let oci_ref = to_oci_reference(&tagged)?;
        match self
            .client
            .fetch_manifest_digest(&oci_ref, &self.auth.to_oci_auth())
            .await
        {
            Ok(digest) => Ok(Some(digest)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(ImgpkgError::RegistryUnavailable {
                registry: oci_ref.registry().to_string(),
                message: format!("Failed to check tag {}: {}", tagged, e),
            }),
        }
    }

    async fn write_tag(&self, target: &ArtifactReference, tag: &str) -> Result<()> {
        let oci_ref = to_oci_reference(&target.url())?;
        self.client
            .auth(&oci_ref, &self.auth.to_oci_auth(), RegistryOperation::Push)
            .await
            .map_err(|e| registry_error(target, "Failed to authenticate", e))?;

        let manifest = self.fetch_manifest(target).await?;
        let tagged = to_oci_reference(&format!("{}:{}", target.repository, tag))?;
        self.push_manifest(&tagged, target, &manifest).await?;
        tracing::debug!(target = %target, tag, "Tag written");
        Ok(())
    }
}

#[async_trait]
impl Registry for OciRegistry {
    async fn resolve_digest(&self, reference: &ImageReference) -> Result<String> {
        if let Some(ref digest) = reference.digest {
            let artifact = reference.with_digest(digest.clone());
            if self.exists(&artifact).await? {
                return Ok(digest.clone());
            }
            return Err(ImgpkgError::NotFound {
                reference: reference.to_string(),
                message: "manifest unknown".to_string(),
            });
        }

        let tagged = format!("{}:{}", reference.context(), reference.effective_tag());
        let oci_ref = to_oci_reference(&tagged)?;
        self.client
            .fetch_manifest_digest(&oci_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| ImgpkgError::NotFound {
                reference: reference.to_string(),
                message: e.to_string(),
            })
    }

    async fn fetch_manifest(&self, reference: &ArtifactReference) -> Result<Manifest> {
        let oci_ref = to_oci_reference(&reference.url())?;
        let (bytes, _digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &self.auth.to_oci_auth(), ACCEPTED_MANIFEST_MEDIA_TYPES)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    ImgpkgError::NotFound {
                        reference: reference.url(),
                        message: e.to_string(),
                    }
                } else {
                    registry_error(reference, "Failed to pull manifest", e)
                }
            })?;
        Manifest::from_bytes(bytes)
    }

    async fn fetch_blob(&self, reference: &ArtifactReference, digest: &str) -> Result<Vec<u8>> {
        let manifest = self.fetch_manifest(reference).await?;
        let descriptor = manifest
            .blob_descriptors()?
            .into_iter()
            .find(|d| d.digest == digest)
            .ok_or_else(|| ImgpkgError::NotFound {
                reference: format!("{}@{}", reference.repository, digest),
                message: "blob is not referenced by the manifest".to_string(),
            })?;

        let oci_ref = to_oci_reference(&reference.url())?;
        let oci_descriptor = OciDescriptor {
            media_type: descriptor.media_type,
            digest: descriptor.digest,
            size: descriptor.size,
            ..Default::default()
        };
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&oci_ref, &oci_descriptor, &mut data)
            .await
            .map_err(|e| registry_error(reference, "Failed to pull blob", e))?;
        Ok(data)
    }
}

fn to_oci_reference(reference: &str) -> Result<Reference> {
    reference.parse::<Reference>().map_err(|e| ImgpkgError::ReferenceParse {
        reference: reference.to_string(),
        message: e.to_string(),
    })
}

fn is_not_found(error: &OciDistributionError) -> bool {
    match error {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::ServerError { code, .. } => *code == 404,
        OciDistributionError::RegistryError { envelope, .. } => envelope.errors.iter().any(|e| {
            matches!(e.code, OciErrorCode::ManifestUnknown | OciErrorCode::NameUnknown)
        }),
        _ => false,
    }
}

fn registry_error(
    reference: &ArtifactReference,
    context: &str,
    error: OciDistributionError,
) -> ImgpkgError {
    ImgpkgError::RegistryUnavailable {
        registry: reference.registry().to_string(),
        message: format!("{} {}: {}", context, reference.url(), error),
    }
}
