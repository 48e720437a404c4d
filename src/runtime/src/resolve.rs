//! Turning user reference strings into digest-pinned, classified artifacts.

use imgpkg_core::error::{ImgpkgError, Result};

use crate::oci::{ArtifactKind, ArtifactReference, ImageReference, Registry};

const BUNDLE_FLAG_HINT: &str =
    "Expected image flag when given an image reference. Please run with -i instead of -b, or use -b with a bundle reference";
const IMAGE_FLAG_HINT: &str =
    "Expected bundle flag when copying a bundle, please use -b instead of -i";

/// A digest-qualified reference plus what it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub reference: ArtifactReference,
    pub kind: ArtifactKind,
}

impl ResolvedArtifact {
    pub fn url(&self) -> String {
        self.reference.url()
    }

    pub fn tag(&self) -> Option<&str> {
        self.reference.tag.as_deref()
    }
}

/// What the user said the input is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedKind {
    Bundle,
    Image,
}

/// Parse `reference`, pin it to a digest and classify it.
///
/// A tag-only reference is resolved against `registry`; an explicit tag is
/// kept on the result.
pub async fn resolve(reference: &str, registry: &dyn Registry) -> Result<ResolvedArtifact> {
    let parsed = ImageReference::parse(reference)?;

    let digest = match parsed.digest {
        Some(ref digest) => digest.clone(),
        None => registry.resolve_digest(&parsed).await?,
    };
    let artifact = parsed.with_digest(digest);
    let kind = classify(&artifact, registry).await?;

    tracing::debug!(reference = %reference, resolved = %artifact, kind = %kind, "Resolved reference");
    Ok(ResolvedArtifact {
        reference: artifact,
        kind,
    })
}

/// Whether the artifact's manifest carries the bundle annotation.
pub async fn is_bundle(reference: &ArtifactReference, registry: &dyn Registry) -> Result<bool> {
    Ok(classify(reference, registry).await?.is_bundle())
}

/// Reject a bundle given as an image and the other way round.
pub fn require_kind(resolved: &ResolvedArtifact, expected: ExpectedKind) -> Result<()> {
    match (expected, resolved.kind.is_bundle()) {
        (ExpectedKind::Bundle, false) => Err(ImgpkgError::WrongArtifactKind {
            message: format!("Expected bundle image but found plain image '{}'", resolved.url()),
            hint: BUNDLE_FLAG_HINT.to_string(),
        }),
        (ExpectedKind::Image, true) => Err(ImgpkgError::WrongArtifactKind {
            message: format!("Expected plain image but found bundle '{}'", resolved.url()),
            hint: IMAGE_FLAG_HINT.to_string(),
        }),
        _ => Ok(()),
    }
}

async fn classify(reference: &ArtifactReference, registry: &dyn Registry) -> Result<ArtifactKind> {
    let manifest = registry.fetch_manifest(reference).await.map_err(|e| match e {
        ImgpkgError::NotFound { .. } => e,
        other => ImgpkgError::ManifestError {
            reference: reference.url(),
            message: other.to_string(),
        },
    })?;

    if manifest.is_index() {
        return Ok(ArtifactKind::Index);
    }
    let is_bundle = manifest.is_bundle().map_err(|e| ImgpkgError::ManifestError {
        reference: reference.url(),
        message: e.to_string(),
    })?;
    Ok(if is_bundle {
        ArtifactKind::Bundle
    } else {
        ArtifactKind::Image
    })
}
