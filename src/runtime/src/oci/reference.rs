//! OCI image reference parsing.
//!
//! Parses references like `ghcr.io/org/app:v1.0@sha256:...` into structured
//! components, and defines the digest-qualified [`ArtifactReference`] every
//! copy operation works with.

use std::fmt;

use imgpkg_core::error::{ImgpkgError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used to resolve a reference that names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/app")
    pub repository: String,
    /// Tag, only when written explicitly (e.g., "v0.1.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `myuser/myimage` → docker.io/myuser/myimage
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    /// - `localhost:5000/image:tag@sha256:abc...`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(parse_error(reference, "empty reference"));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest = &reference[at_pos + 1..];
                validate_digest(digest).map_err(|message| parse_error(reference, &message))?;
                (&reference[..at_pos], Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to a registry port.
        let (name, tag) = match name_tag.rfind(':') {
            Some(colon_pos) if !name_tag[colon_pos + 1..].contains('/') => (
                &name_tag[..colon_pos],
                Some(name_tag[colon_pos + 1..].to_string()),
            ),
            _ => (name_tag, None),
        };

        if let Some(ref tag) = tag {
            validate_tag(tag).map_err(|message| parse_error(reference, &message))?;
        }

        let (registry, repository) = Self::split_registry_repository(name)
            .map_err(|message| parse_error(reference, &message))?;

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Parse a reference that must be digest-qualified (`repo@algorithm:hex`).
    pub fn parse_digest(reference: &str) -> Result<Self> {
        let parsed = Self::parse(reference)?;
        if parsed.digest.is_none() {
            return Err(parse_error(reference, "expected ref to be in digest form"));
        }
        Ok(parsed)
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> std::result::Result<(String, String), String> {
        // The first component is a registry hostname if it contains a dot
        // or colon, or is "localhost"
        let (registry, repository) = match name.find('/') {
            Some(slash_pos)
                if {
                    let first = &name[..slash_pos];
                    first.contains('.') || first.contains(':') || first == "localhost"
                } =>
            {
                (name[..slash_pos].to_string(), name[slash_pos + 1..].to_string())
            }
            // Single name like "nginx" → "library/nginx" for Docker Hub
            _ if !name.contains('/') => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        validate_registry(&registry)?;
        validate_repository(&repository)?;
        Ok((registry, repository))
    }

    /// Repository including its registry (e.g., "ghcr.io/org/app").
    pub fn context(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The tag to resolve when no digest is present.
    pub fn effective_tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// Pin this reference to `digest`, keeping an explicit tag.
    pub fn with_digest(&self, digest: impl Into<String>) -> ArtifactReference {
        ArtifactReference {
            repository: self.context(),
            digest: digest.into(),
            tag: self.tag.clone(),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.context();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Resolved, digest-qualified artifact reference.
///
/// Two references name the same artifact iff their digests are equal,
/// whatever their repository or tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactReference {
    /// Repository including registry (e.g., "ghcr.io/org/app")
    pub repository: String,
    /// Content digest (e.g., "sha256:abc123...")
    pub digest: String,
    /// Tag carried alongside the digest, if any
    pub tag: Option<String>,
}

impl ArtifactReference {
    pub fn new(repository: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            digest: digest.into(),
            tag: None,
        }
    }

    /// Parse a digest-qualified URL (`repo@sha256:...`).
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = ImageReference::parse_digest(url)?;
        let digest = parsed.digest.clone().unwrap_or_default();
        Ok(parsed.with_digest(digest))
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    /// Same digest in another repository.
    pub fn with_repository(&self, repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            digest: self.digest.clone(),
            tag: self.tag.clone(),
        }
    }

    /// `repository@digest`
    pub fn url(&self) -> String {
        format!("{}@{}", self.repository, self.digest)
    }

    /// Registry host part of the repository.
    pub fn registry(&self) -> &str {
        self.repository
            .split_once('/')
            .map(|(registry, _)| registry)
            .unwrap_or(DEFAULT_REGISTRY)
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository, self.digest)
    }
}

/// Kind of artifact a reference points at, decided once at resolve time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Plain single-platform image
    Image,
    /// Image index / manifest list
    Index,
    /// Image annotated as a bundle
    Bundle,
}

impl ArtifactKind {
    pub fn is_bundle(&self) -> bool {
        matches!(self, ArtifactKind::Bundle)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactKind::Image => "image",
            ArtifactKind::Index => "index",
            ArtifactKind::Bundle => "bundle",
        };
        f.write_str(name)
    }
}

/// Move a digest-qualified URL into `repository`, keeping its digest.
pub fn with_repository(url: &str, repository: &str) -> Result<String> {
    let parts: Vec<&str> = url.split('@').collect();
    if parts.len() != 2 {
        return Err(parse_error(url, "parsing image URL: expected exactly one '@'"));
    }
    Ok(format!("{}@{}", repository, parts[1]))
}

/// Check an `algorithm:hex` digest string.
pub fn validate_digest(digest: &str) -> std::result::Result<(), String> {
    let (algorithm, hex) = digest
        .split_once(':')
        .ok_or_else(|| format!("invalid digest '{}': expected algorithm:hex", digest))?;

    let expected_len = match algorithm {
        "sha256" => 64,
        "sha512" => 128,
        other => return Err(format!("unsupported digest algorithm '{}'", other)),
    };

    if hex.len() != expected_len
        || !hex
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(format!(
            "invalid digest '{}': expected {} lowercase hex characters",
            digest, expected_len
        ));
    }
    Ok(())
}

fn validate_tag(tag: &str) -> std::result::Result<(), String> {
    let mut chars = tag.chars();
    let valid_first = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphanumeric() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid_first || !valid_rest || tag.len() > 128 {
        return Err(format!("invalid tag '{}'", tag));
    }
    Ok(())
}

fn validate_registry(registry: &str) -> std::result::Result<(), String> {
    if registry.is_empty()
        || !registry
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
    {
        return Err(format!("invalid registry '{}'", registry));
    }
    Ok(())
}

fn validate_repository(repository: &str) -> std::result::Result<(), String> {
    if repository.is_empty() {
        return Err("empty repository".to_string());
    }
    for component in repository.split('/') {
        let valid = !component.is_empty()
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
            && component.starts_with(|c: char| c.is_ascii_alphanumeric())
            && component.ends_with(|c: char| c.is_ascii_alphanumeric());
        if !valid {
            return Err(format!("invalid repository component '{}'", component));
        }
    }
    Ok(())
}

fn parse_error(reference: &str, message: &str) -> ImgpkgError {
    ImgpkgError::ReferenceParse {
        reference: reference.to_string(),
        message: message.to_string(),
    }
}
