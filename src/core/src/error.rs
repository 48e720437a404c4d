use std::fmt;

use thiserror::Error;

/// imgpkg error types
#[derive(Error, Debug)]
pub enum ImgpkgError {
    /// Reference string is not a valid repository[:tag][@digest]
    #[error("Invalid reference '{reference}': {message}")]
    ReferenceParse { reference: String, message: String },

    /// Registry lookup miss
    #[error("Not found: {reference} - {message}")]
    NotFound { reference: String, message: String },

    /// Bundle given where a plain image was expected, or the other way round
    #[error("{message} (hint: {hint})")]
    WrongArtifactKind { message: String, hint: String },

    /// Lock file failed structural validation
    #[error("Schema error: {0}")]
    Schema(String),

    /// Lock file is neither a valid BundleLock nor a valid ImagesLock
    #[error(
        "Trying to read bundle or images lock file: as BundleLock: {bundle_error}; as ImagesLock: {images_error}"
    )]
    AmbiguousLock {
        bundle_error: Box<ImgpkgError>,
        images_error: Box<ImgpkgError>,
    },

    /// Bundle does not carry an embedded images lock
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Manifest could not be read or parsed
    #[error("Manifest error: {reference} - {message}")]
    ManifestError { reference: String, message: String },

    /// Copied artifact digest differs from the source digest
    #[error("Integrity error: {reference} expected digest {expected}, got {actual}")]
    IntegrityError {
        reference: String,
        expected: String,
        actual: String,
    },

    /// Registry could not be reached or refused the operation
    #[error("Registry error: {registry} - {message}")]
    RegistryUnavailable { registry: String, message: String },

    /// One or more images failed to relocate
    #[error("{0}")]
    Relocation(RelocationFailures),

    /// Archive could not be read or written
    #[error("Archive error: {0}")]
    ArchiveError(String),

    /// Operation was cancelled before all work was dispatched
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ImgpkgError {
    /// Whether this error (or any error it aggregates) is a digest mismatch.
    pub fn is_integrity_error(&self) -> bool {
        match self {
            ImgpkgError::IntegrityError { .. } => true,
            ImgpkgError::Relocation(failures) => {
                failures.iter().any(|f| f.error.is_integrity_error())
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ImgpkgError {
    fn from(err: serde_json::Error) -> Self {
        ImgpkgError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ImgpkgError {
    fn from(err: serde_yaml::Error) -> Self {
        ImgpkgError::SerializationError(err.to_string())
    }
}

/// A single image that could not be processed.
#[derive(Debug)]
pub struct ImageFailure {
    /// Source URL of the image
    pub url: String,
    /// Why it failed
    pub error: ImgpkgError,
}

/// Aggregate of per-image failures, in input order.
#[derive(Debug, Default)]
pub struct RelocationFailures {
    failures: Vec<ImageFailure>,
}

impl RelocationFailures {
    pub fn new(failures: Vec<ImageFailure>) -> Self {
        Self { failures }
    }

    pub fn push(&mut self, url: impl Into<String>, error: ImgpkgError) {
        self.failures.push(ImageFailure {
            url: url.into(),
            error,
        });
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageFailure> {
        self.failures.iter()
    }

    /// URLs of the failing images.
    pub fn urls(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.url.as_str()).collect()
    }

    pub fn into_inner(self) -> Vec<ImageFailure> {
        self.failures
    }
}

impl fmt::Display for RelocationFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} image(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  - {}: {}", failure.url, failure.error)?;
        }
        Ok(())
    }
}

/// Result type alias for imgpkg operations
pub type Result<T> = std::result::Result<T, ImgpkgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_parse_error_display() {
        let error = ImgpkgError::ReferenceParse {
            reference: "Bad Ref".to_string(),
            message: "uppercase characters are not allowed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid reference 'Bad Ref': uppercase characters are not allowed"
        );
    }

    #[test]
    fn test_wrong_artifact_kind_display_includes_hint() {
        let error = ImgpkgError::WrongArtifactKind {
            message: "Expected bundle image but found plain image".to_string(),
            hint: "Did you use -i instead of -b?".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Expected bundle image but found plain image (hint: Did you use -i instead of -b?)"
        );
    }

    #[test]
    fn test_schema_error_display() {
        let error = ImgpkgError::Schema("Unknown kind".to_string());
        assert_eq!(error.to_string(), "Schema error: Unknown kind");
    }

    #[test]
    fn test_ambiguous_lock_carries_both_errors() {
        let error = ImgpkgError::AmbiguousLock {
            bundle_error: Box::new(ImgpkgError::Schema("bad bundle".to_string())),
            images_error: Box::new(ImgpkgError::Schema("bad images".to_string())),
        };
        let message = error.to_string();
        assert!(message.contains("bad bundle"));
        assert!(message.contains("bad images"));
    }

    #[test]
    fn test_integrity_error_display() {
        let error = ImgpkgError::IntegrityError {
            reference: "registry.io/app".to_string(),
            expected: "sha256:aa".to_string(),
            actual: "sha256:bb".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Integrity error: registry.io/app expected digest sha256:aa, got sha256:bb"
        );
        assert!(error.is_integrity_error());
    }

    #[test]
    fn test_registry_unavailable_display() {
        let error = ImgpkgError::RegistryUnavailable {
            registry: "ghcr.io".to_string(),
            message: "connection refused".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: ghcr.io - connection refused"
        );
    }

    #[test]
    fn test_relocation_failures_lists_every_url() {
        let mut failures = RelocationFailures::default();
        failures.push("repo/a@sha256:01", ImgpkgError::Other("boom".to_string()));
        failures.push(
            "repo/b@sha256:02",
            ImgpkgError::IntegrityError {
                reference: "dst/b".to_string(),
                expected: "sha256:02".to_string(),
                actual: "sha256:03".to_string(),
            },
        );

        let error = ImgpkgError::Relocation(failures);
        let message = error.to_string();
        assert!(message.starts_with("2 image(s) failed:"));
        assert!(message.contains("repo/a@sha256:01: boom"));
        assert!(message.contains("repo/b@sha256:02: Integrity error"));
        assert!(error.is_integrity_error());
    }

    #[test]
    fn test_relocation_failures_urls() {
        let failures = RelocationFailures::new(vec![ImageFailure {
            url: "repo/a@sha256:01".to_string(),
            error: ImgpkgError::Cancelled,
        }]);
        assert_eq!(failures.urls(), vec!["repo/a@sha256:01"]);
        assert_eq!(failures.len(), 1);
        assert!(!failures.is_empty());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: ImgpkgError = io_error.into();
        assert!(matches!(error, ImgpkgError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let error: ImgpkgError = result.unwrap_err().into();
        assert!(matches!(error, ImgpkgError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: ImgpkgError = result.unwrap_err().into();
        assert!(matches!(error, ImgpkgError::SerializationError(_)));
    }

    #[test]
    fn test_cancelled_is_not_integrity_error() {
        assert!(!ImgpkgError::Cancelled.is_integrity_error());
    }
}
