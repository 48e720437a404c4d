//! Lock documents pinning bundles and images to digests.
//!
//! Two kinds exist: a [`BundleLock`] naming one bundle, and an
//! [`ImagesLock`] listing plain images. Both are YAML with a shared
//! `apiVersion` and a `kind` discriminator. Validation is structural and
//! never touches a registry.

mod bundle_lock;
mod images_lock;

use std::path::Path;

use imgpkg_core::error::{ImgpkgError, Result};

pub use bundle_lock::{BundleLock, BundleRef, BUNDLE_LOCK_KIND};
pub use images_lock::{ImageRef, ImagesLock, IMAGES_LOCK_KIND};

/// `apiVersion` shared by both lock kinds.
pub const LOCK_API_VERSION: &str = "imgpkg.example/v1alpha1";

/// A lock file of either kind.
#[derive(Debug, Clone, PartialEq)]
pub enum LockFile {
    Bundle(BundleLock),
    Images(ImagesLock),
}

impl LockFile {
    /// Parse a lock of unknown kind: BundleLock first, then ImagesLock.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let bundle_error = match BundleLock::from_bytes(data) {
            Ok(lock) => return Ok(LockFile::Bundle(lock)),
            Err(e) => e,
        };
        let images_error = match ImagesLock::from_bytes(data) {
            Ok(lock) => return Ok(LockFile::Images(lock)),
            Err(e) => e,
        };
        Err(ImgpkgError::AmbiguousLock {
            bundle_error: Box::new(bundle_error),
            images_error: Box::new(images_error),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::parse(&read_lock(path)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            LockFile::Bundle(lock) => lock.to_bytes(),
            LockFile::Images(lock) => lock.to_bytes(),
        }
    }
}

fn read_lock(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| ImgpkgError::Schema(format!("Reading path {}: {}", path.display(), e)))
}

fn write_lock(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data)?;
    tracing::debug!(path = %path.display(), "Wrote lock file");
    Ok(())
}

fn validate_header(api_version: &str, kind: &str, expected_kind: &str) -> Result<()> {
    if api_version != LOCK_API_VERSION {
        return Err(ImgpkgError::Schema(format!(
            "Validating apiVersion: Unknown version (known: {})",
            LOCK_API_VERSION
        )));
    }
    if kind != expected_kind {
        return Err(ImgpkgError::Schema(format!(
            "Validating kind: Unknown kind (known: {})",
            expected_kind
        )));
    }
    Ok(())
}

/// Fails unless `image` is `<repo>@<digest>`.
fn validate_digest_ref(image: &str) -> Result<()> {
    crate::oci::ImageReference::parse_digest(image)
        .map(|_| ())
        .map_err(|_| ImgpkgError::Schema(format!("Expected ref to be in digest form, got '{}'", image)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_detects_bundle_lock() {
        let yaml = format!(
            "apiVersion: {}\nkind: BundleLock\nbundle:\n  image: registry.example.com/bundle@{}\n  tag: v1\n",
            LOCK_API_VERSION, DIGEST
        );
        match LockFile::parse(yaml.as_bytes()).unwrap() {
            LockFile::Bundle(lock) => assert_eq!(lock.bundle.tag.as_deref(), Some("v1")),
            other => panic!("expected bundle lock, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_detects_images_lock() {
        let yaml = format!(
            "apiVersion: {}\nkind: ImagesLock\nimages:\n- image: registry.example.com/app@{}\n",
            LOCK_API_VERSION, DIGEST
        );
        match LockFile::parse(yaml.as_bytes()).unwrap() {
            LockFile::Images(lock) => assert_eq!(lock.images.len(), 1),
            other => panic!("expected images lock, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_ambiguous_carries_both_errors() {
        let yaml = format!("apiVersion: {}\nkind: Something\n", LOCK_API_VERSION);
        let err = LockFile::parse(yaml.as_bytes()).unwrap_err();
        match err {
            ImgpkgError::AmbiguousLock {
                bundle_error,
                images_error,
            } => {
                assert!(matches!(*bundle_error, ImgpkgError::Schema(_)));
                assert!(images_error.to_string().contains("Unknown kind (known: ImagesLock)"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_path_missing_file() {
        let err = LockFile::from_path(Path::new("/nonexistent/lock.yml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/lock.yml"));
    }

    #[test]
    fn test_validate_digest_ref() {
        validate_digest_ref(&format!("registry.example.com/app@{}", DIGEST)).unwrap();
        let err = validate_digest_ref("nginx:v1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Schema error: Expected ref to be in digest form, got 'nginx:v1'"
        );
    }
}
