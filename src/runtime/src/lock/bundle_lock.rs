use std::path::Path;

use imgpkg_core::error::{ImgpkgError, Result};
use serde::{Deserialize, Serialize};

use super::{read_lock, validate_digest_ref, validate_header, write_lock, LOCK_API_VERSION};

pub const BUNDLE_LOCK_KIND: &str = "BundleLock";

/// Lock pinning a single bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleLock {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub bundle: BundleRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    /// Digest-qualified bundle URL
    pub image: String,
    /// Tag the bundle was originally referenced by
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl BundleLock {
    pub fn new(image: impl Into<String>, tag: Option<String>) -> Self {
        Self {
            api_version: LOCK_API_VERSION.to_string(),
            kind: BUNDLE_LOCK_KIND.to_string(),
            bundle: BundleRef {
                image: image.into(),
                tag: tag.filter(|t| !t.is_empty()),
            },
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let lock: Self = serde_yaml::from_slice(data)
            .map_err(|e| ImgpkgError::Schema(format!("Unmarshaling bundle lock: {}", e)))?;
        lock.validate()
            .map_err(|e| ImgpkgError::Schema(format!("Validating bundle lock: {}", schema_message(e))))?;
        Ok(lock)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_bytes(&read_lock(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        validate_header(&self.api_version, &self.kind, BUNDLE_LOCK_KIND)?;
        validate_digest_ref(&self.bundle.image)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        write_lock(path, &self.to_bytes()?)
    }
}

fn schema_message(error: ImgpkgError) -> String {
    match error {
        ImgpkgError::Schema(message) => message,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DIGEST: &str = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    fn bundle_url() -> String {
        format!("registry.example.com/repo-c@{}", DIGEST)
    }

    #[test]
    fn test_new_fills_header() {
        let lock = BundleLock::new(bundle_url(), Some("v1".to_string()));
        assert_eq!(lock.api_version, LOCK_API_VERSION);
        assert_eq!(lock.kind, "BundleLock");
        lock.validate().unwrap();
    }

    #[test]
    fn test_empty_tag_is_dropped() {
        let lock = BundleLock::new(bundle_url(), Some(String::new()));
        assert_eq!(lock.bundle.tag, None);
        let yaml = String::from_utf8(lock.to_bytes().unwrap()).unwrap();
        assert!(!yaml.contains("tag"));
    }

    #[test]
    fn test_round_trip_preserves_document() {
        let yaml = format!(
            "apiVersion: imgpkg.example/v1alpha1\nkind: BundleLock\nbundle:\n  image: {}\n  tag: v1.2.0\n",
            bundle_url()
        );
        let lock = BundleLock::from_bytes(yaml.as_bytes()).unwrap();
        let written = lock.to_bytes().unwrap();

        let original: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let reparsed: serde_yaml::Value = serde_yaml::from_slice(&written).unwrap();
        assert_eq!(original, reparsed);
    }

    #[test]
    fn test_rejects_tag_reference() {
        let yaml = "apiVersion: imgpkg.example/v1alpha1\nkind: BundleLock\nbundle:\n  image: nginx:v1\n";
        let err = BundleLock::from_bytes(yaml.as_bytes()).unwrap_err();
        assert!(matches!(err, ImgpkgError::Schema(_)));
        assert!(err
            .to_string()
            .contains("Expected ref to be in digest form, got 'nginx:v1'"));
    }

    #[test]
    fn test_rejects_unknown_api_version() {
        let yaml = format!("apiVersion: v2\nkind: BundleLock\nbundle:\n  image: {}\n", bundle_url());
        let err = BundleLock::from_bytes(yaml.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Unknown version"));
    }

    #[test]
    fn test_rejects_missing_bundle() {
        let yaml = "apiVersion: imgpkg.example/v1alpha1\nkind: BundleLock\n";
        let err = BundleLock::from_bytes(yaml.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Unmarshaling bundle lock"));
    }

    #[test]
    fn test_write_and_read_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bundle.lock.yml");

        let lock = BundleLock::new(bundle_url(), None);
        lock.write_to_path(&path).unwrap();

        assert_eq!(BundleLock::from_path(&path).unwrap(), lock);
    }
}
