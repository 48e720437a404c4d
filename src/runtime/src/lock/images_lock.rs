use std::collections::BTreeMap;
use std::path::Path;

use imgpkg_core::error::{ImgpkgError, Result};
use serde::{Deserialize, Serialize};

use super::{read_lock, validate_digest_ref, validate_header, write_lock, LOCK_API_VERSION};

pub const IMAGES_LOCK_KIND: &str = "ImagesLock";

/// Lock listing plain images by digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagesLock {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Digest-qualified image URL
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageRef {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            annotations: BTreeMap::new(),
        }
    }
}

impl ImagesLock {
    pub fn new(images: Vec<ImageRef>) -> Self {
        Self {
            api_version: LOCK_API_VERSION.to_string(),
            kind: IMAGES_LOCK_KIND.to_string(),
            images,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let lock: Self = serde_yaml::from_slice(data)
            .map_err(|e| ImgpkgError::Schema(format!("Unmarshaling images lock: {}", e)))?;
        lock.validate().map_err(|e| match e {
            ImgpkgError::Schema(message) => {
                ImgpkgError::Schema(format!("Validating images lock: {}", message))
            }
            other => other,
        })?;
        Ok(lock)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_bytes(&read_lock(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        validate_header(&self.api_version, &self.kind, IMAGES_LOCK_KIND)?;
        for image in &self.images {
            validate_digest_ref(&image.image)?;
        }
        Ok(())
    }

    /// Annotations recorded for `url`, if it is listed.
    pub fn annotations_for(&self, url: &str) -> Option<&BTreeMap<String, String>> {
        self.images
            .iter()
            .find(|image| image.image == url)
            .map(|image| &image.annotations)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        write_lock(path, &self.to_bytes()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DIGEST: &str = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_rejects_non_digest_image() {
        let yaml = "
apiVersion: imgpkg.example/v1alpha1
kind: ImagesLock
images:
- image: nginx:v1
";
        let err = ImagesLock::from_bytes(yaml.as_bytes()).unwrap_err();
        assert!(matches!(err, ImgpkgError::Schema(_)));
        assert!(err
            .to_string()
            .contains("Expected ref to be in digest form, got 'nginx:v1'"));
    }

    #[test]
    fn test_round_trip_with_annotations() {
        let yaml = format!(
            "apiVersion: imgpkg.example/v1alpha1
kind: ImagesLock
images:
- image: registry.example.com/repo-a@{digest}
  annotations:
    kbld.example/id: app
    owner: team-a
- image: registry.example.com/repo-b@{digest}
",
            digest = DIGEST
        );
        let lock = ImagesLock::from_bytes(yaml.as_bytes()).unwrap();
        assert_eq!(lock.images.len(), 2);
        assert_eq!(lock.images[0].annotations.get("owner").map(String::as_str), Some("team-a"));
        assert!(lock.images[1].annotations.is_empty());

        let original: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let reparsed: serde_yaml::Value = serde_yaml::from_slice(&lock.to_bytes().unwrap()).unwrap();
        assert_eq!(original, reparsed);
    }

    #[test]
    fn test_rejects_wrong_kind() {
        let yaml = "apiVersion: imgpkg.example/v1alpha1\nkind: BundleLock\n";
        let err = ImagesLock::from_bytes(yaml.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Unknown kind (known: ImagesLock)"));
    }

    #[test]
    fn test_empty_images_allowed() {
        let yaml = "apiVersion: imgpkg.example/v1alpha1\nkind: ImagesLock\n";
        let lock = ImagesLock::from_bytes(yaml.as_bytes()).unwrap();
        assert!(lock.images.is_empty());
    }

    #[test]
    fn test_annotations_for() {
        let url = format!("registry.example.com/repo-a@{}", DIGEST);
        let mut image = ImageRef::new(url.clone());
        image.annotations.insert("owner".to_string(), "team-a".to_string());
        let lock = ImagesLock::new(vec![image]);

        assert_eq!(lock.annotations_for(&url).map(|a| a.len()), Some(1));
        assert!(lock.annotations_for("registry.example.com/other@x").is_none());
    }

    #[test]
    fn test_write_to_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("images.yml");
        let lock = ImagesLock::new(vec![ImageRef::new(format!("ghcr.io/org/app@{}", DIGEST))]);

        lock.write_to_path(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("kind: ImagesLock"));
        assert_eq!(ImagesLock::from_path(&path).unwrap(), lock);
    }
}
