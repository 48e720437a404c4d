//! Copy requests and copy results.

use std::collections::HashMap;

use crate::oci::ArtifactReference;

/// A copy request not yet executed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnprocessedImageUrl {
    /// Digest-qualified source URL
    pub url: String,
    pub tag: Option<String>,
}

impl UnprocessedImageUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tag: None,
        }
    }

    pub fn with_tag(url: impl Into<String>, tag: Option<String>) -> Self {
        Self {
            url: url.into(),
            tag: tag.filter(|t| !t.is_empty()),
        }
    }
}

/// Insertion-ordered, URL-unique set of copy requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnprocessedImageUrls {
    urls: Vec<UnprocessedImageUrl>,
}

impl UnprocessedImageUrls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `url`, merging with an earlier entry for the same URL.
    /// A non-empty tag wins over a missing one.
    pub fn add(&mut self, url: UnprocessedImageUrl) {
        match self.urls.iter_mut().find(|existing| existing.url == url.url) {
            Some(existing) => {
                if existing.tag.is_none() {
                    existing.tag = url.tag;
                }
            }
            None => self.urls.push(url),
        }
    }

    pub fn all(&self) -> &[UnprocessedImageUrl] {
        &self.urls
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnprocessedImageUrl> {
        self.urls.iter()
    }
}

impl FromIterator<UnprocessedImageUrl> for UnprocessedImageUrls {
    fn from_iter<I: IntoIterator<Item = UnprocessedImageUrl>>(iter: I) -> Self {
        let mut urls = Self::new();
        for url in iter {
            urls.add(url);
        }
        urls
    }
}

impl IntoIterator for UnprocessedImageUrls {
    type Item = UnprocessedImageUrl;
    type IntoIter = std::vec::IntoIter<UnprocessedImageUrl>;

    fn into_iter(self) -> Self::IntoIter {
        self.urls.into_iter()
    }
}

/// One completed copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedImage {
    pub source: UnprocessedImageUrl,
    pub destination: ArtifactReference,
}

/// Insertion-ordered copy results, queryable by source URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedImageSet {
    images: Vec<ProcessedImage>,
    by_source: HashMap<String, usize>,
}

impl ProcessedImageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, image: ProcessedImage) {
        match self.by_source.get(&image.source.url) {
            Some(&idx) => self.images[idx] = image,
            None => {
                self.by_source.insert(image.source.url.clone(), self.images.len());
                self.images.push(image);
            }
        }
    }

    pub fn find_by_source(&self, url: &str) -> Option<&ProcessedImage> {
        self.by_source.get(url).map(|&idx| &self.images[idx])
    }

    pub fn all(&self) -> &[ProcessedImage] {
        &self.images
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessedImage> {
        self.images.iter()
    }
}
