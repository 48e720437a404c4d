//! Digest-preserving copies with bounded concurrency.
//!
//! The unit of work for one image:
//!
//! 1. skip if the digest already exists at the target;
//! 2. fetch the artifact from its source repository and re-check its digest;
//! 3. write it unchanged (tag applied as an extra pointer);
//! 4. compare the digest the destination reports with the source digest.
//!
//! Units run on the [`WorkerPool`]; results are gathered by a single
//! collector into a [`ProcessedImageSet`] in input order. A failed unit
//! never stops the others, and nothing already written is rolled back.

use std::path::Path;
use std::sync::Arc;

use imgpkg_core::error::{ImgpkgError, RelocationFailures, Result};
use imgpkg_core::event::{events, EventEmitter, RelocationEvent};

use crate::archive::ImageArchive;
use crate::images::{ProcessedImage, ProcessedImageSet, UnprocessedImageUrl, UnprocessedImageUrls};
use crate::oci::{ArtifactReference, ImageDestination, ImageSource, ImageReference};
use crate::pool::{WorkOutcome, WorkerPool};

/// Where each image lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRepository {
    /// Every image goes into this repository.
    Repository(String),
    /// Each image keeps its source repository (archive export).
    SourceRepository,
}

impl TargetRepository {
    fn target_for(&self, source: &ArtifactReference) -> ArtifactReference {
        match self {
            TargetRepository::Repository(repository) => source.with_repository(repository.clone()),
            TargetRepository::SourceRepository => source.clone(),
        }
    }
}

/// Outcome of a relocation, kept even when some images failed.
#[derive(Debug, Default)]
pub struct RelocationReport {
    /// Images that were copied or already present, in input order
    pub processed: ProcessedImageSet,
    /// Images that failed, in input order
    pub failures: RelocationFailures,
    /// Some images were never dispatched because of a shutdown request
    pub cancelled: bool,
}

impl RelocationReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// Failures win over cancellation so every failing URL is reported.
    pub fn into_result(self) -> Result<ProcessedImageSet> {
        if !self.failures.is_empty() {
            return Err(ImgpkgError::Relocation(self.failures));
        }
        if self.cancelled {
            return Err(ImgpkgError::Cancelled);
        }
        Ok(self.processed)
    }
}

/// Copies sets of images between registries and archives.
pub struct RelocationEngine {
    pool: WorkerPool,
    events: EventEmitter,
}

impl RelocationEngine {
    pub fn new(pool: WorkerPool, events: EventEmitter) -> Self {
        Self { pool, events }
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Copy `urls` into `repository`, failing with an aggregate error if any image fails.
    pub async fn relocate<R>(
        &self,
        urls: &UnprocessedImageUrls,
        repository: &str,
        registry: Arc<R>,
    ) -> Result<ProcessedImageSet>
    where
        R: ImageSource + ImageDestination + ?Sized + 'static,
    {
        self.relocate_report(urls, repository, registry).await?.into_result()
    }

    /// Like [`relocate`](Self::relocate), but returns partial results.
    ///
    /// Errors returned directly (bad URLs, bad repository) abort before any copy.
    pub async fn relocate_report<R>(
        &self,
        urls: &UnprocessedImageUrls,
        repository: &str,
        registry: Arc<R>,
    ) -> Result<RelocationReport>
    where
        R: ImageSource + ImageDestination + ?Sized + 'static,
    {
        let repository = normalize_repository(repository)?;
        tracing::info!(images = urls.len(), repository = %repository, "Relocating images");
        self.copy_all(
            urls,
            Arc::clone(&registry),
            registry,
            TargetRepository::Repository(repository),
        )
        .await
    }

    /// Copy `urls` from `registry` into a new archive at `path`.
    ///
    /// The archive is only written when every image was copied.
    pub async fn export<S>(&self, urls: &UnprocessedImageUrls, path: &Path, registry: Arc<S>) -> Result<()>
    where
        S: ImageSource + ?Sized + 'static,
    {
        tracing::info!(images = urls.len(), path = %path.display(), "Exporting images");
        let archive = ImageArchive::new();
        let report = self
            .copy_all(
                urls,
                registry,
                Arc::new(archive.clone()),
                TargetRepository::SourceRepository,
            )
            .await?;
        report.into_result()?;
        archive.write(path)
    }

    /// Copy every artifact in the archive at `path` into `repository`.
    pub async fn import<D>(&self, path: &Path, repository: &str, destination: Arc<D>) -> Result<ProcessedImageSet>
    where
        D: ImageDestination + ?Sized + 'static,
    {
        let archive = ImageArchive::read(path)?;
        self.import_archive(&archive, repository, destination)
            .await?
            .into_result()
    }

    /// Copy every artifact of an already loaded archive into `repository`.
    pub async fn import_archive<D>(
        &self,
        archive: &ImageArchive,
        repository: &str,
        destination: Arc<D>,
    ) -> Result<RelocationReport>
    where
        D: ImageDestination + ?Sized + 'static,
    {
        let repository = normalize_repository(repository)?;
        tracing::info!(images = archive.len(), repository = %repository, "Importing images");
        self.copy_all(
            &archive.urls(),
            archive.as_source(),
            destination,
            TargetRepository::Repository(repository),
        )
        .await
    }

    /// Run the unit of work over every URL with explicit source and destination.
    pub async fn copy_all<S, D>(
        &self,
        urls: &UnprocessedImageUrls,
        source: Arc<S>,
        destination: Arc<D>,
        target: TargetRepository,
    ) -> Result<RelocationReport>
    where
        S: ImageSource + ?Sized + 'static,
        D: ImageDestination + ?Sized + 'static,
    {
        // Malformed URLs abort before any copy starts.
        let mut work = Vec::with_capacity(urls.len());
        for url in urls.iter() {
            let source_ref = ArtifactReference::parse(&url.url)?;
            let target_ref = target
                .target_for(&source_ref)
                .with_tag(url.tag.clone());
            work.push(CopyUnit {
                request: url.clone(),
                source_ref,
                target_ref,
            });
        }

        let events = self.events.clone();
        let outcomes = self
            .pool
            .run(work, move |unit| {
                let source = Arc::clone(&source);
                let destination = Arc::clone(&destination);
                let events = events.clone();
                async move { copy_one(unit, source.as_ref(), destination.as_ref(), &events).await }
            })
            .await;

        let mut report = RelocationReport::default();
        for (url, outcome) in urls.iter().zip(outcomes) {
            match outcome {
                WorkOutcome::Completed(Ok(processed)) => report.processed.add(processed),
                WorkOutcome::Completed(Err(e)) => {
                    tracing::warn!(url = %url.url, error = %e, "Image failed to copy");
                    self.events.emit(RelocationEvent::with_detail(
                        events::IMAGE_FAILED,
                        url.url.clone(),
                        e.to_string(),
                    ));
                    report.failures.push(url.url.clone(), e);
                }
                WorkOutcome::NotDispatched => report.cancelled = true,
            }
        }

        tracing::info!(
            processed = report.processed.len(),
            failed = report.failures.len(),
            cancelled = report.cancelled,
            "Relocation finished"
        );
        Ok(report)
    }
}

struct CopyUnit {
    request: UnprocessedImageUrl,
    source_ref: ArtifactReference,
    target_ref: ArtifactReference,
}

async fn copy_one<S, D>(
    unit: CopyUnit,
    source: &S,
    destination: &D,
    events: &EventEmitter,
) -> Result<ProcessedImage>
where
    S: ImageSource + ?Sized,
    D: ImageDestination + ?Sized,
{
    let CopyUnit {
        request,
        source_ref,
        target_ref,
    } = unit;
    let processed = ProcessedImage {
        source: request.clone(),
        destination: target_ref.clone(),
    };

    if destination.exists(&target_ref).await? {
        if let Some(tag) = request.tag.as_deref() {
            let current = destination.tagged_digest(&target_ref.repository, tag).await?;
            if current.as_deref() != Some(target_ref.digest.as_str()) {
                tracing::debug!(target = %target_ref, tag, "Image already present, tagging");
                destination.write_tag(&target_ref, tag).await?;
            }
        }
        tracing::debug!(source = %source_ref, target = %target_ref, "Image already present, skipping");
        events.emit(RelocationEvent::with_detail(
            events::IMAGE_SKIPPED,
            request.url,
            target_ref.url(),
        ));
        return Ok(processed);
    }

    tracing::info!(source = %source_ref, target = %target_ref, "Copying image");
    events.emit(RelocationEvent::with_detail(
        events::IMAGE_COPYING,
        request.url.clone(),
        target_ref.url(),
    ));

    let artifact = source.fetch_image(&source_ref).await?;
    artifact.verify(&source_ref.url(), &source_ref.digest)?;

    let written = destination
        .write_image(&target_ref, request.tag.as_deref(), &artifact)
        .await?;
    if written != source_ref.digest {
        return Err(ImgpkgError::IntegrityError {
            reference: target_ref.url(),
            expected: source_ref.digest,
            actual: written,
        });
    }

    tracing::info!(target = %target_ref, digest = %written, "Image copied");
    events.emit(RelocationEvent::with_detail(
        events::IMAGE_COPIED,
        request.url,
        target_ref.url(),
    ));
    Ok(processed)
}

/// Validate a destination repository and add registry defaults.
fn normalize_repository(repository: &str) -> Result<String> {
    let parsed = ImageReference::parse(repository)?;
    if parsed.tag.is_some() || parsed.digest.is_some() {
        return Err(ImgpkgError::ReferenceParse {
            reference: repository.to_string(),
            message: "expected a repository without tag or digest".to_string(),
        });
    }
    Ok(parsed.context())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::artifact::fixtures;
    use crate::oci::MemoryRegistry;
    use tempfile::TempDir;

    const SRC: &str = "registry.example.com/src";
    const DST: &str = "registry.example.com/dst";

    fn engine() -> RelocationEngine {
        RelocationEngine::new(WorkerPool::new(2), EventEmitter::default())
    }

    #[tokio::test]
    async fn test_relocate_preserves_digest_and_tag() {
        let registry = MemoryRegistry::new();
        let image = fixtures::image(b"app", &[]);
        let source = registry.insert(SRC, None, &image);
        let urls: UnprocessedImageUrls =
            vec![UnprocessedImageUrl::with_tag(source.url(), Some("v1".to_string()))]
                .into_iter()
                .collect();

        let registry = Arc::new(registry);
        let processed = engine()
            .relocate(&urls, DST, Arc::clone(&registry))
            .await
            .unwrap();

        let copied = processed.find_by_source(&source.url()).unwrap();
        assert_eq!(copied.destination.url(), format!("{}@{}", DST, image.digest));
        assert_eq!(copied.destination.tag.as_deref(), Some("v1"));
        assert_eq!(registry.tagged(DST, "v1"), Some(image.digest.clone()));
        assert!(registry.contains(DST, &image.digest));
    }

    #[tokio::test]
    async fn test_present_digest_is_skipped() {
        let registry = MemoryRegistry::new();
        let image = fixtures::image(b"app", &[]);
        let source = registry.insert(SRC, None, &image);
        registry.insert(DST, None, &image);

        let urls: UnprocessedImageUrls = vec![UnprocessedImageUrl::new(source.url())].into_iter().collect();
        let engine = engine();
        let mut rx = engine.events().subscribe();

        let processed = engine.relocate(&urls, DST, Arc::new(registry)).await.unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(rx.recv().await.unwrap().key, events::IMAGE_SKIPPED);
    }

    #[tokio::test]
    async fn test_present_digest_gains_requested_tag() {
        let registry = MemoryRegistry::new();
        let image = fixtures::image(b"app", &[]);
        let source = registry.insert(SRC, None, &image);
        registry.insert(DST, None, &image);
        let stale = fixtures::image(b"old", &[]);
        registry.insert(DST, Some("v1"), &stale);

        let urls: UnprocessedImageUrls =
            vec![UnprocessedImageUrl::with_tag(source.url(), Some("v1".to_string()))]
                .into_iter()
                .collect();
        let engine = engine();
        let mut rx = engine.events().subscribe();

        let registry = Arc::new(registry);
        engine.relocate(&urls, DST, Arc::clone(&registry)).await.unwrap();
        assert_eq!(registry.tagged(DST, "v1"), Some(image.digest.clone()));
        assert_eq!(rx.recv().await.unwrap().key, events::IMAGE_SKIPPED);
    }

    #[tokio::test]
    async fn test_missing_source_reported_in_aggregate() {
        let registry = MemoryRegistry::new();
        let image = fixtures::image(b"app", &[]);
        let present = registry.insert(SRC, None, &image);
        let missing = format!("{}@{}", SRC, crate::oci::sha256_digest(b"missing"));

        let urls: UnprocessedImageUrls = vec![
            UnprocessedImageUrl::new(missing.clone()),
            UnprocessedImageUrl::new(present.url()),
        ]
        .into_iter()
        .collect();

        let report = engine()
            .relocate_report(&urls, DST, Arc::new(registry))
            .await
            .unwrap();
        assert!(!report.is_success());
        assert_eq!(report.processed.len(), 1);
        assert_eq!(report.failures.urls(), vec![missing.as_str()]);

        match report.into_result().unwrap_err() {
            ImgpkgError::Relocation(failures) => assert_eq!(failures.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_tag_url_rejected_before_copy() {
        let registry = Arc::new(MemoryRegistry::new());
        let urls: UnprocessedImageUrls = vec![UnprocessedImageUrl::new(format!("{}:v1", SRC))]
            .into_iter()
            .collect();
        let err = engine().relocate(&urls, DST, registry).await.unwrap_err();
        assert!(matches!(err, ImgpkgError::ReferenceParse { .. }));
    }

    #[tokio::test]
    async fn test_destination_with_tag_rejected() {
        let registry = Arc::new(MemoryRegistry::new());
        let err = engine()
            .relocate(&UnprocessedImageUrls::new(), "registry.example.com/dst:v1", registry)
            .await
            .unwrap_err();
        assert!(matches!(err, ImgpkgError::ReferenceParse { .. }));
    }

    #[tokio::test]
    async fn test_export_then_import() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("export.tar");

        let source = MemoryRegistry::new();
        let image = fixtures::image(b"app", &[]);
        let index = fixtures::index(vec![fixtures::image(b"arm64", &[])]);
        let image_ref = source.insert(SRC, None, &image);
        let index_ref = source.insert("registry.example.com/other", None, &index);

        let urls: UnprocessedImageUrls = vec![
            UnprocessedImageUrl::with_tag(image_ref.url(), Some("v1".to_string())),
            UnprocessedImageUrl::new(index_ref.url()),
        ]
        .into_iter()
        .collect();
        engine().export(&urls, &path, Arc::new(source)).await.unwrap();

        let destination = Arc::new(MemoryRegistry::new());
        let processed = engine()
            .import(&path, DST, Arc::clone(&destination))
            .await
            .unwrap();

        assert_eq!(processed.len(), 2);
        assert_eq!(
            processed.all()[0].destination.url(),
            format!("{}@{}", DST, image.digest)
        );
        assert_eq!(destination.tagged(DST, "v1"), Some(image.digest.clone()));
        assert!(destination.contains(DST, &index.digest));
        assert!(destination.contains(DST, &index.children[0].digest));
    }
}
