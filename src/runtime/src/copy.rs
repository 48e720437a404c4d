//! Copy orchestration.
//!
//! Classifies the input, expands bundles, rewrites dependencies to
//! collocated copies, runs the relocation and finally writes the lock file
//! describing where everything ended up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use imgpkg_core::error::{ImgpkgError, Result};
use imgpkg_core::event::EventEmitter;

use crate::archive::ImageArchive;
use crate::bundle::Bundle;
use crate::collocation::CollocationResolver;
use crate::images::{ProcessedImageSet, UnprocessedImageUrl, UnprocessedImageUrls};
use crate::lock::{BundleLock, ImageRef, ImagesLock, LockFile};
use crate::oci::{ArtifactReference, Registry};
use crate::pool::WorkerPool;
use crate::relocate::RelocationEngine;
use crate::resolve::{is_bundle, require_kind, resolve, ExpectedKind};

/// What to copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopySource {
    /// Bundle reference (`-b`)
    Bundle(String),
    /// Plain image reference (`-i`)
    Image(String),
    /// BundleLock or ImagesLock file (`--lock`)
    LockFile(PathBuf),
    /// Archive produced by an earlier export (`--from-tar`)
    Archive(PathBuf),
}

/// Where to copy to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyDestination {
    /// Repository (`--to-repo`)
    Repository(String),
    /// Local archive (`--to-tar`)
    Archive(PathBuf),
}

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub source: CopySource,
    pub destination: CopyDestination,
    /// Write a BundleLock / ImagesLock describing the copied images
    pub lock_output: Option<PathBuf>,
}

impl CopyOptions {
    /// Reject source/destination combinations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if matches!(self.source, CopySource::Archive(_))
            && matches!(self.destination, CopyDestination::Archive(_))
        {
            return Err(ImgpkgError::Other(
                "Cannot use tar source (--from-tar) with tar destination (--to-tar)".to_string(),
            ));
        }
        if self.lock_output.is_some() && matches!(self.destination, CopyDestination::Archive(_)) {
            return Err(ImgpkgError::Other(
                "Cannot output lock file with tar destination".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of a copy.
#[derive(Debug)]
pub struct CopyOutcome {
    /// Copied images (none for an archive destination)
    pub processed: Option<ProcessedImageSet>,
    /// Digest-qualified URL of the bundle, when a bundle was copied
    pub bundle_url: Option<String>,
    /// Lock written to `lock_output`
    pub lock: Option<LockFile>,
    /// The bundle's embedded lock rewritten to collocated locations, when
    /// every image was found in the bundle repository
    pub bundle_images_lock: Option<ImagesLock>,
}

/// Images to copy, as gathered from the source.
#[derive(Default)]
struct CopyPlan {
    urls: UnprocessedImageUrls,
    bundle_url: Option<String>,
    images_lock: Option<ImagesLock>,
    bundle: Option<(Bundle, ImagesLock)>,
    bundle_images_lock: Option<ImagesLock>,
}

/// Runs `imgpkg copy`.
pub struct Copier {
    registry: Arc<dyn Registry>,
    engine: RelocationEngine,
    collocation: CollocationResolver,
}

impl Copier {
    pub fn new(registry: Arc<dyn Registry>, pool: WorkerPool, events: EventEmitter) -> Self {
        Self {
            registry,
            engine: RelocationEngine::new(pool.clone(), events.clone()),
            collocation: CollocationResolver::new(pool, events),
        }
    }

    pub async fn copy(&self, options: &CopyOptions) -> Result<CopyOutcome> {
        options.validate()?;

        let (processed, bundle_url, images_lock, bundle_images_lock) = match options.source {
            CopySource::Archive(ref path) => {
                let CopyDestination::Repository(ref repository) = options.destination else {
                    return Err(ImgpkgError::Other(
                        "Cannot use tar source (--from-tar) with tar destination (--to-tar)".to_string(),
                    ));
                };
                let archive = ImageArchive::read(path)?;
                let bundle_url = archive_bundle_url(&archive)?;
                let processed = self
                    .engine
                    .import_archive(&archive, repository, Arc::clone(&self.registry))
                    .await?
                    .into_result()?;
                (Some(processed), bundle_url, None, None)
            }
            _ => {
                let plan = self.plan(&options.source).await?;
                let processed = match options.destination {
                    CopyDestination::Archive(ref path) => {
                        self.engine
                            .export(&plan.urls, path, Arc::clone(&self.registry))
                            .await?;
                        None
                    }
                    CopyDestination::Repository(ref repository) => Some(
                        self.engine
                            .relocate(&plan.urls, repository, Arc::clone(&self.registry))
                            .await?,
                    ),
                };
                (processed, plan.bundle_url, plan.images_lock, plan.bundle_images_lock)
            }
        };

        let lock = match (&options.lock_output, &processed) {
            (Some(path), Some(processed)) => {
                let lock = lock_output(processed, bundle_url.as_deref(), images_lock.as_ref())?;
                match lock {
                    LockFile::Bundle(ref l) => l.write_to_path(path)?,
                    LockFile::Images(ref l) => l.write_to_path(path)?,
                }
                tracing::info!(path = %path.display(), "Wrote lock file");
                Some(lock)
            }
            _ => None,
        };

        Ok(CopyOutcome {
            processed,
            bundle_url,
            lock,
            bundle_images_lock,
        })
    }

    /// Gather the images behind a registry-side source.
    async fn plan(&self, source: &CopySource) -> Result<CopyPlan> {
        let registry = self.registry.as_ref();
        let mut plan = match source {
            CopySource::Image(reference) => {
                let resolved = resolve(reference, registry).await?;
                require_kind(&resolved, ExpectedKind::Image)?;
                let mut urls = UnprocessedImageUrls::new();
                urls.add(UnprocessedImageUrl::with_tag(
                    resolved.url(),
                    resolved.reference.tag.clone(),
                ));
                CopyPlan {
                    urls,
                    ..Default::default()
                }
            }
            CopySource::Bundle(reference) => {
                let resolved = resolve(reference, registry).await?;
                let bundle = Bundle::from_resolved(&resolved)?;
                self.bundle_plan(bundle).await?
            }
            CopySource::LockFile(path) => match LockFile::from_path(path)? {
                LockFile::Bundle(lock) => {
                    let resolved = resolve(&lock.bundle.image, registry).await?;
                    require_kind(&resolved, ExpectedKind::Bundle)?;
                    // The lock records the tag the bundle was originally pushed with.
                    let bundle = Bundle::new(resolved.reference.with_tag(lock.bundle.tag.clone()));
                    self.bundle_plan(bundle).await?
                }
                LockFile::Images(lock) => {
                    self.reject_bundles(&lock).await?;
                    let urls = lock
                        .images
                        .iter()
                        .map(|image| UnprocessedImageUrl::new(image.image.clone()))
                        .collect();
                    CopyPlan {
                        urls,
                        images_lock: Some(lock),
                        ..Default::default()
                    }
                }
            },
            CopySource::Archive(_) => {
                return Err(ImgpkgError::Other(
                    "archive sources are imported, not planned".to_string(),
                ))
            }
        };

        if let Some(ref bundle_url) = plan.bundle_url {
            let located = self
                .collocation
                .resolve(&plan.urls, bundle_url, Arc::clone(&self.registry))
                .await?;
            if let Some((ref bundle, ref lock)) = plan.bundle {
                let mapping: HashMap<String, String> = plan
                    .urls
                    .iter()
                    .zip(&located)
                    .map(|(from, to)| (from.url.clone(), to.url.clone()))
                    .collect();
                plan.bundle_images_lock = bundle.rewrite_images_lock(lock, &mapping)?;
            }
            // Inputs that collocate to the same URL collapse here.
            plan.urls = located.into_iter().collect();
        }
        Ok(plan)
    }

    async fn bundle_plan(&self, bundle: Bundle) -> Result<CopyPlan> {
        let (lock, urls) = bundle.expand(self.registry.as_ref()).await?;
        Ok(CopyPlan {
            urls,
            bundle_url: Some(bundle.url()),
            bundle: Some((bundle, lock)),
            ..Default::default()
        })
    }

    /// An ImagesLock passed with `--lock` must list plain images only.
    async fn reject_bundles(&self, lock: &ImagesLock) -> Result<()> {
        let mut bundles = Vec::new();
        for image in &lock.images {
            let reference = ArtifactReference::parse(&image.image)?;
            if is_bundle(&reference, self.registry.as_ref()).await? {
                bundles.push(image.image.clone());
            }
        }
        if bundles.is_empty() {
            return Ok(());
        }
        Err(ImgpkgError::WrongArtifactKind {
            message: format!(
                "Expected image lock to not contain bundle reference: '{}'",
                bundles.join("', '")
            ),
            hint: "copy bundles with -b or with a BundleLock".to_string(),
        })
    }
}

/// The lock describing a finished copy: a BundleLock when a bundle was
/// copied, an ImagesLock otherwise.
pub fn lock_output(
    processed: &ProcessedImageSet,
    bundle_url: Option<&str>,
    input_lock: Option<&ImagesLock>,
) -> Result<LockFile> {
    match bundle_url {
        Some(bundle_url) => {
            let bundle = processed.find_by_source(bundle_url).ok_or_else(|| {
                ImgpkgError::Other(format!("Could not find processed item for url '{}'", bundle_url))
            })?;
            Ok(LockFile::Bundle(BundleLock::new(
                bundle.destination.url(),
                bundle.source.tag.clone(),
            )))
        }
        None => {
            let images = processed
                .iter()
                .map(|image| ImageRef {
                    image: image.destination.url(),
                    annotations: input_lock
                        .and_then(|lock| lock.annotations_for(&image.source.url))
                        .cloned()
                        .unwrap_or_default(),
                })
                .collect();
            Ok(LockFile::Images(ImagesLock::new(images)))
        }
    }
}

fn archive_bundle_url(archive: &ImageArchive) -> Result<Option<String>> {
    let bundles = archive.bundles()?;
    match bundles.as_slice() {
        [bundle] => Ok(Some(bundle.reference().url())),
        [] => Ok(None),
        _ => {
            tracing::warn!(bundles = bundles.len(), "Archive holds more than one bundle");
            Ok(None)
        }
    }
}
