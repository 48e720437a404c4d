//! Preferring images that already sit next to their bundle.
//!
//! For every dependency of a bundle, the copy in the bundle's own repository
//! (same digest) is preferred over the location recorded in the lock. The
//! lookups are independent and run on the worker pool.

use std::sync::Arc;

use imgpkg_core::error::{ImgpkgError, RelocationFailures, Result};
use imgpkg_core::event::{events, EventEmitter, RelocationEvent};

use crate::images::{UnprocessedImageUrl, UnprocessedImageUrls};
use crate::oci::{with_repository, ArtifactReference, Registry};
use crate::pool::{WorkOutcome, WorkerPool};

/// Rewrites dependency URLs to collocated copies when they exist.
pub struct CollocationResolver {
    pool: WorkerPool,
    events: EventEmitter,
}

impl CollocationResolver {
    pub fn new(pool: WorkerPool, events: EventEmitter) -> Self {
        Self { pool, events }
    }

    /// Resolve every URL against the bundle's repository.
    ///
    /// The result is aligned with `urls`: same length and order, with no
    /// merging even when two inputs land on the same collocated copy. A
    /// missing collocated copy is not an error; a failed lookup is, and all
    /// such failures are reported together.
    pub async fn resolve(
        &self,
        urls: &UnprocessedImageUrls,
        bundle_url: &str,
        registry: Arc<dyn Registry>,
    ) -> Result<Vec<UnprocessedImageUrl>> {
        let bundle_repository = ArtifactReference::parse(bundle_url)?.repository;

        // Build every candidate list up front so malformed URLs fail before any lookup.
        let mut work = Vec::with_capacity(urls.len());
        for url in urls.iter() {
            let candidates = if url.url == bundle_url {
                Vec::new()
            } else {
                vec![ArtifactReference::parse(&with_repository(&url.url, &bundle_repository)?)?]
            };
            work.push((url.clone(), candidates));
        }

        let events = self.events.clone();
        let outcomes = self
            .pool
            .run(work, move |(url, candidates)| {
                let registry = Arc::clone(&registry);
                let events = events.clone();
                async move { pick_location(url, candidates, registry.as_ref(), &events).await }
            })
            .await;

        let mut resolved = Vec::with_capacity(urls.len());
        let mut failures = RelocationFailures::default();
        let mut cancelled = false;
        for (url, outcome) in urls.iter().zip(outcomes) {
            match outcome {
                WorkOutcome::Completed(Ok(found)) => resolved.push(found),
                WorkOutcome::Completed(Err(e)) => {
                    tracing::warn!(url = %url.url, error = %e, "Collocation check failed");
                    failures.push(url.url.clone(), e);
                }
                WorkOutcome::NotDispatched => cancelled = true,
            }
        }

        if !failures.is_empty() {
            return Err(ImgpkgError::Relocation(failures));
        }
        if cancelled {
            return Err(ImgpkgError::Cancelled);
        }
        Ok(resolved)
    }
}

/// First candidate that exists wins; the original URL is the fallback.
async fn pick_location(
    url: UnprocessedImageUrl,
    candidates: Vec<ArtifactReference>,
    registry: &dyn Registry,
    events: &EventEmitter,
) -> Result<UnprocessedImageUrl> {
    for candidate in candidates {
        if candidate.url() == url.url {
            return Ok(url);
        }
        let found = registry.exists(&candidate).await.map_err(|e| match e {
            ImgpkgError::RegistryUnavailable { .. } => e,
            other => ImgpkgError::RegistryUnavailable {
                registry: candidate.registry().to_string(),
                message: other.to_string(),
            },
        })?;
        if found {
            tracing::debug!(url = %url.url, collocated = %candidate, "Found collocated image");
            events.emit(RelocationEvent::with_detail(
                events::COLLOCATION_FOUND,
                url.url.clone(),
                candidate.url(),
            ));
            return Ok(UnprocessedImageUrl::with_tag(candidate.url(), url.tag));
        }
    }
    Ok(url)
}
