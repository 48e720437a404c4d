//! imgpkg Runtime - bundle resolution and concurrent relocation.
//!
//! This crate turns bundle or image references (or lock files) into a
//! closed, digest-pinned set of images, prefers copies that already sit
//! next to a bundle, and copies the set to another repository or a local
//! archive with bounded concurrency.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod bundle;
pub mod collocation;
pub mod copy;
pub mod images;
pub mod lock;
pub mod oci;
pub mod pool;
pub mod relocate;
pub mod resolve;

// Re-export common types
pub use archive::{read_archive, write_archive, ArchiveEntry, ImageArchive};
pub use bundle::{Bundle, IMAGES_LOCK_PATH};
pub use collocation::CollocationResolver;
pub use copy::{lock_output, Copier, CopyDestination, CopyOptions, CopyOutcome, CopySource};
pub use images::{ProcessedImage, ProcessedImageSet, UnprocessedImageUrl, UnprocessedImageUrls};
pub use lock::{BundleLock, ImageRef, ImagesLock, LockFile, LOCK_API_VERSION};
pub use oci::{
    ArtifactKind, ArtifactReference, ImageDestination, ImageReference, ImageSource, MemoryRegistry,
    OciArtifact, OciRegistry, Registry, RegistryAuth,
};
pub use pool::{WorkOutcome, WorkerPool};
pub use relocate::{RelocationEngine, RelocationReport, TargetRepository};
pub use resolve::{is_bundle, require_kind, resolve, ExpectedKind, ResolvedArtifact};

/// imgpkg runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
