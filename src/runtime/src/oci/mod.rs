//! OCI artifact access.
//!
//! ```text
//!   ImageReference ──resolve──▶ ArtifactReference (repo@digest)
//!                                      │
//!            ┌─────────────────────────┼─────────────────────────┐
//!            ▼                         ▼                         ▼
//!       OciRegistry              MemoryRegistry             ImageArchive
//!   (oci-distribution)        (tests, tar backing)       (tar on local disk)
//! ```
//!
//! Everything above the [`registry`] traits works only with digests; tags
//! are resolved once and then carried alongside.

pub mod artifact;
pub mod memory;
pub mod reference;
pub mod registry;

pub use artifact::{sha256_digest, Blob, Manifest, OciArtifact, BUNDLE_ANNOTATION};
pub use memory::{ManifestEntry, MemoryRegistry};
pub use reference::{with_repository, ArtifactKind, ArtifactReference, ImageReference};
pub use registry::{ImageDestination, ImageSource, OciRegistry, Registry, RegistryAuth};
