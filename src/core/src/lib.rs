//! imgpkg Core - Foundational Types and Abstractions
//!
//! Error taxonomy, configuration and progress events shared by the
//! relocation runtime and the CLI.

pub mod config;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::{ImgpkgConfig, LogLevel, RegistryConfig, DEFAULT_CONCURRENCY};
pub use error::{ImageFailure, ImgpkgError, RelocationFailures, Result};
pub use event::{EventEmitter, RelocationEvent};

/// imgpkg version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
