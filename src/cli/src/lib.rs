//! imgpkg CLI - relocate bundles and images between registries and archives.

pub mod commands;
pub mod output;
