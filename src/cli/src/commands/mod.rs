//! CLI command definitions and dispatch.

mod copy;
mod version;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use imgpkg_core::ImgpkgConfig;

pub use copy::CopyArgs;

/// imgpkg - copy bundles and images with their dependencies.
#[derive(Parser)]
#[command(name = "imgpkg", version, about)]
pub struct Cli {
    /// Config file (defaults to $IMGPKG_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Copy a bundle or images to a repository or a tarball
    Copy(CopyArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: ImgpkgConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Copy(args) => copy::execute(args, config).await,
        Command::Version(args) => version::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "imgpkg",
            "copy",
            "-i",
            "registry.example.com/app:v1",
            "--to-repo",
            "registry.example.com/dst",
            "--log-format",
            "json",
            "--config",
            "imgpkg.yml",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.config, Some(PathBuf::from("imgpkg.yml")));
        assert!(matches!(cli.command, Command::Copy(_)));
    }

    #[test]
    fn test_version_command() {
        let cli = Cli::try_parse_from(["imgpkg", "version"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(matches!(cli.command, Command::Version(_)));
    }
}
