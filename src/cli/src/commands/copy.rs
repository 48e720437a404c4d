//! `imgpkg copy` command.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgGroup, Args};
use imgpkg_core::error::ImgpkgError;
use imgpkg_core::{EventEmitter, ImgpkgConfig};
use imgpkg_runtime::{
    Copier, CopyDestination, CopyOptions, CopySource, OciRegistry, RegistryAuth, WorkerPool,
};
use tokio::sync::watch;

use crate::output::spawn_event_printer;

#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("source")
        .required(true)
        .args(["bundle", "image", "lock", "from_tar"])
))]
#[command(group(
    ArgGroup::new("destination")
        .required(true)
        .args(["to_repo", "to_tar"])
))]
pub struct CopyArgs {
    /// Bundle reference (e.g., "registry.example.com/app-bundle:v1")
    #[arg(short = 'b', long)]
    pub bundle: Option<String>,

    /// Image reference
    #[arg(short = 'i', long)]
    pub image: Option<String>,

    /// BundleLock or ImagesLock file
    #[arg(long)]
    pub lock: Option<PathBuf>,

    /// Tarball produced by an earlier `--to-tar` copy
    #[arg(long)]
    pub from_tar: Option<PathBuf>,

    /// Destination repository (e.g., "registry.example.com/mirror")
    #[arg(long)]
    pub to_repo: Option<String>,

    /// Destination tarball
    #[arg(long)]
    pub to_tar: Option<PathBuf>,

    /// Write a lock file describing the copied images
    #[arg(long)]
    pub lock_output: Option<PathBuf>,

    /// Number of images copied at the same time (overrides config)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Talk plain HTTP to registries
    #[arg(long)]
    pub registry_insecure: bool,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

impl CopyArgs {
    /// Turn the flags into copy options, enforcing one source and one destination.
    pub fn to_options(&self) -> Result<CopyOptions, ImgpkgError> {
        let source = match (&self.bundle, &self.image, &self.lock, &self.from_tar) {
            (Some(bundle), None, None, None) => CopySource::Bundle(bundle.clone()),
            (None, Some(image), None, None) => CopySource::Image(image.clone()),
            (None, None, Some(lock), None) => CopySource::LockFile(lock.clone()),
            (None, None, None, Some(path)) => CopySource::Archive(path.clone()),
            _ => {
                return Err(ImgpkgError::Other(
                    "Expected exactly one of --bundle, --image, --lock or --from-tar".to_string(),
                ))
            }
        };
        let destination = match (&self.to_repo, &self.to_tar) {
            (Some(repo), None) => CopyDestination::Repository(repo.clone()),
            (None, Some(path)) => CopyDestination::Archive(path.clone()),
            _ => {
                return Err(ImgpkgError::Other(
                    "Expected exactly one of --to-repo or --to-tar".to_string(),
                ))
            }
        };

        let options = CopyOptions {
            source,
            destination,
            lock_output: self.lock_output.clone(),
        };
        options.validate()?;
        Ok(options)
    }
}

pub async fn execute(args: CopyArgs, mut config: ImgpkgConfig) -> Result<(), Box<dyn std::error::Error>> {
    let options = args.to_options()?;

    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if args.registry_insecure {
        config.registry.plain_http = true;
    }
    config.validate()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, waiting for in-flight copies to finish");
            let _ = shutdown_tx.send(true);
        }
    });

    let registry = Arc::new(OciRegistry::with_auth(&config.registry, RegistryAuth::from_env()));
    let events = EventEmitter::default();
    let printer = (!args.quiet).then(|| spawn_event_printer(&events));

    let pool = WorkerPool::new(config.concurrency).with_shutdown(shutdown_rx);
    let copier = Copier::new(registry, pool, events.clone());
    let result = copier.copy(&options).await;

    // Closing the event channel lets the printer drain and exit.
    drop(copier);
    drop(events);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let outcome = result?;
    if !args.quiet {
        if let Some(ref path) = options.lock_output {
            println!("copy | wrote lock file {}", path.display());
        }
        if outcome.bundle_images_lock.is_some() {
            println!("copy | all images found in bundle repository");
        }
        if let Some(ref processed) = outcome.processed {
            println!("copy | {} image(s) copied", processed.len());
        }
        println!("Succeeded");
    }
    Ok(())
}
