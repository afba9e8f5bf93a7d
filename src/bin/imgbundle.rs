use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use imgbundle::artifacts::{Finder, NoopFinder, RegistryFinder};
use imgbundle::config::{load_settings, validate_settings, Settings};
use imgbundle::copy::{CopyDestination, CopyOptions, CopyOrchestrator, CopySource};
use imgbundle_oci::{Registry, RegistryClient};

#[derive(Parser)]
#[command(name = "imgbundle", version, about = "Relocate OCI bundles and images")]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    debug: bool,

    /// Settings file (YAML, or JSON by extension)
    #[arg(long, global = true, env = "IMGBUNDLE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy a bundle, image or lock file to a repository or archive
    Copy(CopyArgs),
}

#[derive(Args)]
struct CopyArgs {
    /// Bundle reference
    #[arg(short = 'b', long)]
    bundle: Option<String>,

    /// Plain image reference
    #[arg(short = 'i', long)]
    image: Option<String>,

    /// BundleLock or ImagesLock file
    #[arg(long)]
    lock: Option<PathBuf>,

    /// Archive produced by --to-tar
    #[arg(long)]
    tar: Option<PathBuf>,

    /// OCI layout directory produced by --to-oci-layout
    #[arg(long)]
    oci_layout: Option<PathBuf>,

    /// Destination repository
    #[arg(long)]
    to_repo: Option<String>,

    /// Destination tarball
    #[arg(long)]
    to_tar: Option<PathBuf>,

    /// Destination OCI layout directory
    #[arg(long)]
    to_oci_layout: Option<PathBuf>,

    /// Maximum in-flight registry and archive operations
    #[arg(long)]
    concurrency: Option<usize>,

    /// Copy non-distributable (foreign) layers too
    #[arg(long)]
    include_non_distributable_layers: bool,

    /// Skip signature, SBOM and attestation lookups
    #[arg(long)]
    without_artifacts: bool,

    /// Write a lock file pointing at the copied content
    #[arg(long)]
    lock_output: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match &cli.command {
        Command::Copy(args) => cmd_copy(cli.config.as_deref(), args).await,
    };
    if let Err(e) = result {
        eprintln!("imgbundle: {}", e);
        std::process::exit(1);
    }
}

async fn cmd_copy(
    config: Option<&std::path::Path>,
    args: &CopyArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = CopySource::from_flags(
        args.bundle.as_deref(),
        args.image.as_deref(),
        args.lock.as_deref(),
        args.tar.as_deref(),
        args.oci_layout.as_deref(),
    )?;
    let destination = CopyDestination::from_flags(
        args.to_repo.as_deref(),
        args.to_tar.as_deref(),
        args.to_oci_layout.as_deref(),
    )?;
    if args.lock_output.is_some() && !matches!(destination, CopyDestination::Repository(_)) {
        return Err("--lock-output requires --to-repo".into());
    }

    let mut settings = match config {
        Some(path) => load_settings(path)?,
        None => Settings::default(),
    };
    if let Some(concurrency) = args.concurrency {
        settings.concurrency = concurrency;
    }
    if args.include_non_distributable_layers {
        settings.include_non_distributable_layers = true;
    }
    if args.without_artifacts {
        settings.fetch_artifacts = false;
    }
    validate_settings(&settings)?;

    let registry: Arc<dyn Registry> =
        Arc::new(RegistryClient::with_auth(settings.registry_auth()));
    let finder: Arc<dyn Finder> = if settings.fetch_artifacts {
        Arc::new(RegistryFinder::new(registry.clone(), settings.retry_policy()))
    } else {
        Arc::new(NoopFinder)
    };

    let orchestrator =
        CopyOrchestrator::new(registry, finder, CopyOptions::from_settings(&settings));
    let report = orchestrator.run(&source, &destination).await?;

    for denied in report.denied.refs() {
        eprintln!("warning: access denied while looking up {}", denied);
    }
    for image in report.processed.all() {
        println!("copied {} -> {}", image.unprocessed.digest_ref(), image.digest_ref);
    }
    if let Some(exported) = &report.exported {
        println!("exported {} images", exported.len());
    }
    if let (Some(path), Some(lock)) = (&args.lock_output, &report.lock) {
        lock.write(path)?;
        println!("wrote lock file {}", path.display());
    }
    Ok(())
}
