//! imgmount binary.
//!
//! Mounts one backend at MOUNTPOINT and blocks until it is unmounted.
//!
//! ```bash
//! # Filesystem image, read-only
//! imgmount --image fs.img /mnt/img
//!
//! # Second partition of a disk image, writable
//! imgmount --disk disk.img --partition 1 --rw /mnt/data
//!
//! # Scratch tree in memory
//! imgmount --memory /mnt/scratch
//! ```

use std::path::PathBuf;

use clap::{Args, Parser};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use imgmount_device::Access;
use imgmount_kernel::{
    BackendChoices, FormatRegistry, MountError, MountOrchestrator, MountRequest,
    config, host_default,
};

/// Mount a disk image, raw device or in-memory tree.
#[derive(Parser, Debug)]
#[command(name = "imgmount", version)]
#[command(about = "Mount a disk image, raw device or in-memory tree")]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    /// Partition index on --disk, starting at 0
    #[arg(long, value_name = "N")]
    partition: Option<usize>,

    /// Image index inside --archive, starting at 0
    #[arg(long, value_name = "N")]
    index: Option<usize>,

    /// Mount read-write (read-only by default)
    #[arg(long)]
    rw: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Config file (default: ~/.config/imgmount/config.ron)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Sector size for raw block devices, overriding the probed value
    #[arg(long, value_name = "BYTES")]
    sector_size: Option<u32>,

    /// Where to mount
    mountpoint: PathBuf,
}

/// Exactly one of these is required.
#[derive(Args, Debug)]
#[command(next_help_heading = "Backend")]
struct BackendArgs {
    /// Filesystem image or raw block device
    #[arg(long, value_name = "PATH")]
    image: Option<PathBuf>,

    /// Disk image or device with a partition table
    #[arg(long, value_name = "PATH")]
    disk: Option<PathBuf>,

    /// Multi-image archive container
    #[arg(long, value_name = "PATH")]
    archive: Option<PathBuf>,

    /// In-memory filesystem that keeps written data
    #[arg(long)]
    memory: bool,

    /// In-memory filesystem that accepts and drops written data
    #[arg(long)]
    discard: bool,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli) {
        let code = e.exit_code();
        eprintln!("Error: {:?}", anyhow::Error::new(e));
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<(), MountError> {
    let defaults = config::load(cli.config.as_deref())?;

    // Built by hand: the mount blocks this thread, outside the runtime.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(usize::from(defaults.dispatch_threads.max(1)))
        .thread_name("imgmount-dispatch")
        .enable_all()
        .build()
        .map_err(MountError::Runtime)?;

    let registry = FormatRegistry::new();
    let adapter = host_default(runtime.handle().clone(), defaults.clone());

    let request = MountRequest {
        backend: BackendChoices {
            image: cli.backend.image,
            disk: cli.backend.disk,
            partition: cli.partition,
            archive: cli.backend.archive,
            index: cli.index,
            memory: cli.backend.memory,
            discard: cli.backend.discard,
        },
        access: if cli.rw {
            Access::ReadWrite
        } else {
            Access::ReadOnly
        },
        target: cli.mountpoint,
        sector_size: cli.sector_size.or(defaults.sector_size),
    };

    let report = MountOrchestrator::new(&registry, adapter.as_ref()).run(request)?;
    tracing::debug!(phases = ?report.phases, "mount finished");
    Ok(())
}
