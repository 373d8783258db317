//! vmkit - Build and patch bootable VM disk images at the block level

use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};

mod common_opts;
mod disk;
mod nbd;
mod path_mapping;
mod rofs;
mod utils;

/// Low-level tooling for assembling VM disk images.
///
/// vmkit edits the partition table and kernel command line of a disk
/// image through an NBD export, and packs application trees into
/// read-only filesystem (ROFS) images attached to a VM as data volumes.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an MBR partition table entry
    #[clap(name = "set-partition")]
    SetPartition(disk::SetPartitionOpts),

    /// Write the kernel command line block after the MBR
    #[clap(name = "set-cmdline")]
    SetCmdline(disk::SetCmdlineOpts),

    /// Build a ROFS image from a directory tree
    Mkfs(rofs::MkfsOpts),

    /// List the contents of a ROFS image
    Inspect(rofs::InspectOpts),
}

/// Install and configure the tracing/logging system.
///
/// Logs go to stderr, filtered by RUST_LOG and defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::SetPartition(opts) => disk::run_set_partition(opts)?,
        Commands::SetCmdline(opts) => disk::run_set_cmdline(opts)?,
        Commands::Mkfs(opts) => rofs::builder::run_mkfs(opts)?,
        Commands::Inspect(opts) => rofs::reader::run_inspect(opts)?,
    }
    tracing::debug!("exiting");
    Ok(())
}
