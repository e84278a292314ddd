//! diskport clone worker.
//!
//! Runs as either half of a volume clone. Both halves mount the same socket
//! directory and agree on the clone id; the target listens, the source
//! connects and streams its image.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use diskport_importer::clone::{self, CloneConfig, CloneRendezvous};
use diskport_importer::error::print_error;
use diskport_importer::{logging, Importer, ImporterConfig, QemuImg};

/// Copy a volume image to another volume over a local socket.
#[derive(Debug, Parser)]
#[command(name = "cloner", version, about, long_about = None)]
struct Cli {
    /// Directory holding the per-clone socket directories.
    #[arg(long, global = true, env = "CLONER_SOCKET_DIR", default_value = "/tmp/clone/socket")]
    socket_dir: PathBuf,

    /// Image path inside the mounted volume.
    #[arg(long, global = true, env = "CLONER_IMAGE_PATH", default_value = "/tmp/clone/image/disk.img")]
    image_path: PathBuf,

    /// Log verbosity (0 = warn, 1 = info, 2 = debug, 3 = trace).
    #[arg(short, long, global = true, env = "IMPORTER_VERBOSITY", default_value_t = 1)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stream the local image to the target.
    Source {
        /// Clone id shared with the target.
        id: String,

        /// Seconds to wait for the target socket.
        #[arg(long, default_value_t = 60)]
        connect_timeout: u64,
    },

    /// Receive an image from the source.
    Target {
        /// Clone id shared with the source.
        id: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.verbosity) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&e);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = CloneConfig {
        socket_dir: cli.socket_dir,
        image_path: cli.image_path,
        ..CloneConfig::default()
    };

    match cli.command {
        Commands::Source {
            id,
            connect_timeout,
        } => {
            config.connect_timeout = Duration::from_secs(connect_timeout);
            let rendezvous = CloneRendezvous::new(&config.socket_dir, id)?;
            let sent = clone::send_source(&rendezvous, &config)
                .with_context(|| format!("clone source {}", rendezvous.id()))?;
            info!(id = rendezvous.id(), bytes = sent, "clone source exiting normally");
        }
        Commands::Target { id } => {
            let rendezvous = CloneRendezvous::new(&config.socket_dir, id)?;
            let importer_config = ImporterConfig {
                convert: false,
                ..ImporterConfig::default()
            };
            let importer = Importer::new(importer_config, Arc::new(QemuImg::default()))?;
            let report = clone::receive_target(&rendezvous, &importer, &config.image_path)
                .with_context(|| format!("clone target {}", rendezvous.id()))?;
            info!(
                id = rendezvous.id(),
                bytes = report.bytes_written,
                "clone target exiting normally"
            );
        }
    }
    Ok(())
}
