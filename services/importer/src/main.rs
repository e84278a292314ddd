//! diskport importer worker.
//!
//! One-shot process started by the orchestration layer for each volume
//! import. Settings come from `IMPORTER_*` environment variables (or the
//! matching flags); the process exits 0 once the image is in place and 1 on
//! any failure, after printing `error: <reason_code>: <message>`.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use diskport_importer::error::print_error;
use diskport_importer::{logging, ImportReport, Importer, ImporterSettings, QemuImg};

/// Import a disk image from an endpoint into a volume.
#[derive(Debug, Parser)]
#[command(name = "importer", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: ImporterSettings,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.settings.verbosity) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        dest = %cli.settings.dest.display(),
        "importer starting"
    );

    match run(&cli.settings) {
        Ok(report) => {
            info!(
                bytes = report.bytes_written,
                mode = ?report.mode,
                "importer exiting normally"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_error(&e);
            ExitCode::from(1)
        }
    }
}

fn run(settings: &ImporterSettings) -> Result<ImportReport> {
    let converter = Arc::new(QemuImg::new(&settings.qemu_img));
    let importer = Importer::new(settings.to_config(), converter)?;
    let report = importer.import(&settings.endpoint, settings.credentials(), &settings.dest)?;
    Ok(report)
}
