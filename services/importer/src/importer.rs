//! One import attempt, end to end.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use diskport_format::Format;
use tracing::{error, info, warn};

use crate::chain::{Closable, DataStream, LinkKind};
use crate::config::ImporterConfig;
use crate::converter::ImageConverter;
use crate::copier::{Copier, CopyMode};
use crate::endpoint::{Credentials, Endpoint};
use crate::error::ImportError;
use crate::resolver::Resolver;

/// Result of a successful import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    /// Endpoint with credentials stripped.
    pub endpoint: String,
    /// Format of the decoded payload.
    pub format: Format,
    /// Chain links in construction order.
    pub links: Vec<LinkKind>,
    pub bytes_written: u64,
    pub mode: CopyMode,
    pub duration: Duration,
}

/// Runs imports with a fixed config and converter.
pub struct Importer {
    config: ImporterConfig,
    resolver: Resolver,
    converter: Arc<dyn ImageConverter>,
}

impl Importer {
    pub fn new(
        config: ImporterConfig,
        converter: Arc<dyn ImageConverter>,
    ) -> Result<Self, ImportError> {
        let resolver = Resolver::new(&config)?;
        Ok(Self {
            config,
            resolver,
            converter,
        })
    }

    /// Import `endpoint` into `dest`.
    ///
    /// On failure nothing is left at `dest` and every temp file is gone.
    pub fn import(
        &self,
        endpoint: &str,
        credentials: Option<Credentials>,
        dest: &Path,
    ) -> Result<ImportReport, ImportError> {
        let started = Instant::now();
        let endpoint = Endpoint::parse(endpoint)?;
        info!(endpoint = %endpoint, dest = %dest.display(), "Starting import");

        let stream = DataStream::open(
            endpoint,
            credentials,
            &self.resolver,
            self.config.max_nesting_depth,
        )
        .inspect_err(|e| error!(reason = e.reason_code(), error = %e, "Failed to open source"))?;
        self.finish(stream, dest, started, &self.config)
    }

    /// Import from an already open source, e.g. an accepted socket.
    pub fn import_source(
        &self,
        endpoint: Endpoint,
        source: Box<dyn Closable>,
        dest: &Path,
    ) -> Result<ImportReport, ImportError> {
        let started = Instant::now();
        info!(endpoint = %endpoint, dest = %dest.display(), "Starting import from open source");
        let stream =
            DataStream::from_source(endpoint, None, source, self.config.max_nesting_depth)?;
        self.finish(stream, dest, started, &self.config)
    }

    /// Copy the single entry of a tar stream into `dest` byte for byte.
    ///
    /// The entry is neither decoded nor converted, whatever its content.
    pub fn import_archive(
        &self,
        endpoint: Endpoint,
        source: Box<dyn Closable>,
        dest: &Path,
    ) -> Result<ImportReport, ImportError> {
        let started = Instant::now();
        info!(endpoint = %endpoint, dest = %dest.display(), "Starting verbatim import");
        let stream = DataStream::from_archive(endpoint, source)?;
        let config = ImporterConfig {
            convert: false,
            ..self.config.clone()
        };
        self.finish(stream, dest, started, &config)
    }

    /// Copy, then tear the chain down.
    ///
    /// Teardown errors are logged and never become the reported outcome: once
    /// the copy succeeded the destination is complete and stays in place, and
    /// a failed copy keeps its own cause.
    fn finish(
        &self,
        mut stream: DataStream,
        dest: &Path,
        started: Instant,
        config: &ImporterConfig,
    ) -> Result<ImportReport, ImportError> {
        let result = Copier::new(self.converter.as_ref(), config).copy(&mut stream, dest);

        if let Err(e) = stream.close() {
            warn!(endpoint = %stream.endpoint(), error = %e, "Failed to close import chain");
        }

        let outcome = result.inspect_err(|e| {
            error!(reason = e.reason_code(), error = %e, "Import failed");
        })?;

        let report = ImportReport {
            endpoint: stream.endpoint().redacted(),
            format: stream.format(),
            links: stream.links(),
            bytes_written: outcome.bytes_written,
            mode: outcome.mode,
            duration: started.elapsed(),
        };
        info!(
            endpoint = %report.endpoint,
            format = %report.format,
            mode = ?report.mode,
            bytes = report.bytes_written,
            links = report.links.len(),
            elapsed_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            "Import complete"
        );
        Ok(report)
    }
}
