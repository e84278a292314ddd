//! Disk image conversion.
//!
//! The pipeline only talks to the [`ImageConverter`] trait. [`QemuImg`] is the
//! production implementation; [`ScriptedConverter`] is a deterministic double
//! for tests and dry runs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::{Mutex, PoisonError};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Errors from converting or inspecting an image.
#[derive(Debug, Error)]
pub enum ConverterError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("unreadable {tool} output: {source}")]
    Output {
        tool: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("image format is {actual}, expected {expected}")]
    FormatMismatch { expected: String, actual: String },

    #[error("image has a backing file: {0}")]
    BackingFile(String),

    #[error("{0}")]
    Scripted(String),
}

/// Converts disk-container images to the target format and checks the result.
pub trait ImageConverter: Send + Sync {
    /// Transcode the qcow2 image at `src` into a raw image at `dst`.
    fn convert(&self, src: &Path, dst: &Path) -> Result<(), ConverterError>;

    /// Transcode a qcow2 image the converter fetches from `url` itself.
    fn convert_stream(&self, url: &Url, dst: &Path) -> Result<(), ConverterError>;

    /// Check that the image at `path` is a standalone image of `expected_format`.
    fn validate(&self, path: &Path, expected_format: &str) -> Result<(), ConverterError>;
}

/// Timeout handed to the converter's HTTP driver for streaming sources.
const STREAM_TIMEOUT_SECS: u64 = 3600;

/// `qemu-img` backed converter.
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: PathBuf,
}

/// Subset of `qemu-img info --output=json`.
#[derive(Debug, Deserialize)]
struct ImageInfo {
    format: String,
    #[serde(rename = "virtual-size")]
    virtual_size: Option<u64>,
    #[serde(rename = "backing-filename")]
    backing_filename: Option<String>,
}

impl QemuImg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn tool(&self) -> String {
        self.binary.display().to_string()
    }

    fn run(&self, command: &mut Command) -> Result<Vec<u8>, ConverterError> {
        let output = command.output().map_err(|source| ConverterError::Spawn {
            tool: self.tool(),
            source,
        })?;
        if !output.status.success() {
            return Err(ConverterError::Failed {
                tool: self.tool(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn convert_from(&self, source: &str, dst: &Path) -> Result<(), ConverterError> {
        let mut command = Command::new(&self.binary);
        command
            .args(["convert", "-p", "-f", "qcow2", "-O", "raw"])
            .arg(source)
            .arg(dst);
        self.run(&mut command)?;
        Ok(())
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

impl ImageConverter for QemuImg {
    fn convert(&self, src: &Path, dst: &Path) -> Result<(), ConverterError> {
        info!(src = %src.display(), dst = %dst.display(), "Converting image");
        self.convert_from(&src.display().to_string(), dst)
    }

    fn convert_stream(&self, url: &Url, dst: &Path) -> Result<(), ConverterError> {
        info!(url = %url.host_str().unwrap_or_default(), dst = %dst.display(), "Converting streamed image");
        self.convert_from(&stream_source(url), dst)
    }

    fn validate(&self, path: &Path, expected_format: &str) -> Result<(), ConverterError> {
        let mut command = Command::new(&self.binary);
        command.args(["info", "--output=json"]).arg(path);
        let stdout = self.run(&mut command)?;
        let info: ImageInfo =
            serde_json::from_slice(&stdout).map_err(|source| ConverterError::Output {
                tool: self.tool(),
                source,
            })?;
        debug!(format = %info.format, virtual_size = info.virtual_size, "Image info");
        check_info(&info, expected_format)
    }
}

/// `json:` pseudo-filename that makes the converter read over HTTP(S).
fn stream_source(url: &Url) -> String {
    let spec = serde_json::json!({
        "file.driver": url.scheme(),
        "file.url": url.as_str(),
        "file.timeout": STREAM_TIMEOUT_SECS,
    });
    format!("json:{spec}")
}

fn check_info(info: &ImageInfo, expected_format: &str) -> Result<(), ConverterError> {
    if info.format != expected_format {
        return Err(ConverterError::FormatMismatch {
            expected: expected_format.to_string(),
            actual: info.format.clone(),
        });
    }
    if let Some(backing) = info.backing_filename.as_deref().filter(|b| !b.is_empty()) {
        return Err(ConverterError::BackingFile(backing.to_string()));
    }
    Ok(())
}

/// One recorded converter invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConverterCall {
    Convert { src: PathBuf, dst: PathBuf },
    ConvertStream { url: Url, dst: PathBuf },
    Validate { path: PathBuf, format: String },
}

/// Converter double with scripted outcomes.
///
/// A successful `convert` copies the source bytes to the destination and a
/// successful `convert_stream` creates an empty destination, so callers see
/// the same files they would with a real tool.
#[derive(Debug, Default)]
pub struct ScriptedConverter {
    convert_error: Option<String>,
    convert_stream_error: Option<String>,
    validate_error: Option<String>,
    calls: Mutex<Vec<ConverterCall>>,
}

impl ScriptedConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_convert(mut self, msg: impl Into<String>) -> Self {
        self.convert_error = Some(msg.into());
        self
    }

    pub fn failing_convert_stream(mut self, msg: impl Into<String>) -> Self {
        self.convert_stream_error = Some(msg.into());
        self
    }

    pub fn failing_validate(mut self, msg: impl Into<String>) -> Self {
        self.validate_error = Some(msg.into());
        self
    }

    /// Every operation fails.
    pub fn rejecting_all() -> Self {
        Self::new()
            .failing_convert("scripted convert failure")
            .failing_convert_stream("scripted convert_stream failure")
            .failing_validate("scripted validate failure")
    }

    /// Invocations so far, in order.
    pub fn calls(&self) -> Vec<ConverterCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: ConverterCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl ImageConverter for ScriptedConverter {
    fn convert(&self, src: &Path, dst: &Path) -> Result<(), ConverterError> {
        self.record(ConverterCall::Convert {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
        if let Some(msg) = &self.convert_error {
            return Err(ConverterError::Scripted(msg.clone()));
        }
        fs::copy(src, dst).map_err(|source| ConverterError::Spawn {
            tool: "scripted".to_string(),
            source,
        })?;
        Ok(())
    }

    fn convert_stream(&self, url: &Url, dst: &Path) -> Result<(), ConverterError> {
        self.record(ConverterCall::ConvertStream {
            url: url.clone(),
            dst: dst.to_path_buf(),
        });
        if let Some(msg) = &self.convert_stream_error {
            return Err(ConverterError::Scripted(msg.clone()));
        }
        fs::File::create(dst).map_err(|source| ConverterError::Spawn {
            tool: "scripted".to_string(),
            source,
        })?;
        Ok(())
    }

    fn validate(&self, path: &Path, expected_format: &str) -> Result<(), ConverterError> {
        self.record(ConverterCall::Validate {
            path: path.to_path_buf(),
            format: expected_format.to_string(),
        });
        match &self.validate_error {
            Some(msg) => Err(ConverterError::Scripted(msg.clone())),
            None => Ok(()),
        }
    }
}
