//! Writes a decoded stream to its destination.
//!
//! Three paths:
//! - direct: stream the bytes into a temp file next to the destination and
//!   rename it over the destination once complete
//! - convert: stream a disk-container payload into a scratch file, have the
//!   converter transcode it, validate, then rename into place
//! - streaming convert: for plain qcow2 over HTTP(S), let the converter fetch
//!   the source itself so no scratch copy is needed

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use url::Url;

use crate::chain::DataStream;
use crate::config::ImporterConfig;
use crate::converter::{ConverterError, ImageConverter};
use crate::endpoint::Scheme;
use crate::error::ImportError;

/// Which path an import took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    Direct,
    Converted,
    StreamConverted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    pub mode: CopyMode,
    pub bytes_written: u64,
}

pub struct Copier<'a> {
    converter: &'a dyn ImageConverter,
    config: &'a ImporterConfig,
}

impl<'a> Copier<'a> {
    pub fn new(converter: &'a dyn ImageConverter, config: &'a ImporterConfig) -> Self {
        Self { converter, config }
    }

    /// Copy `stream` to `dest`.
    ///
    /// The destination only appears once the copy (and conversion, if any)
    /// succeeded. Temp files registered with the stream's closer are removed
    /// when the stream is closed.
    pub fn copy(&self, stream: &mut DataStream, dest: &Path) -> Result<CopyOutcome, ImportError> {
        let needs_convert = self.config.convert && stream.format().is_disk_container();
        if !needs_convert {
            let bytes_written = self.copy_direct(stream, dest)?;
            return Ok(CopyOutcome {
                mode: CopyMode::Direct,
                bytes_written,
            });
        }

        if let Some(url) = self.streamable_url(stream) {
            // The converter opens its own connection
            if let Err(e) = stream.close() {
                warn!(error = %e, "Failed to close source before streaming conversion");
            }
            let bytes_written = self.convert_streamed(&url, dest)?;
            return Ok(CopyOutcome {
                mode: CopyMode::StreamConverted,
                bytes_written,
            });
        }

        let bytes_written = self.convert_buffered(stream, dest)?;
        Ok(CopyOutcome {
            mode: CopyMode::Converted,
            bytes_written,
        })
    }

    /// URL the converter may fetch itself: an anonymous HTTP(S) source whose
    /// payload needed no decoding.
    fn streamable_url(&self, stream: &DataStream) -> Option<Url> {
        let endpoint = stream.endpoint();
        let plain_http = matches!(endpoint.scheme(), Scheme::Http | Scheme::Https);
        if self.config.streaming_convert
            && plain_http
            && stream.credentials().is_none()
            && stream.stages().is_empty()
        {
            Some(endpoint.url().clone())
        } else {
            None
        }
    }

    fn copy_direct(&self, stream: &mut DataStream, dest: &Path) -> Result<u64, ImportError> {
        if is_block_device(dest) {
            debug!(dest = %dest.display(), "Writing block device in place");
            let mut device = OpenOptions::new()
                .write(true)
                .open(dest)
                .map_err(|e| ImportError::io(format!("opening {}", dest.display()), e))?;
            let written = self.write_stream(stream, &mut device)?;
            device
                .sync_all()
                .map_err(|e| ImportError::io(format!("syncing {}", dest.display()), e))?;
            return Ok(written);
        }

        let tmp = random_tmp_name(dest);
        let mut file = create_tracked(stream, &tmp)?;
        let written = self.write_stream(stream, &mut file)?;
        file.sync_all()
            .map_err(|e| ImportError::io(format!("syncing {}", tmp.display()), e))?;
        drop(file);
        commit(stream, &tmp, dest)?;
        info!(dest = %dest.display(), bytes = written, "Copied image");
        Ok(written)
    }

    fn convert_buffered(&self, stream: &mut DataStream, dest: &Path) -> Result<u64, ImportError> {
        let scratch_dir = self
            .config
            .scratch_dir
            .clone()
            .unwrap_or_else(|| parent_dir(dest));
        let scratch = random_tmp_name(&scratch_dir.join("source.qcow2"));

        let mut file = create_tracked(stream, &scratch)?;
        let buffered = self.write_stream(stream, &mut file)?;
        drop(file);
        debug!(scratch = %scratch.display(), bytes = buffered, "Buffered source for conversion");

        let result = self.convert_into(dest, |target| self.converter.convert(&scratch, target));

        // The scratch copy is never needed past this point
        match fs::remove_file(&scratch) {
            Ok(()) => stream.closer_mut().release_scratch(&scratch),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                stream.closer_mut().release_scratch(&scratch)
            }
            Err(e) => warn!(scratch = %scratch.display(), error = %e, "Failed to remove scratch file"),
        }

        let written = result?;
        info!(dest = %dest.display(), bytes = written, "Converted image");
        Ok(written)
    }

    fn convert_streamed(&self, url: &Url, dest: &Path) -> Result<u64, ImportError> {
        let written = self.convert_into(dest, |target| self.converter.convert_stream(url, target))?;
        info!(dest = %dest.display(), bytes = written, "Converted streamed image");
        Ok(written)
    }

    /// Run `convert` into a staged target, validate it, and move it into place.
    fn convert_into<F>(&self, dest: &Path, convert: F) -> Result<u64, ImportError>
    where
        F: FnOnce(&Path) -> Result<(), ConverterError>,
    {
        let in_place = is_block_device(dest);
        let target = if in_place {
            dest.to_path_buf()
        } else {
            random_tmp_name(dest)
        };

        let result = convert(&target)
            .map_err(ImportError::Convert)
            .and_then(|()| {
                self.converter
                    .validate(&target, &self.config.target_format)
                    .map_err(ImportError::Validate)
            })
            .and_then(|()| {
                let len = fs::metadata(&target)
                    .map(|m| m.len())
                    .map_err(|e| ImportError::io(format!("inspecting {}", target.display()), e))?;
                if !in_place {
                    fs::rename(&target, dest).map_err(|e| {
                        ImportError::io(format!("renaming into {}", dest.display()), e)
                    })?;
                }
                Ok(len)
            });

        if result.is_err() && !in_place {
            if let Err(e) = fs::remove_file(&target) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %target.display(), error = %e, "Failed to remove staged image");
                }
            }
        }
        result
    }

    /// Copy the whole stream into `out`, classifying read and write failures.
    fn write_stream<W: Write>(
        &self,
        stream: &mut DataStream,
        out: &mut W,
    ) -> Result<u64, ImportError> {
        let mut buf = vec![0u8; self.config.copy_buffer_size.max(4096)];
        let mut total = 0u64;
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ImportError::from_chain_read("reading source", e)),
            };
            out.write_all(&buf[..n])
                .map_err(|e| ImportError::io("writing destination", e))?;
            total += n as u64;
        }
        out.flush()
            .map_err(|e| ImportError::io("flushing destination", e))?;
        Ok(total)
    }
}

/// Create `path` and register it with the stream's closer.
fn create_tracked(stream: &mut DataStream, path: &Path) -> Result<File, ImportError> {
    let file = File::create(path)
        .map_err(|e| ImportError::io(format!("creating {}", path.display()), e))?;
    stream.closer_mut().track_scratch(path.to_path_buf());
    Ok(file)
}

fn commit(stream: &mut DataStream, tmp: &Path, dest: &Path) -> Result<(), ImportError> {
    fs::rename(tmp, dest)
        .map_err(|e| ImportError::io(format!("renaming into {}", dest.display()), e))?;
    stream.closer_mut().release_scratch(tmp);
    Ok(())
}

/// Sibling of `path` with a random hex suffix.
pub fn random_tmp_name(path: &Path) -> PathBuf {
    let suffix = hex::encode(rand::random::<[u8; 8]>());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    parent_dir(path).join(format!("{name}.{suffix}"))
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn is_block_device(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::converter::{ConverterCall, ScriptedConverter};
    use crate::endpoint::{Credentials, Endpoint};

    fn qcow2_bytes() -> Vec<u8> {
        let mut image = b"QFI\xfb\x00\x00\x00\x03".to_vec();
        image.resize(8192, 0xab);
        image
    }

    fn stream_over(endpoint: &str, creds: Option<Credentials>, bytes: Vec<u8>) -> DataStream {
        DataStream::from_source(
            Endpoint::parse(endpoint).unwrap(),
            creds,
            Box::new(Cursor::new(bytes)),
            4,
        )
        .unwrap()
    }

    fn leftovers(dir: &Path, dest: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p != dest)
            .collect()
    }

    #[test]
    fn test_random_tmp_name() {
        let a = random_tmp_name(Path::new("/data/disk.img"));
        let b = random_tmp_name(Path::new("/data/disk.img"));
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(Path::new("/data")));
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("disk.img."));
        assert_eq!(name.len(), "disk.img.".len() + 16);
    }

    #[test]
    fn test_direct_copy() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("disk.img");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 256) as u8).collect();
        let mut stream = stream_over("file:///images/raw.img", None, data.clone());

        let converter = ScriptedConverter::new();
        let config = ImporterConfig {
            copy_buffer_size: 4096,
            ..ImporterConfig::default()
        };
        let outcome = Copier::new(&converter, &config)
            .copy(&mut stream, &dest)
            .unwrap();
        stream.close().unwrap();

        assert_eq!(outcome.mode, CopyMode::Direct);
        assert_eq!(outcome.bytes_written, data.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), data);
        assert!(leftovers(dir.path(), &dest).is_empty());
        assert!(converter.calls().is_empty());
    }

    #[test]
    fn test_convert_path_calls_convert_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("disk.img");
        let mut stream = stream_over("file:///images/cirros.img", None, qcow2_bytes());

        let converter = ScriptedConverter::new();
        let config = ImporterConfig::default();
        let outcome = Copier::new(&converter, &config)
            .copy(&mut stream, &dest)
            .unwrap();
        stream.close().unwrap();

        assert_eq!(outcome.mode, CopyMode::Converted);
        let calls = converter.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], ConverterCall::Convert { .. }));
        assert!(matches!(&calls[1], ConverterCall::Validate { format, .. } if format == "raw"));
        assert_eq!(fs::read(&dest).unwrap(), qcow2_bytes());
        assert!(leftovers(dir.path(), &dest).is_empty());
    }

    #[test]
    fn test_failed_validation_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("disk.img");
        let mut stream = stream_over("file:///images/cirros.img", None, qcow2_bytes());

        let converter = ScriptedConverter::new().failing_validate("not raw");
        let config = ImporterConfig::default();
        let err = Copier::new(&converter, &config)
            .copy(&mut stream, &dest)
            .unwrap_err();
        stream.close().unwrap();

        assert_eq!(err.reason_code(), "validate_error");
        assert!(!dest.exists());
        assert!(leftovers(dir.path(), &dest).is_empty());
    }

    #[test]
    fn test_failed_convert_skips_validate_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let dest = dir.path().join("disk.img");
        let mut stream = stream_over("file:///images/cirros.img", None, qcow2_bytes());

        let converter = ScriptedConverter::new().failing_convert("unsupported image");
        let config = ImporterConfig {
            scratch_dir: Some(scratch.path().to_path_buf()),
            ..ImporterConfig::default()
        };
        let err = Copier::new(&converter, &config)
            .copy(&mut stream, &dest)
            .unwrap_err();

        // Scratch is gone before teardown runs
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
        stream.close().unwrap();

        assert_eq!(err.reason_code(), "convert_error");
        let calls = converter.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], ConverterCall::Convert { .. }));
        assert!(!dest.exists());
        assert!(leftovers(dir.path(), &dest).is_empty());
    }

    #[test]
    fn test_failed_convert_stream_skips_validate_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("disk.img");
        let mut stream = stream_over("https://images.local/cirros.qcow2", None, qcow2_bytes());

        let converter = ScriptedConverter::new().failing_convert_stream("connection reset");
        let config = ImporterConfig::default();
        let err = Copier::new(&converter, &config)
            .copy(&mut stream, &dest)
            .unwrap_err();

        assert_eq!(err.reason_code(), "convert_error");
        let calls = converter.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], ConverterCall::ConvertStream { .. }));
        assert!(!dest.exists());
        assert!(leftovers(dir.path(), &dest).is_empty());
    }

    #[test]
    fn test_convert_disabled_copies_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("disk.img");
        let mut stream = stream_over("file:///images/cirros.img", None, qcow2_bytes());

        let converter = ScriptedConverter::rejecting_all();
        let config = ImporterConfig {
            convert: false,
            ..ImporterConfig::default()
        };
        let outcome = Copier::new(&converter, &config)
            .copy(&mut stream, &dest)
            .unwrap();
        assert_eq!(outcome.mode, CopyMode::Direct);
        assert!(converter.calls().is_empty());
    }

    #[test]
    fn test_streaming_convert_for_plain_http() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("disk.img");
        let mut stream = stream_over("http://images.local/cirros.qcow2", None, qcow2_bytes());

        let converter = ScriptedConverter::new();
        let config = ImporterConfig::default();
        let outcome = Copier::new(&converter, &config)
            .copy(&mut stream, &dest)
            .unwrap();

        assert_eq!(outcome.mode, CopyMode::StreamConverted);
        assert!(stream.is_closed());
        assert!(matches!(
            &converter.calls()[0],
            ConverterCall::ConvertStream { url, .. } if url.as_str() == "http://images.local/cirros.qcow2"
        ));
        assert!(dest.exists());
    }

    #[test]
    fn test_credentials_disable_streaming_convert() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("disk.img");
        let creds = Credentials::new("ak", "sk");
        let mut stream = stream_over("https://images.local/cirros.qcow2", Some(creds), qcow2_bytes());

        let converter = ScriptedConverter::new();
        let config = ImporterConfig::default();
        let outcome = Copier::new(&converter, &config)
            .copy(&mut stream, &dest)
            .unwrap();
        assert_eq!(outcome.mode, CopyMode::Converted);
    }

    #[test]
    fn test_scratch_dir_is_used_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let dest = dir.path().join("disk.img");
        let mut stream = stream_over("file:///images/cirros.img", None, qcow2_bytes());

        let converter = ScriptedConverter::new();
        let config = ImporterConfig {
            scratch_dir: Some(scratch.path().to_path_buf()),
            ..ImporterConfig::default()
        };
        Copier::new(&converter, &config)
            .copy(&mut stream, &dest)
            .unwrap();

        match &converter.calls()[0] {
            ConverterCall::Convert { src, .. } => assert_eq!(src.parent(), Some(scratch.path())),
            other => panic!("unexpected call {other:?}"),
        }
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_read_failure_removes_temp_file() {
        struct Failing(usize);
        impl Read for Failing {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0 == 0 {
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"));
                }
                let n = buf.len().min(self.0);
                buf[..n].fill(0x42);
                self.0 -= n;
                Ok(n)
            }
        }
        impl crate::chain::Closable for Failing {}

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("disk.img");
        let mut stream = DataStream::from_source(
            Endpoint::parse("file:///images/raw.img").unwrap(),
            None,
            Box::new(Failing(10_000)),
            4,
        )
        .unwrap();

        let converter = ScriptedConverter::new();
        let config = ImporterConfig::default();
        let err = Copier::new(&converter, &config)
            .copy(&mut stream, &dest)
            .unwrap_err();
        assert_eq!(err.reason_code(), "io_error");

        // The partial temp file goes away with the stream
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
        stream.close().unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
