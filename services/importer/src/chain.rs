//! The decode chain of one import attempt.
//!
//! A [`DataStream`] starts from the raw byte source the resolver opened and
//! grows one link at a time:
//!
//! ```text
//! [base, replay]                                  raw or qcow2 payload
//! [base, replay, xz-decode, replay]               .xz
//! [base, replay, xz-decode, replay, tar-extract, replay]   .tar.xz
//! ```
//!
//! Every sniff round peeks a header and leaves a replay link behind so the
//! peeked bytes are still delivered downstream. Reading the finished stream
//! yields exactly the decoded payload.

use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use diskport_format::{Format, Stage, MAX_HEADER_LEN};
use flate2::read::MultiGzDecoder;
use tracing::{debug, warn};
use xz2::read::XzDecoder;

use crate::closer::Closer;
use crate::endpoint::{Credentials, Endpoint};
use crate::error::ImportError;
use crate::replay::{read_full, ReplayReader};
use crate::resolver::Resolver;
use crate::tar_entry::TarEntryReader;

/// A sequential byte source that can be explicitly closed.
///
/// Dropping a source releases it as well; `close` exists for sources whose
/// teardown can fail in a way worth reporting (a socket shutdown, say).
pub trait Closable: Read {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Closable for File {}

impl Closable for reqwest::blocking::Response {}

impl Closable for Cursor<Vec<u8>> {}

impl Closable for UnixStream {
    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl<R: Read> Closable for ReplayReader<R> {}

impl<R: Read> Closable for MultiGzDecoder<R> {}

impl<R: Read> Closable for XzDecoder<R> {}

impl<R: Read> Closable for TarEntryReader<R> {}

/// What a chain link does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// The raw source from the resolver.
    Base,
    /// Replays bytes peeked for sniffing.
    Replay,
    Gunzip,
    Unxz,
    Untar,
}

impl From<Stage> for LinkKind {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Gunzip => LinkKind::Gunzip,
            Stage::Unxz => LinkKind::Unxz,
            Stage::Untar => LinkKind::Untar,
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkKind::Base => "base",
            LinkKind::Replay => "replay",
            LinkKind::Gunzip => "gzip-decode",
            LinkKind::Unxz => "xz-decode",
            LinkKind::Untar => "tar-extract",
        };
        f.write_str(name)
    }
}

/// Shared handle to one stage's reader.
///
/// The next stage reads through a clone of the handle while the chain link
/// keeps another, so the closer can shut a stage down without unwinding the
/// stages stacked on top of it. Reading a closed handle is an error.
#[derive(Clone)]
pub struct LinkHandle(Rc<RefCell<Option<Box<dyn Closable>>>>);

impl LinkHandle {
    fn new(reader: Box<dyn Closable>) -> Self {
        Self(Rc::new(RefCell::new(Some(reader))))
    }

    fn close(&self) -> io::Result<()> {
        // Take the reader out first so a failing close still drops it
        let reader = self.0.borrow_mut().take();
        match reader {
            Some(mut reader) => reader.close(),
            None => Ok(()),
        }
    }
}

impl Read for LinkHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.borrow_mut().as_mut() {
            Some(reader) => reader.read(buf),
            None => Err(io::Error::other("chain link is closed")),
        }
    }
}

/// One stage of the decode chain.
pub struct ChainLink {
    kind: LinkKind,
    handle: LinkHandle,
}

impl ChainLink {
    pub fn new(kind: LinkKind, reader: Box<dyn Closable>) -> Self {
        Self {
            kind,
            handle: LinkHandle::new(reader),
        }
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub(crate) fn close(&self) -> io::Result<()> {
        self.handle.close()
    }
}

/// States of the sniff loop.
enum BuildState {
    Sniff,
    Decompress(Stage),
    Extract,
    Done,
}

/// The byte stream of one import attempt.
///
/// Created per attempt, grown only while the chain is built, and torn down
/// exactly once by [`DataStream::close`] (or on drop).
pub struct DataStream {
    endpoint: Endpoint,
    credentials: Option<Credentials>,
    peek: Box<[u8; MAX_HEADER_LEN]>,
    top: LinkHandle,
    closer: Closer,
    stages: Vec<Stage>,
    format: Format,
}

impl DataStream {
    /// Resolve `endpoint` and build the decode chain over it.
    pub fn open(
        endpoint: Endpoint,
        credentials: Option<Credentials>,
        resolver: &Resolver,
        max_depth: usize,
    ) -> Result<Self, ImportError> {
        let source = resolver.open(&endpoint, credentials.as_ref())?;
        Self::from_source(endpoint, credentials, source, max_depth)
    }

    /// Build the decode chain over an already opened source.
    ///
    /// On failure every link constructed so far is closed before returning.
    pub fn from_source(
        endpoint: Endpoint,
        credentials: Option<Credentials>,
        source: Box<dyn Closable>,
        max_depth: usize,
    ) -> Result<Self, ImportError> {
        Self::assemble(endpoint, credentials, source, |stream| stream.build(max_depth))
    }

    /// Unwrap exactly one tar layer and yield the entry's bytes untouched.
    ///
    /// The entry is sniffed for reporting only: whatever it looks like, it is
    /// never decoded further.
    pub fn from_archive(endpoint: Endpoint, source: Box<dyn Closable>) -> Result<Self, ImportError> {
        Self::assemble(endpoint, None, source, Self::build_archive)
    }

    fn assemble<F>(
        endpoint: Endpoint,
        credentials: Option<Credentials>,
        source: Box<dyn Closable>,
        build: F,
    ) -> Result<Self, ImportError>
    where
        F: FnOnce(&mut Self) -> Result<(), ImportError>,
    {
        let base = ChainLink::new(LinkKind::Base, source);
        let mut closer = Closer::new();
        let top = base.handle.clone();
        closer.push_link(base);

        let mut stream = Self {
            endpoint,
            credentials,
            peek: Box::new([0u8; MAX_HEADER_LEN]),
            top,
            closer,
            stages: Vec::new(),
            format: Format::Raw,
        };

        if let Err(e) = build(&mut stream) {
            if let Err(close_err) = stream.closer.close() {
                warn!(error = %close_err, "Failed to close partially built chain");
            }
            return Err(e);
        }
        Ok(stream)
    }

    fn build(&mut self, max_depth: usize) -> Result<(), ImportError> {
        let mut state = BuildState::Sniff;
        loop {
            state = match state {
                BuildState::Sniff => {
                    let format = self.sniff()?;
                    match format.decode_stage() {
                        Some(_) if self.stages.len() >= max_depth => {
                            return Err(ImportError::Format(format!(
                                "payload nests more than {max_depth} layers (next layer: {format})"
                            )));
                        }
                        Some(Stage::Untar) => BuildState::Extract,
                        Some(stage) => BuildState::Decompress(stage),
                        None => {
                            self.format = format;
                            BuildState::Done
                        }
                    }
                }
                BuildState::Decompress(stage) => {
                    self.push_stage(stage);
                    BuildState::Sniff
                }
                BuildState::Extract => {
                    self.push_stage(Stage::Untar);
                    BuildState::Sniff
                }
                BuildState::Done => {
                    debug!(
                        endpoint = %self.endpoint,
                        format = %self.format,
                        links = self.closer.link_kinds().len(),
                        "Decode chain built"
                    );
                    return Ok(());
                }
            };
        }
    }

    fn build_archive(&mut self) -> Result<(), ImportError> {
        let format = self.sniff()?;
        if format != Format::Tar {
            return Err(ImportError::Format(format!(
                "expected a tar archive, found {format}"
            )));
        }
        self.push_stage(Stage::Untar);
        self.format = self.sniff()?;
        debug!(
            endpoint = %self.endpoint,
            format = %self.format,
            "Archive entry opened without further decoding"
        );
        Ok(())
    }

    /// Peek a header off the current top of the chain, leave a replay link
    /// behind, and classify the header.
    fn sniff(&mut self) -> Result<Format, ImportError> {
        let depth = self.stages.len();
        let n = read_full(&mut self.top, &mut self.peek[..]).map_err(|e| {
            if depth == 0 {
                ImportError::io("reading source header", e)
            } else {
                ImportError::Format(format!(
                    "cannot decode {} layer: {e}",
                    self.stages[depth - 1]
                ))
            }
        })?;

        let header = &self.peek[..n];
        let format = Format::sniff(header);
        debug!(depth, header_len = n, format = %format, "Sniffed header");
        if let Some(size) = diskport_format::qcow2_virtual_size(header) {
            debug!(virtual_size = size, "qcow2 header found");
        }

        let replay = ReplayReader::new(header.to_vec(), self.top.clone());
        self.push(LinkKind::Replay, Box::new(replay));
        Ok(format)
    }

    fn push_stage(&mut self, stage: Stage) {
        let input = self.top.clone();
        let reader: Box<dyn Closable> = match stage {
            Stage::Gunzip => Box::new(MultiGzDecoder::new(input)),
            Stage::Unxz => Box::new(XzDecoder::new_multi_decoder(input)),
            Stage::Untar => Box::new(TarEntryReader::new(input)),
        };
        debug!(stage = %stage, depth = self.stages.len() + 1, "Adding decode stage");
        self.push(stage.into(), reader);
        self.stages.push(stage);
    }

    fn push(&mut self, kind: LinkKind, reader: Box<dyn Closable>) {
        let link = ChainLink::new(kind, reader);
        self.top = link.handle.clone();
        self.closer.push_link(link);
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Format of the payload the chain yields. Raw or a disk container unless
    /// the chain was built with [`DataStream::from_archive`].
    pub fn format(&self) -> Format {
        self.format
    }

    /// Decode stages in the order they were applied.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Kinds of all chain links, in construction order.
    pub fn links(&self) -> Vec<LinkKind> {
        self.closer.link_kinds()
    }

    pub(crate) fn closer_mut(&mut self) -> &mut Closer {
        &mut self.closer
    }

    /// Tear down the chain and any registered scratch files.
    ///
    /// Returns the first failure. Safe to call more than once.
    pub fn close(&mut self) -> io::Result<()> {
        self.closer.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }
}

impl Read for DataStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.top.read(buf)
    }
}

impl Drop for DataStream {
    fn drop(&mut self) {
        if let Err(e) = self.closer.close() {
            warn!(endpoint = %self.endpoint, error = %e, "Failed to close import chain on drop");
        }
    }
}

impl fmt::Debug for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStream")
            .field("endpoint", &self.endpoint)
            .field("format", &self.format)
            .field("links", &self.links())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use xz2::write::XzEncoder;

    fn endpoint() -> Endpoint {
        Endpoint::parse("file:///images/test.img").unwrap()
    }

    fn open(bytes: Vec<u8>, max_depth: usize) -> Result<DataStream, ImportError> {
        DataStream::from_source(endpoint(), None, Box::new(Cursor::new(bytes)), max_depth)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 253) as u8).collect()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn xz(data: &[u8]) -> Vec<u8> {
        let mut enc = XzEncoder::new(Vec::new(), 1);
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn tar(name: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, data).unwrap();
        builder.into_inner().unwrap()
    }

    fn drain(stream: &mut DataStream) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_raw_payload_has_two_links() {
        let data = payload(10_000);
        let mut stream = open(data.clone(), 4).unwrap();
        assert_eq!(stream.links(), vec![LinkKind::Base, LinkKind::Replay]);
        assert_eq!(stream.format(), Format::Raw);
        assert_eq!(drain(&mut stream), data);
    }

    #[test]
    fn test_gzip_payload() {
        let data = payload(100_000);
        let mut stream = open(gzip(&data), 4).unwrap();
        assert_eq!(
            stream.links(),
            vec![
                LinkKind::Base,
                LinkKind::Replay,
                LinkKind::Gunzip,
                LinkKind::Replay
            ]
        );
        assert_eq!(drain(&mut stream), data);
    }

    #[test]
    fn test_tar_xz_payload() {
        let data = payload(300_000);
        let mut stream = open(xz(&tar("tinyCore.iso", &data)), 4).unwrap();
        assert_eq!(stream.stages(), &[Stage::Unxz, Stage::Untar]);
        assert_eq!(stream.links().len(), 6);
        assert_eq!(drain(&mut stream), data);
    }

    #[test]
    fn test_compressed_qcow2_is_detected_after_decoding() {
        let mut image = b"QFI\xfb\x00\x00\x00\x03".to_vec();
        image.extend(payload(4096));
        let mut stream = open(gzip(&tar("disk.qcow2", &image)), 4).unwrap();
        assert_eq!(stream.format(), Format::Qcow2);
        assert_eq!(stream.stages(), &[Stage::Gunzip, Stage::Untar]);
        assert_eq!(drain(&mut stream), image);
    }

    #[test]
    fn test_tiny_payload_shorter_than_header() {
        let mut stream = open(b"tiny".to_vec(), 4).unwrap();
        assert_eq!(drain(&mut stream), b"tiny");

        let mut stream = open(Vec::new(), 4).unwrap();
        assert!(drain(&mut stream).is_empty());
    }

    #[test]
    fn test_nesting_bound() {
        let mut data = payload(1000);
        for _ in 0..10 {
            data = gzip(&data);
        }
        let err = open(data, 3).unwrap_err();
        assert!(matches!(err, ImportError::Format(msg) if msg.contains("more than 3 layers")));
    }

    #[test]
    fn test_corrupt_layer_is_format_error() {
        let mut data = gzip(&payload(10_000));
        // Break the deflate stream right after the header
        for b in data.iter_mut().skip(10).take(64) {
            *b = 0xff;
        }
        let err = open(data, 4).unwrap_err();
        assert_eq!(err.reason_code(), "format_error");
    }

    /// Source that counts how often it was closed.
    struct CountingSource {
        inner: Cursor<Vec<u8>>,
        closes: Rc<std::cell::Cell<usize>>,
    }

    impl Read for CountingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Closable for CountingSource {
        fn close(&mut self) -> io::Result<()> {
            self.closes.set(self.closes.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn test_failed_build_closes_base_once() {
        let mut data = gzip(&payload(10_000));
        for b in data.iter_mut().skip(10).take(64) {
            *b = 0xff;
        }
        let closes = Rc::new(std::cell::Cell::new(0));
        let source = CountingSource {
            inner: Cursor::new(data),
            closes: Rc::clone(&closes),
        };

        let err = DataStream::from_source(endpoint(), None, Box::new(source), 4).unwrap_err();
        assert_eq!(err.reason_code(), "format_error");
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn test_archive_entry_is_not_decoded() {
        let image = gzip(&payload(4096));
        let mut stream =
            DataStream::from_archive(endpoint(), Box::new(Cursor::new(tar("disk.img", &image))))
                .unwrap();
        assert_eq!(
            stream.links(),
            vec![
                LinkKind::Base,
                LinkKind::Replay,
                LinkKind::Untar,
                LinkKind::Replay
            ]
        );
        assert_eq!(stream.format(), Format::Gzip);
        assert_eq!(drain(&mut stream), image);
    }

    #[test]
    fn test_archive_requires_tar() {
        let closes = Rc::new(std::cell::Cell::new(0));
        let source = CountingSource {
            inner: Cursor::new(payload(2048)),
            closes: Rc::clone(&closes),
        };
        let err = DataStream::from_archive(endpoint(), Box::new(source)).unwrap_err();
        assert!(matches!(err, ImportError::Format(msg) if msg.contains("expected a tar archive")));
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn test_close_twice() {
        let mut stream = open(gzip(&payload(5000)), 4).unwrap();
        stream.close().unwrap();
        assert!(stream.is_closed());
        stream.close().unwrap();

        // Reading a torn-down chain fails instead of yielding stale bytes
        assert!(stream.read(&mut [0u8; 16]).is_err());
    }
}
