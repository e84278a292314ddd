//! Streaming extraction of the single disk image inside a tar archive.
//!
//! `tar::Archive` hands out entries that borrow the archive, which doesn't
//! fit a chain where every stage owns its input. This reader walks the
//! header blocks itself (parsing them with `tar::Header`) and exposes the
//! first regular file as a plain `Read`.

use std::io::{self, Read};

use tar::{EntryType, Header, PaxExtensions};

use crate::error::FormatViolation;
use crate::replay::read_full;

const BLOCK_SIZE: u64 = 512;

/// Byte range of the checksum field inside a header block.
const CHECKSUM_RANGE: std::ops::Range<usize> = 148..156;

/// Largest PAX record block accepted.
const MAX_PAX_LEN: u64 = 1024 * 1024;

enum State {
    /// Looking for the first regular file.
    Header,
    /// Streaming the entry's data.
    Entry { remaining: u64, padding: u64 },
    /// Entry done; make sure nothing else meaningful follows.
    Trailer,
    Done,
}

/// `size` and `path` records from PAX extended headers.
#[derive(Debug, Default, Clone)]
struct PaxRecords {
    size: Option<u64>,
    path: Option<String>,
}

impl PaxRecords {
    fn parse(block: &[u8]) -> io::Result<Self> {
        let mut records = Self::default();
        for ext in PaxExtensions::new(block) {
            let ext = ext.map_err(|_| FormatViolation::new("malformed tar PAX record"))?;
            match ext.key() {
                Ok("size") => {
                    let size = ext
                        .value()
                        .ok()
                        .and_then(|v| v.parse::<u64>().ok())
                        .ok_or_else(|| FormatViolation::new("tar PAX size is not a number"))?;
                    records.size = Some(size);
                }
                Ok("path") => records.path = ext.value().ok().map(str::to_string),
                _ => {}
            }
        }
        Ok(records)
    }

    fn merge(&mut self, other: PaxRecords) {
        if other.size.is_some() {
            self.size = other.size;
        }
        if other.path.is_some() {
            self.path = other.path;
        }
    }
}

/// An entry header with PAX overrides applied.
struct EntryMeta {
    kind: EntryType,
    size: u64,
    path: String,
}

/// Reads the one regular file stored in a tar stream.
///
/// Directory and GNU long-name entries are skipped. PAX records override the
/// size and name of the entries they apply to. A second regular file with
/// content is a format error: an import carries exactly one disk image and
/// there is no sound way to pick between several.
pub struct TarEntryReader<R> {
    inner: R,
    state: State,
    entry_name: Option<String>,
    /// Records of the last `x` header, consumed by the next entry.
    local: PaxRecords,
    /// Records of `g` headers, applying to every later entry.
    global: PaxRecords,
}

impl<R: Read> TarEntryReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: State::Header,
            entry_name: None,
            local: PaxRecords::default(),
            global: PaxRecords::default(),
        }
    }

    /// Name of the entry being streamed, once its header has been read.
    pub fn entry_name(&self) -> Option<&str> {
        self.entry_name.as_deref()
    }

    /// Read the next header block. `None` at the end-of-archive marker or EOF.
    fn next_header(&mut self) -> io::Result<Option<Header>> {
        let mut block = [0u8; BLOCK_SIZE as usize];
        let n = read_full(&mut self.inner, &mut block)?;
        if n == 0 {
            return Ok(None);
        }
        if n < block.len() {
            return Err(FormatViolation::new("truncated tar header").into());
        }
        if block.iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let mut header = Header::new_old();
        header.as_mut_bytes().copy_from_slice(&block);
        verify_checksum(&header, &block)?;
        Ok(Some(header))
    }

    fn skip(&mut self, len: u64) -> io::Result<()> {
        let skipped = io::copy(&mut (&mut self.inner).take(len), &mut io::sink())?;
        if skipped != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tar archive ended inside an entry",
            ));
        }
        Ok(())
    }

    fn read_pax(&mut self, size: u64) -> io::Result<PaxRecords> {
        if size > MAX_PAX_LEN {
            return Err(FormatViolation::new("tar PAX header is too large").into());
        }
        let mut block = vec![0u8; size as usize];
        if read_full(&mut self.inner, &mut block)? < block.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tar archive ended inside an entry",
            ));
        }
        self.skip(padding_for(size))?;
        PaxRecords::parse(&block)
    }

    /// Next non-PAX entry, with pending PAX records applied.
    fn next_entry(&mut self) -> io::Result<Option<EntryMeta>> {
        loop {
            let Some(header) = self.next_header()? else {
                return Ok(None);
            };
            let kind = header.entry_type();
            if kind.is_pax_local_extensions() || kind.is_pax_global_extensions() {
                let records = self.read_pax(header.entry_size()?)?;
                if kind.is_pax_global_extensions() {
                    self.global.merge(records);
                } else {
                    self.local = records;
                }
                continue;
            }

            let local = std::mem::take(&mut self.local);
            let size = match local.size.or(self.global.size) {
                Some(size) => size,
                None => header.entry_size()?,
            };
            let path = match local.path.or_else(|| self.global.path.clone()) {
                Some(path) => path,
                None => header.path()?.display().to_string(),
            };
            return Ok(Some(EntryMeta { kind, size, path }));
        }
    }

    fn open_entry(&mut self) -> io::Result<()> {
        loop {
            let entry = self
                .next_entry()?
                .ok_or_else(|| FormatViolation::new("tar archive contains no file entry"))?;

            if is_file(entry.kind) {
                self.entry_name = Some(entry.path);
                self.state = State::Entry {
                    remaining: entry.size,
                    padding: padding_for(entry.size),
                };
                return Ok(());
            }
            if entry.kind.is_gnu_sparse() {
                return Err(FormatViolation::new("sparse tar entries are not supported").into());
            }
            self.skip(entry.size + padding_for(entry.size))?;
        }
    }

    fn check_trailer(&mut self) -> io::Result<()> {
        while let Some(entry) = self.next_entry()? {
            if (is_file(entry.kind) && entry.size > 0) || entry.kind.is_gnu_sparse() {
                return Err(FormatViolation::new(format!(
                    "tar archive holds more than one file ({} and {})",
                    self.entry_name.as_deref().unwrap_or("?"),
                    entry.path
                ))
                .into());
            }
            self.skip(entry.size + padding_for(entry.size))?;
        }
        Ok(())
    }
}

impl<R: Read> Read for TarEntryReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.state {
                State::Header => self.open_entry()?,
                State::Entry { remaining: 0, padding } => {
                    self.skip(padding)?;
                    self.state = State::Trailer;
                }
                State::Entry { remaining, padding } => {
                    if buf.is_empty() {
                        return Ok(0);
                    }
                    let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let n = self.inner.read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "tar entry is truncated",
                        ));
                    }
                    self.state = State::Entry {
                        remaining: remaining - n as u64,
                        padding,
                    };
                    return Ok(n);
                }
                State::Trailer => {
                    self.check_trailer()?;
                    self.state = State::Done;
                }
                State::Done => return Ok(0),
            }
        }
    }
}

fn is_file(kind: EntryType) -> bool {
    kind.is_file() || kind.is_contiguous()
}

fn padding_for(size: u64) -> u64 {
    (BLOCK_SIZE - size % BLOCK_SIZE) % BLOCK_SIZE
}

fn verify_checksum(header: &Header, block: &[u8]) -> io::Result<()> {
    let stored = header
        .cksum()
        .map_err(|_| FormatViolation::new("tar header has an unreadable checksum"))?;
    let computed: u32 = block
        .iter()
        .enumerate()
        .map(|(i, &b)| if CHECKSUM_RANGE.contains(&i) { u32::from(b' ') } else { u32::from(b) })
        .sum();
    if stored != computed {
        return Err(FormatViolation::new("tar header checksum mismatch").into());
    }
    Ok(())
}
