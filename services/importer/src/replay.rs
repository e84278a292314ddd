//! Peek support for non-seekable sources.
//!
//! Sniffing needs to look at a header without taking those bytes away from
//! whoever reads the stream next. [`ReplayReader`] owns the bytes that were
//! peeked and serves them first, then falls through to the live source.

use std::io::{self, Read};

/// Serves a captured prefix, then the underlying reader.
pub struct ReplayReader<R> {
    buffer: Vec<u8>,
    pos: usize,
    inner: R,
}

impl<R: Read> ReplayReader<R> {
    /// Wrap `inner`, which has already had `buffer` read out of it.
    pub fn new(buffer: Vec<u8>, inner: R) -> Self {
        Self {
            buffer,
            pos: 0,
            inner,
        }
    }

    /// Bytes not yet replayed.
    pub fn pending(&self) -> &[u8] {
        &self.buffer[self.pos..]
    }
}

impl<R: Read> Read for ReplayReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pending = self.pending();
        if pending.is_empty() {
            return self.inner.read(buf);
        }
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// Read until `buf` is full or the reader hits EOF. Returns the byte count.
///
/// Network bodies and decoders routinely return short reads, so a single
/// `read` call is not enough to fill a header buffer.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that hands out at most `chunk` bytes per call.
    struct Trickle<'a> {
        data: &'a [u8],
        chunk: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.data.len().min(self.chunk).min(buf.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_peek_then_replay_loses_nothing() {
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let mut source = Trickle {
            data: &data,
            chunk: 7,
        };

        let mut header = [0u8; 512];
        let n = read_full(&mut source, &mut header).unwrap();
        assert_eq!(n, 512);

        let mut replay = ReplayReader::new(header[..n].to_vec(), source);
        let mut out = Vec::new();
        replay.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_replay_of_replay() {
        // Two stacked peeks over the same stream still yield every byte once
        let data = b"0123456789abcdef".to_vec();
        let mut first_peek = [0u8; 4];
        let mut source = &data[..];
        let n = read_full(&mut source, &mut first_peek).unwrap();
        let mut outer = ReplayReader::new(first_peek[..n].to_vec(), source);

        let mut second_peek = [0u8; 10];
        let n = read_full(&mut outer, &mut second_peek).unwrap();
        assert_eq!(&second_peek[..n], b"0123456789");
        let mut replay = ReplayReader::new(second_peek[..n].to_vec(), outer);

        let mut out = Vec::new();
        replay.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_short_source() {
        let mut source: &[u8] = b"abc";
        let mut header = [0u8; 512];
        assert_eq!(read_full(&mut source, &mut header).unwrap(), 3);

        let mut replay = ReplayReader::new(header[..3].to_vec(), source);
        assert_eq!(replay.pending(), b"abc");
        let mut small = [0u8; 2];
        assert_eq!(replay.read(&mut small).unwrap(), 2);
        assert_eq!(replay.pending(), b"c");
        let mut rest = Vec::new();
        replay.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"c");
    }
}
