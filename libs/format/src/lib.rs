//! # diskport-format
//!
//! Magic-signature detection for the payloads an import can receive.
//!
//! An import source is an opaque byte stream that may be wrapped in any
//! number of compression or archive layers around the actual disk image.
//! This crate only answers the question "what is the outermost layer of
//! this header?". It does no I/O; the importer feeds it the bytes it peeked
//! and decides what to do with the answer.
//!
//! ## Detection order
//!
//! Signatures are matched in a fixed priority order and the first match wins:
//!
//! 1. gzip (`1f 8b 08` at offset 0)
//! 2. xz (`fd 37 7a 58 5a 00` at offset 0)
//! 3. tar (`ustar` at offset 257)
//! 4. qcow2 (`QFI\xfb` at offset 0)
//!
//! Anything else is raw content (a plain ISO or raw disk image).

use std::fmt;

/// Number of header bytes that must be peeked to run every signature check.
///
/// The tar magic lives at offset 257, so one full 512-byte tar header block
/// covers all of them.
pub const MAX_HEADER_LEN: usize = 512;

/// Offset of the `ustar` magic inside a tar header block.
const TAR_MAGIC_OFFSET: usize = 257;

/// Offset of the big-endian virtual size field in a qcow2 header.
const QCOW2_SIZE_OFFSET: usize = 24;

/// Format of the outermost layer of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// gzip-compressed stream.
    Gzip,
    /// xz-compressed stream.
    Xz,
    /// POSIX or GNU tar archive.
    Tar,
    /// qcow2 virtual-disk container; needs conversion before use as a raw block image.
    Qcow2,
    /// Unrecognized content, copied as-is.
    Raw,
}

/// A decode stage that peels one layer off a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Gunzip,
    Unxz,
    Untar,
}

struct Signature {
    format: Format,
    offset: usize,
    magic: &'static [u8],
}

/// Known signatures, in priority order.
const SIGNATURES: &[Signature] = &[
    Signature {
        format: Format::Gzip,
        offset: 0,
        magic: &[0x1f, 0x8b, 0x08],
    },
    Signature {
        format: Format::Xz,
        offset: 0,
        magic: &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00],
    },
    Signature {
        format: Format::Tar,
        offset: TAR_MAGIC_OFFSET,
        magic: b"ustar",
    },
    Signature {
        format: Format::Qcow2,
        offset: 0,
        magic: &[b'Q', b'F', b'I', 0xfb],
    },
];

impl Signature {
    fn matches(&self, header: &[u8]) -> bool {
        header
            .get(self.offset..self.offset + self.magic.len())
            .is_some_and(|bytes| bytes == self.magic)
    }
}

impl Format {
    /// Classify a peeked header.
    ///
    /// `header` may be shorter than [`MAX_HEADER_LEN`] when the stream itself
    /// is short; signatures that would extend past its end simply don't match.
    pub fn sniff(header: &[u8]) -> Format {
        SIGNATURES
            .iter()
            .find(|sig| sig.matches(header))
            .map(|sig| sig.format)
            .unwrap_or(Format::Raw)
    }

    /// The decode stage needed to get past this layer, if any.
    ///
    /// `None` means the payload is final: either raw content or a disk
    /// container that the copier hands to the converter.
    pub fn decode_stage(self) -> Option<Stage> {
        match self {
            Format::Gzip => Some(Stage::Gunzip),
            Format::Xz => Some(Stage::Unxz),
            Format::Tar => Some(Stage::Untar),
            Format::Qcow2 | Format::Raw => None,
        }
    }

    /// Whether this is a disk-container format that must be transcoded to raw.
    pub fn is_disk_container(self) -> bool {
        matches!(self, Format::Qcow2)
    }

    /// Name understood by image tools (`qemu-img -f <name>`).
    pub fn name(self) -> &'static str {
        match self {
            Format::Gzip => "gzip",
            Format::Xz => "xz",
            Format::Tar => "tar",
            Format::Qcow2 => "qcow2",
            Format::Raw => "raw",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Gunzip => "gzip-decode",
            Stage::Unxz => "xz-decode",
            Stage::Untar => "tar-extract",
        };
        f.write_str(name)
    }
}

/// Virtual disk size recorded in a qcow2 header, if `header` is one.
pub fn qcow2_virtual_size(header: &[u8]) -> Option<u64> {
    if Format::sniff(header) != Format::Qcow2 {
        return None;
    }
    let field = header.get(QCOW2_SIZE_OFFSET..QCOW2_SIZE_OFFSET + 8)?;
    Some(u64::from_be_bytes(field.try_into().ok()?))
}
