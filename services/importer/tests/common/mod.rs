//! Fixture builders shared by the integration tests.

#![allow(dead_code)]

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use xz2::write::XzEncoder;

/// Deterministic pseudo-random payload that does not start with any magic.
pub fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8 | 0x80
        })
        .collect()
}

/// Minimal qcow2 image: a v3 header followed by filler.
pub fn qcow2_image(virtual_size: u64, len: usize) -> Vec<u8> {
    let mut image = Vec::with_capacity(len.max(32));
    image.extend_from_slice(b"QFI\xfb");
    image.extend_from_slice(&3u32.to_be_bytes());
    image.extend_from_slice(&[0u8; 16]);
    image.extend_from_slice(&virtual_size.to_be_bytes());
    image.resize(len.max(32), 0);
    image
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub fn xz(data: &[u8]) -> Vec<u8> {
    let mut enc = XzEncoder::new(Vec::new(), 6);
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Tar archive holding the given regular files.
pub fn tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}
