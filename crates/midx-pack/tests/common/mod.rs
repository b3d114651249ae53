//! Shared test helpers: synthetic version-2 pack index builders.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use midx_hash::hasher::Hasher;
use midx_hash::ObjectId;
use midx_pack::{IDX_SIGNATURE, IDX_VERSION};

/// A deterministic, well-spread object id derived from a seed.
pub fn oid(seed: u32) -> ObjectId {
    Hasher::digest(&seed.to_be_bytes()).unwrap()
}

/// Build a version-2 `.idx` image from (id, offset) pairs. Offsets at
/// or past 2^31 spill into the trailing 64-bit table.
pub fn build_idx(entries: &[(ObjectId, u64)]) -> Vec<u8> {
    let mut sorted: Vec<_> = entries.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut buf = Vec::new();
    buf.extend_from_slice(&IDX_SIGNATURE);
    buf.extend_from_slice(&IDX_VERSION.to_be_bytes());

    let mut fanout = [0u32; 256];
    for (oid, _) in &sorted {
        fanout[oid.first_byte() as usize] += 1;
    }
    for i in 1..256 {
        fanout[i] += fanout[i - 1];
    }
    for count in fanout {
        buf.extend_from_slice(&count.to_be_bytes());
    }

    for (oid, _) in &sorted {
        buf.extend_from_slice(oid.as_bytes());
    }
    for _ in &sorted {
        buf.extend_from_slice(&0u32.to_be_bytes()); // CRC32, unused here
    }

    let mut spill = Vec::new();
    for (_, offset) in &sorted {
        if *offset >= 0x8000_0000 {
            let index = (spill.len() / 8) as u32;
            spill.extend_from_slice(&offset.to_be_bytes());
            buf.extend_from_slice(&(0x8000_0000u32 | index).to_be_bytes());
        } else {
            buf.extend_from_slice(&(*offset as u32).to_be_bytes());
        }
    }
    buf.extend_from_slice(&spill);

    buf.extend_from_slice(&[0u8; 20]); // pack checksum (unused)
    let checksum = Hasher::digest(&buf).unwrap();
    buf.extend_from_slice(checksum.as_bytes());
    buf
}

/// Write `<name>.idx` into `dir` and return its path.
pub fn write_idx(dir: &Path, name: &str, entries: &[(ObjectId, u64)]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, build_idx(entries)).unwrap();
    path
}
