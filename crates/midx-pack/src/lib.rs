//! Multi-pack index (MIDX) reading and writing, plus the caches backing
//! random-access reads over the indexed packfiles.
//!
//! A repository accumulates packfiles faster than it repacks them, and
//! resolving an object by hash would otherwise probe every per-pack
//! index in turn. The multi-pack index merges those indexes into one
//! hash-sorted table producing (packfile, offset) locations. The
//! mapped-window cache bounds the address space and file descriptors
//! spent on the resulting pack reads.

pub mod midx;
pub mod mwindow;
pub mod pack;
pub mod runtime;
pub mod writer;

use std::path::PathBuf;

/// Errors that can occur during multi-pack index and window operations.
#[derive(Debug, thiserror::Error)]
pub enum MidxError {
    #[error("invalid multi-pack-index file - {0}")]
    Parse(String),

    #[error("object not found - {0}")]
    NotFound(String),

    #[error("found multiple offsets for multi-pack index entry {0}")]
    Ambiguous(String),

    #[error("invalid pack: {0}")]
    InvalidPack(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("runtime is already initialized")]
    AlreadyInitialized,

    #[error(transparent)]
    Hash(#[from] midx_hash::HashError),

    #[error(transparent)]
    Util(#[from] midx_utils::UtilError),
}

impl MidxError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// MIDX signature bytes.
pub const MIDX_SIGNATURE: &[u8; 4] = b"MIDX";
/// Supported MIDX format version.
pub const MIDX_VERSION: u8 = 1;
/// Supported object-id version (the 20-byte hash).
pub const MIDX_OID_VERSION: u8 = 1;
/// Canonical file name of the index inside a pack directory.
pub const MIDX_FILE_NAME: &str = "multi-pack-index";
/// File mode of a committed index.
pub const MIDX_FILE_MODE: u32 = 0o644;

/// Size of the MIDX header.
pub const MIDX_HEADER_SIZE: usize = 12;
/// Size of one chunk lookup table entry (4-byte id + 8-byte offset).
pub const MIDX_CHUNK_ENTRY_SIZE: usize = 12;

/// Chunk IDs used in MIDX files.
pub const CHUNK_PACK_NAMES: u32 = 0x504e_414d; // "PNAM"
pub const CHUNK_OID_FANOUT: u32 = 0x4f49_4446; // "OIDF"
pub const CHUNK_OID_LOOKUP: u32 = 0x4f49_444c; // "OIDL"
pub const CHUNK_OBJECT_OFFSETS: u32 = 0x4f4f_4646; // "OOFF"
pub const CHUNK_LARGE_OFFSETS: u32 = 0x4c4f_4646; // "LOFF"

/// Pack index v2 constants (per-pack `.idx` enumeration).
pub const IDX_SIGNATURE: [u8; 4] = [0xff, 0x74, 0x4f, 0x63]; // "\377tOc"
pub const IDX_VERSION: u32 = 2;
