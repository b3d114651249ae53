//! Multi-pack index writer.
//!
//! Aggregates the entries of a set of packs into the canonical chunked
//! image, deterministically: packs are ordered by name, entries by
//! hash, and a hash appearing in several packs keeps its first holder.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use midx_hash::fanout::FanoutTable;
use midx_hash::hasher::Hasher;
use midx_hash::ObjectId;
use midx_utils::atomic::write_buffer_atomic;

use crate::pack::{self, PackHandle};
use crate::{
    MidxError, CHUNK_LARGE_OFFSETS, CHUNK_OBJECT_OFFSETS, CHUNK_OID_FANOUT, CHUNK_OID_LOOKUP,
    CHUNK_PACK_NAMES, MIDX_CHUNK_ENTRY_SIZE, MIDX_FILE_MODE, MIDX_FILE_NAME, MIDX_HEADER_SIZE,
    MIDX_OID_VERSION, MIDX_SIGNATURE, MIDX_VERSION,
};

/// Accumulates packs and writes `multi-pack-index` for a pack directory.
///
/// Each added pack is held through the pack cache until the writer is
/// dropped.
pub struct MidxWriter {
    pack_dir: PathBuf,
    packs: Vec<Arc<PackHandle>>,
}

struct WriterEntry {
    oid: ObjectId,
    offset: u64,
    pack_index: u32,
}

impl MidxWriter {
    /// Create a writer for `pack_dir`. The directory must exist.
    pub fn new(pack_dir: impl AsRef<Path>) -> Result<Self, MidxError> {
        let pack_dir = pack_dir.as_ref();
        let pack_dir = std::fs::canonicalize(pack_dir).map_err(|e| MidxError::io(pack_dir, e))?;
        Ok(Self {
            pack_dir,
            packs: Vec::new(),
        })
    }

    /// Add one pack by the path of its `.idx` file, resolved relative
    /// to the pack directory.
    pub fn add(&mut self, idx_path: impl AsRef<Path>) -> Result<(), MidxError> {
        let idx_path = idx_path.as_ref();
        let resolved = if idx_path.is_absolute() {
            idx_path.to_path_buf()
        } else {
            self.pack_dir.join(idx_path)
        };
        let handle = pack::get_pack(resolved)?;
        self.packs.push(handle);
        Ok(())
    }

    /// Number of packs added so far.
    pub fn num_packs(&self) -> usize {
        self.packs.len()
    }

    /// The canonicalized pack directory.
    pub fn pack_dir(&self) -> &Path {
        &self.pack_dir
    }

    /// Produce the complete index image.
    ///
    /// Output is byte-deterministic for a given set of packs, whatever
    /// the order they were added in.
    pub fn dump(&self) -> Result<Vec<u8>, MidxError> {
        let mut packs: Vec<&Arc<PackHandle>> = self.packs.iter().collect();
        packs.sort_by(|a, b| a.name().cmp(b.name()));

        let mut packfile_names: Vec<u8> = Vec::new();
        let mut entries: Vec<WriterEntry> = Vec::new();
        for (pack_index, p) in packs.iter().enumerate() {
            let name = self.chunk_name(p.name())?;
            packfile_names.extend_from_slice(&name);
            packfile_names.push(0);

            p.foreach_entry(&mut |oid, offset| {
                entries.push(WriterEntry {
                    oid: *oid,
                    offset,
                    pack_index: pack_index as u32,
                });
                Ok(())
            })?;
        }

        // Pad the packfile names to a multiple of four.
        while packfile_names.len() % 4 != 0 {
            packfile_names.push(0);
        }

        // A hash present in several packs keeps the entry of the
        // first-sorting pack; the total order keeps the image stable.
        entries.sort_by(|a, b| {
            a.oid
                .cmp(&b.oid)
                .then(a.pack_index.cmp(&b.pack_index))
                .then(a.offset.cmp(&b.offset))
        });
        entries.dedup_by(|second, first| second.oid == first.oid);

        let fanout =
            FanoutTable::from_first_bytes(entries.iter().map(|e| e.oid.first_byte()));
        let fanout_bytes = fanout.to_bytes();

        let mut oid_lookup = Vec::with_capacity(entries.len() * ObjectId::RAW_SIZE);
        for e in &entries {
            oid_lookup.extend_from_slice(e.oid.as_bytes());
        }

        // Object offsets, spilling 2^31-and-up into the large table.
        let mut object_offsets = Vec::with_capacity(entries.len() * 8);
        let mut large_offsets = Vec::new();
        for e in &entries {
            object_offsets.extend_from_slice(&e.pack_index.to_be_bytes());
            let word = if e.offset >= 0x8000_0000 {
                let index = (large_offsets.len() / 8) as u32;
                large_offsets.extend_from_slice(&e.offset.to_be_bytes());
                0x8000_0000 | index
            } else {
                e.offset as u32 & 0x7fff_ffff
            };
            object_offsets.extend_from_slice(&word.to_be_bytes());
        }

        let mut chunks: Vec<(u32, &[u8])> = vec![
            (CHUNK_PACK_NAMES, &packfile_names),
            (CHUNK_OID_FANOUT, &fanout_bytes),
            (CHUNK_OID_LOOKUP, &oid_lookup),
            (CHUNK_OBJECT_OFFSETS, &object_offsets),
        ];
        if !large_offsets.is_empty() {
            chunks.push((CHUNK_LARGE_OFFSETS, &large_offsets));
        }

        let mut image = Vec::new();
        image.extend_from_slice(MIDX_SIGNATURE);
        image.push(MIDX_VERSION);
        image.push(MIDX_OID_VERSION);
        image.push(chunks.len() as u8);
        image.push(0); // no base index files
        image.extend_from_slice(&(packs.len() as u32).to_be_bytes());

        // Chunk table offsets accumulate in physical order, terminated
        // by a zero entry pointing at the trailer.
        let mut offset = (MIDX_HEADER_SIZE + (chunks.len() + 1) * MIDX_CHUNK_ENTRY_SIZE) as u64;
        for (id, data) in &chunks {
            image.extend_from_slice(&id.to_be_bytes());
            image.extend_from_slice(&offset.to_be_bytes());
            offset += data.len() as u64;
        }
        image.extend_from_slice(&0u32.to_be_bytes());
        image.extend_from_slice(&offset.to_be_bytes());

        for (_, data) in &chunks {
            image.extend_from_slice(data);
        }

        let checksum = Hasher::digest(&image)?;
        image.extend_from_slice(checksum.as_bytes());
        Ok(image)
    }

    /// Write `pack_dir/multi-pack-index` atomically, mode 0644.
    pub fn commit(&self) -> Result<(), MidxError> {
        let image = self.dump()?;
        let target = self.pack_dir.join(MIDX_FILE_NAME);
        write_buffer_atomic(&target, &image, MIDX_FILE_MODE)?;
        Ok(())
    }

    /// The `.idx` name a pack gets inside the PNAM chunk: its path
    /// relative to the pack directory with the `.pack` suffix swapped.
    fn chunk_name(&self, pack_path: &Path) -> Result<Vec<u8>, MidxError> {
        let rel = pack_path.strip_prefix(&self.pack_dir).map_err(|_| {
            MidxError::InvalidPack(format!(
                "packfile '{}' is outside the pack directory",
                pack_path.display()
            ))
        })?;
        let rel = rel.as_os_str().as_encoded_bytes();
        if rel.iter().any(|&b| b == b'/' || b == b'\\') {
            return Err(MidxError::InvalidPack(format!(
                "packfile '{}' is not directly inside the pack directory",
                pack_path.display()
            )));
        }
        let stem = rel.strip_suffix(b".pack").filter(|s| !s.is_empty()).ok_or_else(|| {
            MidxError::InvalidPack(format!(
                "packfile '{}' does not end in .pack",
                pack_path.display()
            ))
        })?;

        let mut name = stem.to_vec();
        name.extend_from_slice(b".idx");
        Ok(name)
    }
}

impl Drop for MidxWriter {
    fn drop(&mut self) {
        for handle in self.packs.drain(..) {
            pack::put_pack(handle);
        }
    }
}
