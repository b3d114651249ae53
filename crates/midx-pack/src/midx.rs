//! Multi-pack index (MIDX) reading and lookup.
//!
//! The MIDX aggregates the indexes of many packfiles into one
//! hash-sorted table. Format:
//!
//! ```text
//! Header: MIDX (4) | version (1) | OID version (1) | chunks (1) | base files (1) | num_packs (4)
//! Chunk lookup table: [chunk_id (4) | offset (8)] × chunks, then a zero terminator entry
//! Chunks, in file order:
//!   PNAM: NUL-terminated `.idx` names, sorted, NUL-padded to 4 bytes
//!   OIDF: 256 × 4-byte cumulative counts by first hash byte
//!   OIDL: N × 20-byte sorted object ids
//!   OOFF: N × (pack index: 4, offset: 4; high offset bit selects LOFF)
//!   LOFF: 8-byte offsets for entries at or past 2^31 (optional)
//! Trailer: 20-byte hash of everything before it
//! ```
//!
//! The file is untrusted input: every invariant is checked before any
//! chunk is exposed, and the trailer checksum is verified first.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bstr::{BStr, BString, ByteSlice};
use memmap2::Mmap;
use midx_hash::hasher::Hasher;
use midx_hash::ObjectId;
use midx_utils::binread;

use crate::{
    MidxError, CHUNK_LARGE_OFFSETS, CHUNK_OBJECT_OFFSETS, CHUNK_OID_FANOUT, CHUNK_OID_LOOKUP,
    CHUNK_PACK_NAMES, MIDX_CHUNK_ENTRY_SIZE, MIDX_HEADER_SIZE, MIDX_OID_VERSION, MIDX_SIGNATURE,
    MIDX_VERSION,
};

/// A parsed multi-pack index backed by a read-only mapping.
///
/// Table accessors are zero-copy views into the mapping; they live and
/// die with this value. Lookup is lock-free and may run from any thread.
pub struct MultiPackIndex {
    data: Mmap,
    midx_path: PathBuf,
    checksum: ObjectId,
    num_packs: u32,
    num_objects: u32,
    pack_names: Vec<BString>,
    fanout_pos: usize,
    oid_lookup_pos: usize,
    object_offsets_pos: usize,
    large_offsets_pos: usize,
    num_large_offsets: u32,
}

/// A resolved index entry: an object id and where it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidxEntry {
    pub oid: ObjectId,
    /// Index into the sorted packfile-name table.
    pub pack_index: u32,
    /// Byte offset of the object inside its packfile.
    pub offset: u64,
}

impl MultiPackIndex {
    /// Open and validate a multi-pack index file.
    ///
    /// Every format invariant is checked up front; any violation fails
    /// the whole file with [`MidxError::Parse`] naming the invariant.
    pub fn open(midx_path: impl AsRef<Path>) -> Result<Self, MidxError> {
        let midx_path = midx_path.as_ref().to_path_buf();
        let file = File::open(&midx_path).map_err(|e| MidxError::io(&midx_path, e))?;
        let meta = file.metadata().map_err(|e| MidxError::io(&midx_path, e))?;
        if !meta.is_file() {
            return Err(bad("not a regular file"));
        }
        let data = unsafe { Mmap::map(&file) }.map_err(|e| MidxError::io(&midx_path, e))?;

        let layout = parse(&data)?;
        Ok(Self {
            data,
            midx_path,
            checksum: layout.checksum,
            num_packs: layout.num_packs,
            num_objects: layout.num_objects,
            pack_names: layout.pack_names,
            fanout_pos: layout.fanout_pos,
            oid_lookup_pos: layout.oid_lookup_pos,
            object_offsets_pos: layout.object_offsets_pos,
            large_offsets_pos: layout.large_offsets_pos,
            num_large_offsets: layout.num_large_offsets,
        })
    }

    /// Whether the file at `path` no longer matches this in-memory index.
    ///
    /// True when the file is missing, unreadable, not a regular file, of
    /// a different length, or carries a different trailer checksum.
    pub fn needs_refresh(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(_) => return true,
        };
        let meta = match file.metadata() {
            Ok(m) => m,
            Err(_) => return true,
        };
        if !meta.is_file() || meta.len() != self.data.len() as u64 {
            return true;
        }
        let trailer = ObjectId::RAW_SIZE as i64;
        if file.seek(SeekFrom::End(-trailer)).is_err() {
            return true;
        }
        let mut stored = [0u8; ObjectId::RAW_SIZE];
        if file.read_exact(&mut stored).is_err() {
            return true;
        }
        stored != *self.checksum.as_bytes()
    }

    /// Look up an object by hash prefix.
    ///
    /// `len` is the prefix length in hex nibbles (1..=40); `prefix` must
    /// be zero-filled past it, as [`ObjectId::from_hex_prefix`] produces.
    /// A short prefix matching more than one object is
    /// [`MidxError::Ambiguous`].
    pub fn find(&self, prefix: &ObjectId, len: usize) -> Result<MidxEntry, MidxError> {
        let len = len.clamp(1, ObjectId::HEX_SIZE);
        let (lo, hi) = self.fanout_range(prefix.first_byte());
        let target = prefix.as_bytes();

        // Binary search for the zero-padded prefix; its insertion point
        // is the first candidate that can share the prefix.
        let mut low = lo;
        let mut high = hi;
        let mut hit = None;
        while low < high {
            let mid = low + (high - low) / 2;
            match self.oid_bytes_at(mid).cmp(target) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => {
                    hit = Some(mid);
                    break;
                }
            }
        }

        let total = self.num_objects as usize;
        let (pos, mut found) = match hit {
            Some(pos) => (pos, true),
            None => (low, false),
        };
        if !found && pos < total && prefix.shares_prefix_nibbles(&self.oid_at_raw(pos), len) {
            found = true;
        }
        if found
            && len != ObjectId::HEX_SIZE
            && pos + 1 < total
            && prefix.shares_prefix_nibbles(&self.oid_at_raw(pos + 1), len)
        {
            return Err(MidxError::Ambiguous(prefix.to_hex()[..len].to_string()));
        }
        if !found {
            return Err(MidxError::NotFound(format!(
                "failed to find offset for multi-pack index entry {}",
                &prefix.to_hex()[..len]
            )));
        }

        self.entry_at(pos as u32)
    }

    /// Invoke `cb` for every object id in hash order, stopping at and
    /// surfacing the first error verbatim.
    pub fn foreach_entry<E>(&self, mut cb: impl FnMut(&ObjectId) -> Result<(), E>) -> Result<(), E> {
        for i in 0..self.num_objects as usize {
            cb(&self.oid_at_raw(i))?;
        }
        Ok(())
    }

    /// Iterate over all entries in hash order.
    pub fn iter(&self) -> MidxIter<'_> {
        MidxIter { midx: self, pos: 0 }
    }

    /// Total number of objects in the index.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Number of packs referenced by the index.
    pub fn num_packs(&self) -> u32 {
        self.num_packs
    }

    /// The sorted packfile names, as stored.
    pub fn pack_names(&self) -> &[BString] {
        &self.pack_names
    }

    /// Name of the pack at `pack_index`.
    pub fn pack_name(&self, pack_index: u32) -> Option<&BStr> {
        self.pack_names.get(pack_index as usize).map(|n| n.as_bstr())
    }

    /// Object id at position `index` of the sorted table.
    pub fn oid_at(&self, index: u32) -> Option<ObjectId> {
        (index < self.num_objects).then(|| self.oid_at_raw(index as usize))
    }

    /// The trailer checksum.
    pub fn checksum(&self) -> &ObjectId {
        &self.checksum
    }

    /// Path this index was opened from.
    pub fn path(&self) -> &Path {
        &self.midx_path
    }

    fn fanout_entry(&self, index: u8) -> u32 {
        let pos = self.fanout_pos + index as usize * 4;
        u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ])
    }

    fn fanout_range(&self, first_byte: u8) -> (usize, usize) {
        let end = self.fanout_entry(first_byte) as usize;
        let start = if first_byte == 0 {
            0
        } else {
            self.fanout_entry(first_byte - 1) as usize
        };
        (start, end)
    }

    fn oid_bytes_at(&self, index: usize) -> &[u8] {
        let start = self.oid_lookup_pos + index * ObjectId::RAW_SIZE;
        &self.data[start..start + ObjectId::RAW_SIZE]
    }

    fn oid_at_raw(&self, index: usize) -> ObjectId {
        let mut arr = [0u8; ObjectId::RAW_SIZE];
        arr.copy_from_slice(self.oid_bytes_at(index));
        ObjectId::from(arr)
    }

    /// Decode the object-offsets entry at `index`, following the
    /// large-offset indirection when the high bit is set.
    fn entry_at(&self, index: u32) -> Result<MidxEntry, MidxError> {
        let pos = self.object_offsets_pos + index as usize * 8;
        let pack_index = u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ]);
        let raw = u32::from_be_bytes([
            self.data[pos + 4],
            self.data[pos + 5],
            self.data[pos + 6],
            self.data[pos + 7],
        ]);

        let offset = if raw & 0x8000_0000 != 0 {
            let large = raw & 0x7fff_ffff;
            if large >= self.num_large_offsets {
                return Err(MidxError::NotFound(
                    "invalid index into the object large offsets table".into(),
                ));
            }
            let lpos = self.large_offsets_pos + large as usize * 8;
            u64::from_be_bytes([
                self.data[lpos],
                self.data[lpos + 1],
                self.data[lpos + 2],
                self.data[lpos + 3],
                self.data[lpos + 4],
                self.data[lpos + 5],
                self.data[lpos + 6],
                self.data[lpos + 7],
            ])
        } else {
            raw as u64
        };

        if pack_index >= self.num_packs {
            return Err(bad("invalid index into the packfile names table"));
        }

        Ok(MidxEntry {
            oid: self.oid_at_raw(index as usize),
            pack_index,
            offset,
        })
    }
}

/// Iterator over MIDX entries in hash order.
pub struct MidxIter<'a> {
    midx: &'a MultiPackIndex,
    pos: u32,
}

impl<'a> Iterator for MidxIter<'a> {
    type Item = Result<MidxEntry, MidxError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.midx.num_objects {
            return None;
        }
        let entry = self.midx.entry_at(self.pos);
        self.pos += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.midx.num_objects - self.pos) as usize;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for MidxIter<'a> {}

fn bad(message: impl Into<String>) -> MidxError {
    MidxError::Parse(message.into())
}

struct Layout {
    checksum: ObjectId,
    num_packs: u32,
    num_objects: u32,
    pack_names: Vec<BString>,
    fanout_pos: usize,
    oid_lookup_pos: usize,
    object_offsets_pos: usize,
    large_offsets_pos: usize,
    num_large_offsets: u32,
}

/// A chunk located through the lookup table. The length is derived from
/// the next chunk's offset, so it is only known once the table has been
/// walked.
#[derive(Clone, Copy)]
struct Chunk {
    offset: usize,
    length: usize,
}

fn parse(data: &[u8]) -> Result<Layout, MidxError> {
    let trailer_size = ObjectId::RAW_SIZE;
    if data.len() < MIDX_HEADER_SIZE + trailer_size {
        return Err(bad("multi-pack index is too short"));
    }

    if &data[0..4] != MIDX_SIGNATURE {
        return Err(bad("bad signature"));
    }
    let version = data[4];
    if version != MIDX_VERSION {
        return Err(bad(format!("unsupported version {version}")));
    }
    let oid_version = data[5];
    if oid_version != MIDX_OID_VERSION {
        return Err(bad(format!("unsupported object id version {oid_version}")));
    }
    let chunks = data[6] as usize;
    if chunks == 0 {
        return Err(bad("no chunks"));
    }
    // data[7] counts base index files, always zero in version 1.
    let num_packs = binread::be_u32(data, 8).ok_or_else(|| bad("multi-pack index is too short"))?;

    // The first chunk can start no earlier than the end of the lookup
    // table, terminator entry included.
    let table_end = MIDX_HEADER_SIZE + (chunks + 1) * MIDX_CHUNK_ENTRY_SIZE;
    let trailer_offset = data.len() - trailer_size;
    if trailer_offset < table_end {
        return Err(bad("wrong index size"));
    }

    // Verify the trailer before trusting any chunk content.
    let checksum = ObjectId::from_bytes(&data[trailer_offset..])?;
    let computed = Hasher::digest(&data[..trailer_offset])?;
    if computed != checksum {
        return Err(bad("index signature mismatch"));
    }

    let mut entries: Vec<(u32, usize)> = Vec::with_capacity(chunks);
    let mut last_offset = table_end;
    for i in 0..chunks {
        let pos = MIDX_HEADER_SIZE + i * MIDX_CHUNK_ENTRY_SIZE;
        let id = binread::be_u32(data, pos).ok_or_else(|| bad("truncated chunk table"))?;
        let offset = binread::be_u64(data, pos + 4).ok_or_else(|| bad("truncated chunk table"))?;
        let offset = usize::try_from(offset).map_err(|_| bad("chunk offset out of range"))?;
        if offset < last_offset {
            return Err(bad("chunks are non-monotonic"));
        }
        if offset >= trailer_offset {
            return Err(bad("chunks extend beyond the trailer"));
        }
        last_offset = offset;
        entries.push((id, offset));
    }

    let mut chunk_pack_names = None;
    let mut chunk_oid_fanout = None;
    let mut chunk_oid_lookup = None;
    let mut chunk_object_offsets = None;
    let mut chunk_large_offsets = None;
    for (i, &(id, offset)) in entries.iter().enumerate() {
        let length = match entries.get(i + 1) {
            Some(&(_, next)) => next - offset,
            None => trailer_offset - offset,
        };
        let chunk = Chunk { offset, length };
        match id {
            CHUNK_PACK_NAMES => chunk_pack_names = Some(chunk),
            CHUNK_OID_FANOUT => chunk_oid_fanout = Some(chunk),
            CHUNK_OID_LOOKUP => chunk_oid_lookup = Some(chunk),
            CHUNK_OBJECT_OFFSETS => chunk_object_offsets = Some(chunk),
            CHUNK_LARGE_OFFSETS => chunk_large_offsets = Some(chunk),
            _ => return Err(bad("unrecognized chunk ID")),
        }
    }

    let pack_names = parse_packfile_names(data, num_packs, chunk_pack_names)?;
    let (fanout_pos, num_objects) = parse_oid_fanout(data, chunk_oid_fanout)?;
    let oid_lookup_pos = parse_oid_lookup(data, num_objects, chunk_oid_lookup)?;
    let object_offsets_pos = parse_object_offsets(data, num_objects, chunk_object_offsets)?;
    let (large_offsets_pos, num_large_offsets) = parse_large_offsets(chunk_large_offsets)?;

    Ok(Layout {
        checksum,
        num_packs,
        num_objects,
        pack_names,
        fanout_pos,
        oid_lookup_pos,
        object_offsets_pos,
        large_offsets_pos,
        num_large_offsets,
    })
}

fn chunk_bytes(data: &[u8], chunk: Chunk) -> Result<&[u8], MidxError> {
    binread::slice(data, chunk.offset, chunk.length).ok_or_else(|| bad("chunk out of bounds"))
}

fn parse_packfile_names(
    data: &[u8],
    num_packs: u32,
    chunk: Option<Chunk>,
) -> Result<Vec<BString>, MidxError> {
    let chunk = chunk.ok_or_else(|| bad("missing Packfile Names chunk"))?;
    if chunk.length == 0 {
        return Err(bad("empty Packfile Names chunk"));
    }
    let bytes = chunk_bytes(data, chunk)?;

    let mut names: Vec<BString> = Vec::with_capacity(num_packs as usize);
    let mut rest = bytes;
    for _ in 0..num_packs {
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| bad("unterminated packfile name"))?;
        if len == 0 {
            return Err(bad("empty packfile name"));
        }
        let name = BStr::new(&rest[..len]);
        if let Some(prev) = names.last() {
            if prev.as_bstr() >= name {
                return Err(bad("packfile names are not sorted"));
            }
        }
        if len <= ".idx".len() || !name.ends_with(b".idx") {
            return Err(bad("non-.idx packfile name"));
        }
        if name.iter().any(|&b| b == b'/' || b == b'\\') {
            return Err(bad("non-local packfile"));
        }
        names.push(name.to_owned());
        rest = &rest[len + 1..];
    }
    Ok(names)
}

fn parse_oid_fanout(data: &[u8], chunk: Option<Chunk>) -> Result<(usize, u32), MidxError> {
    let chunk = chunk.ok_or_else(|| bad("missing OID Fanout chunk"))?;
    if chunk.length == 0 {
        return Err(bad("empty OID Fanout chunk"));
    }
    if chunk.length != 256 * 4 {
        return Err(bad("OID Fanout chunk has wrong length"));
    }
    let bytes = chunk_bytes(data, chunk)?;

    let mut nr = 0u32;
    for word in bytes.chunks_exact(4) {
        let n = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
        if n < nr {
            return Err(bad("index is non-monotonic"));
        }
        nr = n;
    }
    Ok((chunk.offset, nr))
}

fn parse_oid_lookup(
    data: &[u8],
    num_objects: u32,
    chunk: Option<Chunk>,
) -> Result<usize, MidxError> {
    let chunk = chunk.ok_or_else(|| bad("missing OID Lookup chunk"))?;
    if chunk.length == 0 {
        return Err(bad("empty OID Lookup chunk"));
    }
    if chunk.length != num_objects as usize * ObjectId::RAW_SIZE {
        return Err(bad("OID Lookup chunk has wrong length"));
    }
    let bytes = chunk_bytes(data, chunk)?;

    // Strictly ascending, starting above the all-zero id.
    let zero = [0u8; ObjectId::RAW_SIZE];
    let mut prev: &[u8] = &zero;
    for oid in bytes.chunks_exact(ObjectId::RAW_SIZE) {
        if prev >= oid {
            return Err(bad("OID Lookup index is non-monotonic"));
        }
        prev = oid;
    }
    Ok(chunk.offset)
}

fn parse_object_offsets(
    data: &[u8],
    num_objects: u32,
    chunk: Option<Chunk>,
) -> Result<usize, MidxError> {
    let chunk = chunk.ok_or_else(|| bad("missing Object Offsets chunk"))?;
    if chunk.length == 0 {
        return Err(bad("empty Object Offsets chunk"));
    }
    if chunk.length != num_objects as usize * 8 {
        return Err(bad("Object Offsets chunk has wrong length"));
    }
    chunk_bytes(data, chunk)?;
    Ok(chunk.offset)
}

fn parse_large_offsets(chunk: Option<Chunk>) -> Result<(usize, u32), MidxError> {
    let chunk = match chunk {
        Some(c) if c.length > 0 => c,
        _ => return Ok((0, 0)),
    };
    if chunk.length % 8 != 0 {
        return Err(bad("malformed Object Large Offsets chunk"));
    }
    Ok((chunk.offset, (chunk.length / 8) as u32))
}
