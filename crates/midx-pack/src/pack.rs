//! Pack handles and the process-wide pack cache.
//!
//! A pack is shared by every holder in the process: the cache maps the
//! canonical `.pack` path to one refcounted handle, so N writers and
//! readers cost one descriptor and one index mapping. Entry enumeration
//! goes through the [`PackEntries`] seam; the bundled [`IdxEntries`]
//! implementation reads version-2 `.idx` files.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use midx_hash::ObjectId;

use crate::mwindow::{self, FileId, WindowCursor};
use crate::runtime;
use crate::{MidxError, IDX_SIGNATURE, IDX_VERSION};

/// Enumeration of one pack's objects as `(id, offset)` pairs.
///
/// This is the only thing the index writer needs from a pack, so pack
/// internals stay behind this seam.
pub trait PackEntries: Send + Sync {
    /// Invoke `cb` for every object in the pack, stopping at the first
    /// error and surfacing it verbatim.
    fn foreach_entry(
        &self,
        cb: &mut dyn FnMut(&ObjectId, u64) -> Result<(), MidxError>,
    ) -> Result<(), MidxError>;
}

/// Entry enumeration over a version-2 pack index file.
///
/// Reads only what enumeration needs: the object count, the hash table,
/// and the 31-bit offset table with its 64-bit spill. Object lookup and
/// checksum verification belong to the per-pack index reader, not here.
pub struct IdxEntries {
    data: Mmap,
    num_objects: u32,
    oid_pos: usize,
    offset32_pos: usize,
    offset64_pos: usize,
    num_offset64: usize,
    idx_path: PathBuf,
}

impl IdxEntries {
    /// Open a `.idx` file for enumeration.
    pub fn open(idx_path: impl AsRef<Path>) -> Result<Self, MidxError> {
        let idx_path = idx_path.as_ref().to_path_buf();
        let file = File::open(&idx_path).map_err(|e| MidxError::io(&idx_path, e))?;
        let data = unsafe { Mmap::map(&file) }.map_err(|e| MidxError::io(&idx_path, e))?;

        let raw = ObjectId::RAW_SIZE;
        // Header (8) + fanout (1024) + pack and index checksums.
        if data.len() < 8 + 256 * 4 + 2 * raw {
            return Err(invalid(&idx_path, "file is too small"));
        }
        if data[0..4] != IDX_SIGNATURE {
            return Err(invalid(&idx_path, "bad signature"));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != IDX_VERSION {
            return Err(invalid(&idx_path, &format!("unsupported version {version}")));
        }

        let fanout_pos = 8;
        let last_fanout = fanout_pos + 255 * 4;
        let num_objects = u32::from_be_bytes([
            data[last_fanout],
            data[last_fanout + 1],
            data[last_fanout + 2],
            data[last_fanout + 3],
        ]);

        let n = num_objects as usize;
        let oid_pos = fanout_pos + 256 * 4;
        let crc_pos = oid_pos + n * raw;
        let offset32_pos = crc_pos + n * 4;
        let offset64_pos = offset32_pos + n * 4;

        let spill = data
            .len()
            .checked_sub(offset64_pos + 2 * raw)
            .ok_or_else(|| invalid(&idx_path, "file is truncated"))?;
        if spill % 8 != 0 {
            return Err(invalid(&idx_path, "malformed 64-bit offset table"));
        }

        Ok(Self {
            data,
            num_objects,
            oid_pos,
            offset32_pos,
            offset64_pos,
            num_offset64: spill / 8,
            idx_path,
        })
    }

    /// Number of objects in the index.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    fn offset_at(&self, index: usize) -> Result<u64, MidxError> {
        let pos = self.offset32_pos + index * 4;
        let raw = u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ]);
        if raw & 0x8000_0000 == 0 {
            return Ok(raw as u64);
        }
        let spill = (raw & 0x7fff_ffff) as usize;
        if spill >= self.num_offset64 {
            return Err(invalid(&self.idx_path, "bad 64-bit offset index"));
        }
        let pos = self.offset64_pos + spill * 8;
        Ok(u64::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
            self.data[pos + 4],
            self.data[pos + 5],
            self.data[pos + 6],
            self.data[pos + 7],
        ]))
    }
}

impl PackEntries for IdxEntries {
    fn foreach_entry(
        &self,
        cb: &mut dyn FnMut(&ObjectId, u64) -> Result<(), MidxError>,
    ) -> Result<(), MidxError> {
        for i in 0..self.num_objects as usize {
            let start = self.oid_pos + i * ObjectId::RAW_SIZE;
            let mut bytes = [0u8; ObjectId::RAW_SIZE];
            bytes.copy_from_slice(&self.data[start..start + ObjectId::RAW_SIZE]);
            let oid = ObjectId::from(bytes);
            let offset = self.offset_at(i)?;
            cb(&oid, offset)?;
        }
        Ok(())
    }
}

fn invalid(path: &Path, reason: &str) -> MidxError {
    MidxError::InvalidPack(format!("index '{}': {reason}", path.display()))
}

/// A refcounted, process-shared open pack.
///
/// Obtained from [`get_pack`] and returned with [`put_pack`]; every get
/// must be paired with exactly one put.
pub struct PackHandle {
    /// Canonical `.pack` path; the cache key.
    name: PathBuf,
    entries: Box<dyn PackEntries>,
    /// Window-cache registration of the pack data, made on first read.
    mw_file: Mutex<Option<FileId>>,
}

impl PackHandle {
    fn open(name: PathBuf) -> Result<Self, MidxError> {
        let idx_path = name.with_extension("idx");
        let entries = IdxEntries::open(&idx_path)?;
        Ok(Self {
            name,
            entries: Box::new(entries),
            mw_file: Mutex::new(None),
        })
    }

    /// Canonical path of the `.pack` file.
    pub fn name(&self) -> &Path {
        &self.name
    }

    /// Enumerate the pack's objects.
    pub fn foreach_entry(
        &self,
        cb: &mut dyn FnMut(&ObjectId, u64) -> Result<(), MidxError>,
    ) -> Result<(), MidxError> {
        self.entries.foreach_entry(cb)
    }

    /// Map pack bytes at `offset` through the global window cache,
    /// registering the pack data file on first use.
    ///
    /// The returned bytes stay pinned until `cursor` moves or is closed.
    pub fn window<'a>(
        &self,
        cursor: &'a mut WindowCursor,
        offset: u64,
        extra: usize,
    ) -> Result<&'a [u8], MidxError> {
        let file = {
            let mut slot = self.mw_file.lock().unwrap();
            match *slot {
                Some(id) => id,
                None => {
                    let id = mwindow::register_file(&self.name)?;
                    *slot = Some(id);
                    id
                }
            }
        };
        mwindow::open(file, cursor, offset, extra)
    }
}

impl Drop for PackHandle {
    fn drop(&mut self) {
        if let Some(id) = *self.mw_file.lock().unwrap() {
            mwindow::deregister_file(id);
        }
    }
}

/// Process-wide cache of open packs, keyed by canonical `.pack` path.
///
/// One instance lives behind [`runtime`]; tests may run a private one.
pub struct PackCache {
    packs: HashMap<PathBuf, Arc<PackHandle>>,
}

impl PackCache {
    pub fn new() -> Self {
        Self {
            packs: HashMap::new(),
        }
    }

    /// Look up or open the pack for `path` (a `.pack` or `.idx` path).
    pub fn get(&mut self, path: &Path) -> Result<Arc<PackHandle>, MidxError> {
        let name = packfile_name(path)?;
        if let Some(handle) = self.packs.get(&name) {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(PackHandle::open(name.clone())?);
        self.packs.insert(name, Arc::clone(&handle));
        Ok(handle)
    }

    /// Return a reference obtained from [`get`](Self::get), dropping the
    /// pack from the cache once only the cache's reference remains.
    ///
    /// # Panics
    ///
    /// Panics when the handle is not cached; a put without a paired get
    /// is a corrupted state.
    pub fn put(&mut self, handle: Arc<PackHandle>) {
        let name = handle.name.clone();
        let cached = self
            .packs
            .get(&name)
            .unwrap_or_else(|| panic!("pack handle '{}' is not cached", name.display()));
        assert!(
            Arc::ptr_eq(cached, &handle),
            "pack handle '{}' is not the cached one",
            name.display()
        );
        drop(handle);
        if Arc::strong_count(&self.packs[&name]) == 1 {
            self.packs.remove(&name);
        }
    }

    /// Number of cached packs.
    pub fn len(&self) -> usize {
        self.packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}

impl Default for PackCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical `.pack` cache key for a `.pack` or `.idx` path.
fn packfile_name(path: &Path) -> Result<PathBuf, MidxError> {
    let canonical = std::fs::canonicalize(path).map_err(|e| MidxError::io(path, e))?;
    match canonical.extension() {
        Some(ext) if ext == "idx" => Ok(canonical.with_extension("pack")),
        _ => Ok(canonical),
    }
}

/// Fetch a shared handle for the pack at `path` from the global cache.
pub fn get_pack(path: impl AsRef<Path>) -> Result<Arc<PackHandle>, MidxError> {
    let mut guard = runtime::pack_cache().lock().unwrap();
    let cache = guard.as_mut().expect("pack cache is not initialized");
    cache.get(path.as_ref())
}

/// Return a handle obtained from [`get_pack`].
///
/// After [`runtime::shutdown`] the cache is gone and dropping the last
/// reference is all that is left to do.
pub fn put_pack(handle: Arc<PackHandle>) {
    let mut guard = runtime::pack_cache().lock().unwrap();
    match guard.as_mut() {
        Some(cache) => cache.put(handle),
        None => drop(handle),
    }
}

/// Number of packs in the global cache.
pub fn cached_packs() -> usize {
    runtime::pack_cache()
        .lock()
        .unwrap()
        .as_ref()
        .map_or(0, |c| c.len())
}
