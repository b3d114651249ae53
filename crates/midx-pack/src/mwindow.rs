//! Mapped window cache: bounded memory-mapped views over pack files.
//!
//! Mapping every pack in full would exhaust address space on 32-bit
//! hosts and file descriptors everywhere else, so pack reads go through
//! fixed-size windows shared process-wide. Windows are evicted
//! least-recently-used under a soft memory budget; whole files are
//! closed least-recently-used under an optional descriptor budget.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};

use crate::runtime;
use crate::MidxError;

/// Soft budgets for the window cache, fixed at [`runtime::init`].
#[derive(Debug, Clone, Copy)]
pub struct MwindowOptions {
    /// Size of a mapped window; offsets align down to half of it.
    pub window_size: u64,
    /// Soft cap on total mapped bytes.
    pub mapped_limit: u64,
    /// Cap on files holding an open descriptor; 0 means unlimited.
    pub file_limit: usize,
}

impl Default for MwindowOptions {
    fn default() -> Self {
        Self {
            window_size: if cfg!(target_pointer_width = "64") {
                1 << 30
            } else {
                32 << 20
            },
            mapped_limit: if cfg!(target_pointer_width = "64") {
                8 << 40
            } else {
                256 << 20
            },
            file_limit: 0,
        }
    }
}

impl MwindowOptions {
    /// Defaults overridden by the `MIDXR_WINDOW_SIZE`,
    /// `MIDXR_MAPPED_LIMIT`, and `MIDXR_FILE_LIMIT` environment
    /// variables (decimal byte and file counts).
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(v) = env_u64("MIDXR_WINDOW_SIZE") {
            opts.window_size = v;
        }
        if let Some(v) = env_u64("MIDXR_MAPPED_LIMIT") {
            opts.mapped_limit = v;
        }
        if let Some(v) = env_u64("MIDXR_FILE_LIMIT") {
            opts.file_limit = v as usize;
        }
        opts
    }
}

fn env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok()?.parse().ok()
}

/// Token for a file registered with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(u64);

/// Caller-owned slot naming the window a read currently pins.
///
/// A cursor pins at most one window; the pin moves when the cursor is
/// opened over a range its window does not cover, and is released by
/// `close`. The mapping is shared into the cursor, so bytes handed out
/// stay valid while the cursor stays put even across evictions.
#[derive(Default)]
pub struct WindowCursor {
    pinned: Option<Pinned>,
}

struct Pinned {
    file: FileId,
    window: u64,
    map: Arc<Mmap>,
    /// File offset of the window's first byte.
    base: u64,
}

impl WindowCursor {
    pub fn new() -> Self {
        Self { pinned: None }
    }

    /// Whether the cursor currently pins a window.
    pub fn is_open(&self) -> bool {
        self.pinned.is_some()
    }
}

struct Window {
    id: u64,
    /// File offset of the first mapped byte.
    offset: u64,
    map: Arc<Mmap>,
    last_used: u64,
    inuse: u32,
}

impl Window {
    /// Containment with an inclusive upper bound: a cursor parked at a
    /// window's very end reuses it and sees zero bytes available.
    fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset - self.offset <= self.map.len() as u64
    }
}

struct WindowedFile {
    id: FileId,
    path: PathBuf,
    /// Closed by file eviction; re-opened lazily by the next window.
    file: Option<File>,
    size: u64,
    windows: Vec<Window>,
}

/// Usage counters, exact at quiescent points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MwindowStats {
    pub mapped: u64,
    pub open_windows: usize,
    pub open_files: usize,
    pub mmap_calls: u64,
    pub peak_mapped: u64,
    pub peak_open_windows: usize,
}

/// The window cache proper. One process-global instance lives behind
/// [`runtime`]; tests may run private instances.
pub struct MwindowCache {
    window_size: u64,
    mapped_limit: u64,
    file_limit: usize,
    files: Vec<WindowedFile>,
    mapped: u64,
    open_windows: usize,
    used_ctr: u64,
    next_file: u64,
    next_window: u64,
    mmap_calls: u64,
    peak_mapped: u64,
    peak_open_windows: usize,
}

impl MwindowCache {
    pub fn new(opts: MwindowOptions) -> Self {
        Self {
            // Half-window alignment needs a nonzero stride.
            window_size: opts.window_size.max(2),
            mapped_limit: opts.mapped_limit,
            file_limit: opts.file_limit,
            files: Vec::new(),
            mapped: 0,
            open_windows: 0,
            used_ctr: 0,
            next_file: 0,
            next_window: 0,
            mmap_calls: 0,
            peak_mapped: 0,
            peak_open_windows: 0,
        }
    }

    /// Register `path` for windowed access.
    ///
    /// When a file limit is set, files whose windows are all unused are
    /// closed first to make room; the limit is soft.
    pub fn register_file(&mut self, path: impl AsRef<Path>) -> Result<FileId, MidxError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| MidxError::io(path, e))?;
        let size = file.metadata().map_err(|e| MidxError::io(path, e))?.len();

        if self.file_limit > 0 {
            while self.open_file_count() >= self.file_limit && self.close_lru_file() {}
        }

        let id = FileId(self.next_file);
        self.next_file += 1;
        self.files.push(WindowedFile {
            id,
            path: path.to_path_buf(),
            file: Some(file),
            size,
            windows: Vec::new(),
        });
        Ok(id)
    }

    /// Drop a file's registration and release its mappings.
    ///
    /// # Panics
    ///
    /// Panics when any of the file's windows is still pinned.
    pub fn deregister_file(&mut self, id: FileId) {
        let Some(i) = self.files.iter().position(|f| f.id == id) else {
            return;
        };
        assert!(
            self.files[i].windows.iter().all(|w| w.inuse == 0),
            "deregistering '{}' with a pinned window",
            self.files[i].path.display()
        );
        let file = self.files.remove(i);
        for w in &file.windows {
            self.mapped -= w.map.len() as u64;
            self.open_windows -= 1;
        }
    }

    /// Pin a window covering `[offset, offset + extra]` of `id` and
    /// return the bytes from `offset` to the window's end.
    ///
    /// The cursor's current window is reused when it still covers the
    /// range; otherwise its pin moves to a covering or freshly mapped
    /// window. The slice borrows from the cursor, and a pinned window is
    /// never evicted, so the bytes stay valid until the cursor moves or
    /// closes. Fewer than `extra + 1` bytes come back only when the file
    /// itself ends inside the requested range.
    pub fn open<'a>(
        &mut self,
        id: FileId,
        cursor: &'a mut WindowCursor,
        offset: u64,
        extra: usize,
    ) -> Result<&'a [u8], MidxError> {
        let end = offset.saturating_add(extra as u64);
        let reuse = match &cursor.pinned {
            Some(p) => {
                let len = p.map.len() as u64;
                p.file == id
                    && offset >= p.base
                    && offset - p.base <= len
                    && end - p.base <= len
            }
            None => false,
        };

        if !reuse {
            self.unpin(cursor);

            let fi = self
                .files
                .iter()
                .position(|f| f.id == id)
                .expect("window file is not registered");
            let wi = match self.files[fi]
                .windows
                .iter()
                .position(|w| w.contains(offset) && w.contains(end))
            {
                Some(wi) => wi,
                None => self.new_window(fi, offset)?,
            };

            self.used_ctr += 1;
            let w = &mut self.files[fi].windows[wi];
            w.last_used = self.used_ctr;
            w.inuse += 1;
            cursor.pinned = Some(Pinned {
                file: id,
                window: w.id,
                map: Arc::clone(&w.map),
                base: w.offset,
            });
        }

        let p = cursor.pinned.as_ref().expect("cursor pinned above");
        let window_offset = (offset - p.base) as usize;
        Ok(&p.map[window_offset..])
    }

    /// Release the cursor's pin, if any.
    pub fn close(&mut self, cursor: &mut WindowCursor) {
        self.unpin(cursor);
    }

    /// Usage counters.
    pub fn stats(&self) -> MwindowStats {
        MwindowStats {
            mapped: self.mapped,
            open_windows: self.open_windows,
            open_files: self.open_file_count(),
            mmap_calls: self.mmap_calls,
            peak_mapped: self.peak_mapped,
            peak_open_windows: self.peak_open_windows,
        }
    }

    fn open_file_count(&self) -> usize {
        self.files.iter().filter(|f| f.file.is_some()).count()
    }

    fn unpin(&mut self, cursor: &mut WindowCursor) {
        let Some(p) = cursor.pinned.take() else {
            return;
        };
        if let Some(f) = self.files.iter_mut().find(|f| f.id == p.file) {
            if let Some(w) = f.windows.iter_mut().find(|w| w.id == p.window) {
                w.inuse -= 1;
            }
        }
    }

    /// Map a new window of `files[fi]` covering `offset`, evicting LRU
    /// windows to stay under the soft mapped limit. Returns the window's
    /// position in the file's list.
    fn new_window(&mut self, fi: usize, offset: u64) -> Result<usize, MidxError> {
        if self.files[fi].file.is_none() {
            // A file-limit eviction closed the descriptor; re-open it.
            let path = self.files[fi].path.clone();
            let file = File::open(&path).map_err(|e| MidxError::io(&path, e))?;
            self.files[fi].size = file.metadata().map_err(|e| MidxError::io(&path, e))?.len();
            self.files[fi].file = Some(file);
        }

        let size = self.files[fi].size;
        if offset >= size {
            return Err(MidxError::io(
                &self.files[fi].path,
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "window offset past end of file",
                ),
            ));
        }

        let walign = self.window_size / 2;
        let aligned = offset / walign * walign;
        let len = (size - aligned).min(self.window_size);

        // Charge the new mapping first, then trim back under the soft
        // limit; if nothing evictable remains we run over it.
        self.mapped += len;
        while self.mapped > self.mapped_limit && self.close_lru_window() {}

        let map = match self.map_range(fi, aligned, len) {
            Ok(map) => map,
            Err(_) => {
                // Address space may be fragmented; release everything
                // evictable and try once more.
                while self.close_lru_window() {}
                match self.map_range(fi, aligned, len) {
                    Ok(map) => map,
                    Err(e) => {
                        self.mapped -= len;
                        return Err(e);
                    }
                }
            }
        };

        self.mmap_calls += 1;
        self.open_windows += 1;
        self.peak_mapped = self.peak_mapped.max(self.mapped);
        self.peak_open_windows = self.peak_open_windows.max(self.open_windows);

        let id = self.next_window;
        self.next_window += 1;
        self.files[fi].windows.push(Window {
            id,
            offset: aligned,
            map: Arc::new(map),
            last_used: 0,
            inuse: 0,
        });
        Ok(self.files[fi].windows.len() - 1)
    }

    fn map_range(&self, fi: usize, offset: u64, len: u64) -> Result<Mmap, MidxError> {
        let f = &self.files[fi];
        let file = f.file.as_ref().expect("descriptor opened above");
        unsafe { MmapOptions::new().offset(offset).len(len as usize).map(file) }
            .map_err(|e| MidxError::io(&f.path, e))
    }

    /// Unmap the least-recently-used unpinned window across all files,
    /// ties broken by enumeration order. Returns whether one was found.
    fn close_lru_window(&mut self) -> bool {
        let mut lru: Option<(usize, usize, u64)> = None;
        for (fi, f) in self.files.iter().enumerate() {
            for (wi, w) in f.windows.iter().enumerate() {
                if w.inuse != 0 {
                    continue;
                }
                if lru.map_or(true, |(_, _, tick)| w.last_used < tick) {
                    lru = Some((fi, wi, w.last_used));
                }
            }
        }
        let Some((fi, wi, _)) = lru else {
            return false;
        };
        let w = self.files[fi].windows.remove(wi);
        self.mapped -= w.map.len() as u64;
        self.open_windows -= 1;
        true
    }

    /// Close the file with no pinned windows whose most recent use is
    /// the oldest: drop its windows and descriptor. The registration
    /// stays; the next window on it re-opens the file. Returns whether
    /// one was found.
    fn close_lru_file(&mut self) -> bool {
        let mut lru: Option<(usize, u64)> = None;
        for (fi, f) in self.files.iter().enumerate() {
            if f.windows.is_empty() || f.windows.iter().any(|w| w.inuse != 0) {
                continue;
            }
            let Some(mru) = f.windows.iter().map(|w| w.last_used).max() else {
                continue;
            };
            if lru.map_or(true, |(_, tick)| mru < tick) {
                lru = Some((fi, mru));
            }
        }
        let Some((fi, _)) = lru else {
            return false;
        };
        let count = self.files[fi].windows.len();
        let freed: u64 = self.files[fi].windows.iter().map(|w| w.map.len() as u64).sum();
        self.files[fi].windows.clear();
        self.files[fi].file = None;
        self.open_windows -= count;
        self.mapped -= freed;
        true
    }
}

/// Register `path` with the global cache.
pub fn register_file(path: impl AsRef<Path>) -> Result<FileId, MidxError> {
    let mut guard = runtime::window_cache().lock().unwrap();
    let cache = guard.as_mut().expect("window cache is not initialized");
    cache.register_file(path)
}

/// Deregister from the global cache. A no-op after [`runtime::shutdown`],
/// so late handle drops stay safe.
pub fn deregister_file(id: FileId) {
    let mut guard = runtime::window_cache().lock().unwrap();
    if let Some(cache) = guard.as_mut() {
        cache.deregister_file(id);
    }
}

/// Pin a window from the global cache; see [`MwindowCache::open`].
pub fn open<'a>(
    id: FileId,
    cursor: &'a mut WindowCursor,
    offset: u64,
    extra: usize,
) -> Result<&'a [u8], MidxError> {
    let mut guard = runtime::window_cache().lock().unwrap();
    let cache = guard.as_mut().expect("window cache is not initialized");
    cache.open(id, cursor, offset, extra)
}

/// Release a cursor's pin in the global cache.
pub fn close(cursor: &mut WindowCursor) {
    let mut guard = runtime::window_cache().lock().unwrap();
    match guard.as_mut() {
        Some(cache) => cache.close(cursor),
        None => cursor.pinned = None,
    }
}

/// Usage counters of the global cache.
pub fn stats() -> MwindowStats {
    runtime::window_cache()
        .lock()
        .unwrap()
        .as_ref()
        .map(|c| c.stats())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(window_size: u64, mapped_limit: u64, file_limit: usize) -> MwindowOptions {
        MwindowOptions {
            window_size,
            mapped_limit,
            file_limit,
        }
    }

    /// A file whose byte at position i is `i % 251`.
    fn patterned_file(dir: &Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    fn byte_at(i: u64) -> u8 {
        (i % 251) as u8
    }

    #[test]
    fn window_alignment_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), "pack", 16 * 1024);
        let mut cache = MwindowCache::new(opts(8192, u64::MAX, 0));
        let id = cache.register_file(&path).unwrap();

        let mut cursor = WindowCursor::new();
        let bytes = cache.open(id, &mut cursor, 5000, 16).unwrap();
        assert_eq!(bytes[0], byte_at(5000));
        assert_eq!(bytes[16], byte_at(5016));

        // 5000 aligns down to 4096; the window spans a full window size.
        let stats = cache.stats();
        assert_eq!(stats.open_windows, 1);
        assert_eq!(stats.mapped, 8192);
        assert_eq!(bytes.len(), 8192 - (5000 - 4096));

        cache.close(&mut cursor);
        assert!(!cursor.is_open());
    }

    #[test]
    fn overlapping_opens_reuse_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), "pack", 16 * 1024);
        let mut cache = MwindowCache::new(opts(8192, u64::MAX, 0));
        let id = cache.register_file(&path).unwrap();

        let mut cursor = WindowCursor::new();
        let first = cache.open(id, &mut cursor, 4100, 8).unwrap();
        let first_ptr = first.as_ptr() as usize;
        let stats = cache.stats();

        let second = cache.open(id, &mut cursor, 4110, 8).unwrap();
        assert_eq!(second.as_ptr() as usize, first_ptr + 10);
        assert_eq!(cache.stats().open_windows, stats.open_windows);
        assert_eq!(cache.stats().mmap_calls, stats.mmap_calls);

        // A second cursor over the same range shares the window too.
        let mut other = WindowCursor::new();
        cache.open(id, &mut other, 4200, 4).unwrap();
        assert_eq!(cache.stats().open_windows, 1);

        cache.close(&mut cursor);
        cache.close(&mut other);
    }

    #[test]
    fn lru_window_is_evicted_under_memory_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), "pack", 16 * 1024);
        // Two 4 KiB windows fit; the third evicts the oldest.
        let mut cache = MwindowCache::new(opts(4096, 8192, 0));
        let id = cache.register_file(&path).unwrap();

        let mut c1 = WindowCursor::new();
        cache.open(id, &mut c1, 0, 8).unwrap();
        cache.close(&mut c1);

        let mut c2 = WindowCursor::new();
        cache.open(id, &mut c2, 6000, 8).unwrap();
        cache.close(&mut c2);
        assert_eq!(cache.stats().open_windows, 2);
        assert_eq!(cache.stats().mapped, 8192);

        let mut c3 = WindowCursor::new();
        cache.open(id, &mut c3, 12 * 1024, 8).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.open_windows, 2);
        assert_eq!(stats.mapped, 8192);
        assert_eq!(stats.mmap_calls, 3);

        // The oldest window (offset 0) went away; reading it again maps anew.
        let mut c4 = WindowCursor::new();
        let bytes = cache.open(id, &mut c4, 0, 8).unwrap();
        assert_eq!(bytes[0], byte_at(0));
        assert_eq!(cache.stats().mmap_calls, 4);

        cache.close(&mut c3);
        cache.close(&mut c4);
    }

    #[test]
    fn pinned_windows_survive_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), "pack", 16 * 1024);
        let mut cache = MwindowCache::new(opts(4096, 4096, 0));
        let id = cache.register_file(&path).unwrap();

        let mut pinned = WindowCursor::new();
        let bytes = cache.open(id, &mut pinned, 100, 8).unwrap();
        assert_eq!(bytes[0], byte_at(100));

        // The budget only has room for one window, but the first one is
        // pinned: the limit is soft and both stay mapped.
        let mut other = WindowCursor::new();
        cache.open(id, &mut other, 8000, 8).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.open_windows, 2);
        assert_eq!(stats.mapped, 8192);

        // Once unpinned, the next mapping evicts back under the limit.
        cache.close(&mut pinned);
        cache.close(&mut other);
        let mut c3 = WindowCursor::new();
        cache.open(id, &mut c3, 12 * 1024, 8).unwrap();
        assert_eq!(cache.stats().mapped, 4096);
        assert_eq!(cache.stats().open_windows, 1);
        cache.close(&mut c3);
    }

    #[test]
    fn file_limit_closes_the_lru_file() {
        let dir = tempfile::tempdir().unwrap();
        let path1 = patterned_file(dir.path(), "pack1", 8 * 1024);
        let path2 = patterned_file(dir.path(), "pack2", 8 * 1024);
        let mut cache = MwindowCache::new(opts(4096, u64::MAX, 1));

        let id1 = cache.register_file(&path1).unwrap();
        let mut cursor = WindowCursor::new();
        cache.open(id1, &mut cursor, 0, 8).unwrap();
        cache.close(&mut cursor);
        assert_eq!(cache.stats().open_files, 1);

        // Registering the second file closes the first: windows gone,
        // descriptor gone, registration kept.
        let id2 = cache.register_file(&path2).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.open_files, 1);
        assert_eq!(stats.open_windows, 0);
        assert_eq!(stats.mapped, 0);

        let bytes = cache.open(id2, &mut cursor, 10, 4).unwrap();
        assert_eq!(bytes[0], byte_at(10));
        cache.close(&mut cursor);

        // The first file re-opens transparently on its next window.
        let bytes = cache.open(id1, &mut cursor, 20, 4).unwrap();
        assert_eq!(bytes[0], byte_at(20));
        cache.close(&mut cursor);
    }

    #[test]
    fn deregister_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), "pack", 8 * 1024);
        let mut cache = MwindowCache::new(opts(4096, u64::MAX, 0));
        let id = cache.register_file(&path).unwrap();

        let mut cursor = WindowCursor::new();
        cache.open(id, &mut cursor, 0, 8).unwrap();
        cache.close(&mut cursor);

        cache.deregister_file(id);
        assert_eq!(cache.stats(), MwindowStats {
            mapped: 0,
            open_windows: 0,
            open_files: 0,
            mmap_calls: 1,
            peak_mapped: 4096,
            peak_open_windows: 1,
        });

        // Deregistering twice is a quiet no-op.
        cache.deregister_file(id);
    }

    #[test]
    #[should_panic(expected = "pinned window")]
    fn deregister_with_pinned_window_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), "pack", 8 * 1024);
        let mut cache = MwindowCache::new(opts(4096, u64::MAX, 0));
        let id = cache.register_file(&path).unwrap();

        let mut cursor = WindowCursor::new();
        cache.open(id, &mut cursor, 0, 8).unwrap();
        cache.deregister_file(id);
    }

    #[test]
    fn reads_at_end_of_file_are_short() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), "pack", 1000);
        let mut cache = MwindowCache::new(opts(4096, u64::MAX, 0));
        let id = cache.register_file(&path).unwrap();

        let mut cursor = WindowCursor::new();
        let bytes = cache.open(id, &mut cursor, 990, 64).unwrap();
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes[9], byte_at(999));

        // Parking exactly at the window's end reuses it, zero bytes left.
        let bytes = cache.open(id, &mut cursor, 1000, 0).unwrap();
        assert!(bytes.is_empty());

        // Past every window and past the file is an error.
        assert!(cache.open(id, &mut cursor, 5000, 0).is_err());
        cache.close(&mut cursor);
    }

    #[test]
    fn moving_a_cursor_unpins_its_old_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = patterned_file(dir.path(), "pack", 16 * 1024);
        let mut cache = MwindowCache::new(opts(4096, 4096, 0));
        let id = cache.register_file(&path).unwrap();

        let mut cursor = WindowCursor::new();
        cache.open(id, &mut cursor, 0, 8).unwrap();
        // Moving to a distant range unpins the old window, so the
        // eviction loop can reclaim it and stay on budget.
        cache.open(id, &mut cursor, 12 * 1024, 8).unwrap();
        let stats = cache.stats();
        assert_eq!(stats.open_windows, 1);
        assert_eq!(stats.mapped, 4096);
        cache.close(&mut cursor);
    }

    #[test]
    fn options_from_env_fall_back_to_defaults() {
        // Not set in the test environment.
        let opts = MwindowOptions::from_env();
        let defaults = MwindowOptions::default();
        assert_eq!(opts.window_size, defaults.window_size);
        assert_eq!(opts.file_limit, defaults.file_limit);
    }
}
