//! One-time global setup for the pack and window caches.
//!
//! Both caches are process-wide, each behind its own mutex. All global
//! access is mediated by the accessors here, so tests can run private
//! [`PackCache`](crate::pack::PackCache) and
//! [`MwindowCache`](crate::mwindow::MwindowCache) instances instead.

use std::sync::Mutex;

use crate::mwindow::{MwindowCache, MwindowOptions};
use crate::pack::PackCache;
use crate::MidxError;

static PACK_CACHE: Mutex<Option<PackCache>> = Mutex::new(None);
static WINDOW_CACHE: Mutex<Option<MwindowCache>> = Mutex::new(None);

/// Install the global caches.
///
/// Fails with [`MidxError::AlreadyInitialized`] while a previous
/// initialization is still live; after [`shutdown`] it may be called
/// again.
pub fn init(opts: MwindowOptions) -> Result<(), MidxError> {
    let mut packs = PACK_CACHE.lock().unwrap();
    let mut windows = WINDOW_CACHE.lock().unwrap();
    if packs.is_some() || windows.is_some() {
        return Err(MidxError::AlreadyInitialized);
    }
    *packs = Some(PackCache::new());
    *windows = Some(MwindowCache::new(opts));
    Ok(())
}

/// Tear the global caches down, releasing every mapping and descriptor.
pub fn shutdown() {
    // Dropping cached pack handles deregisters their window files, so
    // the pack cache must go first, outside the window lock.
    let packs = PACK_CACHE.lock().unwrap().take();
    drop(packs);
    let windows = WINDOW_CACHE.lock().unwrap().take();
    drop(windows);
}

/// Whether [`init`] is currently active.
pub fn is_initialized() -> bool {
    PACK_CACHE.lock().unwrap().is_some()
}

pub(crate) fn pack_cache() -> &'static Mutex<Option<PackCache>> {
    &PACK_CACHE
}

pub(crate) fn window_cache() -> &'static Mutex<Option<MwindowCache>> {
    &WINDOW_CACHE
}
