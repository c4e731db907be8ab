//! Keep-alive bookkeeping for objects handed to native code.
//!
//! Native code only ever sees a raw pointer (`Arc::as_ptr`) to an adapter.
//! While it holds at least one reference, the adapter must not be freed even
//! if every Rust handle is gone.  The [`KeepAliveSet`] owns one strong `Arc`
//! per object whose native count is non-zero:
//!
//! ```text
//!   add_ref   0 → 1   insert strong handle
//!   add_ref   n → n+1 (count only)
//!   release   n → n-1 (count only)
//!   release   1 → 0   remove handle, run teardown (if dispose_on_release)
//!   release   0 → ?   OverRelease, count stays 0
//! ```
//!
//! The count and the set membership change under the set's lock, so a
//! concurrent `0 → 1` and `1 → 0` can never leave the set out of step with
//! the count.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::error::{Result, SevenZipError};

/// An object whose lifetime native code participates in.
pub trait Guarded: Send + Sync + 'static {
    fn header(&self) -> &RefHeader;

    /// Release wrapped resources.  Called at most once per 1 → 0 transition
    /// and must tolerate repeated calls.
    fn teardown(&self);

    /// Short type label for diagnostics.
    fn kind(&self) -> &'static str;
}

/// Reference count plus a non-owning link to the set that keeps the object
/// alive.
#[derive(Debug)]
pub struct RefHeader {
    count:              AtomicU32,
    keep_alive:         Weak<KeepAliveSet>,
    dispose_on_release: bool,
}

impl RefHeader {
    pub fn new(keep_alive: &Arc<KeepAliveSet>, dispose_on_release: bool) -> Self {
        RefHeader {
            count:              AtomicU32::new(0),
            keep_alive:         Arc::downgrade(keep_alive),
            dispose_on_release,
        }
    }

    /// Current native reference count.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn dispose_on_release(&self) -> bool {
        self.dispose_on_release
    }
}

/// The set of adapters currently referenced by native code.
#[derive(Default)]
pub struct KeepAliveSet {
    live: Mutex<HashMap<usize, Arc<dyn Guarded>>>,
}

impl KeepAliveSet {
    pub fn new() -> Arc<Self> {
        Arc::new(KeepAliveSet::default())
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.live.lock().contains_key(&addr)
    }

    /// Report any object native code still references.  The objects stay in
    /// the set; native code may still hold their addresses.
    pub fn shutdown(&self) -> Result<()> {
        let live = self.live.lock();
        if live.is_empty() {
            return Ok(());
        }
        let count = live.len();
        for obj in live.values() {
            error!(kind = obj.kind(), refs = obj.header().count(), "native reference leaked");
        }
        Err(SevenZipError::LeakedNativeReference { count })
    }
}

impl std::fmt::Debug for KeepAliveSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveSet").field("live", &self.len()).finish()
    }
}

impl Drop for KeepAliveSet {
    fn drop(&mut self) {
        let live = self.live.get_mut();
        if !live.is_empty() {
            error!(count = live.len(), "keep-alive set dropped with live native references");
        }
    }
}

// ── Counting ────────────────────────────────────────────────────────────────

/// Increment the native count of the object at `ptr`.
///
/// # Safety
/// `ptr` must come from `Arc::as_ptr` / `Arc::into_raw` of an `Arc<T>` that
/// is still alive (held by the caller or by the keep-alive set).
pub unsafe fn add_ref_raw<T: Guarded>(ptr: *const T) -> u32 {
    let obj = &*ptr;
    let header = obj.header();
    let set = header.keep_alive.upgrade();
    let mut live = set.as_ref().map(|s| s.live.lock());

    let prev = header.count.fetch_add(1, Ordering::AcqRel);
    if prev == 0 {
        match live.as_mut() {
            Some(live) => {
                Arc::increment_strong_count(ptr);
                let strong: Arc<T> = Arc::from_raw(ptr);
                live.insert(ptr as usize, strong);
            }
            None => warn!(
                kind = obj.kind(),
                addr = ptr as usize,
                "reference taken after the keep-alive set was dropped; object is not kept alive"
            ),
        }
        trace!(kind = obj.kind(), addr = ptr as usize, "native reference taken");
    }
    prev + 1
}

/// Decrement the native count of the object at `ptr`; on the last release
/// drop the keep-alive handle and tear the object down.
///
/// # Safety
/// Same as [`add_ref_raw`].
pub unsafe fn release_raw<T: Guarded>(ptr: *const T) -> Result<u32> {
    let obj = &*ptr;
    let header = obj.header();
    let set = header.keep_alive.upgrade();
    let mut live = set.as_ref().map(|s| s.live.lock());

    let mut cur = header.count.load(Ordering::Acquire);
    let next = loop {
        if cur == 0 {
            drop(live);
            error!(kind = obj.kind(), addr = ptr as usize, "release on object with zero references");
            return Err(SevenZipError::OverRelease { addr: ptr as usize });
        }
        match header.count.compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break cur - 1,
            Err(actual) => cur = actual,
        }
    };

    if next != 0 {
        return Ok(next);
    }

    // Keep the handle alive across teardown; it may be the last strong one.
    let removed = live.as_mut().and_then(|l| l.remove(&(ptr as usize)));
    drop(live);
    trace!(kind = obj.kind(), addr = ptr as usize, "last native reference released");
    if header.dispose_on_release {
        obj.teardown();
    }
    drop(removed);
    Ok(0)
}

/// Safe wrapper over [`add_ref_raw`] for host-side callers.
pub fn add_ref<T: Guarded>(obj: &Arc<T>) -> u32 {
    unsafe { add_ref_raw(Arc::as_ptr(obj)) }
}

/// Safe wrapper over [`release_raw`] for host-side callers.
pub fn release<T: Guarded>(obj: &Arc<T>) -> Result<u32> {
    unsafe { release_raw(Arc::as_ptr(obj)) }
}
