//! `IArchiveOpenCallback` (+ `IArchiveOpenVolumeCallback`).
//!
//! Passed to `IInArchive::Open` when the archive has a name.  Handlers that
//! work on multi-part inputs ask the volume interface for `kpidName` to learn
//! what the first part is called, then request sibling volumes by name.
//! Sibling volumes are not offered.

use std::ffi::c_void;
use std::mem::offset_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};
use uuid::Uuid;

use super::{guard, primary_interface, ComObject, IUnknownVtbl, VtableLayout, VtblPtr};
use crate::guid::{IID_IARCHIVE_OPEN_CALLBACK, IID_IARCHIVE_OPEN_VOLUME_CALLBACK};
use crate::hresult::{rc, HResult};
use crate::lifetime::{Guarded, KeepAliveSet, RefHeader};
use crate::props::ItemProp;
use crate::variant::{read_wide_cstr, PropVariant, WChar};

// ── Slot tables ─────────────────────────────────────────────────────────────

#[repr(C)]
struct OpenCallbackVtbl<const D: usize> {
    unknown:       IUnknownVtbl<D>,
    set_total:     unsafe extern "system" fn(*mut c_void, *const u64, *const u64) -> i32,
    set_completed: unsafe extern "system" fn(*mut c_void, *const u64, *const u64) -> i32,
}

#[repr(C)]
struct VolumeCallbackVtbl<const D: usize> {
    unknown:      IUnknownVtbl<D>,
    get_property: unsafe extern "system" fn(*mut c_void, u32, *mut PropVariant) -> i32,
    get_stream:   unsafe extern "system" fn(*mut c_void, *const WChar, *mut *mut c_void) -> i32,
}

const VOLUME_OFFSET: usize = offset_of!(OpenCallback, volume_vtbl);

impl<const D: usize> OpenCallbackVtbl<D> {
    const NEW: Self = OpenCallbackVtbl {
        unknown:       IUnknownVtbl::new::<OpenCallback, 0>(),
        set_total:     open_set_total,
        set_completed: open_set_completed,
    };
}

impl<const D: usize> VolumeCallbackVtbl<D> {
    const NEW: Self = VolumeCallbackVtbl {
        unknown:      IUnknownVtbl::new::<OpenCallback, VOLUME_OFFSET>(),
        get_property: volume_get_property,
        get_stream:   volume_get_stream,
    };
}

static OPEN_PLAIN:   OpenCallbackVtbl<0>   = OpenCallbackVtbl::<0>::NEW;
static OPEN_DTOR:    OpenCallbackVtbl<2>   = OpenCallbackVtbl::<2>::NEW;
static VOLUME_PLAIN: VolumeCallbackVtbl<0> = VolumeCallbackVtbl::<0>::NEW;
static VOLUME_DTOR:  VolumeCallbackVtbl<2> = VolumeCallbackVtbl::<2>::NEW;

// ── OpenCallback ────────────────────────────────────────────────────────────

#[repr(C)]
pub struct OpenCallback {
    vtbl:        VtblPtr,
    volume_vtbl: VtblPtr,
    header:      RefHeader,
    name:        String,
    files:       AtomicU64,
    bytes:       AtomicU64,
}

impl OpenCallback {
    /// Callback answering `kpidName` with `archive_name`.
    pub fn new(archive_name: &str, keep_alive: &Arc<KeepAliveSet>, layout: VtableLayout) -> Arc<Self> {
        let (vtbl, volume_vtbl) = match layout {
            VtableLayout::Plain           => (VtblPtr::of(&OPEN_PLAIN), VtblPtr::of(&VOLUME_PLAIN)),
            VtableLayout::WithDestructors => (VtblPtr::of(&OPEN_DTOR), VtblPtr::of(&VOLUME_DTOR)),
        };
        Arc::new(OpenCallback {
            vtbl,
            volume_vtbl,
            header: RefHeader::new(keep_alive, true),
            name:   archive_name.to_string(),
            files:  AtomicU64::new(0),
            bytes:  AtomicU64::new(0),
        })
    }

    pub fn as_raw(&self) -> *mut c_void {
        primary_interface(self)
    }

    fn volume_interface(&self) -> *mut c_void {
        &self.volume_vtbl as *const VtblPtr as *mut c_void
    }

    pub fn archive_name(&self) -> &str {
        &self.name
    }

    /// Files and bytes the handler reported as processed while opening.
    pub fn progress(&self) -> (u64, u64) {
        (self.files.load(Ordering::Relaxed), self.bytes.load(Ordering::Relaxed))
    }

    pub fn native_refs(&self) -> u32 {
        self.header.count()
    }

    fn record(&self, files: Option<u64>, bytes: Option<u64>) {
        if let Some(f) = files {
            self.files.store(f, Ordering::Relaxed);
        }
        if let Some(b) = bytes {
            self.bytes.store(b, Ordering::Relaxed);
        }
    }
}

impl Guarded for OpenCallback {
    fn header(&self) -> &RefHeader { &self.header }

    fn teardown(&self) {}

    fn kind(&self) -> &'static str { "OpenCallback" }
}

impl ComObject for OpenCallback {
    fn interface(&self, iid: &Uuid) -> Option<*mut c_void> {
        if *iid == IID_IARCHIVE_OPEN_CALLBACK {
            Some(self.as_raw())
        } else if *iid == IID_IARCHIVE_OPEN_VOLUME_CALLBACK {
            Some(self.volume_interface())
        } else {
            None
        }
    }
}

// ── Thunks ──────────────────────────────────────────────────────────────────

#[inline]
unsafe fn opt(p: *const u64) -> Option<u64> {
    (!p.is_null()).then(|| *p)
}

unsafe extern "system" fn open_set_total(_this: *mut c_void, files: *const u64, bytes: *const u64) -> i32 {
    guard("SetTotal", || {
        trace!(files = ?opt(files), bytes = ?opt(bytes), "open total");
        HResult::OK
    })
}

unsafe extern "system" fn open_set_completed(this: *mut c_void, files: *const u64, bytes: *const u64) -> i32 {
    let cb = &*(this as *const OpenCallback);
    guard("SetCompleted", || {
        cb.record(opt(files), opt(bytes));
        HResult::OK
    })
}

unsafe extern "system" fn volume_get_property(
    this: *mut c_void,
    prop_id: u32,
    value: *mut PropVariant,
) -> i32 {
    let cb = &*((this as *const u8).sub(VOLUME_OFFSET) as *const OpenCallback);
    guard("GetProperty", || {
        if value.is_null() {
            return HResult(rc::E_POINTER);
        }
        *value = PropVariant::default();
        if prop_id != ItemProp::Name.id() {
            return HResult::OK;
        }
        if (*value).set_string(&cb.name) {
            HResult::OK
        } else {
            HResult::OUT_OF_MEMORY
        }
    })
}

unsafe extern "system" fn volume_get_stream(
    this: *mut c_void,
    name: *const WChar,
    out: *mut *mut c_void,
) -> i32 {
    let cb = &*((this as *const u8).sub(VOLUME_OFFSET) as *const OpenCallback);
    guard("GetStream", || {
        if !out.is_null() {
            *out = std::ptr::null_mut();
        }
        debug!(archive = %cb.name, volume = %read_wide_cstr(name), "volume not available");
        HResult::FALSE
    })
}
