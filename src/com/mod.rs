//! COM plumbing shared by every adapter.
//!
//! Objects handed to the engine are `#[repr(C)]` structs whose first field is
//! a pointer to a static slot table.  Slot order follows the engine's C++
//! declarations: `QueryInterface`, `AddRef`, `Release`, then (on builds that
//! declare a virtual destructor in `IUnknown`) two destructor slots, then the
//! interface's own methods.  The slot tables are generic over the number of
//! destructor slots and instantiated once per [`VtableLayout`].
//!
//! Native objects we call into (archive readers) are wrapped in [`ComPtr`],
//! which addresses methods by slot index and releases on drop.

pub mod callback;
pub mod codecs;
pub mod open;
pub mod stream;

use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;

use tracing::error;
use uuid::Uuid;

use crate::guid::{Guid, IID_IUNKNOWN};
use crate::hresult::{rc, HResult};
use crate::lifetime::{self, Guarded};

pub use callback::{EntryOutcome, ExtractCallback, ExtractLog, SinkResolver, SinkTarget};
pub use codecs::{CodecProvider, CodecsInfo};
pub use open::OpenCallback;
pub use stream::{InStream, OutStream, ReadSeek, SharedSink, SharedStream, SinkStream, WriteDigest};

// ── Layout ──────────────────────────────────────────────────────────────────

/// Whether the engine's `IUnknown` carries a virtual destructor.
///
/// Windows builds never do.  p7zip-derived `7z.so` builds do, which inserts
/// two slots after `Release`.  Official 7-Zip Linux builds (21+) do not;
/// select [`VtableLayout::Plain`] in the engine config for those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VtableLayout {
    Plain,
    WithDestructors,
}

impl VtableLayout {
    pub const fn platform_default() -> Self {
        if cfg!(windows) {
            VtableLayout::Plain
        } else {
            VtableLayout::WithDestructors
        }
    }

    #[inline]
    pub const fn destructor_slots(self) -> usize {
        match self {
            VtableLayout::Plain => 0,
            VtableLayout::WithDestructors => 2,
        }
    }

    /// Slot index of method `n` counted without destructor slots.
    #[inline]
    pub const fn slot(self, n: usize) -> usize {
        if n < 3 { n } else { n + self.destructor_slots() }
    }
}

impl Default for VtableLayout {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl std::str::FromStr for VtableLayout {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain"                                   => Ok(VtableLayout::Plain),
            "with-destructors" | "destructors" | "p7zip" => Ok(VtableLayout::WithDestructors),
            _ => Err(format!("unknown vtable layout `{s}` (expected plain or with-destructors)")),
        }
    }
}

// ── Slot tables ─────────────────────────────────────────────────────────────

pub type QueryInterfaceFn = unsafe extern "system" fn(*mut c_void, *const Guid, *mut *mut c_void) -> i32;
pub type AddRefFn         = unsafe extern "system" fn(*mut c_void) -> u32;
pub type ReleaseFn        = unsafe extern "system" fn(*mut c_void) -> u32;
pub type DtorFn           = unsafe extern "system" fn(*mut c_void);

/// The `IUnknown` head of every slot table.
#[repr(C)]
pub struct IUnknownVtbl<const D: usize> {
    pub query_interface: QueryInterfaceFn,
    pub add_ref:         AddRefFn,
    pub release:         ReleaseFn,
    pub destructors:     [DtorFn; D],
}

impl<const D: usize> IUnknownVtbl<D> {
    /// Head for an object of type `T` seen through the interface pointer
    /// located `OFF` bytes into it.
    pub const fn new<T: ComObject, const OFF: usize>() -> Self {
        IUnknownVtbl {
            query_interface: query_interface_thunk::<T, OFF>,
            add_ref:         add_ref_thunk::<T, OFF>,
            release:         release_thunk::<T, OFF>,
            destructors:     [destructor_stub as DtorFn; D],
        }
    }
}

/// Pointer to a static slot table.
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
pub struct VtblPtr(pub *const c_void);

// Points at immutable statics.
unsafe impl Send for VtblPtr {}
unsafe impl Sync for VtblPtr {}

impl VtblPtr {
    pub fn of<V>(table: &'static V) -> Self {
        VtblPtr(table as *const V as *const c_void)
    }
}

// ── Adapter objects ─────────────────────────────────────────────────────────

/// A host object exposed to the engine.
pub trait ComObject: Guarded + Sized {
    /// Interface pointer for `iid`, or `None` if not implemented.  Must not
    /// touch the reference count.
    fn interface(&self, iid: &Uuid) -> Option<*mut c_void>;
}

/// Pointer to the primary interface of `this`.
#[inline]
pub fn primary_interface<T>(this: &T) -> *mut c_void {
    this as *const T as *mut c_void
}

/// Recover the object from an interface pointer `OFF` bytes into it.
#[inline]
unsafe fn object_from<'a, T, const OFF: usize>(this: *mut c_void) -> &'a T {
    &*((this as *const u8).sub(OFF) as *const T)
}

/// Run a callback body without letting a panic cross the boundary.
pub(crate) fn guard(call: &'static str, f: impl FnOnce() -> HResult) -> i32 {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(hr) => hr.0,
        Err(_) => {
            error!(call, "panic inside engine callback");
            rc::E_FAIL
        }
    }
}

unsafe extern "system" fn query_interface_thunk<T: ComObject, const OFF: usize>(
    this: *mut c_void,
    iid: *const Guid,
    out: *mut *mut c_void,
) -> i32 {
    if out.is_null() {
        return rc::E_POINTER;
    }
    *out = std::ptr::null_mut();
    if iid.is_null() {
        return rc::E_POINTER;
    }
    let obj = object_from::<T, OFF>(this);
    let want = Uuid::from(*iid);
    let found = if want == IID_IUNKNOWN {
        Some(primary_interface(obj))
    } else {
        obj.interface(&want)
    };
    match found {
        Some(p) => {
            lifetime::add_ref_raw(obj as *const T);
            *out = p;
            rc::S_OK
        }
        None => rc::E_NOINTERFACE,
    }
}

unsafe extern "system" fn add_ref_thunk<T: ComObject, const OFF: usize>(this: *mut c_void) -> u32 {
    lifetime::add_ref_raw(object_from::<T, OFF>(this) as *const T)
}

unsafe extern "system" fn release_thunk<T: ComObject, const OFF: usize>(this: *mut c_void) -> u32 {
    // Over-release is already logged; native code gets 0.
    lifetime::release_raw(object_from::<T, OFF>(this) as *const T).unwrap_or(0)
}

unsafe extern "system" fn destructor_stub(_this: *mut c_void) {}

// ── Native objects ──────────────────────────────────────────────────────────

/// An owned reference to an object implemented by the engine.
pub struct ComPtr {
    raw:    NonNull<c_void>,
    layout: VtableLayout,
}

// Engine objects are free-threaded as far as reference counting goes; all
// other calls are serialised by the `&mut` API of the owners.
unsafe impl Send for ComPtr {}

impl ComPtr {
    /// Adopt one reference to `raw`.
    ///
    /// # Safety
    /// `raw` must be null or a live interface pointer whose reference the
    /// caller transfers to the returned value.
    pub unsafe fn from_raw(raw: *mut c_void, layout: VtableLayout) -> Option<Self> {
        NonNull::new(raw).map(|raw| ComPtr { raw, layout })
    }

    #[inline]
    pub fn as_raw(&self) -> *mut c_void {
        self.raw.as_ptr()
    }

    pub fn layout(&self) -> VtableLayout {
        self.layout
    }

    /// Function pointer stored in method slot `n` (numbered without
    /// destructor slots).
    ///
    /// # Safety
    /// `F` must be the exact function-pointer type of that slot.
    pub unsafe fn method<F: Copy>(&self, n: usize) -> F {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*const c_void>());
        let vtbl = *(self.raw.as_ptr() as *const *const *const c_void);
        let entry = *vtbl.add(self.layout.slot(n));
        std::mem::transmute_copy::<*const c_void, F>(&entry)
    }
}

impl Drop for ComPtr {
    fn drop(&mut self) {
        unsafe {
            let release: ReleaseFn = self.method(2);
            release(self.raw.as_ptr());
        }
    }
}

impl std::fmt::Debug for ComPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ComPtr({:p}, {:?})", self.raw, self.layout)
    }
}
