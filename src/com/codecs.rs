//! Codec-info object passed to modules through `SetCodecs`.
//!
//! A module that exports `SetCodecs` can use coders and hashers implemented
//! by its siblings (a RAR module asking for the AES coder of the main
//! library, for instance).  The object exposes `ICompressCodecsInfo` and
//! `IHashers` over the registry's flat index and forwards every call to the
//! owning module; property variants are filled in directly by that module.

use std::ffi::c_void;
use std::mem::offset_of;
use std::sync::Arc;

use uuid::Uuid;

use super::{guard, primary_interface, ComObject, IUnknownVtbl, VtableLayout, VtblPtr};
use crate::guid::{Guid, IID_ICOMPRESS_CODECS_INFO, IID_IHASHERS};
use crate::hresult::{rc, HResult};
use crate::lifetime::{Guarded, KeepAliveSet, RefHeader};
use crate::variant::PropVariant;

/// Flat coder/hasher index shared by all loaded modules.
pub trait CodecProvider: Send + Sync + 'static {
    fn num_methods(&self) -> u32;

    /// # Safety
    /// `value` must be a valid, cleared `PROPVARIANT`.
    unsafe fn method_property(&self, index: u32, prop_id: u32, value: *mut PropVariant) -> HResult;

    /// # Safety
    /// `iid` must be readable and `out` writable.
    unsafe fn create_decoder(&self, index: u32, iid: *const Guid, out: *mut *mut c_void) -> HResult;

    /// # Safety
    /// As for [`create_decoder`](Self::create_decoder).
    unsafe fn create_encoder(&self, index: u32, iid: *const Guid, out: *mut *mut c_void) -> HResult;

    fn num_hashers(&self) -> u32;

    /// # Safety
    /// `value` must be a valid, cleared `PROPVARIANT`.
    unsafe fn hasher_property(&self, index: u32, prop_id: u32, value: *mut PropVariant) -> HResult;

    /// # Safety
    /// `out` must be writable.
    unsafe fn create_hasher(&self, index: u32, out: *mut *mut c_void) -> HResult;
}

#[repr(C)]
struct CodecsInfoVtbl<const D: usize> {
    unknown:        IUnknownVtbl<D>,
    get_num_methods: unsafe extern "system" fn(*mut c_void, *mut u32) -> i32,
    get_property:   unsafe extern "system" fn(*mut c_void, u32, u32, *mut PropVariant) -> i32,
    create_decoder: unsafe extern "system" fn(*mut c_void, u32, *const Guid, *mut *mut c_void) -> i32,
    create_encoder: unsafe extern "system" fn(*mut c_void, u32, *const Guid, *mut *mut c_void) -> i32,
}

#[repr(C)]
struct HashersVtbl<const D: usize> {
    unknown:         IUnknownVtbl<D>,
    get_num_hashers: unsafe extern "system" fn(*mut c_void) -> u32,
    get_hasher_prop: unsafe extern "system" fn(*mut c_void, u32, u32, *mut PropVariant) -> i32,
    create_hasher:   unsafe extern "system" fn(*mut c_void, u32, *mut *mut c_void) -> i32,
}

const HASHERS_OFFSET: usize = offset_of!(CodecsInfo, hashers_vtbl);

impl<const D: usize> CodecsInfoVtbl<D> {
    const NEW: Self = CodecsInfoVtbl {
        unknown:         IUnknownVtbl::new::<CodecsInfo, 0>(),
        get_num_methods: ci_get_num_methods,
        get_property:    ci_get_property,
        create_decoder:  ci_create_decoder,
        create_encoder:  ci_create_encoder,
    };
}

impl<const D: usize> HashersVtbl<D> {
    const NEW: Self = HashersVtbl {
        unknown:         IUnknownVtbl::new::<CodecsInfo, HASHERS_OFFSET>(),
        get_num_hashers: hs_get_num_hashers,
        get_hasher_prop: hs_get_hasher_prop,
        create_hasher:   hs_create_hasher,
    };
}

static CODECS_PLAIN:  CodecsInfoVtbl<0> = CodecsInfoVtbl::<0>::NEW;
static CODECS_DTOR:   CodecsInfoVtbl<2> = CodecsInfoVtbl::<2>::NEW;
static HASHERS_PLAIN: HashersVtbl<0>    = HashersVtbl::<0>::NEW;
static HASHERS_DTOR:  HashersVtbl<2>    = HashersVtbl::<2>::NEW;

#[repr(C)]
pub struct CodecsInfo {
    vtbl:         VtblPtr,
    hashers_vtbl: VtblPtr,
    header:       RefHeader,
    provider:     Arc<dyn CodecProvider>,
}

impl CodecsInfo {
    pub fn new(
        provider: Arc<dyn CodecProvider>,
        keep_alive: &Arc<KeepAliveSet>,
        layout: VtableLayout,
    ) -> Arc<Self> {
        let (vtbl, hashers_vtbl) = match layout {
            VtableLayout::Plain           => (VtblPtr::of(&CODECS_PLAIN), VtblPtr::of(&HASHERS_PLAIN)),
            VtableLayout::WithDestructors => (VtblPtr::of(&CODECS_DTOR), VtblPtr::of(&HASHERS_DTOR)),
        };
        Arc::new(CodecsInfo {
            vtbl,
            hashers_vtbl,
            header: RefHeader::new(keep_alive, false),
            provider,
        })
    }

    pub fn as_raw(&self) -> *mut c_void {
        primary_interface(self)
    }

    fn hashers_interface(&self) -> *mut c_void {
        &self.hashers_vtbl as *const VtblPtr as *mut c_void
    }

    pub fn native_refs(&self) -> u32 {
        self.header.count()
    }
}

impl Guarded for CodecsInfo {
    fn header(&self) -> &RefHeader { &self.header }

    fn teardown(&self) {}

    fn kind(&self) -> &'static str { "CodecsInfo" }
}

impl ComObject for CodecsInfo {
    fn interface(&self, iid: &Uuid) -> Option<*mut c_void> {
        if *iid == IID_ICOMPRESS_CODECS_INFO {
            Some(self.as_raw())
        } else if *iid == IID_IHASHERS {
            Some(self.hashers_interface())
        } else {
            None
        }
    }
}

#[inline]
unsafe fn codecs<'a>(this: *mut c_void) -> &'a CodecsInfo {
    &*(this as *const CodecsInfo)
}

#[inline]
unsafe fn hashers<'a>(this: *mut c_void) -> &'a CodecsInfo {
    &*((this as *const u8).sub(HASHERS_OFFSET) as *const CodecsInfo)
}

unsafe extern "system" fn ci_get_num_methods(this: *mut c_void, out: *mut u32) -> i32 {
    let ci = codecs(this);
    guard("GetNumMethods", || {
        if out.is_null() {
            return HResult(rc::E_POINTER);
        }
        *out = ci.provider.num_methods();
        HResult::OK
    })
}

unsafe extern "system" fn ci_get_property(
    this: *mut c_void,
    index: u32,
    prop_id: u32,
    value: *mut PropVariant,
) -> i32 {
    let ci = codecs(this);
    guard("ICompressCodecsInfo::GetProperty", || {
        if value.is_null() {
            return HResult(rc::E_POINTER);
        }
        ci.provider.method_property(index, prop_id, value)
    })
}

unsafe extern "system" fn ci_create_decoder(
    this: *mut c_void,
    index: u32,
    iid: *const Guid,
    out: *mut *mut c_void,
) -> i32 {
    let ci = codecs(this);
    guard("CreateDecoder", || {
        if out.is_null() || iid.is_null() {
            return HResult(rc::E_POINTER);
        }
        ci.provider.create_decoder(index, iid, out)
    })
}

unsafe extern "system" fn ci_create_encoder(
    this: *mut c_void,
    index: u32,
    iid: *const Guid,
    out: *mut *mut c_void,
) -> i32 {
    let ci = codecs(this);
    guard("CreateEncoder", || {
        if out.is_null() || iid.is_null() {
            return HResult(rc::E_POINTER);
        }
        ci.provider.create_encoder(index, iid, out)
    })
}

unsafe extern "system" fn hs_get_num_hashers(this: *mut c_void) -> u32 {
    let ci = hashers(this);
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ci.provider.num_hashers())).unwrap_or(0)
}

unsafe extern "system" fn hs_get_hasher_prop(
    this: *mut c_void,
    index: u32,
    prop_id: u32,
    value: *mut PropVariant,
) -> i32 {
    let ci = hashers(this);
    guard("GetHasherProp", || {
        if value.is_null() {
            return HResult(rc::E_POINTER);
        }
        ci.provider.hasher_property(index, prop_id, value)
    })
}

unsafe extern "system" fn hs_create_hasher(this: *mut c_void, index: u32, out: *mut *mut c_void) -> i32 {
    let ci = hashers(this);
    guard("CreateHasher", || {
        if out.is_null() {
            return HResult(rc::E_POINTER);
        }
        ci.provider.create_hasher(index, out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime;
    use crate::variant::vt;

    struct FakeCodecs;

    impl CodecProvider for FakeCodecs {
        fn num_methods(&self) -> u32 { 3 }

        unsafe fn method_property(&self, index: u32, prop_id: u32, value: *mut PropVariant) -> HResult {
            if index >= 3 {
                return HResult::INVALID_ARG;
            }
            (*value).vt = vt::UI8;
            (*value).data.u64_val = (index as u64) << 8 | prop_id as u64;
            HResult::OK
        }

        unsafe fn create_decoder(&self, _: u32, _: *const Guid, out: *mut *mut c_void) -> HResult {
            *out = std::ptr::null_mut();
            HResult::FAIL
        }

        unsafe fn create_encoder(&self, i: u32, iid: *const Guid, out: *mut *mut c_void) -> HResult {
            self.create_decoder(i, iid, out)
        }

        fn num_hashers(&self) -> u32 { 1 }

        unsafe fn hasher_property(&self, _: u32, _: u32, value: *mut PropVariant) -> HResult {
            (*value).vt = vt::UI4;
            (*value).data.u32_val = 4;
            HResult::OK
        }

        unsafe fn create_hasher(&self, _: u32, out: *mut *mut c_void) -> HResult {
            *out = std::ptr::null_mut();
            HResult::NOT_IMPL
        }
    }

    #[test]
    fn forwards_method_queries() {
        let set = KeepAliveSet::new();
        let ci = CodecsInfo::new(Arc::new(FakeCodecs), &set, VtableLayout::Plain);

        let mut n = 0u32;
        assert_eq!(unsafe { (CODECS_PLAIN.get_num_methods)(ci.as_raw(), &mut n) }, rc::S_OK);
        assert_eq!(n, 3);

        let mut v = PropVariant::default();
        assert_eq!(unsafe { (CODECS_PLAIN.get_property)(ci.as_raw(), 2, 1, &mut v) }, rc::S_OK);
        assert_eq!(unsafe { v.to_value(false) }, crate::variant::PropValue::U64(0x201));
    }

    #[test]
    fn hashers_interface_resolves_back_to_object() {
        let set = KeepAliveSet::new();
        let ci = CodecsInfo::new(Arc::new(FakeCodecs), &set, VtableLayout::WithDestructors);

        let iid = Guid::from(IID_IHASHERS);
        let mut h = std::ptr::null_mut();
        let hr = unsafe { (CODECS_DTOR.unknown.query_interface)(ci.as_raw(), &iid, &mut h) };
        assert_eq!(hr, rc::S_OK);
        assert_eq!(unsafe { (HASHERS_DTOR.get_num_hashers)(h) }, 1);

        let mut v = PropVariant::default();
        assert_eq!(unsafe { (HASHERS_DTOR.get_hasher_prop)(h, 0, 9, &mut v) }, rc::S_OK);
        assert_eq!(unsafe { (HASHERS_DTOR.unknown.release)(h) }, 0);

        // Registry-owned: the last release does not tear anything down.
        assert_eq!(lifetime::add_ref(&ci), 1);
        assert_eq!(lifetime::release(&ci).unwrap(), 0);
    }
}
