//! One loaded engine module (`7z.so`, `7z.dll`, or a codec plugin).
//!
//! The module's C exports are resolved once at load time and cached as raw
//! function pointers next to the [`libloading::Library`] that owns them.
//! Nothing here outlives the library: every object created from a module
//! holds an `Arc<NativeModule>`.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::catalog::{parse_extensions, parse_multi_signature, ArcFlags, FormatDescriptor, ProbeFn};
use crate::com::{ComPtr, VtableLayout};
use crate::engine::{CoderInfo, HasherInfo};
use crate::error::{Result, SevenZipError};
use crate::guid::{Guid, IID_IIN_ARCHIVE};
use crate::hresult::{rc, HResult, ProbeResult};
use crate::props::{HandlerProp, MethodProp};
use crate::variant::{PropValue, PropVariant};
#[cfg(not(windows))]
use crate::variant::{free_bstr, vt};

// ── Export signatures ───────────────────────────────────────────────────────

type CreateObjectFn        = unsafe extern "system" fn(*const Guid, *const Guid, *mut *mut c_void) -> i32;
type CreateCoderFn         = unsafe extern "system" fn(u32, *const Guid, *mut *mut c_void) -> i32;
type GetMethodPropertyFn   = unsafe extern "system" fn(u32, u32, *mut PropVariant) -> i32;
type GetNumberOfMethodsFn  = unsafe extern "system" fn(*mut u32) -> i32;
type GetHashersFn          = unsafe extern "system" fn(*mut *mut c_void) -> i32;
type SetCodecsFn           = unsafe extern "system" fn(*mut c_void) -> i32;
type GetHandlerProperty2Fn = unsafe extern "system" fn(u32, u32, *mut PropVariant) -> i32;
type GetHandlerPropertyFn  = unsafe extern "system" fn(u32, *mut PropVariant) -> i32;
type GetNumberOfFormatsFn  = unsafe extern "system" fn(*mut u32) -> i32;
type IsArcFn               = unsafe extern "system" fn(*const u8, usize) -> u32;
type GetIsArcFn            = unsafe extern "system" fn(u32, *mut Option<IsArcFn>) -> i32;
type SetCaseSensitiveFn    = unsafe extern "system" fn(i32) -> i32;
type SetLargePageModeFn    = unsafe extern "system" fn() -> i32;
type VariantClearFn        = unsafe extern "system" fn(*mut PropVariant) -> i32;

// IHashers slots, counted without destructor slots.
const HASHERS_GET_NUM:  usize = 3;
const HASHERS_GET_PROP: usize = 4;
const HASHERS_CREATE:   usize = 5;

type HashersGetNumFn    = unsafe extern "system" fn(*mut c_void) -> u32;
type HashersGetPropFn   = unsafe extern "system" fn(*mut c_void, u32, u32, *mut PropVariant) -> i32;
type HashersCreateFn    = unsafe extern "system" fn(*mut c_void, u32, *mut *mut c_void) -> i32;

#[cfg(windows)]
#[link(name = "ole32")]
extern "system" {
    fn PropVariantClear(pvar: *mut PropVariant) -> i32;
}

#[cfg(windows)]
unsafe fn clear_raw(_module_clear: Option<VariantClearFn>, v: *mut PropVariant) {
    PropVariantClear(v);
}

#[cfg(not(windows))]
unsafe fn clear_raw(module_clear: Option<VariantClearFn>, v: *mut PropVariant) {
    match module_clear {
        Some(clear) => {
            clear(v);
        }
        None => {
            if (*v).vt == vt::BSTR {
                free_bstr((*v).data.bstr);
            }
        }
    }
}

/// Whether the module is the primary engine or a plugin from the codec dir.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleRole {
    Primary,
    Auxiliary,
}

// ── NativeModule ────────────────────────────────────────────────────────────

pub struct NativeModule {
    path:   PathBuf,
    role:   ModuleRole,
    layout: VtableLayout,

    create_object:         CreateObjectFn,
    create_decoder:        CreateCoderFn,
    create_encoder:        CreateCoderFn,
    get_method_property:   GetMethodPropertyFn,
    get_number_of_methods: GetNumberOfMethodsFn,
    get_hashers:           Option<GetHashersFn>,
    set_codecs:            Option<SetCodecsFn>,
    get_handler_property2: Option<GetHandlerProperty2Fn>,
    get_handler_property:  Option<GetHandlerPropertyFn>,
    get_number_of_formats: Option<GetNumberOfFormatsFn>,
    get_is_arc:            Option<GetIsArcFn>,
    set_case_sensitive:    Option<SetCaseSensitiveFn>,
    set_large_page_mode:   Option<SetLargePageModeFn>,
    variant_clear:         Option<VariantClearFn>,

    hashers: Option<Mutex<ComPtr>>,

    // Declared last: dropped after the hashers object is released.
    _lib: Library,
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModule")
            .field("path", &self.path)
            .field("role", &self.role)
            .field("handlers", &(self.get_handler_property2.is_some() || self.get_handler_property.is_some()))
            .field("set_codecs", &self.set_codecs.is_some())
            .finish()
    }
}

unsafe fn required<T: Copy>(lib: &Library, path: &Path, symbol: &'static str) -> Result<T> {
    lib.get::<T>(symbol.as_bytes())
        .map(|s| *s)
        .map_err(|_| SevenZipError::ExportNotFound { symbol, path: path.to_path_buf() })
}

unsafe fn optional<T: Copy>(lib: &Library, symbol: &str) -> Option<T> {
    lib.get::<T>(symbol.as_bytes()).ok().map(|s| *s)
}

impl NativeModule {
    /// Load the library at `path` and resolve its exports.
    pub fn load(path: &Path, role: ModuleRole, layout: VtableLayout) -> Result<Arc<Self>> {
        let lib = unsafe { Library::new(path) }.map_err(|e| SevenZipError::NativeModuleLoadFailed {
            path:   path.to_path_buf(),
            reason: e.to_string(),
        })?;

        unsafe {
            let get_handler_property2 = optional::<GetHandlerProperty2Fn>(&lib, "GetHandlerProperty2");
            let get_handler_property  = optional::<GetHandlerPropertyFn>(&lib, "GetHandlerProperty");
            if role == ModuleRole::Primary && get_handler_property2.is_none() && get_handler_property.is_none() {
                return Err(SevenZipError::ExportNotFound {
                    symbol: "GetHandlerProperty2",
                    path:   path.to_path_buf(),
                });
            }

            let mut module = NativeModule {
                path: path.to_path_buf(),
                role,
                layout,
                create_object:         required(&lib, path, "CreateObject")?,
                create_decoder:        required(&lib, path, "CreateDecoder")?,
                create_encoder:        required(&lib, path, "CreateEncoder")?,
                get_method_property:   required(&lib, path, "GetMethodProperty")?,
                get_number_of_methods: required(&lib, path, "GetNumberOfMethods")?,
                get_hashers:           optional(&lib, "GetHashers"),
                set_codecs:            optional(&lib, "SetCodecs"),
                get_handler_property2,
                get_handler_property,
                get_number_of_formats: optional(&lib, "GetNumberOfFormats"),
                get_is_arc:            optional(&lib, "GetIsArc"),
                set_case_sensitive:    optional(&lib, "SetCaseSensitive"),
                set_large_page_mode:   optional(&lib, "SetLargePageMode"),
                variant_clear:         optional(&lib, "VariantClear"),
                hashers:               None,
                _lib:                  lib,
            };

            if let Some(get) = module.get_hashers {
                let mut raw = std::ptr::null_mut();
                if HResult(get(&mut raw)).is_ok() {
                    module.hashers = ComPtr::from_raw(raw, layout).map(Mutex::new);
                }
            }

            debug!(path = %path.display(), ?role, "loaded native module");
            Ok(Arc::new(module))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> ModuleRole {
        self.role
    }

    pub fn layout(&self) -> VtableLayout {
        self.layout
    }

    pub fn has_handlers(&self) -> bool {
        self.get_handler_property2.is_some() || self.get_handler_property.is_some()
    }

    pub fn accepts_codecs(&self) -> bool {
        self.set_codecs.is_some()
    }

    // ── Variants ──

    /// Release whatever the engine allocated inside `v`.
    pub(crate) fn clear_variant(&self, v: &mut PropVariant) {
        unsafe { clear_raw(self.variant_clear, v) };
        *v = PropVariant::default();
    }

    /// Run `fill` on a fresh variant, copy the value out, clear it.
    pub(crate) fn read_variant(
        &self,
        binary: bool,
        fill: impl FnOnce(*mut PropVariant) -> i32,
    ) -> (HResult, PropValue) {
        let mut v = PropVariant::default();
        let hr = HResult(fill(&mut v as *mut PropVariant));
        let value = if hr.is_ok() { unsafe { v.to_value(binary) } } else { PropValue::Empty };
        self.clear_variant(&mut v);
        (hr, value)
    }

    // ── Methods (coders) ──

    pub fn method_count(&self) -> Result<u32> {
        let mut n = 0u32;
        HResult(unsafe { (self.get_number_of_methods)(&mut n) }).check("GetNumberOfMethods")?;
        Ok(n)
    }

    /// # Safety
    /// `value` must point at a cleared `PROPVARIANT`.
    pub unsafe fn method_property_raw(&self, index: u32, prop_id: u32, value: *mut PropVariant) -> HResult {
        HResult((self.get_method_property)(index, prop_id, value))
    }

    pub fn method_property(&self, index: u32, prop: MethodProp) -> Result<PropValue> {
        let (hr, v) = self.read_variant(prop.is_binary(), |p| unsafe {
            (self.get_method_property)(index, prop.id(), p)
        });
        hr.check("GetMethodProperty")?;
        Ok(v)
    }

    fn method_property_opt(&self, index: u32, prop: MethodProp) -> PropValue {
        self.method_property(index, prop).unwrap_or(PropValue::Empty)
    }

    pub fn coder_info(&self, index: u32) -> Result<CoderInfo> {
        let id = self.method_property(index, MethodProp::Id)?.as_u64("ID")?.unwrap_or(0);
        let name = self
            .method_property(index, MethodProp::Name)?
            .into_string("Name")?
            .unwrap_or_default();
        let class_of = |v: PropValue| v.as_bytes("Coder").ok().flatten().and_then(Guid::from_native_bytes).map(Uuid::from);
        let decoder = class_of(self.method_property_opt(index, MethodProp::Decoder));
        let encoder = class_of(self.method_property_opt(index, MethodProp::Encoder));
        let decoder_assigned = match self.method_property_opt(index, MethodProp::DecoderIsAssigned) {
            PropValue::Bool(b) => b,
            _ => decoder.is_some(),
        };
        let encoder_assigned = match self.method_property_opt(index, MethodProp::EncoderIsAssigned) {
            PropValue::Bool(b) => b,
            _ => encoder.is_some(),
        };
        let pack_streams = match self.method_property_opt(index, MethodProp::PackStreams) {
            PropValue::Empty => 1,
            v => v.as_u32("PackStreams").ok().flatten().unwrap_or(0),
        };
        let is_filter = match self.method_property_opt(index, MethodProp::IsFilter) {
            PropValue::Bool(b) => Some(b),
            _ => None,
        };
        let description = self
            .method_property_opt(index, MethodProp::Description)
            .into_string("Description")
            .ok()
            .flatten();
        Ok(CoderInfo {
            id,
            name,
            decoder,
            encoder,
            decoder_assigned,
            encoder_assigned,
            pack_streams,
            is_filter,
            description,
        })
    }

    /// # Safety
    /// `iid` must be readable and `out` writable.
    pub unsafe fn create_decoder_raw(&self, index: u32, iid: *const Guid, out: *mut *mut c_void) -> HResult {
        HResult((self.create_decoder)(index, iid, out))
    }

    /// # Safety
    /// `iid` must be readable and `out` writable.
    pub unsafe fn create_encoder_raw(&self, index: u32, iid: *const Guid, out: *mut *mut c_void) -> HResult {
        HResult((self.create_encoder)(index, iid, out))
    }

    // ── Hashers ──

    pub fn hasher_count(&self) -> u32 {
        match &self.hashers {
            Some(h) => {
                let h = h.lock();
                unsafe {
                    let get: HashersGetNumFn = h.method(HASHERS_GET_NUM);
                    get(h.as_raw())
                }
            }
            None => 0,
        }
    }

    /// # Safety
    /// `value` must point at a cleared `PROPVARIANT`.
    pub unsafe fn hasher_property_raw(&self, index: u32, prop_id: u32, value: *mut PropVariant) -> HResult {
        let Some(h) = &self.hashers else {
            return HResult(rc::E_NOTIMPL);
        };
        let h = h.lock();
        let get: HashersGetPropFn = h.method(HASHERS_GET_PROP);
        HResult(get(h.as_raw(), index, prop_id, value))
    }

    /// # Safety
    /// `out` must be writable.
    pub unsafe fn create_hasher_raw(&self, index: u32, out: *mut *mut c_void) -> HResult {
        let Some(h) = &self.hashers else {
            *out = std::ptr::null_mut();
            return HResult(rc::E_NOTIMPL);
        };
        let h = h.lock();
        let create: HashersCreateFn = h.method(HASHERS_CREATE);
        HResult(create(h.as_raw(), index, out))
    }

    pub fn hasher_info(&self, index: u32) -> Result<HasherInfo> {
        let read = |prop: MethodProp| {
            self.read_variant(false, |p| unsafe { self.hasher_property_raw(index, prop.id(), p).0 })
        };
        let (hr, id) = read(MethodProp::Id);
        let id = if hr.is_ok() { id.as_u64("ID").ok().flatten().unwrap_or(0) } else { 0 };
        let (hr, name) = read(MethodProp::Name);
        hr.check("GetHasherProp")?;
        let name = name.into_string("Name")?.unwrap_or_default();
        let (hr, size) = read(MethodProp::DigestSize);
        let digest_size = if hr.is_ok() { size.as_u32("DigestSize").ok().flatten().unwrap_or(0) } else { 0 };
        Ok(HasherInfo { id, name, digest_size })
    }

    // ── Formats ──

    pub fn format_count(&self) -> u32 {
        if !self.has_handlers() {
            return 0;
        }
        let Some(get) = self.get_number_of_formats else {
            return 1;
        };
        let mut n = 0u32;
        if HResult(unsafe { get(&mut n) }).is_ok() { n } else { 1 }
    }

    fn handler_property(&self, index: u32, prop: HandlerProp) -> Result<PropValue> {
        let (hr, v) = self.read_variant(prop.is_binary(), |p| unsafe {
            match (self.get_handler_property2, self.get_handler_property) {
                (Some(get2), _) => get2(index, prop.id(), p),
                (None, Some(get)) if index == 0 => get(prop.id(), p),
                _ => rc::E_INVALIDARG,
            }
        });
        hr.check("GetHandlerProperty")?;
        Ok(v)
    }

    /// Descriptors for every handler in the module.  Handlers without a
    /// readable class id are skipped.
    pub fn formats(self: &Arc<Self>, module_index: usize) -> Result<Vec<FormatDescriptor>> {
        let mut out = Vec::new();
        for i in 0..self.format_count() {
            let class_id = match self.handler_property(i, HandlerProp::ClassId) {
                Ok(PropValue::Bytes(b)) => match Guid::from_native_bytes(&b) {
                    Some(g) => Uuid::from(g),
                    None => continue,
                },
                _ => {
                    debug!(index = i, path = %self.path.display(), "handler without class id skipped");
                    continue;
                }
            };
            let name = self.handler_string(i, HandlerProp::Name);
            let ext = self.handler_string(i, HandlerProp::Extension);
            let add_ext = self.handler_string(i, HandlerProp::AddExtension);

            let opt = |p: HandlerProp| self.handler_property(i, p).unwrap_or(PropValue::Empty);
            let mut flags = ArcFlags(opt(HandlerProp::Flags).as_u32("Flags").ok().flatten().unwrap_or(0));
            if opt(HandlerProp::KeepName).as_bool("KeepName").unwrap_or(false) {
                flags = flags | ArcFlags::KEEP_NAME;
            }
            let time_flags = opt(HandlerProp::TimeFlags).as_u32("TimeFlags").ok().flatten().unwrap_or(0);
            let can_update = opt(HandlerProp::Update).as_bool("Update").unwrap_or(false);
            let signature_offset = opt(HandlerProp::SignatureOffset).as_u64("SignatureOffset").ok().flatten().unwrap_or(0);

            let signatures = match opt(HandlerProp::Signature) {
                PropValue::Bytes(b) if !b.is_empty() => vec![b],
                _ => match opt(HandlerProp::MultiSignature) {
                    PropValue::Bytes(b) => parse_multi_signature(&name, &b)?,
                    _ => Vec::new(),
                },
            };

            let probe = self.probe_for(i);

            trace!(name = %name, %class_id, sigs = signatures.len(), "handler");
            out.push(FormatDescriptor {
                class_id,
                name,
                signatures,
                signature_offset,
                extensions: parse_extensions(&ext, &add_ext),
                flags,
                time_flags,
                can_update,
                probe,
                module_index,
                format_index: i,
            });
        }
        Ok(out)
    }

    fn handler_string(&self, index: u32, prop: HandlerProp) -> String {
        self.handler_property(index, prop)
            .and_then(|v| v.into_string(prop.name()))
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    fn probe_for(self: &Arc<Self>, index: u32) -> Option<ProbeFn> {
        let get = self.get_is_arc?;
        let mut f: Option<IsArcFn> = None;
        let hr = HResult(unsafe { get(index, &mut f) });
        let f = f.filter(|_| hr.is_ok())?;
        let module = Arc::clone(self);
        Some(Arc::new(move |window: &[u8]| {
            let _alive = &module;
            ProbeResult::from_raw(unsafe { f(window.as_ptr(), window.len()) })
        }))
    }

    // ── Objects ──

    /// `CreateObject(class_id, IID_IInArchive)`.
    pub fn create_archive(&self, class_id: &Uuid) -> Result<ComPtr> {
        let clsid = Guid::from(*class_id);
        let iid = Guid::from(IID_IIN_ARCHIVE);
        let mut raw = std::ptr::null_mut();
        let hr = HResult(unsafe { (self.create_object)(&clsid, &iid, &mut raw) });
        if hr != HResult::OK {
            return Err(SevenZipError::ObjectCreationFailed { class_id: *class_id, status: hr });
        }
        unsafe { ComPtr::from_raw(raw, self.layout) }.ok_or(SevenZipError::ObjectCreationFailed {
            class_id: *class_id,
            status:   HResult(rc::E_POINTER),
        })
    }

    /// Hand the module a codec-info object (or detach with null).  Modules
    /// without `SetCodecs` accept silently.
    ///
    /// # Safety
    /// `codecs` must be null or a live `ICompressCodecsInfo` pointer.
    pub unsafe fn set_codecs(&self, codecs: *mut c_void) -> Result<()> {
        match self.set_codecs {
            Some(set) => HResult(set(codecs)).check("SetCodecs"),
            None => Ok(()),
        }
    }

    /// `None` when the module does not export the switch.
    pub fn set_case_sensitive(&self, on: bool) -> Option<HResult> {
        self.set_case_sensitive.map(|f| HResult(unsafe { f(on as i32) }))
    }

    pub fn set_large_page_mode(&self) -> Option<HResult> {
        self.set_large_page_mode.map(|f| HResult(unsafe { f() }))
    }
}
