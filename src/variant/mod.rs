//! `PROPVARIANT` decoding.
//!
//! Everything the engine reports about formats, methods and items comes back
//! as a tagged union.  [`PropVariant`] is the frozen C layout; [`PropValue`]
//! is the closed Rust enum it is copied into before the native variant is
//! cleared.  Extractors on [`PropValue`] fail with
//! [`SevenZipError::PropertyTypeMismatch`] instead of coercing.

use std::fmt;

use byteorder::{ByteOrder, NativeEndian};
use chrono::{DateTime, Utc};

use crate::error::{Result, SevenZipError};

// ── Variant type tags ───────────────────────────────────────────────────────

pub mod vt {
    pub const EMPTY:    u16 = 0;
    pub const NULL:     u16 = 1;
    pub const I2:       u16 = 2;
    pub const I4:       u16 = 3;
    pub const BSTR:     u16 = 8;
    pub const BOOL:     u16 = 11;
    pub const I1:       u16 = 16;
    pub const UI1:      u16 = 17;
    pub const UI2:      u16 = 18;
    pub const UI4:      u16 = 19;
    pub const I8:       u16 = 20;
    pub const UI8:      u16 = 21;
    pub const INT:      u16 = 22;
    pub const UINT:     u16 = 23;
    pub const FILETIME: u16 = 64;
    pub const BLOB:     u16 = 65;
}

/// Native wide character: UTF-16 on Windows, UTF-32 elsewhere.
#[cfg(windows)]
pub type WChar = u16;
#[cfg(not(windows))]
pub type WChar = u32;

// ── FFI layout ──────────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FileTime {
    pub low:  u32,
    pub high: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Blob {
    pub cb:   u32,
    pub data: *mut u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union PropVariantData {
    pub bool_val: i16,
    pub i8_val:   i8,
    pub u8_val:   u8,
    pub i16_val:  i16,
    pub u16_val:  u16,
    pub i32_val:  i32,
    pub u32_val:  u32,
    pub i64_val:  i64,
    pub u64_val:  u64,
    pub bstr:     *mut WChar,
    pub filetime: FileTime,
    pub blob:     Blob,
    _pad:         [usize; 2],
}

/// `PROPVARIANT` as laid out by the engine.
#[repr(C)]
pub struct PropVariant {
    pub vt:   u16,
    reserved: [u16; 3],
    pub data: PropVariantData,
}

impl Default for PropVariant {
    fn default() -> Self {
        PropVariant { vt: vt::EMPTY, reserved: [0; 3], data: PropVariantData { _pad: [0; 2] } }
    }
}

impl fmt::Debug for PropVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropVariant").field("vt", &self.vt).finish_non_exhaustive()
    }
}

impl PropVariant {
    /// Copy the variant's payload into an owned [`PropValue`].
    ///
    /// `binary` selects how a `VT_BSTR` is read: as raw bytes (class ids and
    /// signatures) or as a wide string.
    ///
    /// # Safety
    /// The variant must have been filled in by the engine (or be empty), so
    /// that pointer payloads are valid for the tag.
    pub unsafe fn to_value(&self, binary: bool) -> PropValue {
        let d = &self.data;
        match self.vt {
            vt::EMPTY | vt::NULL => PropValue::Empty,
            vt::BOOL             => PropValue::Bool(d.bool_val != 0),
            vt::I1               => PropValue::I64(d.i8_val as i64),
            vt::I2               => PropValue::I64(d.i16_val as i64),
            vt::I4 | vt::INT     => PropValue::I64(d.i32_val as i64),
            vt::I8               => PropValue::I64(d.i64_val),
            vt::UI1              => PropValue::U8(d.u8_val),
            vt::UI2              => PropValue::U16(d.u16_val),
            vt::UI4 | vt::UINT   => PropValue::U32(d.u32_val),
            vt::UI8              => PropValue::U64(d.u64_val),
            vt::FILETIME         => {
                let ticks = ((d.filetime.high as u64) << 32) | d.filetime.low as u64;
                PropValue::FileTime(ticks)
            }
            vt::BSTR if d.bstr.is_null() => PropValue::Empty,
            vt::BSTR => {
                let bytes = bstr_bytes(d.bstr);
                if binary {
                    PropValue::Bytes(bytes.to_vec())
                } else {
                    PropValue::Str(decode_wide(bytes))
                }
            }
            vt::BLOB => {
                if d.blob.data.is_null() || d.blob.cb == 0 {
                    PropValue::Bytes(Vec::new())
                } else {
                    PropValue::Bytes(std::slice::from_raw_parts(d.blob.data, d.blob.cb as usize).to_vec())
                }
            }
            other => PropValue::Other(other),
        }
    }
}

/// Bytes of a `BSTR`, using the `u32` byte-length prefix in front of it.
///
/// # Safety
/// `p` must be a live, non-null `BSTR`.
unsafe fn bstr_bytes<'a>(p: *const WChar) -> &'a [u8] {
    let base = p as *const u8;
    let len = NativeEndian::read_u32(std::slice::from_raw_parts(base.sub(4), 4)) as usize;
    std::slice::from_raw_parts(base, len)
}

// ── BSTR allocation ─────────────────────────────────────────────────────────
//
// Strings handed to the engine must be freeable by the engine's own
// `VariantClear`.  Windows builds use the OLE allocator.  Elsewhere the engine
// allocates with `malloc` and a `u32` byte-length prefix, so we do the same.

#[cfg(windows)]
#[link(name = "oleaut32")]
extern "system" {
    fn SysAllocStringLen(s: *const u16, len: u32) -> *mut u16;
    fn SysFreeString(s: *mut u16);
}

#[cfg(not(windows))]
extern "C" {
    fn malloc(size: usize) -> *mut std::ffi::c_void;
    fn free(p: *mut std::ffi::c_void);
}

/// Allocate a `BSTR` holding `s`.  Null if allocation failed.
#[cfg(windows)]
pub fn alloc_bstr(s: &str) -> *mut WChar {
    let units: Vec<u16> = s.encode_utf16().collect();
    unsafe { SysAllocStringLen(units.as_ptr(), units.len() as u32) }
}

/// Allocate a `BSTR` holding `s`.  Null if allocation failed.
#[cfg(not(windows))]
pub fn alloc_bstr(s: &str) -> *mut WChar {
    let units: Vec<WChar> = s.chars().map(|c| c as WChar).collect();
    let byte_len = units.len() * std::mem::size_of::<WChar>();
    unsafe {
        let base = malloc(4 + byte_len + std::mem::size_of::<WChar>()) as *mut u8;
        if base.is_null() {
            return std::ptr::null_mut();
        }
        (base as *mut u32).write_unaligned(byte_len as u32);
        let chars = base.add(4) as *mut WChar;
        std::ptr::copy_nonoverlapping(units.as_ptr(), chars, units.len());
        chars.add(units.len()).write_unaligned(0);
        chars
    }
}

/// Free a `BSTR` from [`alloc_bstr`] or from the engine.
///
/// # Safety
/// `p` must be null or a live `BSTR` that is not used afterwards.
pub unsafe fn free_bstr(p: *mut WChar) {
    if p.is_null() {
        return;
    }
    #[cfg(windows)]
    SysFreeString(p);
    #[cfg(not(windows))]
    free((p as *mut u8).sub(4) as *mut std::ffi::c_void);
}

impl PropVariant {
    /// Store `s` as a fresh `VT_BSTR`.  The receiver owns the string and
    /// clears it with `VariantClear`.  Returns false if allocation failed.
    ///
    /// # Safety
    /// `self` must not own a payload; it is overwritten without being freed.
    pub unsafe fn set_string(&mut self, s: &str) -> bool {
        let bstr = alloc_bstr(s);
        if bstr.is_null() {
            return false;
        }
        self.vt = vt::BSTR;
        self.data.bstr = bstr;
        true
    }
}

/// Copy a NUL-terminated native wide string.
///
/// # Safety
/// `p` must be null or point at a NUL-terminated run of `WChar`.
pub unsafe fn read_wide_cstr(p: *const WChar) -> String {
    if p.is_null() {
        return String::new();
    }
    let mut len = 0usize;
    while *p.add(len) != 0 {
        len += 1;
    }
    let units = std::slice::from_raw_parts(p, len);
    #[cfg(windows)]
    {
        String::from_utf16_lossy(units)
    }
    #[cfg(not(windows))]
    {
        units.iter().map(|&u| char::from_u32(u).unwrap_or(char::REPLACEMENT_CHARACTER)).collect()
    }
}

/// Decode native wide characters, stopping at the first NUL.
pub fn decode_wide(bytes: &[u8]) -> String {
    #[cfg(windows)]
    {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(NativeEndian::read_u16)
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }
    #[cfg(not(windows))]
    {
        bytes
            .chunks_exact(4)
            .map(NativeEndian::read_u32)
            .take_while(|&u| u != 0)
            .map(|u| char::from_u32(u).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }
}

// ── Owned values ────────────────────────────────────────────────────────────

/// The kind of a [`PropValue`], for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKind {
    Empty,
    Bool,
    Unsigned,
    Signed,
    String,
    Bytes,
    FileTime,
    Other(u16),
}

impl fmt::Display for PropKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropKind::Other(tag) => write!(f, "vt {tag}"),
            k => write!(f, "{k:?}"),
        }
    }
}

/// An owned property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    Empty,
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I64(i64),
    Str(String),
    Bytes(Vec<u8>),
    /// Raw `FILETIME` ticks (100 ns since 1601-01-01 UTC).
    FileTime(u64),
    Other(u16),
}

impl PropValue {
    pub fn kind(&self) -> PropKind {
        match self {
            PropValue::Empty       => PropKind::Empty,
            PropValue::Bool(_)     => PropKind::Bool,
            PropValue::U8(_)
            | PropValue::U16(_)
            | PropValue::U32(_)
            | PropValue::U64(_)    => PropKind::Unsigned,
            PropValue::I64(_)      => PropKind::Signed,
            PropValue::Str(_)      => PropKind::String,
            PropValue::Bytes(_)    => PropKind::Bytes,
            PropValue::FileTime(_) => PropKind::FileTime,
            PropValue::Other(t)    => PropKind::Other(*t),
        }
    }

    fn mismatch(&self, property: &'static str, expected: &'static str) -> SevenZipError {
        SevenZipError::PropertyTypeMismatch { property, expected, found: self.kind() }
    }

    pub fn as_str(&self, property: &'static str) -> Result<Option<&str>> {
        match self {
            PropValue::Empty  => Ok(None),
            PropValue::Str(s) => Ok(Some(s)),
            v => Err(v.mismatch(property, "string")),
        }
    }

    pub fn into_string(self, property: &'static str) -> Result<Option<String>> {
        match self {
            PropValue::Empty  => Ok(None),
            PropValue::Str(s) => Ok(Some(s)),
            v => Err(v.mismatch(property, "string")),
        }
    }

    /// An absent flag reads as `false`.
    pub fn as_bool(&self, property: &'static str) -> Result<bool> {
        match self {
            PropValue::Empty   => Ok(false),
            PropValue::Bool(b) => Ok(*b),
            v => Err(v.mismatch(property, "bool")),
        }
    }

    /// Any unsigned width widens to `u64`.
    pub fn as_u64(&self, property: &'static str) -> Result<Option<u64>> {
        match *self {
            PropValue::Empty  => Ok(None),
            PropValue::U8(n)  => Ok(Some(n as u64)),
            PropValue::U16(n) => Ok(Some(n as u64)),
            PropValue::U32(n) => Ok(Some(n as u64)),
            PropValue::U64(n) => Ok(Some(n)),
            ref v => Err(v.mismatch(property, "unsigned integer")),
        }
    }

    pub fn as_u32(&self, property: &'static str) -> Result<Option<u32>> {
        match *self {
            PropValue::Empty  => Ok(None),
            PropValue::U8(n)  => Ok(Some(n as u32)),
            PropValue::U16(n) => Ok(Some(n as u32)),
            PropValue::U32(n) => Ok(Some(n)),
            ref v => Err(v.mismatch(property, "u32")),
        }
    }

    pub fn as_bytes(&self, property: &'static str) -> Result<Option<&[u8]>> {
        match self {
            PropValue::Empty    => Ok(None),
            PropValue::Bytes(b) => Ok(Some(b)),
            v => Err(v.mismatch(property, "binary")),
        }
    }

    /// A zero `FILETIME` is the engine's way of saying "not recorded".
    pub fn as_datetime(&self, property: &'static str) -> Result<Option<DateTime<Utc>>> {
        match *self {
            PropValue::Empty       => Ok(None),
            PropValue::FileTime(0) => Ok(None),
            PropValue::FileTime(t) => Ok(filetime_to_datetime(t)),
            ref v => Err(v.mismatch(property, "filetime")),
        }
    }
}

// ── FILETIME ────────────────────────────────────────────────────────────────

const FILETIME_UNIX_EPOCH_SECS: i64 = 11_644_473_600;
const FILETIME_TICKS_PER_SEC:   u64 = 10_000_000;

pub fn filetime_to_datetime(ticks: u64) -> Option<DateTime<Utc>> {
    let secs  = (ticks / FILETIME_TICKS_PER_SEC) as i64 - FILETIME_UNIX_EPOCH_SECS;
    let nanos = ((ticks % FILETIME_TICKS_PER_SEC) * 100) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
}

/// FILETIME ticks for `t`, clamped to the representable range.
pub fn datetime_to_filetime(t: DateTime<Utc>) -> u64 {
    let secs = u64::try_from(t.timestamp().saturating_add(FILETIME_UNIX_EPOCH_SECS)).unwrap_or(0);
    secs.saturating_mul(FILETIME_TICKS_PER_SEC)
        .saturating_add((t.timestamp_subsec_nanos() / 100) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_variant_decodes_to_empty() {
        let v = PropVariant::default();
        assert_eq!(unsafe { v.to_value(false) }, PropValue::Empty);
    }

    #[test]
    fn integer_variants_widen() {
        let mut v = PropVariant::default();
        v.vt = vt::UI4;
        v.data.u32_val = 7;
        let value = unsafe { v.to_value(false) };
        assert_eq!(value, PropValue::U32(7));
        assert_eq!(value.as_u64("Size").unwrap(), Some(7));
    }

    #[test]
    fn bstr_is_read_through_length_prefix() {
        // Length prefix followed by the characters, as the engine allocates it.
        let text: Vec<WChar> = "a.7z".chars().map(|c| c as WChar).collect();
        let byte_len = (text.len() * std::mem::size_of::<WChar>()) as u32;
        let mut buf = vec![0u8; 4];
        NativeEndian::write_u32(&mut buf, byte_len);
        for ch in &text {
            buf.extend_from_slice(&ch.to_ne_bytes());
        }
        buf.extend_from_slice(&[0u8; 4]);
        let mut v = PropVariant::default();
        v.vt = vt::BSTR;
        v.data.bstr = unsafe { buf.as_mut_ptr().add(4) } as *mut WChar;

        assert_eq!(unsafe { v.to_value(false) }, PropValue::Str("a.7z".into()));
        match unsafe { v.to_value(true) } {
            PropValue::Bytes(b) => assert_eq!(b.len(), byte_len as usize),
            other => panic!("expected bytes, got {other:?}"),
        }
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let err = PropValue::Str("x".into()).as_bool("IsDir").unwrap_err();
        match err {
            SevenZipError::PropertyTypeMismatch { property, found, .. } => {
                assert_eq!(property, "IsDir");
                assert_eq!(found, PropKind::String);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!PropValue::Empty.as_bool("IsDir").unwrap());
    }

    #[test]
    fn filetime_conversion() {
        // 2000-01-01T00:00:00Z
        let ticks = 125_911_584_000_000_000u64;
        let t = filetime_to_datetime(ticks).unwrap();
        assert_eq!(t.to_rfc3339(), "2000-01-01T00:00:00+00:00");
        assert_eq!(datetime_to_filetime(t), ticks);
        assert_eq!(PropValue::FileTime(0).as_datetime("MTime").unwrap(), None);
    }

    #[test]
    fn filetime_saturates_outside_its_range() {
        let far = DateTime::<Utc>::from_timestamp(7_000_000_000_000, 0).unwrap();
        assert_eq!(datetime_to_filetime(far), u64::MAX);
        let early = DateTime::<Utc>::from_timestamp(-FILETIME_UNIX_EPOCH_SECS - 86_400, 0).unwrap();
        assert_eq!(datetime_to_filetime(early), 0);
    }

    #[test]
    fn allocated_bstr_reads_back() {
        let mut v = PropVariant::default();
        assert!(unsafe { v.set_string("parts.7z.001") });
        assert_eq!(v.vt, vt::BSTR);
        assert_eq!(unsafe { v.to_value(false) }, PropValue::Str("parts.7z.001".into()));
        unsafe { free_bstr(v.data.bstr) };
    }
}
