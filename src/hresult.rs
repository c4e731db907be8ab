//! Status codes exchanged with the engine.
//!
//! The engine speaks COM: every call returns a 32-bit `HRESULT`.  Success is
//! `S_OK` (0); `S_FALSE` (1) is a success code too.  Everything negative is a
//! failure.  Per-item extraction outcomes use a separate small enum,
//! [`OperationResult`].

use std::fmt;

use crate::error::{Result, SevenZipError};

/// Raw `HRESULT` constants.
pub mod rc {
    pub const S_OK:                      i32 = 0;
    pub const S_FALSE:                   i32 = 1;
    pub const E_NOTIMPL:                 i32 = 0x8000_4001_u32 as i32;
    pub const E_NOINTERFACE:             i32 = 0x8000_4002_u32 as i32;
    pub const E_POINTER:                 i32 = 0x8000_4003_u32 as i32;
    pub const E_ABORT:                   i32 = 0x8000_4004_u32 as i32;
    pub const E_FAIL:                    i32 = 0x8000_4005_u32 as i32;
    pub const E_UNEXPECTED:              i32 = 0x8000_FFFF_u32 as i32;
    pub const CLASS_E_CLASSNOTAVAILABLE: i32 = 0x8004_0111_u32 as i32;
    pub const E_ACCESSDENIED:            i32 = 0x8007_0005_u32 as i32;
    pub const E_OUTOFMEMORY:             i32 = 0x8007_000E_u32 as i32;
    pub const E_INVALIDARG:              i32 = 0x8007_0057_u32 as i32;
}

/// A status returned by (or to) the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HResult(pub i32);

impl HResult {
    pub const OK:            HResult = HResult(rc::S_OK);
    pub const FALSE:         HResult = HResult(rc::S_FALSE);
    pub const FAIL:          HResult = HResult(rc::E_FAIL);
    pub const NOT_IMPL:      HResult = HResult(rc::E_NOTIMPL);
    pub const NO_INTERFACE:  HResult = HResult(rc::E_NOINTERFACE);
    pub const INVALID_ARG:   HResult = HResult(rc::E_INVALIDARG);
    pub const OUT_OF_MEMORY: HResult = HResult(rc::E_OUTOFMEMORY);

    #[inline]
    pub fn is_ok(self) -> bool { self.0 >= 0 }

    /// Map a failure status to [`SevenZipError::Status`].
    #[inline]
    pub fn check(self, call: &'static str) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(SevenZipError::Status { call, status: self })
        }
    }

    /// Symbolic name for the well-known codes (diagnostics only).
    pub fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            rc::S_OK                      => "S_OK",
            rc::S_FALSE                   => "S_FALSE",
            rc::E_NOTIMPL                 => "E_NOTIMPL",
            rc::E_NOINTERFACE             => "E_NOINTERFACE",
            rc::E_POINTER                 => "E_POINTER",
            rc::E_ABORT                   => "E_ABORT",
            rc::E_FAIL                    => "E_FAIL",
            rc::E_UNEXPECTED              => "E_UNEXPECTED",
            rc::CLASS_E_CLASSNOTAVAILABLE => "CLASS_E_CLASSNOTAVAILABLE",
            rc::E_ACCESSDENIED            => "E_ACCESSDENIED",
            rc::E_OUTOFMEMORY             => "E_OUTOFMEMORY",
            rc::E_INVALIDARG              => "E_INVALIDARG",
            _ => return None,
        })
    }
}

impl fmt::Display for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#010x})", self.0 as u32),
            None       => write!(f, "HRESULT {:#010x}", self.0 as u32),
        }
    }
}

impl fmt::Debug for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<std::io::Error> for HResult {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            PermissionDenied => HResult(rc::E_ACCESSDENIED),
            InvalidInput     => HResult(rc::E_INVALIDARG),
            OutOfMemory      => HResult(rc::E_OUTOFMEMORY),
            Unsupported      => HResult(rc::E_NOTIMPL),
            _                => HResult(rc::E_FAIL),
        }
    }
}

/// What the engine intends to do with the stream it asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AskMode {
    Extract      = 0,
    Test         = 1,
    Skip         = 2,
    ReadExternal = 3,
}

impl AskMode {
    pub fn from_raw(v: i32) -> Option<Self> {
        match v {
            0 => Some(AskMode::Extract),
            1 => Some(AskMode::Test),
            2 => Some(AskMode::Skip),
            3 => Some(AskMode::ReadExternal),
            _ => None,
        }
    }
}

/// Per-item outcome reported after each entry is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum OperationResult {
    Ok,
    UnsupportedMethod,
    DataError,
    CrcError,
    Unavailable,
    UnexpectedEnd,
    DataAfterEnd,
    IsNotArc,
    HeadersError,
    WrongPassword,
    Other(i32),
}

impl OperationResult {
    pub fn from_raw(v: i32) -> Self {
        match v {
            0 => OperationResult::Ok,
            1 => OperationResult::UnsupportedMethod,
            2 => OperationResult::DataError,
            3 => OperationResult::CrcError,
            4 => OperationResult::Unavailable,
            5 => OperationResult::UnexpectedEnd,
            6 => OperationResult::DataAfterEnd,
            7 => OperationResult::IsNotArc,
            8 => OperationResult::HeadersError,
            9 => OperationResult::WrongPassword,
            n => OperationResult::Other(n),
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            OperationResult::Ok                => 0,
            OperationResult::UnsupportedMethod => 1,
            OperationResult::DataError         => 2,
            OperationResult::CrcError          => 3,
            OperationResult::Unavailable       => 4,
            OperationResult::UnexpectedEnd     => 5,
            OperationResult::DataAfterEnd      => 6,
            OperationResult::IsNotArc          => 7,
            OperationResult::HeadersError      => 8,
            OperationResult::WrongPassword     => 9,
            OperationResult::Other(n)          => n,
        }
    }

    #[inline]
    pub fn is_ok(self) -> bool { self == OperationResult::Ok }
}

/// Index kind attached to `ReportExtractResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum EventIndexType {
    NoIndex,
    InArcIndex,
    BlockIndex,
    OutArcIndex,
    Other(u32),
}

impl EventIndexType {
    pub fn from_raw(v: u32) -> Self {
        match v {
            0 => EventIndexType::NoIndex,
            1 => EventIndexType::InArcIndex,
            2 => EventIndexType::BlockIndex,
            3 => EventIndexType::OutArcIndex,
            n => EventIndexType::Other(n),
        }
    }
}

/// Verdict of a format probe function (`IsArc_*` in the engine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    No,
    Yes,
    NeedMoreData,
}

impl ProbeResult {
    pub fn from_raw(v: u32) -> Self {
        match v {
            0 => ProbeResult::No,
            2 => ProbeResult::NeedMoreData,
            // 3 is "yes, low probability"; still a yes.
            _ => ProbeResult::Yes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_codes_map_to_status_errors() {
        assert!(HResult::OK.check("Open").is_ok());
        assert!(HResult::FALSE.check("Open").is_ok());
        let err = HResult::FAIL.check("Open").unwrap_err();
        assert_eq!(err.status(), Some(HResult::FAIL));
        assert!(err.to_string().contains("E_FAIL"));
    }

    #[test]
    fn unknown_codes_still_display() {
        let s = HResult(0x8007_1128_u32 as i32).to_string();
        assert!(s.contains("0x80071128"), "{s}");
    }

    #[test]
    fn operation_result_round_trips_raw_values() {
        for raw in 0..12 {
            assert_eq!(OperationResult::from_raw(raw).to_raw(), raw);
        }
        assert!(OperationResult::from_raw(0).is_ok());
        assert_eq!(OperationResult::from_raw(3), OperationResult::CrcError);
    }
}
