//! Crate-wide error type.
//!
//! Every non-OK status coming back from the engine is turned into a
//! [`SevenZipError`] at the call site that received it.  Nothing above the
//! FFI layer ever inspects a raw `HRESULT`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::hresult::HResult;
use crate::variant::PropKind;

pub type Result<T, E = SevenZipError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum SevenZipError {
    #[error("Failed to load native module {path}: {reason}")]
    NativeModuleLoadFailed { path: PathBuf, reason: String },

    #[error("Export `{symbol}` not found in {path}")]
    ExportNotFound { symbol: &'static str, path: PathBuf },

    /// No format candidate for the stream + name combination.
    #[error("Unknown archive format{}", .name.as_deref().map(|n| format!(" for {n}")).unwrap_or_default())]
    UnknownFormat { name: Option<String> },

    #[error("Unable to open archive: {status}")]
    ArchiveOpenFailed { status: HResult },

    #[error("Engine refused to create object {class_id}: {status}")]
    ObjectCreationFailed { class_id: uuid::Uuid, status: HResult },

    /// The engine returned a variant of the wrong kind for a property the
    /// caller cannot do without.
    #[error("Property {property} has kind {found:?}, expected {expected}")]
    PropertyTypeMismatch {
        property: &'static str,
        expected: &'static str,
        found:    PropKind,
    },

    #[error("{call} failed: {status}")]
    Status { call: &'static str, status: HResult },

    #[error("Invalid signature for format {format}: {reason}")]
    InvalidSignature { format: String, reason: &'static str },

    /// `release()` called on an object whose count is already zero.
    #[error("Over-release of native-visible object at {addr:#x}")]
    OverRelease { addr: usize },

    #[error("{count} object(s) still referenced by native code at shutdown")]
    LeakedNativeReference { count: usize },

    #[error("Archive session is closed")]
    SessionClosed,

    #[error("Entry index {index} out of range ({count} entries)")]
    EntryOutOfRange { index: u32, count: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SevenZipError {
    /// Status code carried by the error, if it came from the engine.
    pub fn status(&self) -> Option<HResult> {
        match self {
            SevenZipError::ArchiveOpenFailed { status }
            | SevenZipError::ObjectCreationFailed { status, .. }
            | SevenZipError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
