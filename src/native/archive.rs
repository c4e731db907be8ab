//! `IInArchive` objects created by a loaded module.

use std::ffi::c_void;
use std::sync::Arc;

use tracing::{debug, warn};

use super::library::NativeModule;
use crate::com::{ComPtr, ExtractCallback, InStream, OpenCallback};
use crate::engine::ArchiveReader;
use crate::error::{Result, SevenZipError};
use crate::hresult::HResult;
use crate::props::ItemProp;
use crate::variant::{PropValue, PropVariant};

// Method slots, counted without destructor slots.
const OPEN:                usize = 3;
const CLOSE:               usize = 4;
const GET_NUMBER_OF_ITEMS: usize = 5;
const GET_PROPERTY:        usize = 6;
const EXTRACT:             usize = 7;

type OpenFn             = unsafe extern "system" fn(*mut c_void, *mut c_void, *const u64, *mut c_void) -> i32;
type CloseFn            = unsafe extern "system" fn(*mut c_void) -> i32;
type GetNumberOfItemsFn = unsafe extern "system" fn(*mut c_void, *mut u32) -> i32;
type GetPropertyFn      = unsafe extern "system" fn(*mut c_void, u32, u32, *mut PropVariant) -> i32;
type ExtractFn          = unsafe extern "system" fn(*mut c_void, *const u32, u32, i32, *mut c_void) -> i32;

/// A reader instance.  Holds its module so the library outlives it.
pub struct NativeArchive {
    // Released before `module` is dropped.
    ptr:    ComPtr,
    module: Arc<NativeModule>,
    opened: bool,
}

impl NativeArchive {
    pub(crate) fn new(ptr: ComPtr, module: Arc<NativeModule>) -> Self {
        NativeArchive { ptr, module, opened: false }
    }

    pub fn module(&self) -> &Arc<NativeModule> {
        &self.module
    }
}

impl ArchiveReader for NativeArchive {
    fn open(
        &mut self,
        stream: &Arc<InStream>,
        max_check_start: u64,
        callback: Option<&Arc<OpenCallback>>,
    ) -> Result<()> {
        let callback = callback.map_or(std::ptr::null_mut(), |cb| cb.as_raw());
        let status = unsafe {
            let open: OpenFn = self.ptr.method(OPEN);
            HResult(open(self.ptr.as_raw(), stream.as_raw(), &max_check_start, callback))
        };
        if status != HResult::OK {
            debug!(%status, "Open rejected the stream");
            return Err(SevenZipError::ArchiveOpenFailed { status });
        }
        self.opened = true;
        Ok(())
    }

    fn item_count(&mut self) -> Result<u32> {
        let mut n = 0u32;
        let status = unsafe {
            let get: GetNumberOfItemsFn = self.ptr.method(GET_NUMBER_OF_ITEMS);
            HResult(get(self.ptr.as_raw(), &mut n))
        };
        status.check("GetNumberOfItems")?;
        Ok(n)
    }

    fn property(&mut self, index: u32, prop: ItemProp) -> Result<PropValue> {
        let ptr = &self.ptr;
        let (status, value) = self.module.read_variant(false, |v| unsafe {
            let get: GetPropertyFn = ptr.method(GET_PROPERTY);
            get(ptr.as_raw(), index, prop.id(), v)
        });
        status.check("GetProperty")?;
        Ok(value)
    }

    fn extract(
        &mut self,
        indices: Option<&[u32]>,
        test_mode: bool,
        callback: &Arc<ExtractCallback>,
    ) -> Result<()> {
        let (list, count) = match indices {
            Some(ix) => (ix.as_ptr(), ix.len() as u32),
            None     => (std::ptr::null(), u32::MAX),
        };
        let status = unsafe {
            let extract: ExtractFn = self.ptr.method(EXTRACT);
            HResult(extract(self.ptr.as_raw(), list, count, test_mode as i32, callback.as_raw()))
        };
        status.check("Extract")
    }

    fn close(&mut self) -> Result<()> {
        if !self.opened {
            return Ok(());
        }
        self.opened = false;
        let status = unsafe {
            let close: CloseFn = self.ptr.method(CLOSE);
            HResult(close(self.ptr.as_raw()))
        };
        status.check("Close")
    }
}

impl Drop for NativeArchive {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "archive close failed during drop");
        }
    }
}
