//! Host streams exposed as `IInStream` / `IOutStream`.
//!
//! Both adapters are straight pass-through: one engine `Read`/`Write` call is
//! one call on the wrapped stream, with no buffering in between.  The wrapped
//! handle is shared (`Arc<Mutex<..>>`); with `close_on_release` the adapter
//! drops its handle when the engine releases its last reference, which
//! closes the stream if nobody else holds it.

use std::ffi::c_void;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::{guard, primary_interface, ComObject, IUnknownVtbl, VtableLayout, VtblPtr};
use crate::guid::{IID_IIN_STREAM, IID_IOUT_STREAM, IID_ISEQUENTIAL_IN_STREAM, IID_ISEQUENTIAL_OUT_STREAM};
use crate::hresult::{rc, HResult};
use crate::lifetime::{Guarded, KeepAliveSet, RefHeader};

// ── Host stream traits ──────────────────────────────────────────────────────

pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// A seekable, truncatable output.
pub trait SinkStream: Write + Seek + Send {
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl SinkStream for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

impl SinkStream for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }
}

pub type SharedStream = Arc<Mutex<dyn ReadSeek>>;
pub type SharedSink   = Arc<Mutex<dyn SinkStream>>;

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream adapter already released")
}

fn seek_from(offset: i64, origin: u32) -> Option<SeekFrom> {
    match origin {
        0 => u64::try_from(offset).ok().map(SeekFrom::Start),
        1 => Some(SeekFrom::Current(offset)),
        2 => Some(SeekFrom::End(offset)),
        _ => None,
    }
}

// ── InStream ────────────────────────────────────────────────────────────────

#[repr(C)]
struct InStreamVtbl<const D: usize> {
    unknown: IUnknownVtbl<D>,
    read:    unsafe extern "system" fn(*mut c_void, *mut c_void, u32, *mut u32) -> i32,
    seek:    unsafe extern "system" fn(*mut c_void, i64, u32, *mut u64) -> i32,
}

impl<const D: usize> InStreamVtbl<D> {
    const NEW: Self = InStreamVtbl {
        unknown: IUnknownVtbl::new::<InStream, 0>(),
        read:    in_stream_read,
        seek:    in_stream_seek,
    };
}

static IN_STREAM_PLAIN: InStreamVtbl<0> = InStreamVtbl::<0>::NEW;
static IN_STREAM_DTOR:  InStreamVtbl<2> = InStreamVtbl::<2>::NEW;

/// Input adapter handed to `IInArchive::Open`.
#[repr(C)]
pub struct InStream {
    vtbl:             VtblPtr,
    header:           RefHeader,
    stream:           Mutex<Option<SharedStream>>,
    close_on_release: bool,
}

impl InStream {
    pub fn new(
        stream: SharedStream,
        close_on_release: bool,
        keep_alive: &Arc<KeepAliveSet>,
        layout: VtableLayout,
    ) -> Arc<Self> {
        let vtbl = match layout {
            VtableLayout::Plain           => VtblPtr::of(&IN_STREAM_PLAIN),
            VtableLayout::WithDestructors => VtblPtr::of(&IN_STREAM_DTOR),
        };
        Arc::new(InStream {
            vtbl,
            header: RefHeader::new(keep_alive, true),
            stream: Mutex::new(Some(stream)),
            close_on_release,
        })
    }

    /// Interface pointer for the engine.  Does not take a reference.
    pub fn as_raw(&self) -> *mut c_void {
        primary_interface(self)
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let handle = self.stream.lock().clone().ok_or_else(closed)?;
        let mut s = handle.lock();
        s.read(buf)
    }

    pub fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        let handle = self.stream.lock().clone().ok_or_else(closed)?;
        let mut s = handle.lock();
        s.seek(pos)
    }

    /// Drop the wrapped handle now, regardless of `close_on_release`.
    pub fn close(&self) {
        self.stream.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.stream.lock().is_none()
    }

    pub fn native_refs(&self) -> u32 {
        self.header.count()
    }
}

impl Guarded for InStream {
    fn header(&self) -> &RefHeader { &self.header }

    fn teardown(&self) {
        if self.close_on_release {
            self.close();
        }
    }

    fn kind(&self) -> &'static str { "InStream" }
}

impl ComObject for InStream {
    fn interface(&self, iid: &Uuid) -> Option<*mut c_void> {
        (*iid == IID_IIN_STREAM || *iid == IID_ISEQUENTIAL_IN_STREAM).then(|| self.as_raw())
    }
}

unsafe extern "system" fn in_stream_read(
    this: *mut c_void,
    data: *mut c_void,
    size: u32,
    processed: *mut u32,
) -> i32 {
    let obj = &*(this as *const InStream);
    guard("ISequentialInStream::Read", || {
        if !processed.is_null() {
            *processed = 0;
        }
        if size == 0 {
            return HResult::OK;
        }
        if data.is_null() {
            return HResult(rc::E_POINTER);
        }
        let buf = std::slice::from_raw_parts_mut(data as *mut u8, size as usize);
        match obj.read(buf) {
            Ok(n) => {
                if !processed.is_null() {
                    *processed = n as u32;
                }
                HResult::OK
            }
            Err(e) => HResult::from(e),
        }
    })
}

unsafe extern "system" fn in_stream_seek(
    this: *mut c_void,
    offset: i64,
    origin: u32,
    new_pos: *mut u64,
) -> i32 {
    let obj = &*(this as *const InStream);
    guard("IInStream::Seek", || {
        let Some(pos) = seek_from(offset, origin) else {
            return HResult::INVALID_ARG;
        };
        match obj.seek(pos) {
            Ok(p) => {
                if !new_pos.is_null() {
                    *new_pos = p;
                }
                HResult::OK
            }
            Err(e) => HResult::from(e),
        }
    })
}

// ── OutStream ───────────────────────────────────────────────────────────────

#[repr(C)]
struct OutStreamVtbl<const D: usize> {
    unknown:  IUnknownVtbl<D>,
    write:    unsafe extern "system" fn(*mut c_void, *const c_void, u32, *mut u32) -> i32,
    seek:     unsafe extern "system" fn(*mut c_void, i64, u32, *mut u64) -> i32,
    set_size: unsafe extern "system" fn(*mut c_void, u64) -> i32,
}

impl<const D: usize> OutStreamVtbl<D> {
    const NEW: Self = OutStreamVtbl {
        unknown:  IUnknownVtbl::new::<OutStream, 0>(),
        write:    out_stream_write,
        seek:     out_stream_seek,
        set_size: out_stream_set_size,
    };
}

static OUT_STREAM_PLAIN: OutStreamVtbl<0> = OutStreamVtbl::<0>::NEW;
static OUT_STREAM_DTOR:  OutStreamVtbl<2> = OutStreamVtbl::<2>::NEW;

/// Running CRC-32 of the bytes written through an [`OutStream`].
///
/// Only meaningful while writes are sequential; any seek that moves away
/// from the end of the written data invalidates it.
#[derive(Debug, Clone)]
pub struct WriteDigest {
    crc:        crc32fast::Hasher,
    pub len:    u64,
    sequential: bool,
}

impl WriteDigest {
    fn new() -> Self {
        WriteDigest { crc: crc32fast::Hasher::new(), len: 0, sequential: true }
    }

    /// CRC-32 of the output, if every write was sequential.
    pub fn crc32(&self) -> Option<u32> {
        self.sequential.then(|| self.crc.clone().finalize())
    }
}

/// Output adapter handed to the engine from `GetStream`.
#[repr(C)]
pub struct OutStream {
    vtbl:             VtblPtr,
    header:           RefHeader,
    sink:             Mutex<Option<SharedSink>>,
    digest:           Mutex<WriteDigest>,
    close_on_release: bool,
}

impl OutStream {
    pub fn new(
        sink: SharedSink,
        close_on_release: bool,
        keep_alive: &Arc<KeepAliveSet>,
        layout: VtableLayout,
    ) -> Arc<Self> {
        let vtbl = match layout {
            VtableLayout::Plain           => VtblPtr::of(&OUT_STREAM_PLAIN),
            VtableLayout::WithDestructors => VtblPtr::of(&OUT_STREAM_DTOR),
        };
        Arc::new(OutStream {
            vtbl,
            header: RefHeader::new(keep_alive, true),
            sink: Mutex::new(Some(sink)),
            digest: Mutex::new(WriteDigest::new()),
            close_on_release,
        })
    }

    pub fn as_raw(&self) -> *mut c_void {
        primary_interface(self)
    }

    fn handle(&self) -> io::Result<SharedSink> {
        self.sink.lock().clone().ok_or_else(closed)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let handle = self.handle()?;
        let n = handle.lock().write(buf)?;
        let mut d = self.digest.lock();
        d.crc.update(&buf[..n]);
        d.len += n as u64;
        Ok(n)
    }

    pub fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        let handle = self.handle()?;
        let p = handle.lock().seek(pos)?;
        let mut d = self.digest.lock();
        if p != d.len {
            d.sequential = false;
        }
        Ok(p)
    }

    pub fn set_len(&self, len: u64) -> io::Result<()> {
        let handle = self.handle()?;
        handle.lock().set_len(len)?;
        let mut d = self.digest.lock();
        if len < d.len {
            d.sequential = false;
        }
        Ok(())
    }

    pub fn flush(&self) -> io::Result<()> {
        match self.sink.lock().clone() {
            Some(h) => h.lock().flush(),
            None => Ok(()),
        }
    }

    pub fn digest(&self) -> WriteDigest {
        self.digest.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.sink.lock().is_none()
    }

    pub fn native_refs(&self) -> u32 {
        self.header.count()
    }
}

impl Guarded for OutStream {
    fn header(&self) -> &RefHeader { &self.header }

    fn teardown(&self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "flush on release failed");
        }
        if self.close_on_release {
            self.sink.lock().take();
        }
    }

    fn kind(&self) -> &'static str { "OutStream" }
}

impl ComObject for OutStream {
    fn interface(&self, iid: &Uuid) -> Option<*mut c_void> {
        (*iid == IID_IOUT_STREAM || *iid == IID_ISEQUENTIAL_OUT_STREAM).then(|| self.as_raw())
    }
}

unsafe extern "system" fn out_stream_write(
    this: *mut c_void,
    data: *const c_void,
    size: u32,
    processed: *mut u32,
) -> i32 {
    let obj = &*(this as *const OutStream);
    guard("ISequentialOutStream::Write", || {
        if !processed.is_null() {
            *processed = 0;
        }
        if size == 0 {
            return HResult::OK;
        }
        if data.is_null() {
            return HResult(rc::E_POINTER);
        }
        let buf = std::slice::from_raw_parts(data as *const u8, size as usize);
        match obj.write(buf) {
            Ok(n) => {
                if !processed.is_null() {
                    *processed = n as u32;
                }
                HResult::OK
            }
            Err(e) => HResult::from(e),
        }
    })
}

unsafe extern "system" fn out_stream_seek(
    this: *mut c_void,
    offset: i64,
    origin: u32,
    new_pos: *mut u64,
) -> i32 {
    let obj = &*(this as *const OutStream);
    guard("IOutStream::Seek", || {
        let Some(pos) = seek_from(offset, origin) else {
            return HResult::INVALID_ARG;
        };
        match obj.seek(pos) {
            Ok(p) => {
                if !new_pos.is_null() {
                    *new_pos = p;
                }
                HResult::OK
            }
            Err(e) => HResult::from(e),
        }
    })
}

unsafe extern "system" fn out_stream_set_size(this: *mut c_void, size: u64) -> i32 {
    let obj = &*(this as *const OutStream);
    guard("IOutStream::SetSize", || match obj.set_len(size) {
        Ok(()) => HResult::OK,
        Err(e) => HResult::from(e),
    })
}
