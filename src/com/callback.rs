//! `IArchiveExtractCallback` (+ `IArchiveExtractCallbackMessage`).
//!
//! One callback object drives a whole `Extract` call.  For each item the
//! engine asks for a stream (`GetStream`), announces the operation
//! (`PrepareOperation`), writes, releases the stream and reports the result
//! (`SetOperationResult`).  Failures reported for individual items are
//! recorded and logged; they never abort the run.

use std::ffi::c_void;
use std::io;
use std::mem::offset_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::stream::{OutStream, SharedSink, WriteDigest};
use super::{guard, primary_interface, ComObject, IUnknownVtbl, VtableLayout, VtblPtr};
use crate::guid::{IID_IARCHIVE_EXTRACT_CALLBACK, IID_IARCHIVE_EXTRACT_CALLBACK_MSG, IID_IPROGRESS};
use crate::hresult::{rc, AskMode, EventIndexType, HResult, OperationResult};
use crate::lifetime::{self, Guarded, KeepAliveSet, RefHeader};

/// Where one entry's bytes go.
pub struct SinkTarget {
    pub sink:             SharedSink,
    /// Drop the adapter's handle (closing e.g. a `File`) when the engine
    /// releases the stream.
    pub close_on_release: bool,
}

/// Supplies a sink per entry.  `Ok(None)` skips the entry.
pub trait SinkResolver: Send {
    fn sink_for(&mut self, index: u32) -> io::Result<Option<SinkTarget>>;
}

impl<F> SinkResolver for F
where
    F: FnMut(u32) -> io::Result<Option<SinkTarget>> + Send,
{
    fn sink_for(&mut self, index: u32) -> io::Result<Option<SinkTarget>> {
        self(index)
    }
}

/// What happened to one entry the engine processed.
#[derive(Debug, Clone)]
pub struct EntryOutcome {
    pub index:  u32,
    pub mode:   AskMode,
    pub result: OperationResult,
    /// Digest of the bytes written, when a sink was supplied.
    pub digest: Option<WriteDigest>,
}

/// Everything recorded during one `Extract` call.
#[derive(Debug, Clone, Default)]
pub struct ExtractLog {
    pub outcomes:  Vec<EntryOutcome>,
    /// Results from `ReportExtractResult` that were not OK.
    pub messages:  Vec<(EventIndexType, u32, OperationResult)>,
    pub total:     u64,
    pub completed: u64,
}

#[derive(Default)]
struct Current {
    index:  Option<u32>,
    mode:   Option<AskMode>,
    stream: Option<Arc<OutStream>>,
}

// ── Slot tables ─────────────────────────────────────────────────────────────

#[repr(C)]
struct ExtractCallbackVtbl<const D: usize> {
    unknown:             IUnknownVtbl<D>,
    set_total:           unsafe extern "system" fn(*mut c_void, u64) -> i32,
    set_completed:       unsafe extern "system" fn(*mut c_void, *const u64) -> i32,
    get_stream:          unsafe extern "system" fn(*mut c_void, u32, *mut *mut c_void, i32) -> i32,
    prepare_operation:   unsafe extern "system" fn(*mut c_void, i32) -> i32,
    set_operation_result: unsafe extern "system" fn(*mut c_void, i32) -> i32,
}

#[repr(C)]
struct ExtractMessageVtbl<const D: usize> {
    unknown:               IUnknownVtbl<D>,
    report_extract_result: unsafe extern "system" fn(*mut c_void, u32, u32, i32) -> i32,
}

const MSG_OFFSET: usize = offset_of!(ExtractCallback, msg_vtbl);

impl<const D: usize> ExtractCallbackVtbl<D> {
    const NEW: Self = ExtractCallbackVtbl {
        unknown:              IUnknownVtbl::new::<ExtractCallback, 0>(),
        set_total:            cb_set_total,
        set_completed:        cb_set_completed,
        get_stream:           cb_get_stream,
        prepare_operation:    cb_prepare_operation,
        set_operation_result: cb_set_operation_result,
    };
}

impl<const D: usize> ExtractMessageVtbl<D> {
    const NEW: Self = ExtractMessageVtbl {
        unknown:               IUnknownVtbl::new::<ExtractCallback, MSG_OFFSET>(),
        report_extract_result: cb_report_extract_result,
    };
}

static CALLBACK_PLAIN: ExtractCallbackVtbl<0> = ExtractCallbackVtbl::<0>::NEW;
static CALLBACK_DTOR:  ExtractCallbackVtbl<2> = ExtractCallbackVtbl::<2>::NEW;
static MESSAGE_PLAIN:  ExtractMessageVtbl<0>  = ExtractMessageVtbl::<0>::NEW;
static MESSAGE_DTOR:   ExtractMessageVtbl<2>  = ExtractMessageVtbl::<2>::NEW;

// ── ExtractCallback ─────────────────────────────────────────────────────────

#[repr(C)]
pub struct ExtractCallback {
    vtbl:       VtblPtr,
    msg_vtbl:   VtblPtr,
    header:     RefHeader,
    keep_alive: Weak<KeepAliveSet>,
    layout:     VtableLayout,
    resolver:   Mutex<Box<dyn SinkResolver>>,
    current:    Mutex<Current>,
    log:        Mutex<ExtractLog>,
    failure:    Mutex<Option<io::Error>>,
    total:      AtomicU64,
    completed:  AtomicU64,
}

impl ExtractCallback {
    pub fn new(
        resolver: Box<dyn SinkResolver>,
        keep_alive: &Arc<KeepAliveSet>,
        layout: VtableLayout,
    ) -> Arc<Self> {
        let (vtbl, msg_vtbl) = match layout {
            VtableLayout::Plain           => (VtblPtr::of(&CALLBACK_PLAIN), VtblPtr::of(&MESSAGE_PLAIN)),
            VtableLayout::WithDestructors => (VtblPtr::of(&CALLBACK_DTOR), VtblPtr::of(&MESSAGE_DTOR)),
        };
        Arc::new(ExtractCallback {
            vtbl,
            msg_vtbl,
            header:     RefHeader::new(keep_alive, true),
            keep_alive: Arc::downgrade(keep_alive),
            layout,
            resolver:   Mutex::new(resolver),
            current:    Mutex::new(Current::default()),
            log:        Mutex::new(ExtractLog::default()),
            failure:    Mutex::new(None),
            total:      AtomicU64::new(0),
            completed:  AtomicU64::new(0),
        })
    }

    pub fn as_raw(&self) -> *mut c_void {
        primary_interface(self)
    }

    fn message_interface(&self) -> *mut c_void {
        &self.msg_vtbl as *const VtblPtr as *mut c_void
    }

    // ── IProgress ──

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn set_completed(&self, completed: Option<u64>) {
        if let Some(c) = completed {
            self.completed.store(c, Ordering::Relaxed);
        }
    }

    pub fn progress(&self) -> (u64, u64) {
        (self.completed.load(Ordering::Relaxed), self.total.load(Ordering::Relaxed))
    }

    // ── IArchiveExtractCallback ──

    /// Output stream for entry `index`, or `None` to have the engine skip
    /// writing it.  A returned stream carries one native reference that the
    /// receiver must release.
    pub fn get_stream(&self, index: u32, mode: AskMode) -> io::Result<Option<Arc<OutStream>>> {
        {
            let mut cur = self.current.lock();
            cur.index = Some(index);
            cur.mode = Some(mode);
            cur.stream = None;
        }
        if mode != AskMode::Extract {
            return Ok(None);
        }

        let target = match self.resolver.lock().sink_for(index) {
            Ok(Some(t)) => t,
            Ok(None) => {
                debug!(index, "entry skipped by caller");
                return Ok(None);
            }
            Err(e) => {
                warn!(index, error = %e, "could not provide output for entry");
                let report = io::Error::new(e.kind(), e.to_string());
                self.failure.lock().get_or_insert(report);
                return Err(e);
            }
        };

        let keep_alive = self
            .keep_alive
            .upgrade()
            .ok_or_else(|| io::Error::other("engine already shut down"))?;
        let out = OutStream::new(target.sink, target.close_on_release, &keep_alive, self.layout);
        lifetime::add_ref(&out);
        self.current.lock().stream = Some(out.clone());
        Ok(Some(out))
    }

    pub fn prepare_operation(&self, mode: AskMode) {
        self.current.lock().mode = Some(mode);
    }

    pub fn set_operation_result(&self, result: OperationResult) {
        let (index, mode, stream) = {
            let mut cur = self.current.lock();
            (cur.index.take(), cur.mode.take(), cur.stream.take())
        };
        let Some(index) = index else {
            debug!(?result, "operation result without a current entry");
            return;
        };
        if !result.is_ok() {
            warn!(index, ?result, "entry extraction failed");
        }
        let digest = stream.as_ref().map(|s| s.digest());
        self.log.lock().outcomes.push(EntryOutcome {
            index,
            mode: mode.unwrap_or(AskMode::Extract),
            result,
            digest,
        });
    }

    // ── IArchiveExtractCallbackMessage ──

    pub fn report_extract_result(&self, kind: EventIndexType, index: u32, result: OperationResult) {
        if result.is_ok() {
            return;
        }
        warn!(?kind, index, ?result, "engine reported extraction problem");
        self.log.lock().messages.push((kind, index, result));
    }

    /// Snapshot of the recorded outcomes and progress.
    pub fn log(&self) -> ExtractLog {
        let mut log = self.log.lock().clone();
        log.total = self.total.load(Ordering::Relaxed);
        log.completed = self.completed.load(Ordering::Relaxed);
        log
    }

    /// First I/O error raised while providing an output, if any.
    pub fn take_failure(&self) -> Option<io::Error> {
        self.failure.lock().take()
    }

    pub fn native_refs(&self) -> u32 {
        self.header.count()
    }
}

impl Guarded for ExtractCallback {
    fn header(&self) -> &RefHeader { &self.header }

    fn teardown(&self) {
        self.current.lock().stream = None;
    }

    fn kind(&self) -> &'static str { "ExtractCallback" }
}

impl ComObject for ExtractCallback {
    fn interface(&self, iid: &Uuid) -> Option<*mut c_void> {
        if *iid == IID_IARCHIVE_EXTRACT_CALLBACK || *iid == IID_IPROGRESS {
            Some(self.as_raw())
        } else if *iid == IID_IARCHIVE_EXTRACT_CALLBACK_MSG {
            Some(self.message_interface())
        } else {
            None
        }
    }
}

// ── Thunks ──────────────────────────────────────────────────────────────────

#[inline]
unsafe fn callback<'a>(this: *mut c_void) -> &'a ExtractCallback {
    &*(this as *const ExtractCallback)
}

unsafe extern "system" fn cb_set_total(this: *mut c_void, total: u64) -> i32 {
    let cb = callback(this);
    guard("SetTotal", || {
        cb.set_total(total);
        HResult::OK
    })
}

unsafe extern "system" fn cb_set_completed(this: *mut c_void, completed: *const u64) -> i32 {
    let cb = callback(this);
    guard("SetCompleted", || {
        cb.set_completed((!completed.is_null()).then(|| *completed));
        HResult::OK
    })
}

unsafe extern "system" fn cb_get_stream(
    this: *mut c_void,
    index: u32,
    out: *mut *mut c_void,
    ask_mode: i32,
) -> i32 {
    let cb = callback(this);
    guard("GetStream", || {
        if out.is_null() {
            return HResult(rc::E_POINTER);
        }
        *out = std::ptr::null_mut();
        let mode = AskMode::from_raw(ask_mode).unwrap_or(AskMode::Skip);
        match cb.get_stream(index, mode) {
            Ok(Some(stream)) => {
                // The reference taken in `get_stream` now belongs to the engine.
                *out = stream.as_raw();
                HResult::OK
            }
            Ok(None) => HResult::OK,
            Err(e) => HResult::from(e),
        }
    })
}

unsafe extern "system" fn cb_prepare_operation(this: *mut c_void, ask_mode: i32) -> i32 {
    let cb = callback(this);
    guard("PrepareOperation", || {
        cb.prepare_operation(AskMode::from_raw(ask_mode).unwrap_or(AskMode::Skip));
        HResult::OK
    })
}

unsafe extern "system" fn cb_set_operation_result(this: *mut c_void, result: i32) -> i32 {
    let cb = callback(this);
    guard("SetOperationResult", || {
        cb.set_operation_result(OperationResult::from_raw(result));
        HResult::OK
    })
}

unsafe extern "system" fn cb_report_extract_result(
    this: *mut c_void,
    index_type: u32,
    index: u32,
    result: i32,
) -> i32 {
    let cb = &*((this as *const u8).sub(MSG_OFFSET) as *const ExtractCallback);
    guard("ReportExtractResult", || {
        cb.report_extract_result(
            EventIndexType::from_raw(index_type),
            index,
            OperationResult::from_raw(result),
        );
        HResult::OK
    })
}
