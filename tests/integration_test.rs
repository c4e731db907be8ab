use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use proptest::prelude::*;
use sevenzip_bridge::catalog::{ArcFlags, ExtensionInfo, FormatDescriptor, SignatureCatalog};
use sevenzip_bridge::com::{
    ComPtr, ExtractCallback, InStream, OpenCallback, QueryInterfaceFn, SharedSink, SharedStream,
    SinkTarget, VtableLayout,
};
use sevenzip_bridge::detect::FormatDetector;
use sevenzip_bridge::engine::{ArchiveEngine, ArchiveReader};
use sevenzip_bridge::guid::{
    Guid, IID_IARCHIVE_EXTRACT_CALLBACK, IID_IARCHIVE_EXTRACT_CALLBACK_MSG,
    IID_IARCHIVE_OPEN_VOLUME_CALLBACK, IID_IIN_STREAM,
};
use sevenzip_bridge::hresult::{EventIndexType, HResult, OperationResult, ProbeResult};
use sevenzip_bridge::lifetime::{self, KeepAliveSet};
use sevenzip_bridge::props::ItemProp;
use sevenzip_bridge::session::{read_entry, EntryProblem, SessionState};
use sevenzip_bridge::variant::{datetime_to_filetime, free_bstr, PropValue, PropVariant};
use sevenzip_bridge::{
    ArchiveFormat, ExtractOptions, ExtractionSession, FormatSelection, Result, SevenZipError,
};
use std::ffi::c_void;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;
use uuid::Uuid;

// ── Toy archive format ───────────────────────────────────────────────────────
//
// "TOY1" | u32 count | { u16 name_len | name | u8 flags | u32 len | data }*

const TOY_ID: Uuid = Uuid::from_u128(0x746f79_0001);
const LAX_ID: Uuid = Uuid::from_u128(0x746f79_0002);
const GHOST_ID: Uuid = Uuid::from_u128(0x746f79_0099);

const FOLDER:         u8 = 1;
const CORRUPT:        u8 = 2;
const WRONG_PASSWORD: u8 = 4;
const BAD_CRC:        u8 = 8;
const BAD_SIZE:       u8 = 16;

#[derive(Clone)]
struct ToyItem {
    name:  String,
    flags: u8,
    data:  Vec<u8>,
}

fn file(name: &str, data: &[u8]) -> ToyItem {
    ToyItem { name: name.into(), flags: 0, data: data.to_vec() }
}

fn folder(name: &str) -> ToyItem {
    ToyItem { name: name.into(), flags: FOLDER, data: Vec::new() }
}

fn flagged(name: &str, data: &[u8], flags: u8) -> ToyItem {
    ToyItem { name: name.into(), flags, data: data.to_vec() }
}

fn toy_archive(items: &[ToyItem]) -> Vec<u8> {
    let mut out = b"TOY1".to_vec();
    out.write_u32::<LittleEndian>(items.len() as u32).unwrap();
    for it in items {
        out.write_u16::<LittleEndian>(it.name.len() as u16).unwrap();
        out.extend_from_slice(it.name.as_bytes());
        out.push(it.flags);
        out.write_u32::<LittleEndian>(it.data.len() as u32).unwrap();
        out.extend_from_slice(&it.data);
    }
    out
}

fn parse_toy(body: &[u8]) -> Option<Vec<ToyItem>> {
    let mut r = Cursor::new(body);
    let count = r.read_u32::<LittleEndian>().ok()?;
    let mut items = Vec::new();
    for _ in 0..count {
        let n = r.read_u16::<LittleEndian>().ok()? as usize;
        let mut name = vec![0u8; n];
        r.read_exact(&mut name).ok()?;
        let flags = r.read_u8().ok()?;
        let len = r.read_u32::<LittleEndian>().ok()? as usize;
        let mut data = vec![0u8; len];
        r.read_exact(&mut data).ok()?;
        items.push(ToyItem { name: String::from_utf8(name).ok()?, flags, data });
    }
    Some(items)
}

// ── Engine double ────────────────────────────────────────────────────────────

fn descriptor(
    class_id: Uuid,
    name: &str,
    signatures: &[&[u8]],
    ext: &str,
    probe: Option<sevenzip_bridge::catalog::ProbeFn>,
) -> FormatDescriptor {
    FormatDescriptor {
        class_id,
        name:             name.into(),
        signatures:       signatures.iter().map(|s| s.to_vec()).collect(),
        signature_offset: 0,
        extensions:       vec![ExtensionInfo { ext: ext.into(), add_ext: String::new() }],
        flags:            ArcFlags::default(),
        time_flags:       0,
        can_update:       false,
        probe,
        module_index:     0,
        format_index:     0,
    }
}

struct ToyEngine {
    catalog:    SignatureCatalog,
    keep_alive: Arc<KeepAliveSet>,
    layout:     VtableLayout,
    /// Archive name each reader learned from its open callback.
    opened_as:  Arc<Mutex<Vec<Option<String>>>>,
}

impl ToyEngine {
    fn new(layout: VtableLayout) -> Arc<Self> {
        let toy = descriptor(TOY_ID, "Toy", &[b"TOY1"], "toy", None);
        Self::with_catalog(vec![toy], layout)
    }

    /// A permissive handler ahead of the real one: its probe says yes to
    /// everything but its reader never opens.
    fn with_lax(layout: VtableLayout) -> Arc<Self> {
        let lax = descriptor(LAX_ID, "Lax", &[], "lax", Some(Arc::new(|_: &[u8]| ProbeResult::Yes)));
        let toy = descriptor(TOY_ID, "Toy", &[b"TOY1"], "toy", None);
        Self::with_catalog(vec![lax, toy], layout)
    }

    /// A handler listed in the catalog whose reader cannot be created.
    fn with_ghost(layout: VtableLayout) -> Arc<Self> {
        let ghost = descriptor(GHOST_ID, "Ghost", &[], "ghost", Some(Arc::new(|_: &[u8]| ProbeResult::Yes)));
        let toy = descriptor(TOY_ID, "Toy", &[b"TOY1"], "toy", None);
        Self::with_catalog(vec![ghost, toy], layout)
    }

    fn with_catalog(formats: Vec<FormatDescriptor>, layout: VtableLayout) -> Arc<Self> {
        Arc::new(ToyEngine {
            catalog: SignatureCatalog::new(formats).unwrap(),
            keep_alive: KeepAliveSet::new(),
            layout,
            opened_as: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

impl ArchiveEngine for ToyEngine {
    fn catalog(&self) -> &SignatureCatalog {
        &self.catalog
    }

    fn keep_alive(&self) -> &Arc<KeepAliveSet> {
        &self.keep_alive
    }

    fn vtable_layout(&self) -> VtableLayout {
        self.layout
    }

    fn create_reader(&self, class_id: &Uuid) -> Result<Box<dyn ArchiveReader>> {
        if *class_id == TOY_ID || *class_id == LAX_ID {
            Ok(Box::new(ToyReader::new(self.layout, *class_id == TOY_ID, self.opened_as.clone())))
        } else {
            Err(SevenZipError::UnknownFormat { name: Some(class_id.to_string()) })
        }
    }
}

type ReadFn          = unsafe extern "system" fn(*mut c_void, *mut c_void, u32, *mut u32) -> i32;
type WriteFn         = unsafe extern "system" fn(*mut c_void, *const c_void, u32, *mut u32) -> i32;
type SetTotalFn      = unsafe extern "system" fn(*mut c_void, u64) -> i32;
type SetCompletedFn  = unsafe extern "system" fn(*mut c_void, *const u64) -> i32;
type GetStreamFn     = unsafe extern "system" fn(*mut c_void, u32, *mut *mut c_void, i32) -> i32;
type PrepareFn       = unsafe extern "system" fn(*mut c_void, i32) -> i32;
type SetResultFn     = unsafe extern "system" fn(*mut c_void, i32) -> i32;
type ReportResultFn  = unsafe extern "system" fn(*mut c_void, u32, u32, i32) -> i32;
type VolumePropFn    = unsafe extern "system" fn(*mut c_void, u32, *mut PropVariant) -> i32;

/// `QueryInterface` through the object's own slot table, the way the engine
/// does it.  The returned pointer owns the reference QI took.
unsafe fn query(iface: *mut c_void, layout: VtableLayout, iid: Uuid) -> Option<ComPtr> {
    let vtbl = *(iface as *const *const QueryInterfaceFn);
    let qi = *vtbl;
    let iid = Guid::from(iid);
    let mut out = std::ptr::null_mut();
    if qi(iface, &iid, &mut out) != 0 {
        return None;
    }
    ComPtr::from_raw(out, layout)
}

fn status(call: &'static str, hr: i32) -> SevenZipError {
    SevenZipError::Status { call, status: HResult(hr) }
}

/// Reader for the toy format that only touches the host through the
/// adapters' slot tables.
struct ToyReader {
    layout:    VtableLayout,
    accept:    bool,
    input:     Option<ComPtr>,
    items:     Vec<ToyItem>,
    opened_as: Arc<Mutex<Vec<Option<String>>>>,
}

impl ToyReader {
    fn new(layout: VtableLayout, accept: bool, opened_as: Arc<Mutex<Vec<Option<String>>>>) -> Self {
        ToyReader { layout, accept, input: None, items: Vec::new(), opened_as }
    }

    /// Ask the open callback for the archive name, as multi-volume handlers do.
    fn archive_name(&self, callback: &OpenCallback) -> Result<Option<String>> {
        let volume = unsafe { query(callback.as_raw(), self.layout, IID_IARCHIVE_OPEN_VOLUME_CALLBACK) }
            .ok_or_else(|| status("QueryInterface", HResult::NO_INTERFACE.0))?;
        let mut v = PropVariant::default();
        let hr = unsafe {
            let get: VolumePropFn = volume.method(3);
            get(volume.as_raw(), ItemProp::Name.id(), &mut v)
        };
        HResult(hr).check("GetProperty")?;
        let value = unsafe { v.to_value(false) };
        unsafe { free_bstr(v.data.bstr) };
        value.into_string("Name")
    }
}

impl ArchiveReader for ToyReader {
    fn open(
        &mut self,
        stream: &Arc<InStream>,
        _max_check_start: u64,
        callback: Option<&Arc<OpenCallback>>,
    ) -> Result<()> {
        let name = match callback {
            Some(cb) => self.archive_name(cb)?,
            None => None,
        };
        self.opened_as.lock().push(name);
        let input = unsafe { query(stream.as_raw(), self.layout, IID_IIN_STREAM) }
            .ok_or_else(|| status("QueryInterface", HResult::NO_INTERFACE.0))?;
        let mut buf = Vec::new();
        let mut chunk = [0u8; 5];
        loop {
            let mut n = 0u32;
            let hr = unsafe {
                let read: ReadFn = input.method(3);
                read(input.as_raw(), chunk.as_mut_ptr().cast(), chunk.len() as u32, &mut n)
            };
            HResult(hr).check("Read")?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n as usize]);
        }
        if !self.accept || !buf.starts_with(b"TOY1") {
            return Err(SevenZipError::ArchiveOpenFailed { status: HResult::FALSE });
        }
        self.items = parse_toy(&buf[4..]).ok_or(SevenZipError::ArchiveOpenFailed { status: HResult::FAIL })?;
        self.input = Some(input);
        Ok(())
    }

    fn item_count(&mut self) -> Result<u32> {
        Ok(self.items.len() as u32)
    }

    fn property(&mut self, index: u32, prop: ItemProp) -> Result<PropValue> {
        let it = self.items.get(index as usize).ok_or_else(|| status("GetProperty", HResult::INVALID_ARG.0))?;
        let folder = it.flags & FOLDER != 0;
        Ok(match prop {
            ItemProp::Path          => PropValue::Str(it.name.clone()),
            ItemProp::IsFolder      => PropValue::Bool(folder),
            ItemProp::Encrypted     => PropValue::Bool(it.flags & WRONG_PASSWORD != 0),
            ItemProp::Size if it.flags & BAD_SIZE != 0 => PropValue::Str("huge".into()),
            ItemProp::Size          => PropValue::U64(it.data.len() as u64),
            ItemProp::PackedSize    => PropValue::U64(it.data.len() as u64),
            ItemProp::Crc if folder => PropValue::Empty,
            ItemProp::Crc => {
                let crc = crc32fast::hash(&it.data);
                PropValue::U32(if it.flags & BAD_CRC != 0 { crc ^ 1 } else { crc })
            }
            ItemProp::LastWriteTime => {
                PropValue::FileTime(datetime_to_filetime(Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap()))
            }
            ItemProp::Attributes    => return Err(status("GetProperty", HResult::INVALID_ARG.0)),
            _                       => PropValue::Empty,
        })
    }

    fn extract(
        &mut self,
        indices: Option<&[u32]>,
        test_mode: bool,
        callback: &Arc<ExtractCallback>,
    ) -> Result<()> {
        let layout = self.layout;
        let cb = unsafe { query(callback.as_raw(), layout, IID_IARCHIVE_EXTRACT_CALLBACK) }
            .ok_or_else(|| status("QueryInterface", HResult::NO_INTERFACE.0))?;
        let msg = unsafe { query(callback.as_raw(), layout, IID_IARCHIVE_EXTRACT_CALLBACK_MSG) };

        let all: Vec<u32> = (0..self.items.len() as u32).collect();
        let list = indices.unwrap_or(&all);
        let total: u64 = list.iter().map(|&i| self.items[i as usize].data.len() as u64).sum();

        unsafe {
            let set_total: SetTotalFn = cb.method(3);
            set_total(cb.as_raw(), total);

            let mut done = 0u64;
            for &i in list {
                let item = self.items.get(i as usize).ok_or_else(|| status("Extract", HResult::INVALID_ARG.0))?;
                let mut mode = if test_mode { 1 } else { 0 };

                let get_stream: GetStreamFn = cb.method(5);
                let mut raw = std::ptr::null_mut();
                let hr = get_stream(cb.as_raw(), i, &mut raw, mode);
                if hr != 0 {
                    return Err(status("GetStream", hr));
                }
                let out = ComPtr::from_raw(raw, layout);
                if out.is_none() && mode == 0 {
                    mode = 2;
                }
                let prepare: PrepareFn = cb.method(6);
                prepare(cb.as_raw(), mode);

                if let Some(out) = &out {
                    let data = if item.flags & CORRUPT != 0 {
                        &item.data[..item.data.len() / 2]
                    } else {
                        &item.data[..]
                    };
                    for piece in data.chunks(7) {
                        let write: WriteFn = out.method(3);
                        let mut n = 0u32;
                        HResult(write(out.as_raw(), piece.as_ptr().cast(), piece.len() as u32, &mut n))
                            .check("Write")?;
                        assert_eq!(n as usize, piece.len());
                    }
                }
                // The stream is released before the result is reported.
                drop(out);

                let result = if item.flags & CORRUPT != 0 {
                    OperationResult::DataError
                } else if item.flags & WRONG_PASSWORD != 0 {
                    OperationResult::WrongPassword
                } else {
                    OperationResult::Ok
                };
                if result == OperationResult::WrongPassword {
                    if let Some(msg) = &msg {
                        let report: ReportResultFn = msg.method(3);
                        report(msg.as_raw(), 1, i, result.to_raw());
                    }
                }
                let set_result: SetResultFn = cb.method(7);
                set_result(cb.as_raw(), result.to_raw());

                done += item.data.len() as u64;
                let set_completed: SetCompletedFn = cb.method(4);
                set_completed(cb.as_raw(), &done);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.input = None;
        self.items.clear();
        Ok(())
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

const LAYOUTS: [VtableLayout; 2] = [VtableLayout::Plain, VtableLayout::WithDestructors];

fn sample_items() -> Vec<ToyItem> {
    vec![
        folder("docs"),
        file("docs/readme.txt", b"Hello through the engine boundary!"),
        file("empty.bin", b""),
        file("data.bin", &(0u8..=255).cycle().take(3000).collect::<Vec<u8>>()),
    ]
}

fn session_for(engine: &Arc<ToyEngine>, items: &[ToyItem], name: &str) -> ExtractionSession {
    let engine: Arc<dyn ArchiveEngine> = engine.clone();
    ExtractionSession::from_reader(engine, Cursor::new(toy_archive(items)), Some(name), FormatSelection::Auto)
        .unwrap()
}

fn memory_sinks(n: usize) -> (Vec<Arc<Mutex<Cursor<Vec<u8>>>>>, Vec<Option<SharedSink>>) {
    let bufs: Vec<_> = (0..n).map(|_| Arc::new(Mutex::new(Cursor::new(Vec::<u8>::new())))).collect();
    let sinks = bufs.iter().map(|b| Some(b.clone() as SharedSink)).collect();
    (bufs, sinks)
}

// ── Detection ────────────────────────────────────────────────────────────────

#[test]
fn signature_match_is_probable() {
    let engine = ToyEngine::new(VtableLayout::Plain);
    let bytes = toy_archive(&sample_items());
    let result = FormatDetector::new(engine.catalog())
        .detect(&mut Cursor::new(bytes), None)
        .unwrap();
    assert_eq!(result.probable, vec![0]);
    assert!(result.unlikely.is_empty());
}

#[test]
fn rar5_prefix_is_not_mistaken_for_rar4() {
    let catalog = SignatureCatalog::builtin();
    let mut data = b"Rar!\x1A\x07\x01\x00".to_vec();
    data.resize(64, 0);
    let result = FormatDetector::new(&catalog)
        .detect(&mut Cursor::new(data), Some("archive.rar"))
        .unwrap();
    let best = catalog.get(result.best().unwrap()).unwrap();
    assert_eq!(best.archive_format(), Some(ArchiveFormat::Rar5));
    let rar4 = catalog.iter().position(|d| d.archive_format() == Some(ArchiveFormat::Rar)).unwrap();
    assert!(!result.probable.contains(&rar4));
    assert_eq!(ArchiveFormat::from_extension("rar"), None);
}

#[test]
fn legacy_rar_prefix_selects_rar4() {
    let catalog = SignatureCatalog::builtin();
    let mut data = b"Rar!\x1A\x07\x00".to_vec();
    data.resize(64, 0);
    let result = FormatDetector::new(&catalog)
        .detect(&mut Cursor::new(data), Some("x.rar"))
        .unwrap();
    let best = catalog.get(result.best().unwrap()).unwrap();
    assert_eq!(best.archive_format(), Some(ArchiveFormat::Rar));
    let rar5 = catalog.iter().position(|d| d.archive_format() == Some(ArchiveFormat::Rar5)).unwrap();
    assert!(!result.probable.contains(&rar5));
}

#[test]
fn extension_narrows_shared_signatures() {
    let a = descriptor(Uuid::from_u128(1), "A", &[b"AB"], "a", None);
    let b = descriptor(Uuid::from_u128(2), "B", &[b"AB"], "b", None);
    let catalog = SignatureCatalog::new(vec![a, b]).unwrap();
    let det = FormatDetector::new(&catalog);

    let r = det.detect(&mut Cursor::new(b"ABCD".to_vec()), Some("file.B")).unwrap();
    assert_eq!(r.probable, vec![1]);
    assert_eq!(r.unlikely, vec![0]);

    // An extension no probable format lists changes nothing.
    let r = det.detect(&mut Cursor::new(b"ABCD".to_vec()), Some("file.zzz")).unwrap();
    assert_eq!(r.probable, vec![0, 1]);
}

#[test]
fn zero_length_signature_is_rejected() {
    let bad = descriptor(Uuid::from_u128(3), "Bad", &[b""], "bad", None);
    assert!(matches!(
        SignatureCatalog::new(vec![bad]),
        Err(SevenZipError::InvalidSignature { .. })
    ));
}

proptest! {
    #[test]
    fn detection_leaves_stream_where_it_was(
        data in proptest::collection::vec(any::<u8>(), 0..4096),
        start in 0usize..4096,
        name in proptest::option::of("[a-z]{1,8}\\.[a-z0-9]{1,4}"),
    ) {
        let catalog = SignatureCatalog::builtin();
        let start = start.min(data.len()) as u64;
        let mut cur = Cursor::new(data);
        cur.seek(SeekFrom::Start(start)).unwrap();
        let result = FormatDetector::new(&catalog).detect(&mut cur, name.as_deref()).unwrap();
        prop_assert_eq!(cur.position(), start);
        for i in &result.probable {
            prop_assert!(!result.unlikely.contains(i));
        }
    }

    #[test]
    fn native_count_matches_keep_alive_membership(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
        let set = KeepAliveSet::new();
        let stream: SharedStream = Arc::new(Mutex::new(Cursor::new(vec![1u8, 2, 3])));
        let obj = InStream::new(stream, false, &set, VtableLayout::Plain);
        let addr = Arc::as_ptr(&obj) as usize;
        let mut model = 0u32;
        for add in ops {
            if add {
                model += 1;
                prop_assert_eq!(lifetime::add_ref(&obj), model);
            } else if model == 0 {
                let over_released = matches!(lifetime::release(&obj), Err(SevenZipError::OverRelease { .. }));
                prop_assert!(over_released);
            } else {
                model -= 1;
                prop_assert_eq!(lifetime::release(&obj).unwrap(), model);
            }
            prop_assert_eq!(obj.native_refs(), model);
            prop_assert_eq!(set.contains(addr), model > 0);
        }
        while model > 0 {
            model -= 1;
            lifetime::release(&obj).unwrap();
        }
        prop_assert!(set.is_empty());
    }
}

// ── Extraction ───────────────────────────────────────────────────────────────

#[test]
fn extracted_bytes_match_archive_contents() {
    for layout in LAYOUTS {
        let engine = ToyEngine::new(layout);
        let items = sample_items();
        let mut session = session_for(&engine, &items, "sample.toy");

        let entries = session.entries().unwrap().to_vec();
        assert_eq!(entries.len(), items.len());
        assert_eq!(session.format_name(), Some("Toy"));

        let (bufs, mut sinks) = memory_sinks(items.len());
        sinks[0] = None;
        let report = session.extract_to_sinks(sinks).unwrap();
        assert!(report.is_clean(), "{:?}", report.warnings);
        assert_eq!(report.extracted, vec![1, 2, 3]);
        assert_eq!(report.skipped, vec![0]);
        assert_eq!(report.bytes_written, items.iter().map(|i| i.data.len() as u64).sum::<u64>());

        for (item, buf) in items.iter().zip(&bufs) {
            let got = buf.lock().get_ref().clone();
            assert_eq!(blake3::hash(&got), blake3::hash(&item.data), "{}", item.name);
        }

        // Only the reader's input adapter is still referenced.
        assert_eq!(engine.keep_alive().len(), 1);
        session.close().unwrap();
        assert!(engine.keep_alive().is_empty());
    }
}

#[test]
fn entries_without_sink_are_skipped() {
    let engine = ToyEngine::new(VtableLayout::platform_default());
    let items = sample_items();
    let mut session = session_for(&engine, &items, "sample.toy");

    let only = Arc::new(Mutex::new(Cursor::new(Vec::<u8>::new())));
    let sinks = vec![None, None, None, Some(only.clone() as SharedSink)];
    let report = session.extract_to_sinks(sinks).unwrap();

    assert_eq!(report.extracted, vec![3]);
    assert_eq!(report.skipped, vec![0, 1, 2]);
    assert_eq!(only.lock().get_ref(), &items[3].data);
}

#[test]
fn failed_entry_does_not_abort_the_rest() {
    let engine = ToyEngine::new(VtableLayout::Plain);
    let items = vec![
        file("a", b"first"),
        flagged("b", b"broken payload", CORRUPT),
        file("c", b"third"),
    ];
    let mut session = session_for(&engine, &items, "x.toy");
    let (bufs, sinks) = memory_sinks(3);
    let report = session.extract_to_sinks(sinks).unwrap();

    assert_eq!(report.extracted, vec![0, 2]);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].index, Some(1));
    assert_eq!(report.warnings[0].path.as_deref(), Some("b"));
    assert_eq!(report.warnings[0].problem, EntryProblem::Operation(OperationResult::DataError));
    assert_eq!(bufs[2].lock().get_ref(), b"third");
}

#[test]
fn message_interface_reports_are_recorded() {
    let engine = ToyEngine::new(VtableLayout::WithDestructors);
    let items = vec![flagged("secret", b"xyz", WRONG_PASSWORD)];
    let mut session = session_for(&engine, &items, "x.toy");
    assert!(session.entries().unwrap()[0].is_encrypted);

    let (_bufs, sinks) = memory_sinks(1);
    let report = session.extract_to_sinks(sinks).unwrap();
    assert!(report.warnings.iter().any(|w| w.problem
        == EntryProblem::Reported { kind: EventIndexType::InArcIndex, result: OperationResult::WrongPassword }));
    assert!(report.warnings.iter().any(|w| w.problem == EntryProblem::Operation(OperationResult::WrongPassword)));
}

#[test]
fn crc_mismatch_is_flagged() {
    let engine = ToyEngine::new(VtableLayout::Plain);
    let items = vec![file("ok", b"fine"), flagged("bad", b"tampered", BAD_CRC)];
    let mut session = session_for(&engine, &items, "x.toy");
    let (_bufs, sinks) = memory_sinks(2);
    let report = session.extract_to_sinks(sinks).unwrap();

    assert_eq!(report.extracted, vec![0]);
    let crc = crc32fast::hash(b"tampered");
    assert_eq!(
        report.warnings[0].problem,
        EntryProblem::CrcMismatch { expected: crc ^ 1, actual: crc }
    );
}

#[test]
fn test_mode_decodes_without_sinks() {
    let engine = ToyEngine::new(VtableLayout::Plain);
    let items = sample_items();
    let mut session = session_for(&engine, &items, "sample.toy");
    let report = session.test().unwrap();
    assert_eq!(report.tested, vec![0, 1, 2, 3]);
    assert!(report.extracted.is_empty());
    assert_eq!(report.bytes_written, 0);
}

#[test]
fn single_entry_extraction() {
    let engine = ToyEngine::new(VtableLayout::Plain);
    let items = sample_items();
    let mut session = session_for(&engine, &items, "sample.toy");

    let (data, report) = read_entry(&mut session, 1).unwrap();
    assert_eq!(data, items[1].data);
    assert_eq!(report.extracted, vec![1]);

    let err = read_entry(&mut session, 9).unwrap_err();
    assert!(matches!(err, SevenZipError::EntryOutOfRange { index: 9, count: 4 }));
}

#[test]
fn resolver_error_surfaces_as_io_error() {
    let engine = ToyEngine::new(VtableLayout::Plain);
    let items = sample_items();
    let mut session = session_for(&engine, &items, "sample.toy");

    let err = session
        .extract_with(|index: u32| -> io::Result<Option<SinkTarget>> {
            if index == 1 {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only target"))
            } else {
                Ok(None)
            }
        })
        .unwrap_err();
    match err {
        SevenZipError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.state(), SessionState::Enumerated);
    session.close().unwrap();
    assert!(engine.keep_alive().is_empty());
}

#[test]
fn extract_to_dir_creates_tree_and_respects_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let engine = ToyEngine::new(VtableLayout::Plain);
    let items = vec![
        folder("docs"),
        file("docs/a.txt", b"alpha"),
        file("b.txt", b"new contents"),
        file("../escape.txt", b"nope"),
    ];
    std::fs::write(dir.path().join("b.txt"), b"old").unwrap();

    let mut session = session_for(&engine, &items, "tree.toy");
    let report = session.extract_to_dir(dir.path(), ExtractOptions::default()).unwrap();
    assert!(dir.path().join("docs").is_dir());
    assert_eq!(std::fs::read(dir.path().join("docs/a.txt")).unwrap(), b"alpha");
    assert_eq!(std::fs::read(dir.path().join("b.txt")).unwrap(), b"old");
    assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    assert_eq!(report.extracted, vec![1]);

    let report = session.extract_to_dir(dir.path(), ExtractOptions { overwrite: true }).unwrap();
    assert_eq!(std::fs::read(dir.path().join("b.txt")).unwrap(), b"new contents");
    assert_eq!(report.extracted, vec![1, 2]);
}

#[test]
fn open_path_reads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.toy");
    std::fs::write(&path, toy_archive(&sample_items())).unwrap();

    let engine = ToyEngine::new(VtableLayout::Plain);
    let dyn_engine: Arc<dyn ArchiveEngine> = engine.clone();
    let mut session = ExtractionSession::open_path(dyn_engine, &path, FormatSelection::Auto).unwrap();
    assert_eq!(session.file_name(), Some("disk.toy"));
    assert_eq!(session.entries().unwrap()[1].path, "docs/readme.txt");
    drop(session);
    assert!(engine.keep_alive().is_empty());
}

// ── Session lifecycle ────────────────────────────────────────────────────────

#[test]
fn auto_selection_falls_back_to_next_candidate() {
    let engine = ToyEngine::with_lax(VtableLayout::Plain);
    let mut session = session_for(&engine, &sample_items(), "sample.bin");
    assert_eq!(session.candidates(), &[LAX_ID, TOY_ID]);
    session.open().unwrap();
    assert_eq!(session.format_name(), Some("Toy"));
    assert_eq!(session.class_id(), Some(TOY_ID));
    // The rejected attempt released its input adapter.
    assert_eq!(engine.keep_alive().len(), 1);
}

#[test]
fn auto_selection_skips_candidates_without_a_reader() {
    for layout in LAYOUTS {
        let engine = ToyEngine::with_ghost(layout);
        let mut session = session_for(&engine, &sample_items(), "sample.bin");
        assert_eq!(session.candidates(), &[GHOST_ID, TOY_ID]);
        session.open().unwrap();
        assert_eq!(session.class_id(), Some(TOY_ID));
        assert_eq!(session.entries().unwrap().len(), 4);
        drop(session);
        assert!(engine.keep_alive().is_empty());
    }
}

#[test]
fn open_callback_reports_archive_name() {
    let engine = ToyEngine::new(VtableLayout::WithDestructors);
    let mut session = session_for(&engine, &sample_items(), "sample.toy");
    session.open().unwrap();
    assert_eq!(engine.opened_as.lock().as_slice(), &[Some("sample.toy".to_string())]);
    // The callback was released; only the input adapter is still held.
    assert_eq!(engine.keep_alive().len(), 1);
    drop(session);
    assert!(engine.keep_alive().is_empty());

    let dyn_engine: Arc<dyn ArchiveEngine> = engine.clone();
    let mut anonymous = ExtractionSession::from_reader(
        dyn_engine,
        Cursor::new(toy_archive(&sample_items())),
        None,
        FormatSelection::Auto,
    )
    .unwrap();
    anonymous.open().unwrap();
    assert_eq!(engine.opened_as.lock().last(), Some(&None));
}

#[test]
fn unrecognised_stream_fails_at_construction() {
    let engine: Arc<dyn ArchiveEngine> = ToyEngine::new(VtableLayout::Plain);
    let err = ExtractionSession::from_reader(engine, Cursor::new(b"zzzz".to_vec()), Some("x.bin"), FormatSelection::Auto)
        .unwrap_err();
    assert!(matches!(err, SevenZipError::UnknownFormat { name: Some(n) } if n == "x.bin"));
}

#[test]
fn forced_format_must_exist_in_catalog() {
    let engine: Arc<dyn ArchiveEngine> = ToyEngine::new(VtableLayout::Plain);
    let err = ExtractionSession::from_reader(
        engine.clone(),
        Cursor::new(toy_archive(&sample_items())),
        None,
        FormatSelection::Format(ArchiveFormat::Zip),
    )
    .unwrap_err();
    assert!(matches!(err, SevenZipError::UnknownFormat { .. }));

    let mut session = ExtractionSession::from_reader(
        engine,
        Cursor::new(toy_archive(&sample_items())),
        None,
        FormatSelection::ClassId(TOY_ID),
    )
    .unwrap();
    assert_eq!(session.entries().unwrap().len(), 4);
}

#[test]
fn forced_format_that_rejects_stream_fails_open() {
    let engine: Arc<dyn ArchiveEngine> = ToyEngine::with_lax(VtableLayout::Plain);
    let mut session = ExtractionSession::from_reader(
        engine,
        Cursor::new(toy_archive(&sample_items())),
        None,
        FormatSelection::ClassId(LAX_ID),
    )
    .unwrap();
    let err = session.entries().unwrap_err();
    assert!(matches!(err, SevenZipError::ArchiveOpenFailed { status } if status == HResult::FALSE));
}

#[test]
fn optional_properties_degrade_and_mandatory_ones_propagate() {
    let engine = ToyEngine::new(VtableLayout::Plain);
    let mut session = session_for(&engine, &sample_items(), "sample.toy");
    let e = session.entry(1).unwrap().clone();
    assert_eq!(e.attributes, None);
    assert_eq!(e.comment, None);
    assert_eq!(e.crc, Some(crc32fast::hash(b"Hello through the engine boundary!")));
    assert_eq!(e.modified, Some(Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap()));
    assert_eq!(session.entry(0).unwrap().crc, None);

    let items = vec![flagged("weird", b"abc", BAD_SIZE)];
    let mut session = session_for(&engine, &items, "weird.toy");
    let err = session.entries().unwrap_err();
    assert!(matches!(err, SevenZipError::PropertyTypeMismatch { property: "Size", .. }));
}

#[test]
fn close_is_idempotent_and_leaves_shared_stream_usable() {
    let engine = ToyEngine::new(VtableLayout::WithDestructors);
    let bytes = toy_archive(&sample_items());
    let stream: SharedStream = Arc::new(Mutex::new(Cursor::new(bytes.clone())));
    let dyn_engine: Arc<dyn ArchiveEngine> = engine.clone();
    let mut session =
        ExtractionSession::from_shared(dyn_engine, stream.clone(), Some("shared.toy"), FormatSelection::Auto).unwrap();

    assert_eq!(session.state(), SessionState::Created);
    session.entries().unwrap();
    assert_eq!(session.state(), SessionState::Enumerated);
    // The reader holds the input adapter.
    assert_eq!(engine.keep_alive().len(), 1);

    session.close().unwrap();
    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(engine.keep_alive().is_empty());
    assert!(matches!(session.entries(), Err(SevenZipError::SessionClosed)));

    let mut back = Vec::new();
    let mut s = stream.lock();
    s.seek(SeekFrom::Start(0)).unwrap();
    s.read_to_end(&mut back).unwrap();
    assert_eq!(back, bytes);
}
