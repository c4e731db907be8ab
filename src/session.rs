//! Opening one archive, listing it, extracting from it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sevenzip_bridge::native::{EngineConfig, Registry};
//! use sevenzip_bridge::session::{ExtractionSession, ExtractOptions, FormatSelection};
//!
//! let engine = Arc::new(Registry::load(&EngineConfig::new("/usr/lib/p7zip/7z.so"))?);
//! let mut session = ExtractionSession::open_path(engine, "data.7z", FormatSelection::Auto)?;
//! for entry in session.entries()? {
//!     println!("{} {}", entry.size, entry.path);
//! }
//! let report = session.extract_to_dir("out", ExtractOptions::default())?;
//! assert!(report.is_clean());
//! # Ok::<(), sevenzip_bridge::SevenZipError>(())
//! ```

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::com::{
    EntryOutcome, ExtractCallback, ExtractLog, InStream, OpenCallback, ReadSeek, SharedSink,
    SharedStream, SinkResolver, SinkTarget,
};
use crate::detect::FormatDetector;
use crate::engine::{ArchiveEngine, ArchiveReader};
use crate::error::{Result, SevenZipError};
use crate::formats::ArchiveFormat;
use crate::hresult::{AskMode, EventIndexType, OperationResult};
use crate::props::ItemProp;
use crate::variant::PropValue;

// ── Selection & state ─────────────────────────────────────────────────────────

/// How the archive format is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatSelection {
    /// Detect from the stream prefix and the file name.  Candidates are
    /// tried in detection order until one opens.
    Auto,
    Format(ArchiveFormat),
    ClassId(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Opened,
    Enumerated,
    Extracting,
    Closed,
}

// ── Entry ─────────────────────────────────────────────────────────────────────

/// Metadata of one archive item, read once per open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub index:        u32,
    pub path:         String,
    pub is_folder:    bool,
    pub is_encrypted: bool,
    pub size:         u64,
    pub packed_size:  u64,
    pub created:      Option<DateTime<Utc>>,
    pub modified:     Option<DateTime<Utc>>,
    pub accessed:     Option<DateTime<Utc>>,
    pub crc:          Option<u32>,
    pub attributes:   Option<u32>,
    pub comment:      Option<String>,
    pub host_os:      Option<String>,
    pub method:       Option<String>,
    pub split_before: bool,
    pub split_after:  bool,
}

fn optional(reader: &mut dyn ArchiveReader, index: u32, prop: ItemProp) -> PropValue {
    match reader.property(index, prop) {
        Ok(v) => v,
        Err(e) => {
            debug!(index, property = prop.name(), error = %e, "optional property unavailable");
            PropValue::Empty
        }
    }
}

impl Entry {
    fn read(reader: &mut dyn ArchiveReader, index: u32) -> Result<Self> {
        let path = reader
            .property(index, ItemProp::Path)?
            .into_string(ItemProp::Path.name())?
            .unwrap_or_default();
        let is_folder    = reader.property(index, ItemProp::IsFolder)?.as_bool(ItemProp::IsFolder.name())?;
        let is_encrypted = reader.property(index, ItemProp::Encrypted)?.as_bool(ItemProp::Encrypted.name())?;
        let size         = reader.property(index, ItemProp::Size)?.as_u64(ItemProp::Size.name())?.unwrap_or(0);
        let packed_size  = reader
            .property(index, ItemProp::PackedSize)?
            .as_u64(ItemProp::PackedSize.name())?
            .unwrap_or(0);

        let time = |r: &mut dyn ArchiveReader, p: ItemProp| optional(r, index, p).as_datetime(p.name()).ok().flatten();
        let text = |r: &mut dyn ArchiveReader, p: ItemProp| optional(r, index, p).into_string(p.name()).ok().flatten();
        let flag = |r: &mut dyn ArchiveReader, p: ItemProp| optional(r, index, p).as_bool(p.name()).unwrap_or(false);

        Ok(Entry {
            index,
            path,
            is_folder,
            is_encrypted,
            size,
            packed_size,
            created:      time(reader, ItemProp::CreationTime),
            modified:     time(reader, ItemProp::LastWriteTime),
            accessed:     time(reader, ItemProp::LastAccessTime),
            crc:          optional(reader, index, ItemProp::Crc).as_u32(ItemProp::Crc.name()).ok().flatten(),
            attributes:   optional(reader, index, ItemProp::Attributes).as_u32(ItemProp::Attributes.name()).ok().flatten(),
            comment:      text(reader, ItemProp::Comment),
            host_os:      text(reader, ItemProp::HostOs),
            method:       text(reader, ItemProp::Method),
            split_before: flag(reader, ItemProp::SplitBefore),
            split_after:  flag(reader, ItemProp::SplitAfter),
        })
    }
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EntryProblem {
    /// `SetOperationResult` was not OK.
    Operation(OperationResult),
    /// `ReportExtractResult` was not OK.
    Reported { kind: EventIndexType, result: OperationResult },
    /// The written bytes do not match the CRC stored in the archive.
    CrcMismatch { expected: u32, actual: u32 },
}

/// A non-fatal problem with one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryWarning {
    pub index:   Option<u32>,
    pub path:    Option<String>,
    pub problem: EntryProblem,
}

/// Outcome of one extraction pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractReport {
    /// Entries written to a sink without error.
    pub extracted:     Vec<u32>,
    /// Entries decoded in test mode without error.
    pub tested:        Vec<u32>,
    /// Entries the engine did not write anywhere.
    pub skipped:       Vec<u32>,
    pub warnings:      Vec<EntryWarning>,
    pub bytes_written: u64,
}

impl ExtractReport {
    fn build(log: ExtractLog, entries: &[Entry]) -> Self {
        let path_of = |i: u32| entries.get(i as usize).map(|e| e.path.clone());
        let mut report = ExtractReport::default();

        for EntryOutcome { index, mode, result, digest } in log.outcomes {
            if !result.is_ok() {
                report.warnings.push(EntryWarning {
                    index:   Some(index),
                    path:    path_of(index),
                    problem: EntryProblem::Operation(result),
                });
                continue;
            }
            match (mode, digest) {
                (AskMode::Extract, Some(d)) => {
                    report.bytes_written += d.len;
                    let expected = entries.get(index as usize).and_then(|e| e.crc);
                    if let (Some(expected), Some(actual)) = (expected, d.crc32()) {
                        if expected != actual {
                            warn!(index, expected, actual, "CRC mismatch in extracted data");
                            report.warnings.push(EntryWarning {
                                index:   Some(index),
                                path:    path_of(index),
                                problem: EntryProblem::CrcMismatch { expected, actual },
                            });
                            continue;
                        }
                    }
                    report.extracted.push(index);
                }
                (AskMode::Test, _) => report.tested.push(index),
                _ => report.skipped.push(index),
            }
        }

        for (kind, index, result) in log.messages {
            let index = (kind == EventIndexType::InArcIndex).then_some(index);
            report.warnings.push(EntryWarning {
                index,
                path: index.and_then(path_of),
                problem: EntryProblem::Reported { kind, result },
            });
        }
        report
    }

    /// No entry failed and no CRC mismatched.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

// ── Extraction options ────────────────────────────────────────────────────────

/// Configuration for [`ExtractionSession::extract_to_dir`].
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Replace files that already exist.  Existing files are skipped
    /// otherwise.
    pub overwrite: bool,
}

/// `root` joined with the entry path, or `None` if the path would escape
/// `root`.
fn safe_join(root: &Path, entry_path: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    let mut depth = 0usize;
    for part in entry_path.split(['/', '\\']) {
        let comp = Path::new(part).components().next();
        match comp {
            None | Some(Component::CurDir) => {}
            Some(Component::Normal(p)) if !part.contains(':') => {
                out.push(p);
                depth += 1;
            }
            _ => return None,
        }
    }
    (depth > 0).then_some(out)
}

// ── ExtractionSession ─────────────────────────────────────────────────────────

/// One open archive.
///
/// `Created → Opened → Enumerated → (Extracting)* → Closed`.  Opening and
/// enumeration happen lazily on first use; [`close`](Self::close) runs on
/// drop.
pub struct ExtractionSession {
    engine:        Arc<dyn ArchiveEngine>,
    stream:        SharedStream,
    close_stream:  bool,
    start:         u64,
    file_name:     Option<String>,
    candidates:    Vec<Uuid>,
    format:        Option<(Uuid, String)>,
    state:         SessionState,
    reader:        Option<Box<dyn ArchiveReader>>,
    input:         Option<Arc<InStream>>,
    entries:       Vec<Entry>,
}

impl std::fmt::Debug for ExtractionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionSession")
            .field("file_name", &self.file_name)
            .field("format", &self.format)
            .field("state", &self.state)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl ExtractionSession {
    /// Open the file at `path`.  The session owns the file handle.
    pub fn open_path(
        engine: Arc<dyn ArchiveEngine>,
        path: impl AsRef<Path>,
        selection: FormatSelection,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let name = path.file_name().and_then(|n| n.to_str()).map(str::to_string);
        let stream: SharedStream = Arc::new(Mutex::new(file));
        Self::new(engine, stream, true, name.as_deref(), selection)
    }

    /// Take ownership of `reader`.
    pub fn from_reader<R: ReadSeek + 'static>(
        engine: Arc<dyn ArchiveEngine>,
        reader: R,
        file_name: Option<&str>,
        selection: FormatSelection,
    ) -> Result<Self> {
        let stream: SharedStream = Arc::new(Mutex::new(reader));
        Self::new(engine, stream, true, file_name, selection)
    }

    /// Read from a stream the caller keeps.  The engine's handle is dropped
    /// when it releases the input adapter; the stream itself stays open.
    pub fn from_shared(
        engine: Arc<dyn ArchiveEngine>,
        stream: SharedStream,
        file_name: Option<&str>,
        selection: FormatSelection,
    ) -> Result<Self> {
        Self::new(engine, stream, false, file_name, selection)
    }

    fn new(
        engine: Arc<dyn ArchiveEngine>,
        stream: SharedStream,
        close_stream: bool,
        file_name: Option<&str>,
        selection: FormatSelection,
    ) -> Result<Self> {
        let catalog = engine.catalog();
        let candidates = match selection {
            FormatSelection::Format(f) => {
                let desc = catalog
                    .find_by_class_id(&f.class_id())
                    .ok_or_else(|| SevenZipError::UnknownFormat { name: Some(f.name().to_string()) })?;
                vec![desc.class_id]
            }
            FormatSelection::ClassId(id) => {
                let desc = catalog
                    .find_by_class_id(&id)
                    .ok_or_else(|| SevenZipError::UnknownFormat { name: Some(id.to_string()) })?;
                vec![desc.class_id]
            }
            FormatSelection::Auto => {
                let result = {
                    let mut s = stream.lock();
                    FormatDetector::new(catalog).detect(&mut *s, file_name)?
                };
                result.select(file_name)?;
                result
                    .candidates()
                    .filter_map(|i| catalog.get(i).map(|d| d.class_id))
                    .collect()
            }
        };
        let start = stream.lock().stream_position()?;

        Ok(ExtractionSession {
            engine,
            stream,
            close_stream,
            start,
            file_name: file_name.map(str::to_string),
            candidates,
            format: None,
            state: SessionState::Created,
            reader: None,
            input: None,
            entries: Vec::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Class ids that will be tried, in order.
    pub fn candidates(&self) -> &[Uuid] {
        &self.candidates
    }

    /// Name of the handler that opened the archive.
    pub fn format_name(&self) -> Option<&str> {
        self.format.as_ref().map(|(_, n)| n.as_str())
    }

    pub fn class_id(&self) -> Option<Uuid> {
        self.format.as_ref().map(|(id, _)| *id)
    }

    /// Open the archive with the first candidate the engine accepts.
    pub fn open(&mut self) -> Result<()> {
        match self.state {
            SessionState::Created => {}
            SessionState::Closed => return Err(SevenZipError::SessionClosed),
            _ => return Ok(()),
        }

        let callback = self.file_name.as_deref().map(|name| {
            OpenCallback::new(name, self.engine.keep_alive(), self.engine.vtable_layout())
        });
        let mut last_err = None;
        for class_id in self.candidates.clone() {
            self.stream.lock().seek(SeekFrom::Start(self.start))?;
            let mut reader = match self.engine.create_reader(&class_id) {
                Ok(reader) => reader,
                Err(e) => {
                    debug!(%class_id, error = %e, "no reader for candidate");
                    last_err = Some(e);
                    continue;
                }
            };
            let input = InStream::new(
                Arc::clone(&self.stream),
                self.close_stream,
                self.engine.keep_alive(),
                self.engine.vtable_layout(),
            );
            match reader.open(&input, self.engine.max_check_start(), callback.as_ref()) {
                Ok(()) => {
                    let name = self
                        .engine
                        .catalog()
                        .find_by_class_id(&class_id)
                        .map(|d| d.name.clone())
                        .unwrap_or_default();
                    debug!(format = %name, "archive opened");
                    self.format = Some((class_id, name));
                    self.reader = Some(reader);
                    self.input = Some(input);
                    self.state = SessionState::Opened;
                    return Ok(());
                }
                Err(e) => {
                    debug!(%class_id, error = %e, "candidate rejected");
                    if let Err(close) = reader.close() {
                        debug!(error = %close, "close after failed open");
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(SevenZipError::UnknownFormat { name: self.file_name.clone() }))
    }

    /// All entries, read from the engine on first call.
    pub fn entries(&mut self) -> Result<&[Entry]> {
        self.open()?;
        if self.state == SessionState::Opened {
            let reader = self.reader.as_deref_mut().ok_or(SevenZipError::SessionClosed)?;
            let count = reader.item_count()?;
            let mut entries = Vec::with_capacity(count as usize);
            for i in 0..count {
                entries.push(Entry::read(reader, i)?);
            }
            self.entries = entries;
            self.state = SessionState::Enumerated;
        }
        Ok(&self.entries)
    }

    pub fn entry(&mut self, index: u32) -> Result<&Entry> {
        let entries = self.entries()?;
        let count = entries.len();
        entries.get(index as usize).ok_or(SevenZipError::EntryOutOfRange { index, count })
    }

    // ── Extraction ──

    fn run(
        &mut self,
        indices: Option<&[u32]>,
        test_mode: bool,
        resolver: Box<dyn SinkResolver>,
    ) -> Result<ExtractReport> {
        self.entries()?;
        let reader = self.reader.as_deref_mut().ok_or(SevenZipError::SessionClosed)?;
        let callback = ExtractCallback::new(resolver, self.engine.keep_alive(), self.engine.vtable_layout());

        self.state = SessionState::Extracting;
        let status = reader.extract(indices, test_mode, &callback);
        self.state = SessionState::Enumerated;

        if let Some(e) = callback.take_failure() {
            return Err(e.into());
        }
        status?;
        let report = ExtractReport::build(callback.log(), &self.entries);
        debug!(
            extracted = report.extracted.len(),
            skipped   = report.skipped.len(),
            warnings  = report.warnings.len(),
            "extraction finished"
        );
        Ok(report)
    }

    /// Extract every entry, asking `resolver` for each entry's sink.
    pub fn extract_with(&mut self, resolver: impl SinkResolver + 'static) -> Result<ExtractReport> {
        self.run(None, false, Box::new(resolver))
    }

    /// Extract into sinks aligned with entry indices.  `None` (or a missing
    /// slot) skips the entry.  Sinks stay open afterwards.
    pub fn extract_to_sinks(&mut self, sinks: Vec<Option<SharedSink>>) -> Result<ExtractReport> {
        self.extract_with(move |index: u32| -> io::Result<Option<SinkTarget>> {
            Ok(sinks
                .get(index as usize)
                .cloned()
                .flatten()
                .map(|sink| SinkTarget { sink, close_on_release: false }))
        })
    }

    /// Extract to paths chosen by `resolve`, called once per entry.  `None`
    /// skips the entry.  Folders are created; so are parent directories of
    /// files.
    pub fn extract_with_paths(
        &mut self,
        mut resolve: impl FnMut(&Entry) -> Option<PathBuf>,
    ) -> Result<ExtractReport> {
        let mut targets: Vec<Option<PathBuf>> = Vec::new();
        for entry in self.entries()? {
            let target = resolve(entry);
            match (&target, entry.is_folder) {
                (Some(dir), true) => {
                    fs::create_dir_all(dir)?;
                    targets.push(None);
                }
                _ => targets.push(target),
            }
        }
        self.extract_with(move |index: u32| -> io::Result<Option<SinkTarget>> {
            let Some(path) = targets.get(index as usize).cloned().flatten() else {
                return Ok(None);
            };
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(&path)?;
            Ok(Some(SinkTarget { sink: Arc::new(Mutex::new(file)), close_on_release: true }))
        })
    }

    /// Extract everything below `dir`.  Entry paths that would land outside
    /// `dir` are skipped.
    pub fn extract_to_dir(&mut self, dir: impl AsRef<Path>, opts: ExtractOptions) -> Result<ExtractReport> {
        let root = dir.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let fallback = self
            .file_name
            .as_deref()
            .and_then(|n| Path::new(n).file_stem())
            .and_then(|s| s.to_str())
            .unwrap_or("unnamed")
            .to_string();

        self.extract_with_paths(|entry| {
            let name = if entry.path.is_empty() { fallback.as_str() } else { entry.path.as_str() };
            let Some(target) = safe_join(&root, name) else {
                warn!(index = entry.index, path = %entry.path, "entry path escapes output directory");
                return None;
            };
            if !entry.is_folder && !opts.overwrite && target.exists() {
                debug!(path = %target.display(), "exists, skipped");
                return None;
            }
            Some(target)
        })
    }

    /// Extract a single entry into `sink`.
    pub fn extract_entry(&mut self, index: u32, sink: SharedSink) -> Result<ExtractReport> {
        let count = self.entries()?.len();
        if index as usize >= count {
            return Err(SevenZipError::EntryOutOfRange { index, count });
        }
        let resolver = move |i: u32| -> io::Result<Option<SinkTarget>> {
            Ok((i == index).then(|| SinkTarget { sink: Arc::clone(&sink), close_on_release: false }))
        };
        self.run(Some(&[index]), false, Box::new(resolver))
    }

    /// Decode every entry without writing anything.
    pub fn test(&mut self) -> Result<ExtractReport> {
        self.run(None, true, Box::new(|_: u32| -> io::Result<Option<SinkTarget>> { Ok(None) }))
    }

    /// Release the reader and the input adapter.  Safe to call repeatedly.
    pub fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        let result = match self.reader.take() {
            Some(mut reader) => reader.close(),
            None => Ok(()),
        };
        self.input = None;
        self.entries.clear();
        result
    }
}

impl Drop for ExtractionSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "closing archive session failed");
        }
    }
}

/// Read a whole entry into memory.
pub fn read_entry(session: &mut ExtractionSession, index: u32) -> Result<(Vec<u8>, ExtractReport)> {
    let buf = Arc::new(Mutex::new(std::io::Cursor::new(Vec::<u8>::new())));
    let sink: SharedSink = buf.clone();
    let report = session.extract_entry(index, sink)?;
    let mut data = Vec::new();
    {
        let mut cur = buf.lock();
        cur.set_position(0);
        cur.read_to_end(&mut data)?;
    }
    Ok((data, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_keeps_paths_inside_root() {
        let root = Path::new("/out");
        assert_eq!(safe_join(root, "a/b.txt"), Some(PathBuf::from("/out/a/b.txt")));
        assert_eq!(safe_join(root, "./a\\b.txt"), Some(PathBuf::from("/out/a/b.txt")));
        assert_eq!(safe_join(root, "../evil"), None);
        assert_eq!(safe_join(root, "a/../../evil"), None);
        assert_eq!(safe_join(root, "C:/evil"), None);
        assert_eq!(safe_join(root, ""), None);
    }

    fn entry(index: u32, crc: Option<u32>) -> Entry {
        Entry {
            index,
            path: format!("f{index}"),
            is_folder: false,
            is_encrypted: false,
            size: 3,
            packed_size: 3,
            created: None,
            modified: None,
            accessed: None,
            crc,
            attributes: None,
            comment: None,
            host_os: None,
            method: None,
            split_before: false,
            split_after: false,
        }
    }

    #[test]
    fn report_sorts_outcomes_and_flags_failures() {
        let log = ExtractLog {
            outcomes: vec![
                EntryOutcome { index: 0, mode: AskMode::Skip, result: OperationResult::Ok, digest: None },
                EntryOutcome { index: 1, mode: AskMode::Extract, result: OperationResult::DataError, digest: None },
                EntryOutcome { index: 2, mode: AskMode::Test, result: OperationResult::Ok, digest: None },
            ],
            messages: vec![(EventIndexType::InArcIndex, 1, OperationResult::WrongPassword)],
            total: 0,
            completed: 0,
        };
        let entries = [entry(0, None), entry(1, None), entry(2, None)];
        let report = ExtractReport::build(log, &entries);
        assert_eq!(report.skipped, vec![0]);
        assert_eq!(report.tested, vec![2]);
        assert!(report.extracted.is_empty());
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(report.warnings[0].problem, EntryProblem::Operation(OperationResult::DataError));
        assert_eq!(report.warnings[1].path.as_deref(), Some("f1"));
        assert!(!report.is_clean());
    }
}
