//! Format descriptors and the signature catalog.
//!
//! A [`SignatureCatalog`] is the flat list of every archive handler the
//! loaded modules expose, in module order.  It is built once, validated once
//! (no zero-length signatures) and then shared read-only by the detector and
//! the session layer.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Result, SevenZipError};
use crate::formats::ArchiveFormat;
use crate::hresult::ProbeResult;

// ── Archive handler flags ───────────────────────────────────────────────────

/// `NArcInfoFlags` bit set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ArcFlags(pub u32);

impl ArcFlags {
    pub const KEEP_NAME:          ArcFlags = ArcFlags(1 << 0);
    pub const ALT_STREAMS:        ArcFlags = ArcFlags(1 << 1);
    pub const NT_SECURE:          ArcFlags = ArcFlags(1 << 2);
    pub const FIND_SIGNATURE:     ArcFlags = ArcFlags(1 << 3);
    pub const MULTI_SIGNATURE:    ArcFlags = ArcFlags(1 << 4);
    pub const USE_GLOBAL_OFFSET:  ArcFlags = ArcFlags(1 << 5);
    pub const START_OPEN:         ArcFlags = ArcFlags(1 << 6);
    pub const PURE_START_OPEN:    ArcFlags = ArcFlags(1 << 7);
    pub const BACKWARD_OPEN:      ArcFlags = ArcFlags(1 << 8);
    pub const PRE_ARC:            ArcFlags = ArcFlags(1 << 9);
    pub const SYM_LINKS:          ArcFlags = ArcFlags(1 << 10);
    pub const HARD_LINKS:         ArcFlags = ArcFlags(1 << 11);
    pub const BY_EXT_ONLY_OPEN:   ArcFlags = ArcFlags(1 << 12);
    pub const HASH_HANDLER:       ArcFlags = ArcFlags(1 << 13);
    pub const CTIME:              ArcFlags = ArcFlags(1 << 14);
    pub const CTIME_DEFAULT:      ArcFlags = ArcFlags(1 << 15);
    pub const ATIME:              ArcFlags = ArcFlags(1 << 16);
    pub const ATIME_DEFAULT:      ArcFlags = ArcFlags(1 << 17);
    pub const MTIME:              ArcFlags = ArcFlags(1 << 18);
    pub const MTIME_DEFAULT:      ArcFlags = ArcFlags(1 << 19);

    const NAMES: [&'static str; 20] = [
        "KEEP_NAME", "ALT_STREAMS", "NT_SECURE", "FIND_SIGNATURE", "MULTI_SIGNATURE",
        "USE_GLOBAL_OFFSET", "START_OPEN", "PURE_START_OPEN", "BACKWARD_OPEN", "PRE_ARC",
        "SYM_LINKS", "HARD_LINKS", "BY_EXT_ONLY_OPEN", "HASH_HANDLER", "CTIME",
        "CTIME_DEFAULT", "ATIME", "ATIME_DEFAULT", "MTIME", "MTIME_DEFAULT",
    ];

    #[inline]
    pub fn contains(self, other: ArcFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: ArcFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for ArcFlags {
    type Output = ArcFlags;
    fn bitor(self, rhs: ArcFlags) -> ArcFlags { ArcFlags(self.0 | rhs.0) }
}

impl fmt::Debug for ArcFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (bit, name) in Self::NAMES.iter().enumerate() {
            if self.0 & (1 << bit) != 0 {
                set.entry(name);
            }
        }
        let unknown = self.0 & !((1u32 << Self::NAMES.len()) - 1);
        if unknown != 0 {
            set.entry(&format_args!("{unknown:#x}"));
        }
        set.finish()
    }
}

// ── Descriptors ─────────────────────────────────────────────────────────────

/// A format-supplied probe over the stream prefix.
pub type ProbeFn = Arc<dyn Fn(&[u8]) -> ProbeResult + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionInfo {
    pub ext:     String,
    /// Extension of the unpacked payload (`tgz` → `tar`); empty when none.
    pub add_ext: String,
}

/// One archive handler as exposed by a module.
#[derive(Clone)]
pub struct FormatDescriptor {
    pub class_id:         Uuid,
    pub name:             String,
    pub signatures:       Vec<Vec<u8>>,
    pub signature_offset: u64,
    pub extensions:       Vec<ExtensionInfo>,
    pub flags:            ArcFlags,
    pub time_flags:       u32,
    pub can_update:       bool,
    pub probe:            Option<ProbeFn>,
    /// Index of the owning module in the registry.
    pub module_index:     usize,
    /// Index of the handler within its module.
    pub format_index:     u32,
}

impl fmt::Debug for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatDescriptor")
            .field("name", &self.name)
            .field("class_id", &self.class_id)
            .field("signatures", &self.signatures.len())
            .field("signature_offset", &self.signature_offset)
            .field("flags", &self.flags)
            .field("probe", &self.probe.is_some())
            .field("module_index", &self.module_index)
            .field("format_index", &self.format_index)
            .finish()
    }
}

impl FormatDescriptor {
    /// Descriptor for a built-in format, owned by module 0.
    pub fn from_builtin(format: ArchiveFormat) -> Self {
        FormatDescriptor {
            class_id:         format.class_id(),
            name:             format.name().to_string(),
            signatures:       format.signatures().iter().map(|s| s.to_vec()).collect(),
            signature_offset: format.signature_offset(),
            extensions:       format
                .extensions()
                .map(|e| ExtensionInfo { ext: e.to_string(), add_ext: String::new() })
                .collect(),
            flags:            ArcFlags::default(),
            time_flags:       0,
            can_update:       false,
            probe:            None,
            module_index:     0,
            format_index:     format as u32,
        }
    }

    /// Run the probe over `window`.  An empty window is always `No`.
    pub fn run_probe(&self, window: &[u8]) -> Option<ProbeResult> {
        let probe = self.probe.as_ref()?;
        if window.is_empty() {
            return Some(ProbeResult::No);
        }
        Some(probe(window))
    }

    pub fn has_extension(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e.ext.eq_ignore_ascii_case(ext))
    }

    /// Built-in enum value for this handler, if it is a stock one.
    pub fn archive_format(&self) -> Option<ArchiveFormat> {
        ArchiveFormat::from_class_id(&self.class_id)
    }

    /// Formats that must be handed to `Open` even without a signature hit.
    pub fn must_try_open(&self) -> bool {
        (self.signatures.is_empty() && self.probe.is_none())
            || self.flags.intersects(
                ArcFlags::START_OPEN | ArcFlags::PURE_START_OPEN | ArcFlags::BACKWARD_OPEN,
            )
    }
}

// ── Property parsing helpers ────────────────────────────────────────────────

/// Split a `kMultiSignature` blob: a sequence of `[len: u8][bytes; len]`.
pub fn parse_multi_signature(format: &str, blob: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    let mut rest = blob;
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if len > tail.len() {
            return Err(SevenZipError::InvalidSignature {
                format: format.to_string(),
                reason: "truncated multi-signature list",
            });
        }
        out.push(tail[..len].to_vec());
        rest = &tail[len..];
    }
    Ok(out)
}

/// Pair up `kExtension` and `kAddExtension` (both space separated).  A `*`
/// in the additional list means "none".
pub fn parse_extensions(ext: &str, add_ext: &str) -> Vec<ExtensionInfo> {
    let adds: Vec<&str> = add_ext.split(' ').collect();
    ext.split(' ')
        .filter(|e| !e.is_empty())
        .enumerate()
        .map(|(i, e)| {
            let add = adds.get(i).copied().filter(|a| *a != "*").unwrap_or("");
            ExtensionInfo { ext: e.to_string(), add_ext: add.to_string() }
        })
        .collect()
}

/// Trailing extension of a file name, without the dot.  `None` when there
/// is no dot or nothing after it.
pub fn trailing_extension(file_name: &str) -> Option<&str> {
    let (_, ext) = file_name.rsplit_once('.')?;
    if ext.is_empty() || ext.contains(['/', '\\']) {
        None
    } else {
        Some(ext)
    }
}

// ── SignatureCatalog ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SignatureCatalog {
    formats: Vec<FormatDescriptor>,
}

impl SignatureCatalog {
    /// Validate and wrap a descriptor list.
    pub fn new(formats: Vec<FormatDescriptor>) -> Result<Self> {
        for f in &formats {
            if f.signatures.iter().any(|s| s.is_empty()) {
                return Err(SevenZipError::InvalidSignature {
                    format: f.name.clone(),
                    reason: "zero-length signature",
                });
            }
        }
        Ok(SignatureCatalog { formats })
    }

    /// Catalog of the stock formats, without probe functions.
    pub fn builtin() -> Self {
        SignatureCatalog {
            formats: ArchiveFormat::ALL.iter().map(|f| FormatDescriptor::from_builtin(*f)).collect(),
        }
    }

    pub fn len(&self) -> usize { self.formats.len() }

    pub fn is_empty(&self) -> bool { self.formats.is_empty() }

    pub fn get(&self, index: usize) -> Option<&FormatDescriptor> {
        self.formats.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FormatDescriptor> {
        self.formats.iter()
    }

    /// Position of a descriptor in the catalog.
    pub fn index_of(&self, desc: &FormatDescriptor) -> Option<usize> {
        self.formats.iter().position(|f| {
            f.class_id == desc.class_id && f.module_index == desc.module_index
        })
    }

    pub fn find_by_class_id(&self, id: &Uuid) -> Option<&FormatDescriptor> {
        self.formats.iter().find(|f| f.class_id == *id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&FormatDescriptor> {
        if name.is_empty() {
            return None;
        }
        self.formats.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// First handler claiming `ext`.  Takes the part after the last dot, so
    /// `"a.tar.gz"` and `".gz"` both look up `gz`.  `exe` never matches: it
    /// would select the PE handler for every self-extractor.
    pub fn find_by_extension(&self, ext: &str) -> Option<&FormatDescriptor> {
        let ext = ext.rsplit_once('.').map_or(ext, |(_, e)| e);
        if ext.is_empty() || ext.eq_ignore_ascii_case("exe") {
            return None;
        }
        self.formats.iter().find(|f| f.has_extension(ext))
    }

    pub fn find_by_archive_path(&self, path: &Path) -> Option<&FormatDescriptor> {
        let ext = path.extension()?.to_str()?;
        self.find_by_extension(ext)
    }
}

impl<'a> IntoIterator for &'a SignatureCatalog {
    type Item = &'a FormatDescriptor;
    type IntoIter = std::slice::Iter<'a, FormatDescriptor>;
    fn into_iter(self) -> Self::IntoIter { self.formats.iter() }
}
