//! Format detection from a stream prefix and an optional file name.
//!
//! Detection is non-destructive: the stream is read from its current
//! position and sought back by exactly the number of bytes consumed.

use std::io::{self, Read, Seek, SeekFrom};

use tracing::debug;

use crate::catalog::{trailing_extension, FormatDescriptor, SignatureCatalog};
use crate::error::{Result, SevenZipError};
use crate::hresult::ProbeResult;

/// Bytes inspected per detection.  Must exceed the deepest signature offset
/// and the UDF probe window (`(1 << 19) + x`).
pub const MAX_PREFIX_LEN: usize = 1 << 20;

/// Candidates for one stream, as indices into the catalog.
///
/// A catalog index never appears in both lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionResult {
    pub probable: Vec<usize>,
    pub unlikely: Vec<usize>,
}

impl DetectionResult {
    /// First probable, else first unlikely.
    pub fn best(&self) -> Option<usize> {
        self.probable.first().or_else(|| self.unlikely.first()).copied()
    }

    /// [`best`](Self::best), failing with `UnknownFormat`.
    pub fn select(&self, file_name: Option<&str>) -> Result<usize> {
        self.best().ok_or_else(|| SevenZipError::UnknownFormat {
            name: file_name.map(str::to_string),
        })
    }

    /// Every candidate, probable first.
    pub fn candidates(&self) -> impl Iterator<Item = usize> + '_ {
        self.probable.iter().chain(self.unlikely.iter()).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.probable.is_empty() && self.unlikely.is_empty()
    }

    /// Keep only the probable formats listing `ext`, demoting the others.
    /// Nothing changes when no probable format lists it.
    fn narrow_by_extension(&mut self, catalog: &SignatureCatalog, ext: &str) {
        let (keep, demote): (Vec<usize>, Vec<usize>) = self
            .probable
            .iter()
            .partition(|&&i| catalog.get(i).is_some_and(|d| d.has_extension(ext)));
        if keep.is_empty() {
            return;
        }
        for i in demote {
            if !self.unlikely.contains(&i) {
                self.unlikely.push(i);
            }
        }
        self.probable = keep;
    }
}

/// Runs the catalog's signatures and probes against stream prefixes.
#[derive(Debug, Clone, Copy)]
pub struct FormatDetector<'c> {
    catalog: &'c SignatureCatalog,
}

impl<'c> FormatDetector<'c> {
    pub fn new(catalog: &'c SignatureCatalog) -> Self {
        FormatDetector { catalog }
    }

    /// Read up to [`MAX_PREFIX_LEN`] bytes, classify, seek back.
    pub fn detect<R: Read + Seek + ?Sized>(
        &self,
        stream: &mut R,
        file_name: Option<&str>,
    ) -> io::Result<DetectionResult> {
        let start = stream.stream_position()?;
        let mut prefix = Vec::with_capacity(MAX_PREFIX_LEN.min(64 * 1024));
        let read = (&mut *stream).take(MAX_PREFIX_LEN as u64).read_to_end(&mut prefix);
        stream.seek(SeekFrom::Start(start))?;
        let n = read?;

        let end_of_file = n < MAX_PREFIX_LEN;
        Ok(self.detect_prefix(&prefix, end_of_file, file_name))
    }

    /// Classify an already captured prefix.  `end_of_file` is true when the
    /// prefix is the whole stream.
    pub fn detect_prefix(
        &self,
        prefix: &[u8],
        end_of_file: bool,
        file_name: Option<&str>,
    ) -> DetectionResult {
        let mut result = DetectionResult::default();

        for (index, desc) in self.catalog.iter().enumerate() {
            match classify(desc, prefix, end_of_file) {
                Verdict::Probable => result.probable.push(index),
                Verdict::Unlikely => result.unlikely.push(index),
                Verdict::Excluded => {}
            }
        }

        if let Some(ext) = file_name.and_then(trailing_extension) {
            result.narrow_by_extension(self.catalog, ext);
        }

        debug!(
            probable = ?self.names(&result.probable),
            unlikely = result.unlikely.len(),
            prefix_len = prefix.len(),
            "format detection"
        );
        result
    }

    fn names(&self, idx: &[usize]) -> Vec<&str> {
        idx.iter()
            .filter_map(|&i| self.catalog.get(i))
            .map(|d| d.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Probable,
    Unlikely,
    Excluded,
}

fn classify(desc: &FormatDescriptor, prefix: &[u8], end_of_file: bool) -> Verdict {
    // A probe is authoritative.
    if let Some(res) = desc.run_probe(prefix) {
        return match res {
            ProbeResult::No => Verdict::Excluded,
            ProbeResult::NeedMoreData if end_of_file => Verdict::Excluded,
            _ => Verdict::Probable,
        };
    }

    let mut try_open = desc.must_try_open();
    let offset = desc.signature_offset as usize;
    for sig in &desc.signatures {
        let end = offset.saturating_add(sig.len());
        if prefix.len() < end {
            try_open = true;
            continue;
        }
        if &prefix[offset..end] == sig.as_slice() {
            return Verdict::Probable;
        }
    }

    if try_open {
        Verdict::Unlikely
    } else {
        Verdict::Excluded
    }
}
