//! The seam between the session layer and whatever decodes archives.
//!
//! [`Registry`](crate::native::Registry) implements these traits over the
//! loaded 7-Zip modules.  Anything else that speaks the same reference
//! counting protocol through the adapters in [`com`](crate::com) can stand
//! in for it.

use std::sync::Arc;

use uuid::Uuid;

use crate::catalog::SignatureCatalog;
use crate::com::{ExtractCallback, InStream, OpenCallback, VtableLayout};
use crate::error::Result;
use crate::lifetime::KeepAliveSet;
use crate::native::DEFAULT_MAX_CHECK_START;
use crate::props::ItemProp;
use crate::variant::PropValue;

/// A coder (compression method) exposed by a module.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CoderInfo {
    pub id:               u64,
    pub name:             String,
    pub decoder:          Option<Uuid>,
    pub encoder:          Option<Uuid>,
    pub decoder_assigned: bool,
    pub encoder_assigned: bool,
    pub pack_streams:     u32,
    pub is_filter:        Option<bool>,
    pub description:      Option<String>,
}

/// A hash function exposed through `IHashers`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HasherInfo {
    pub id:          u64,
    pub name:        String,
    pub digest_size: u32,
}

pub trait ArchiveEngine: Send + Sync {
    /// Every archive handler the engine exposes, in module order.
    fn catalog(&self) -> &SignatureCatalog;

    /// The set holding adapters the engine currently references.
    fn keep_alive(&self) -> &Arc<KeepAliveSet>;

    /// Slot layout adapters must present to this engine.
    fn vtable_layout(&self) -> VtableLayout;

    /// Largest offset at which readers look for the archive start.
    fn max_check_start(&self) -> u64 {
        DEFAULT_MAX_CHECK_START
    }

    /// Instantiate a reader for the handler with `class_id`.
    fn create_reader(&self, class_id: &Uuid) -> Result<Box<dyn ArchiveReader>>;

    fn coders(&self) -> Vec<CoderInfo> {
        Vec::new()
    }

    fn hashers(&self) -> Vec<HasherInfo> {
        Vec::new()
    }
}

/// One `IInArchive` instance.  Not shared between threads.
pub trait ArchiveReader: Send {
    /// Open the archive behind `stream`.  Anything but a plain success,
    /// including `S_FALSE`, is an open failure.  `callback` is offered to
    /// the handler when the archive has a name.
    fn open(
        &mut self,
        stream: &Arc<InStream>,
        max_check_start: u64,
        callback: Option<&Arc<OpenCallback>>,
    ) -> Result<()>;

    fn item_count(&mut self) -> Result<u32>;

    fn property(&mut self, index: u32, prop: ItemProp) -> Result<PropValue>;

    /// Run one extraction pass.  `None` means every item.
    fn extract(
        &mut self,
        indices: Option<&[u32]>,
        test_mode: bool,
        callback: &Arc<ExtractCallback>,
    ) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}
