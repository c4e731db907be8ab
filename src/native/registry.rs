//! The loaded engine: primary module, codec plugins and their merged tables.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::archive::NativeArchive;
use super::config::EngineConfig;
use super::library::{ModuleRole, NativeModule};
use crate::catalog::{FormatDescriptor, SignatureCatalog};
use crate::com::{CodecProvider, CodecsInfo, VtableLayout};
use crate::engine::{ArchiveEngine, ArchiveReader, CoderInfo, HasherInfo};
use crate::error::{Result, SevenZipError};
use crate::guid::Guid;
use crate::hresult::HResult;
use crate::lifetime::KeepAliveSet;
use crate::variant::PropVariant;

/// A plugin that failed to load.
#[derive(Debug, Clone)]
pub struct SkippedModule {
    pub path:   PathBuf,
    pub reason: String,
}

// ── Flat codec index ────────────────────────────────────────────────────────

#[derive(Debug)]
struct Slot<I> {
    module: Arc<NativeModule>,
    local:  u32,
    info:   Option<I>,
}

/// Coders and hashers of every module behind one index space.
#[derive(Debug, Default)]
struct CodecTable {
    coders:  Vec<Slot<CoderInfo>>,
    hashers: Vec<Slot<HasherInfo>>,
}

impl CodecTable {
    fn add_module(&mut self, module: &Arc<NativeModule>) -> Result<()> {
        for local in 0..module.method_count()? {
            let info = match module.coder_info(local) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(path = %module.path().display(), index = local, error = %e, "unreadable coder");
                    None
                }
            };
            self.coders.push(Slot { module: Arc::clone(module), local, info });
        }
        for local in 0..module.hasher_count() {
            let info = module.hasher_info(local).ok();
            self.hashers.push(Slot { module: Arc::clone(module), local, info });
        }
        Ok(())
    }
}

impl CodecProvider for CodecTable {
    fn num_methods(&self) -> u32 {
        self.coders.len() as u32
    }

    unsafe fn method_property(&self, index: u32, prop_id: u32, value: *mut PropVariant) -> HResult {
        match self.coders.get(index as usize) {
            Some(s) => s.module.method_property_raw(s.local, prop_id, value),
            None => HResult::INVALID_ARG,
        }
    }

    unsafe fn create_decoder(&self, index: u32, iid: *const Guid, out: *mut *mut c_void) -> HResult {
        *out = std::ptr::null_mut();
        match self.coders.get(index as usize) {
            Some(s) => s.module.create_decoder_raw(s.local, iid, out),
            None => HResult::FAIL,
        }
    }

    unsafe fn create_encoder(&self, index: u32, iid: *const Guid, out: *mut *mut c_void) -> HResult {
        *out = std::ptr::null_mut();
        match self.coders.get(index as usize) {
            Some(s) => s.module.create_encoder_raw(s.local, iid, out),
            None => HResult::FAIL,
        }
    }

    fn num_hashers(&self) -> u32 {
        self.hashers.len() as u32
    }

    unsafe fn hasher_property(&self, index: u32, prop_id: u32, value: *mut PropVariant) -> HResult {
        match self.hashers.get(index as usize) {
            Some(s) => s.module.hasher_property_raw(s.local, prop_id, value),
            None => HResult::INVALID_ARG,
        }
    }

    unsafe fn create_hasher(&self, index: u32, out: *mut *mut c_void) -> HResult {
        *out = std::ptr::null_mut();
        match self.hashers.get(index as usize) {
            Some(s) => s.module.create_hasher_raw(s.local, out),
            None => HResult::FAIL,
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// All loaded modules and the tables built from them.
///
/// Dropping the registry detaches the codec-info object from every module.
/// Each library is unloaded once the last reader created from it is gone.
pub struct Registry {
    config:     EngineConfig,
    modules:    Vec<Arc<NativeModule>>,
    skipped:    Vec<SkippedModule>,
    catalog:    SignatureCatalog,
    table:      Arc<CodecTable>,
    codecs:     Option<Arc<CodecsInfo>>,
    keep_alive: Arc<KeepAliveSet>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("modules", &self.modules.len())
            .field("skipped", &self.skipped.len())
            .field("formats", &self.catalog.len())
            .field("coders", &self.table.coders.len())
            .field("hashers", &self.table.hashers.len())
            .finish()
    }
}

fn plugin_paths(dir: &Path, primary: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let primary = primary.canonicalize().ok();
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case(std::env::consts::DLL_EXTENSION))
        })
        .filter(|p| primary.is_none() || p.canonicalize().ok() != primary)
        .collect();
    paths.sort();
    paths
}

impl Registry {
    /// Load the primary library and every plugin in the codec directory.
    ///
    /// Failure to load the primary library is fatal.  Plugins that fail are
    /// logged and listed in [`skipped_modules`](Self::skipped_modules).
    pub fn load(config: &EngineConfig) -> Result<Self> {
        let layout = config.layout;
        let primary = NativeModule::load(&config.library, ModuleRole::Primary, layout)?;
        let mut modules = vec![primary];
        let mut skipped = Vec::new();

        for path in plugin_paths(&config.codecs_dir(), &config.library) {
            match NativeModule::load(&path, ModuleRole::Auxiliary, layout) {
                Ok(m) => modules.push(m),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping codec module");
                    skipped.push(SkippedModule { path, reason: e.to_string() });
                }
            }
        }

        let mut table = CodecTable::default();
        let mut formats: Vec<FormatDescriptor> = Vec::new();
        let mut kept = Vec::with_capacity(modules.len());
        for module in modules {
            let index = kept.len();
            let loaded = table.add_module(&module).and_then(|()| module.formats(index));
            match loaded {
                Ok(mut f) => formats.append(&mut f),
                Err(e) if module.role() == ModuleRole::Auxiliary => {
                    warn!(path = %module.path().display(), error = %e, "skipping codec module");
                    table.coders.retain(|s| !Arc::ptr_eq(&s.module, &module));
                    table.hashers.retain(|s| !Arc::ptr_eq(&s.module, &module));
                    skipped.push(SkippedModule { path: module.path().to_path_buf(), reason: e.to_string() });
                    continue;
                }
                Err(e) => return Err(e),
            }
            kept.push(module);
        }

        let catalog = SignatureCatalog::new(formats)?;
        let table = Arc::new(table);
        let keep_alive = KeepAliveSet::new();

        let mut registry = Registry {
            config: config.clone(),
            modules: kept,
            skipped,
            catalog,
            table,
            codecs: None,
            keep_alive,
        };
        registry.attach_codecs(layout);
        registry.apply_tuning();

        info!(
            modules = registry.modules.len(),
            formats = registry.catalog.len(),
            coders  = registry.table.coders.len(),
            hashers = registry.table.hashers.len(),
            "engine loaded"
        );
        Ok(registry)
    }

    fn attach_codecs(&mut self, layout: VtableLayout) {
        if !self.modules.iter().any(|m| m.accepts_codecs()) {
            return;
        }
        let provider: Arc<dyn CodecProvider> = self.table.clone();
        let codecs = CodecsInfo::new(provider, &self.keep_alive, layout);
        for m in self.modules.iter().filter(|m| m.accepts_codecs()) {
            if let Err(e) = unsafe { m.set_codecs(codecs.as_raw()) } {
                warn!(path = %m.path().display(), error = %e, "SetCodecs failed");
            }
        }
        self.codecs = Some(codecs);
    }

    fn apply_tuning(&self) {
        for m in &self.modules {
            if let Some(on) = self.config.case_sensitive {
                if let Some(status) = m.set_case_sensitive(on) {
                    debug!(path = %m.path().display(), %status, on, "SetCaseSensitive");
                }
            }
            if self.config.large_pages {
                if let Some(status) = m.set_large_page_mode() {
                    debug!(path = %m.path().display(), %status, "SetLargePageMode");
                }
            }
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn modules(&self) -> &[Arc<NativeModule>] {
        &self.modules
    }

    pub fn skipped_modules(&self) -> &[SkippedModule] {
        &self.skipped
    }

    /// Toggle case-sensitive name matching in every module that supports it.
    /// Returns `S_FALSE` when none does.
    pub fn set_case_sensitive(&self, on: bool) -> HResult {
        self.modules
            .iter()
            .filter_map(|m| m.set_case_sensitive(on))
            .fold(HResult::FALSE, |acc, s| if s.is_ok() { s } else { acc })
    }

    pub fn set_large_page_mode(&self) -> HResult {
        self.modules
            .iter()
            .filter_map(|m| m.set_large_page_mode())
            .fold(HResult::FALSE, |acc, s| if s.is_ok() { s } else { acc })
    }
}

impl ArchiveEngine for Registry {
    fn catalog(&self) -> &SignatureCatalog {
        &self.catalog
    }

    fn keep_alive(&self) -> &Arc<KeepAliveSet> {
        &self.keep_alive
    }

    fn vtable_layout(&self) -> VtableLayout {
        self.config.layout
    }

    fn max_check_start(&self) -> u64 {
        self.config.max_check_start
    }

    fn create_reader(&self, class_id: &Uuid) -> Result<Box<dyn ArchiveReader>> {
        let desc = self
            .catalog
            .find_by_class_id(class_id)
            .ok_or_else(|| SevenZipError::UnknownFormat { name: Some(class_id.to_string()) })?;
        let module = self
            .modules
            .get(desc.module_index)
            .ok_or_else(|| SevenZipError::UnknownFormat { name: Some(desc.name.clone()) })?;
        let ptr = module.create_archive(class_id)?;
        debug!(format = %desc.name, "archive reader created");
        Ok(Box::new(NativeArchive::new(ptr, Arc::clone(module))))
    }

    fn coders(&self) -> Vec<CoderInfo> {
        self.table.coders.iter().filter_map(|s| s.info.clone()).collect()
    }

    fn hashers(&self) -> Vec<HasherInfo> {
        self.table.hashers.iter().filter_map(|s| s.info.clone()).collect()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if self.codecs.is_some() {
            for m in self.modules.iter().filter(|m| m.accepts_codecs()) {
                if let Err(e) = unsafe { m.set_codecs(std::ptr::null_mut()) } {
                    warn!(path = %m.path().display(), error = %e, "detaching codecs failed");
                }
            }
        }
        self.codecs = None;
        // Probe closures hold their modules.
        self.catalog = SignatureCatalog::default();
        if let Err(e) = self.keep_alive.shutdown() {
            error!(error = %e, "engine shut down with live native references");
        }
        debug!(modules = self.modules.len(), "engine released");
    }
}
