//! Engine configuration and the process-wide engine slot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::registry::Registry;
use crate::com::VtableLayout;
use crate::error::Result;

/// Engine library file name for the current platform.
#[cfg(windows)]
pub const DEFAULT_LIBRARY: &str = "7z.dll";
#[cfg(not(windows))]
pub const DEFAULT_LIBRARY: &str = "7z.so";

/// Environment variable naming the engine library.
pub const LIBRARY_ENV: &str = "SEVENZIP_LIB";

/// Largest offset at which the engine looks for an archive start when
/// opening a stream.
pub const DEFAULT_MAX_CHECK_START: u64 = 1 << 15;

// ── EngineConfig ──────────────────────────────────────────────────────────────

/// Configuration for [`Registry::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub library:         PathBuf,
    /// Directory scanned for codec plugins.  `None` means `Codecs` next to
    /// the library.
    pub codecs_dir:      Option<PathBuf>,
    pub layout:          VtableLayout,
    pub max_check_start: u64,
    /// Forwarded to `SetCaseSensitive` when set.
    pub case_sensitive:  Option<bool>,
    pub large_pages:     bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            library:         PathBuf::from(DEFAULT_LIBRARY),
            codecs_dir:      None,
            layout:          VtableLayout::platform_default(),
            max_check_start: DEFAULT_MAX_CHECK_START,
            case_sensitive:  None,
            large_pages:     false,
        }
    }
}

impl EngineConfig {
    pub fn new(library: impl Into<PathBuf>) -> Self {
        Self { library: library.into(), ..Self::default() }
    }

    /// Find the engine: `$SEVENZIP_LIB` first, then the stock library names
    /// next to the running executable.
    pub fn locate() -> Option<Self> {
        if let Some(path) = std::env::var_os(LIBRARY_ENV).filter(|p| !p.is_empty()) {
            debug!(path = ?path, "engine from {}", LIBRARY_ENV);
            return Some(Self::new(path));
        }
        let exe = std::env::current_exe().ok()?;
        let dir = exe.parent()?;
        let names: &[&str] = if cfg!(windows) { &["7z.dll"] } else { &["7z.so", "lib7z.so"] };
        names
            .iter()
            .map(|n| dir.join(n))
            .find(|p| p.is_file())
            .map(Self::new)
    }

    pub fn with_layout(mut self, layout: VtableLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_codecs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.codecs_dir = Some(dir.into());
        self
    }

    /// Resolved plugin directory.
    pub fn codecs_dir(&self) -> PathBuf {
        match &self.codecs_dir {
            Some(d) => d.clone(),
            None => self
                .library
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join("Codecs"),
        }
    }
}

// ── SharedEngine ──────────────────────────────────────────────────────────────

/// Lazily loaded engine shared by every caller in the process.
///
/// Concurrent first calls converge on a single [`Registry`]; the lock is held
/// only while loading.
///
/// ```no_run
/// use std::sync::OnceLock;
/// use sevenzip_bridge::native::{EngineConfig, SharedEngine};
///
/// static ENGINE: OnceLock<SharedEngine> = OnceLock::new();
/// let engine = ENGINE
///     .get_or_init(|| SharedEngine::new(EngineConfig::locate().unwrap_or_default()))
///     .get()?;
/// # Ok::<(), sevenzip_bridge::SevenZipError>(())
/// ```
#[derive(Debug)]
pub struct SharedEngine {
    config: EngineConfig,
    slot:   Mutex<Option<Arc<Registry>>>,
}

impl SharedEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config, slot: Mutex::new(None) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The registry, loading it on first use.  A failed load is not cached.
    pub fn get(&self) -> Result<Arc<Registry>> {
        let mut slot = self.slot.lock();
        if let Some(reg) = slot.as_ref() {
            return Ok(Arc::clone(reg));
        }
        let reg = Arc::new(Registry::load(&self.config)?);
        *slot = Some(Arc::clone(&reg));
        Ok(reg)
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Drop the shared handle.  The engine unloads once every outstanding
    /// `Arc<Registry>` is gone.
    pub fn unload(&self) -> Option<Arc<Registry>> {
        self.slot.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codecs_dir_defaults_next_to_library() {
        let cfg = EngineConfig::new("/opt/7zip/7z.so");
        assert_eq!(cfg.codecs_dir(), PathBuf::from("/opt/7zip/Codecs"));
        let cfg = cfg.with_codecs_dir("/elsewhere");
        assert_eq!(cfg.codecs_dir(), PathBuf::from("/elsewhere"));
    }

    #[test]
    fn defaults_match_platform() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.layout, VtableLayout::platform_default());
        assert_eq!(cfg.max_check_start, 32 * 1024);
        assert_eq!(cfg.library, PathBuf::from(DEFAULT_LIBRARY));
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = EngineConfig::new("lib/7z.so").with_layout(VtableLayout::Plain);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.library, cfg.library);
        assert_eq!(back.layout, VtableLayout::Plain);
    }

    #[test]
    fn failed_load_is_not_cached() {
        let shared = SharedEngine::new(EngineConfig::new("/definitely/not/here/7z.so"));
        assert!(shared.get().is_err());
        assert!(!shared.is_loaded());
    }
}
