//! Loading 7-Zip engine modules and calling into them.

pub mod archive;
pub mod config;
pub mod library;
pub mod registry;

pub use archive::NativeArchive;
pub use config::{EngineConfig, SharedEngine, DEFAULT_LIBRARY, DEFAULT_MAX_CHECK_START, LIBRARY_ENV};
pub use library::{ModuleRole, NativeModule};
pub use registry::{Registry, SkippedModule};
