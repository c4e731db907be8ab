pub mod error;
pub mod hresult;
pub mod guid;
pub mod variant;
pub mod props;
pub mod formats;
pub mod catalog;
pub mod detect;
pub mod lifetime;
pub mod com;
pub mod engine;
pub mod native;
pub mod session;

pub use error::{Result, SevenZipError};
pub use hresult::{HResult, OperationResult};
pub use formats::ArchiveFormat;
pub use catalog::{FormatDescriptor, SignatureCatalog};
pub use detect::{DetectionResult, FormatDetector};
pub use engine::{ArchiveEngine, ArchiveReader};
pub use native::{EngineConfig, Registry, SharedEngine};
pub use session::{Entry, ExtractOptions, ExtractReport, ExtractionSession, FormatSelection};
