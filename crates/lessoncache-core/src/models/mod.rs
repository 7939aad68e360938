//! Data models for the offline engine.
//!
//! - `CachedModule`, `Section`: downloadable content units
//! - `ProgressRecord`, `ProgressKey`: per-user section progress
//! - `MediaAsset`: cached binary resources shared between modules
//! - `EngineSettings`, `SettingsPatch`: policy knobs
//! - `StorageSnapshot`: derived storage accounting

pub mod media;
pub mod module;
pub mod progress;
pub mod settings;
pub mod snapshot;

pub use media::MediaAsset;
pub use module::{CachedModule, DownloadState, Priority, Section, SectionKind};
pub use progress::{ProgressKey, ProgressRecord, SyncStatus};
pub use settings::{CompressionLevel, EngineSettings, SettingsPatch};
pub use snapshot::StorageSnapshot;
