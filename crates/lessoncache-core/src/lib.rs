//! lessoncache-core - offline caching and progress sync for learning modules.
//!
//! Modules are downloaded under an admission policy, kept until they expire,
//! and reclaimed by a sweep. Learner progress is written locally first and
//! pushed to a remote authority in batched sync cycles.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use lessoncache_core::{ApiClient, HttpTransfer, OfflineEngine, Store};
//!
//! let store = Arc::new(Store::open("/tmp/lessoncache").await?);
//! let engine = OfflineEngine::builder(
//!     Arc::new(ApiClient::new("https://lessons.example/api")?),
//!     Arc::new(HttpTransfer::new()?),
//! )
//! .store(store)
//! .build()
//! .await;
//! engine.start().await?;
//! engine.refresh_catalog().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod monitor;
pub mod settings;
pub mod store;
pub mod sweeper;
pub mod sync;

pub use api::{ApiClient, HttpProbe, HttpTransfer};
pub use config::Config;
pub use download::{Admission, DownloadHandle, DownloadOptions, FetchedMedia, ProgressSink, Transfer};
pub use engine::{EngineBuilder, OfflineEngine};
pub use error::{
    AdmissionError, Error, ProgressError, RemoteError, Result, SettingsError, StoreError,
    TransferError,
};
pub use events::EngineEvent;
pub use models::{
    CachedModule, CompressionLevel, DownloadState, EngineSettings, MediaAsset, Priority,
    ProgressKey, ProgressRecord, Section, SectionKind, SettingsPatch, StorageSnapshot, SyncStatus,
};
pub use monitor::{
    ConnectionType, ConnectivityProbe, DirectoryQuota, FixedQuota, NetworkMonitor, NetworkQuality,
    NetworkStatus, Quota, QuotaProvider,
};
pub use store::Store;
pub use sweeper::SweepReport;
pub use sync::{PushOutcome, RemoteAuthority, SyncReport, SyncStats};
