//! Fakes for the engine's external collaborators.

#![allow(dead_code)] // Not every test file uses every fake

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use lessoncache_core::{
    CachedModule, ConnectionType, DownloadOptions, FetchedMedia, FixedQuota, NetworkMonitor,
    NetworkStatus, OfflineEngine, ProgressKey, ProgressRecord, ProgressSink, PushOutcome,
    RemoteAuthority, RemoteError, Section, Store, Transfer, TransferError,
};

/// Records every pushed batch. Can fail, or hold a push until released.
#[derive(Default)]
pub struct FakeRemote {
    pub pushes: AtomicUsize,
    pub batches: Mutex<Vec<Vec<ProgressRecord>>>,
    pub fail: AtomicBool,
    pub hold: AtomicBool,
    /// Signalled when a held push has started.
    pub entered: Notify,
    pub release: Notify,
    pub catalog: Mutex<Vec<CachedModule>>,
}

impl FakeRemote {
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn last_batch(&self) -> Vec<ProgressRecord> {
        self.batches
            .lock()
            .expect("batches lock")
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteAuthority for FakeRemote {
    async fn push_progress(&self, records: &[ProgressRecord]) -> Result<PushOutcome, RemoteError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.batches
            .lock()
            .expect("batches lock")
            .push(records.to_vec());
        if self.hold.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("remote down".into()));
        }
        Ok(PushOutcome::accepted())
    }

    async fn fetch_catalog(&self) -> Result<Vec<CachedModule>, RemoteError> {
        Ok(self.catalog.lock().expect("catalog lock").clone())
    }
}

/// Reports fixed chunk sizes and returns four bytes per media URL.
#[derive(Default)]
pub struct FakeTransfer {
    pub fetches: AtomicUsize,
    pub chunks: Mutex<Vec<u64>>,
    pub fail: AtomicBool,
    pub hold: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl FakeTransfer {
    pub fn with_chunks(chunks: &[u64]) -> Self {
        let transfer = Self::default();
        *transfer.chunks.lock().expect("chunks lock") = chunks.to_vec();
        transfer
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transfer for FakeTransfer {
    async fn fetch(
        &self,
        _module: &CachedModule,
        media_urls: &[String],
        progress: &ProgressSink,
    ) -> Result<Vec<FetchedMedia>, TransferError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let chunks = self.chunks.lock().expect("chunks lock").clone();
        for chunk in chunks {
            progress.advance(chunk);
            tokio::task::yield_now().await;
        }
        if self.hold.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransferError::Network("connection reset".into()));
        }
        Ok(media_urls
            .iter()
            .map(|url| FetchedMedia {
                url: url.clone(),
                bytes: b"data".to_vec(),
            })
            .collect())
    }
}

pub struct Harness {
    pub engine: OfflineEngine,
    pub store: Arc<Store>,
    pub remote: Arc<FakeRemote>,
    pub transfer: Arc<FakeTransfer>,
    pub network: NetworkMonitor,
}

pub async fn harness(status: NetworkStatus) -> Harness {
    harness_with(status, FakeTransfer::default(), DownloadOptions::default()).await
}

pub async fn harness_with(
    status: NetworkStatus,
    transfer: FakeTransfer,
    options: DownloadOptions,
) -> Harness {
    harness_on(Arc::new(Store::in_memory()), status, transfer, options).await
}

/// Build an engine over an existing store, e.g. one opened from disk.
pub async fn harness_on(
    store: Arc<Store>,
    status: NetworkStatus,
    transfer: FakeTransfer,
    options: DownloadOptions,
) -> Harness {
    let remote = Arc::new(FakeRemote::default());
    let transfer = Arc::new(transfer);
    let network = NetworkMonitor::new(status);
    let engine = OfflineEngine::builder(remote.clone(), transfer.clone())
        .store(store.clone())
        .quota(Arc::new(FixedQuota::new(1_000_000, 0)))
        .network(network.clone())
        .download_options(options)
        .build()
        .await;
    Harness {
        engine,
        store,
        remote,
        transfer,
        network,
    }
}

pub fn wifi() -> NetworkStatus {
    NetworkStatus::online(ConnectionType::Wifi)
}

pub fn module(id: &str, size: u64, media: &[&str]) -> CachedModule {
    CachedModule::new(
        id,
        size,
        vec![Section {
            id: "s1".into(),
            media_urls: media.iter().map(|u| u.to_string()).collect(),
            ..Default::default()
        }],
    )
}

pub fn key(module_id: &str, section_id: &str) -> ProgressKey {
    ProgressKey::new(module_id, section_id, "learner-1")
}
