//! Download admission, queuing and progress accounting.
//!
//! A request is checked against, in order: current module state, available
//! storage, connectivity, and the connection-type policy. Admitted downloads
//! run as spawned tasks, at most `max_concurrent` at a time; a failed or
//! cancelled download reverts the module to `NotDownloaded` and is never
//! retried automatically.

pub mod transfer;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AdmissionError, Error, Result, StoreError, TransferError};
use crate::events::{EngineEvent, EventBus};
use crate::models::{CachedModule, DownloadState, MediaAsset};
use crate::monitor::{NetworkMonitor, StorageMonitor};
use crate::store::Store;

pub use transfer::{FetchedMedia, ProgressSink, Transfer};

/// Default number of module downloads allowed to move bytes at once.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// Outcome of an accepted download request.
#[derive(Debug)]
pub enum Admission {
    /// A new download was queued.
    Started(DownloadHandle),
    /// The module is already downloading; the request was a no-op.
    InProgress,
}

impl Admission {
    pub fn into_handle(self) -> Option<DownloadHandle> {
        match self {
            Admission::Started(handle) => Some(handle),
            Admission::InProgress => None,
        }
    }
}

/// Resolves once a started download completes, fails or is cancelled.
#[derive(Debug)]
pub struct DownloadHandle {
    module_id: String,
    done: oneshot::Receiver<Result<CachedModule>>,
}

impl DownloadHandle {
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub async fn wait(self) -> Result<CachedModule> {
        self.done.await.unwrap_or(Err(Error::Shutdown))
    }
}

/// Policy knobs fixed at construction time.
#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    pub max_concurrent: usize,
    /// Also refuse downloads that would push the engine past `max_storage_size`.
    pub enforce_storage_ceiling: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            enforce_storage_ceiling: false,
        }
    }
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<Store>,
    network: NetworkMonitor,
    storage: StorageMonitor,
    transfer: Arc<dyn Transfer>,
    events: EventBus,
    options: DownloadOptions,
    permits: Arc<Semaphore>,
    /// Cancellation handles of downloads that are queued or running.
    active: Mutex<HashMap<String, CancellationToken>>,
    /// Woken whenever a download leaves `active`.
    settled: Notify,
    shutdown: CancellationToken,
}

impl DownloadManager {
    pub fn new(
        store: Arc<Store>,
        network: NetworkMonitor,
        storage: StorageMonitor,
        transfer: Arc<dyn Transfer>,
        events: EventBus,
        options: DownloadOptions,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                store,
                network,
                storage,
                transfer,
                events,
                options,
                permits,
                active: Mutex::new(HashMap::new()),
                settled: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Request a module download.
    ///
    /// Admission errors come back immediately and nothing is started.
    pub async fn request_download(&self, module_id: &str) -> Result<Admission> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }

        // Held across admission so two requests for one module cannot both start.
        let mut active = inner.active.lock().await;
        if active.contains_key(module_id) {
            debug!(module_id = module_id, "Download already in progress");
            return Ok(Admission::InProgress);
        }

        let module = inner
            .store
            .modules
            .get(&module_id.to_string())
            .await
            .ok_or_else(|| AdmissionError::UnknownModule(module_id.to_string()))?;
        self.admit(&module).await.inspect_err(|e| {
            info!(module_id = module_id, reason = e.kind(), "Download rejected");
        })?;

        inner
            .store
            .modules
            .update(&module.id, |m| {
                m.begin_download();
                true
            })
            .await?;

        let cancel = inner.shutdown.child_token();
        active.insert(module.id.clone(), cancel.clone());
        drop(active);

        let (tx, rx) = oneshot::channel();
        let manager = self.clone();
        let id = module.id.clone();
        tokio::spawn(async move {
            let result = manager.run(id, cancel).await;
            let _ = tx.send(result);
        });

        info!(module_id = %module.id, size = module.size_estimate, "Download queued");
        inner.events.emit(EngineEvent::ModulesChanged);
        Ok(Admission::Started(DownloadHandle {
            module_id: module.id,
            done: rx,
        }))
    }

    /// Admission checks, in order. Each failure is a distinct rejection.
    async fn admit(&self, module: &CachedModule) -> Result<()> {
        let inner = &self.inner;
        if module.is_downloaded() {
            return Err(AdmissionError::AlreadyDownloaded(module.id.clone()).into());
        }

        let snapshot = inner.storage.snapshot(&inner.store).await?;
        if snapshot.available < module.size_estimate {
            return Err(AdmissionError::InsufficientStorage {
                required: module.size_estimate,
                available: snapshot.available,
            }
            .into());
        }

        let network = inner.network.status();
        if !network.online {
            return Err(AdmissionError::OfflineUnavailable.into());
        }

        let settings = inner.store.settings.get().await;
        if network.is_cellular() && !settings.download_on_cellular {
            return Err(AdmissionError::CellularRestricted.into());
        }
        if network.is_unmetered() && !settings.download_on_wifi {
            return Err(AdmissionError::WifiRestricted.into());
        }

        if inner.options.enforce_storage_ceiling
            && snapshot.engine_bytes().saturating_add(module.size_estimate) > settings.max_storage_size
        {
            return Err(AdmissionError::StorageCeilingExceeded {
                ceiling: settings.max_storage_size,
            }
            .into());
        }
        Ok(())
    }

    /// Abandon a queued or running download. Returns `false` if none was active.
    pub async fn cancel_download(&self, module_id: &str) -> bool {
        match self.inner.active.lock().await.get(module_id) {
            Some(token) => {
                info!(module_id = module_id, "Cancelling download");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until `module_id` has no queued or running download.
    pub async fn wait_settled(&self, module_id: &str) {
        loop {
            let settled = self.inner.settled.notified();
            if !self.is_active(module_id).await {
                return;
            }
            settled.await;
        }
    }

    pub async fn is_active(&self, module_id: &str) -> bool {
        self.inner.active.lock().await.contains_key(module_id)
    }

    pub async fn active_downloads(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.active.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Revert modules left `Downloading` by a previous process.
    ///
    /// Only modules without a queued or running task here are touched.
    pub async fn recover_abandoned(&self) -> Result<usize> {
        let active = self.inner.active.lock().await;
        let recovered = self
            .inner
            .store
            .modules
            .update_all(|m| {
                if m.state != DownloadState::Downloading || active.contains_key(&m.id) {
                    return false;
                }
                m.reset_download();
                true
            })
            .await?;
        drop(active);
        if recovered > 0 {
            info!(modules = recovered, "Reverted abandoned downloads");
            self.inner.events.emit(EngineEvent::ModulesChanged);
        }
        Ok(recovered)
    }

    /// Cancel everything and refuse new requests.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn run(&self, module_id: String, cancel: CancellationToken) -> Result<CachedModule> {
        let outcome = self.execute(&module_id, &cancel).await;
        let result = match outcome {
            Ok(media) => self.finish(&module_id, media).await,
            Err(e) => Err(e),
        };

        let result = match result {
            Ok(module) => {
                info!(module_id = %module_id, "Download complete");
                self.inner.events.emit(EngineEvent::DownloadCompleted {
                    module_id: module_id.clone(),
                });
                Ok(module)
            }
            Err(e) => {
                self.revert(&module_id).await;
                if matches!(e, Error::Transfer(TransferError::Cancelled)) {
                    info!(module_id = %module_id, "Download cancelled");
                    self.inner.events.emit(EngineEvent::DownloadCancelled {
                        module_id: module_id.clone(),
                    });
                } else {
                    warn!(module_id = %module_id, error = %e, "Download failed");
                    self.inner.events.emit(EngineEvent::DownloadFailed {
                        module_id: module_id.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
                Err(e)
            }
        };

        self.inner.active.lock().await.remove(&module_id);
        self.inner.settled.notify_waiters();
        self.inner.events.emit(EngineEvent::ModulesChanged);
        result
    }

    /// Wait for a permit, then drive the transfer while accounting progress.
    async fn execute(&self, module_id: &str, cancel: &CancellationToken) -> Result<Vec<FetchedMedia>> {
        let inner = &self.inner;
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled.into()),
            permit = inner.permits.clone().acquire_owned() => {
                permit.map_err(|_| Error::Shutdown)?
            }
        };

        let module = inner
            .store
            .modules
            .get(&module_id.to_string())
            .await
            .ok_or_else(|| StoreError::NotFound {
                family: "modules",
                key: module_id.to_string(),
            })?;
        let media_urls = self.uncached_media(&module).await;
        debug!(module_id = module_id, media = media_urls.len(), "Transfer starting");

        let (sink, mut reports) = ProgressSink::channel();
        let fetch = inner.transfer.fetch(&module, &media_urls, &sink);
        tokio::pin!(fetch);

        let mut received: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled.into()),
                result = &mut fetch => return result.map_err(Error::from),
                Some(bytes) = reports.recv() => {
                    received = received.saturating_add(bytes);
                    self.record_progress(module_id, received).await;
                }
            }
        }
    }

    async fn uncached_media(&self, module: &CachedModule) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for url in module.media_urls() {
            if !seen.insert(url) {
                continue;
            }
            if self.inner.store.media.get(&url.to_string()).await.is_none() {
                urls.push(url.to_string());
            }
        }
        urls
    }

    async fn record_progress(&self, module_id: &str, received: u64) {
        let mut advanced = false;
        let updated = self
            .inner
            .store
            .modules
            .update(&module_id.to_string(), |m| {
                let before = m.downloaded_size;
                advanced = m.record_progress(received) != before;
                advanced
            })
            .await;
        match updated {
            Ok(Some(m)) if advanced => self.inner.events.emit(EngineEvent::DownloadProgress {
                module_id: m.id,
                downloaded: m.downloaded_size,
                total: m.size_estimate,
            }),
            Ok(_) => {}
            Err(e) => warn!(module_id = module_id, error = %e, "Failed to persist download progress"),
        }
    }

    /// Persist fetched media, then mark the module downloaded.
    async fn finish(&self, module_id: &str, media: Vec<FetchedMedia>) -> Result<CachedModule> {
        let store = &self.inner.store;
        for item in media {
            let asset = MediaAsset::new(item.url, item.bytes.len() as u64);
            store.put_media(asset, &item.bytes).await?;
        }

        let settings = store.settings.get().await;
        let now = Utc::now();
        store
            .modules
            .update(&module_id.to_string(), |m| {
                m.complete(now, settings.cache_expiration_days);
                true
            })
            .await?
            .ok_or_else(|| {
                StoreError::NotFound {
                    family: "modules",
                    key: module_id.to_string(),
                }
                .into()
            })
    }

    async fn revert(&self, module_id: &str) {
        let reverted = self
            .inner
            .store
            .modules
            .update(&module_id.to_string(), |m| {
                m.reset_download();
                true
            })
            .await;
        if let Err(e) = reverted {
            warn!(module_id = module_id, error = %e, "Failed to revert module after download failure");
        }
    }
}
