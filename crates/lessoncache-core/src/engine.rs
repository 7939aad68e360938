//! The offline engine facade.
//!
//! `OfflineEngine` owns every component and is the only surface a
//! presentation layer needs. All operations are async and return without
//! waiting on network transfers; progress is reported through `subscribe()`.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_STORAGE_CAPACITY;
use crate::download::{Admission, DownloadManager, DownloadOptions, Transfer};
use crate::error::{Error, Result, StoreError};
use crate::events::{EngineEvent, EventBus};
use crate::models::{
    CachedModule, EngineSettings, Priority, ProgressKey, ProgressRecord, SettingsPatch,
    StorageSnapshot,
};
use crate::monitor::{DirectoryQuota, NetworkMonitor, NetworkStatus, QuotaProvider, StorageMonitor};
use crate::settings::SettingsStore;
use crate::store::Store;
use crate::sweeper::{SweepReport, Sweeper};
use crate::sync::scheduler::DEBOUNCE_DELAY;
use crate::sync::{RemoteAuthority, SyncManager, SyncReport, SyncScheduler, SyncStats};

/// Assembles an engine from its external collaborators.
pub struct EngineBuilder {
    remote: Arc<dyn RemoteAuthority>,
    transfer: Arc<dyn Transfer>,
    store: Option<Arc<Store>>,
    quota: Option<Arc<dyn QuotaProvider>>,
    network: NetworkMonitor,
    options: DownloadOptions,
}

impl EngineBuilder {
    pub fn store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn quota(mut self, quota: Arc<dyn QuotaProvider>) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Share a monitor that a platform adapter or probe keeps current.
    pub fn network(mut self, network: NetworkMonitor) -> Self {
        self.network = network;
        self
    }

    pub fn download_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn build(self) -> OfflineEngine {
        let store = self.store.unwrap_or_else(|| Arc::new(Store::in_memory()));
        let quota = self
            .quota
            .unwrap_or_else(|| Arc::new(DirectoryQuota::new(DEFAULT_STORAGE_CAPACITY, store.clone())));
        let events = EventBus::new();
        let storage = StorageMonitor::new(quota);

        let downloads = DownloadManager::new(
            store.clone(),
            self.network.clone(),
            storage.clone(),
            self.transfer,
            events.clone(),
            self.options,
        );
        if let Err(e) = downloads.recover_abandoned().await {
            warn!(error = %e, "Failed to revert abandoned downloads");
        }
        let sync = SyncManager::new(store.clone(), self.remote.clone(), events.clone()).await;
        let scheduler = Arc::new(SyncScheduler::new(sync.clone()));

        OfflineEngine {
            settings: SettingsStore::new(store.clone()),
            sweeper: Sweeper::new(store.clone(), events.clone()),
            remote: self.remote,
            network: self.network,
            store,
            storage,
            downloads,
            sync,
            scheduler,
            events,
            watcher: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }
}

pub struct OfflineEngine {
    store: Arc<Store>,
    remote: Arc<dyn RemoteAuthority>,
    network: NetworkMonitor,
    storage: StorageMonitor,
    downloads: DownloadManager,
    sync: SyncManager,
    scheduler: Arc<SyncScheduler>,
    settings: SettingsStore,
    sweeper: Sweeper,
    events: EventBus,
    watcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl OfflineEngine {
    pub fn builder(remote: Arc<dyn RemoteAuthority>, transfer: Arc<dyn Transfer>) -> EngineBuilder {
        EngineBuilder {
            remote,
            transfer,
            store: None,
            quota: None,
            network: NetworkMonitor::default(),
            options: DownloadOptions::default(),
        }
    }

    // ===== Lifecycle =====

    /// Sweep expired content, arm the sync timer and start following
    /// connectivity changes. Calling it again is a no-op.
    pub async fn start(&self) -> Result<SweepReport> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let mut watcher = self.watcher.lock().await;
        if watcher.is_some() {
            debug!("Engine already started");
            return Ok(SweepReport::default());
        }

        let report = self.sweep().await;
        self.maintain().await;

        let settings = self.settings.get().await;
        self.scheduler.reschedule(&settings, self.network.is_online()).await;
        *watcher = Some(self.spawn_network_watcher());
        info!(online = self.network.is_online(), "Engine started");
        Ok(report)
    }

    /// Stop the sync timer, cancel downloads and refuse further work.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.downloads.shutdown();
        self.scheduler.shutdown().await;
        if let Some(handle) = self.watcher.lock().await.take() {
            handle.abort();
        }
        info!("Engine shut down");
    }

    /// Started and not yet shut down.
    pub async fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && self.watcher.lock().await.is_some()
    }

    fn spawn_network_watcher(&self) -> JoinHandle<()> {
        let mut rx = self.network.subscribe();
        let cancel = self.shutdown.child_token();
        let scheduler = self.scheduler.clone();
        let settings = self.settings.clone();
        let sync = self.sync.clone();
        let events = self.events.clone();
        let mut was_online = rx.borrow().online;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                let status = rx.borrow_and_update().clone();
                events.emit(EngineEvent::NetworkChanged(status.clone()));

                let current = settings.get().await;
                scheduler.reschedule(&current, status.online).await;
                if status.online && !was_online && sync.pending_count().await > 0 {
                    debug!("Back online with pending progress, syncing");
                    scheduler.trigger_debounced(DEBOUNCE_DELAY).await;
                }
                was_online = status.online;
            }
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn network(&self) -> watch::Receiver<NetworkStatus> {
        self.network.subscribe()
    }

    /// The monitor a platform adapter reports connectivity into.
    pub fn network_monitor(&self) -> &NetworkMonitor {
        &self.network
    }

    // ===== Catalog =====

    /// Merge catalog metadata into the store.
    ///
    /// Modules that hold media keep their local content; everything else takes
    /// the catalog's sections and size. With `auto_download` set, critical and
    /// high priority modules are requested afterwards.
    pub async fn load_catalog(&self, catalog: Vec<CachedModule>) -> Result<usize> {
        let count = catalog.len();
        for remote in catalog {
            let id = remote.id.clone();
            self.store
                .modules
                .upsert(id, |existing| match existing {
                    Some(local) => {
                        let mut merged = local.clone();
                        merged.merge_catalog(remote);
                        merged
                    }
                    None => remote,
                })
                .await?;
        }
        info!(modules = count, "Catalog loaded");
        self.events.emit(EngineEvent::ModulesChanged);

        if self.settings.get().await.auto_download {
            self.auto_download().await;
        }
        Ok(count)
    }

    /// Fetch the catalog from the remote authority and merge it.
    pub async fn refresh_catalog(&self) -> Result<usize> {
        let catalog = self.remote.fetch_catalog().await?;
        self.load_catalog(catalog).await
    }

    async fn auto_download(&self) {
        let wanted = self
            .store
            .modules
            .get_all(|m| {
                matches!(m.priority, Priority::Critical | Priority::High)
                    && !m.is_downloaded()
                    && !m.is_downloading()
            })
            .await;
        for module in wanted {
            match self.downloads.request_download(&module.id).await {
                Ok(_) => debug!(module_id = %module.id, "Auto-download queued"),
                Err(e) => debug!(module_id = %module.id, reason = e.kind(), "Auto-download skipped"),
            }
        }
    }

    /// All modules, highest priority first.
    pub async fn modules(&self) -> Vec<CachedModule> {
        let mut modules = self.store.modules.get_all(|_| true).await;
        modules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        modules
    }

    pub async fn module(&self, module_id: &str) -> Option<CachedModule> {
        self.store.modules.get(&module_id.to_string()).await
    }

    // ===== Downloads =====

    pub async fn request_download(&self, module_id: &str) -> Result<Admission> {
        self.downloads.request_download(module_id).await
    }

    pub async fn cancel_download(&self, module_id: &str) -> bool {
        self.downloads.cancel_download(module_id).await
    }

    pub async fn active_downloads(&self) -> Vec<String> {
        self.downloads.active_downloads().await
    }

    /// Remove a module and any media no other module references.
    ///
    /// An active download is cancelled and allowed to unwind first.
    pub async fn remove_module(&self, module_id: &str) -> Result<Option<SweepReport>> {
        if self.downloads.cancel_download(module_id).await {
            self.downloads.wait_settled(module_id).await;
        }
        self.sweeper.remove_module(module_id).await
    }

    pub async fn set_pinned(&self, module_id: &str, pinned: bool) -> Result<CachedModule> {
        let module = self
            .store
            .modules
            .update(&module_id.to_string(), |m| {
                let changed = m.is_pinned != pinned;
                m.is_pinned = pinned;
                changed
            })
            .await?
            .ok_or_else(|| StoreError::NotFound {
                family: "modules",
                key: module_id.to_string(),
            })?;
        info!(module_id = module_id, pinned = pinned, "Pin updated");
        self.events.emit(EngineEvent::ModulesChanged);
        Ok(module)
    }

    // ===== Progress =====

    /// Save progress locally and schedule a debounced sync if online.
    pub async fn save_progress(&self, record: ProgressRecord) -> Result<ProgressRecord> {
        record.validate()?;
        let saved = self.store.save_progress(record).await?;
        debug!(key = %saved.key, revision = saved.revision, "Progress saved");
        self.events.emit(EngineEvent::ProgressChanged {
            key: saved.key.clone(),
        });
        if self.network.is_online() {
            self.scheduler.trigger_debounced(DEBOUNCE_DELAY).await;
        }
        Ok(saved)
    }

    pub async fn progress(&self, key: &ProgressKey) -> Option<ProgressRecord> {
        self.store.progress.get(key).await
    }

    /// Every section record of `module_id` for `user_id`.
    pub async fn progress_for(&self, module_id: &str, user_id: &str) -> Vec<ProgressRecord> {
        self.store
            .progress
            .get_all(|r| r.key.module_id == module_id && r.key.user_id == user_id)
            .await
    }

    // ===== Sync =====

    pub async fn sync_now(&self) -> Result<SyncReport> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        self.sync.sync_now().await
    }

    pub async fn sync_stats(&self) -> SyncStats {
        self.sync.stats().await
    }

    pub async fn pending_sync(&self) -> usize {
        self.sync.pending_count().await
    }

    // ===== Settings =====

    pub async fn settings(&self) -> EngineSettings {
        self.settings.get().await
    }

    /// Apply a partial update; the sync timer follows interval or flag changes.
    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<EngineSettings> {
        let change = self.settings.update(patch).await?;
        if change.reschedule_needed() && self.is_running().await {
            self.scheduler
                .reschedule(&change.current, self.network.is_online())
                .await;
        }
        if change.current.max_storage_size < change.previous.max_storage_size {
            self.maintain().await;
        }
        Ok(change.current)
    }

    // ===== Storage =====

    pub async fn storage_snapshot(&self) -> Result<StorageSnapshot> {
        self.storage.snapshot(&self.store).await
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweeper.sweep().await
    }

    /// Sweep if the footprint is over the configured ceiling.
    pub async fn maintain(&self) -> Option<SweepReport> {
        match self.storage_snapshot().await {
            Ok(snapshot) => self.sweeper.maintain(&snapshot).await,
            Err(e) => {
                warn!(error = %e, "Storage estimate unavailable, skipping maintenance");
                None
            }
        }
    }

    pub async fn clear_cache(&self) -> Result<SweepReport> {
        self.sweeper.clear_cache().await
    }

    pub async fn media_cached(&self, url: &str) -> bool {
        self.store.media.get(&url.to_string()).await.is_some()
    }

    /// Cached bytes for `url`, or `None` on a cache miss.
    pub async fn read_media(&self, url: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.store.read_media(url).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RemoteError;
    use crate::download::{FetchedMedia, ProgressSink};
    use crate::error::TransferError;
    use crate::monitor::ConnectionType;
    use crate::sync::PushOutcome;
    use async_trait::async_trait;

    struct NullRemote;

    #[async_trait]
    impl RemoteAuthority for NullRemote {
        async fn push_progress(
            &self,
            _records: &[ProgressRecord],
        ) -> std::result::Result<PushOutcome, RemoteError> {
            Ok(PushOutcome::accepted())
        }

        async fn fetch_catalog(&self) -> std::result::Result<Vec<CachedModule>, RemoteError> {
            let mut module = CachedModule::new("intro", 5, Vec::new());
            module.title = "Intro".into();
            Ok(vec![module])
        }
    }

    struct NullTransfer;

    #[async_trait]
    impl Transfer for NullTransfer {
        async fn fetch(
            &self,
            _module: &CachedModule,
            _media_urls: &[String],
            _progress: &ProgressSink,
        ) -> std::result::Result<Vec<FetchedMedia>, TransferError> {
            Ok(Vec::new())
        }
    }

    async fn engine() -> OfflineEngine {
        OfflineEngine::builder(Arc::new(NullRemote), Arc::new(NullTransfer))
            .network(NetworkMonitor::new(NetworkStatus::online(ConnectionType::Wifi)))
            .build()
            .await
    }

    #[tokio::test]
    async fn test_refresh_catalog_then_pin() {
        let engine = engine().await;
        assert_eq!(engine.refresh_catalog().await.expect("refresh"), 1);
        let module = engine.set_pinned("intro", true).await.expect("pin");
        assert!(module.is_pinned);
        assert_eq!(engine.module("intro").await.expect("module").title, "Intro");
    }

    #[tokio::test]
    async fn test_pin_unknown_module() {
        let engine = engine().await;
        let err = engine.set_pinned("ghost", true).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_catalog_reload_keeps_downloaded_state() {
        let engine = engine().await;
        engine.refresh_catalog().await.expect("refresh");
        engine
            .request_download("intro")
            .await
            .expect("admitted")
            .into_handle()
            .expect("started")
            .wait()
            .await
            .expect("download");

        engine.refresh_catalog().await.expect("refresh again");
        assert!(engine.module("intro").await.expect("module").is_downloaded());
    }

    #[tokio::test]
    async fn test_operations_after_shutdown() {
        let engine = engine().await;
        engine.start().await.expect("start");
        engine.shutdown().await;
        assert!(matches!(engine.sync_now().await, Err(Error::Shutdown)));
        assert!(matches!(engine.start().await, Err(Error::Shutdown)));
    }
}
