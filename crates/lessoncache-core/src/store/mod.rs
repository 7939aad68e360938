//! Persistent local storage.
//!
//! The `Store` holds four record families plus a small sync bookkeeping
//! document. On disk each family is a JSON file in the data directory:
//!
//! - `modules.json`: cached modules
//! - `progress.json`: progress records
//! - `media.json`: media asset records, with bytes in `media/<blake3>.bin`
//! - `settings.json`: engine settings
//! - `sync_meta.json`: last successful sync
//!
//! The store is the single source of truth; every component reads through it.

pub mod family;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::media::blob_name;
use crate::models::{
    CachedModule, EngineSettings, MediaAsset, ProgressKey, ProgressRecord, SyncStatus,
};

pub use family::{Document, Family, Record};

const MEDIA_DIR: &str = "media";

impl Record for CachedModule {
    type Key = String;
    const FAMILY: &'static str = "modules";

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl Record for ProgressRecord {
    type Key = ProgressKey;
    const FAMILY: &'static str = "progress";

    fn key(&self) -> ProgressKey {
        self.key.clone()
    }
}

impl Record for MediaAsset {
    type Key = String;
    const FAMILY: &'static str = "media";

    fn key(&self) -> String {
        self.url.clone()
    }
}

/// Sync bookkeeping that must survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    pub last_sync_at: Option<DateTime<Utc>>,
}

pub struct Store {
    dir: Option<PathBuf>,
    pub modules: Family<CachedModule>,
    pub progress: Family<ProgressRecord>,
    pub media: Family<MediaAsset>,
    pub settings: Document<EngineSettings>,
    pub sync_meta: Document<SyncMeta>,
    /// Media bytes when running without a data directory.
    memory_blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl Store {
    /// Open (or create) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        let media_dir = dir.join(MEDIA_DIR);
        tokio::fs::create_dir_all(&media_dir)
            .await
            .map_err(|source| StoreError::Io {
                family: "media",
                key: media_dir.display().to_string(),
                source,
            })?;

        let store = Self {
            modules: Family::open(&dir).await,
            progress: Family::open(&dir).await,
            media: Family::open(&dir).await,
            settings: Document::open(&dir, "settings").await,
            sync_meta: Document::open(&dir, "sync_meta").await,
            memory_blobs: Mutex::new(HashMap::new()),
            dir: Some(dir),
        };
        debug!(dir = ?store.dir, "Store opened");
        Ok(store)
    }

    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            modules: Family::in_memory(),
            progress: Family::in_memory(),
            media: Family::in_memory(),
            settings: Document::in_memory("settings"),
            sync_meta: Document::in_memory("sync_meta"),
            memory_blobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    // ===== Progress =====

    /// Save a progress record, replacing any prior value for its key.
    ///
    /// The stored copy is always `Pending`, stamped with the current time and
    /// the next revision for the key.
    pub async fn save_progress(&self, record: ProgressRecord) -> Result<ProgressRecord, StoreError> {
        let key = record.key.clone();
        self.progress
            .upsert(key, move |previous| {
                let mut next = record;
                next.sync_status = SyncStatus::Pending;
                next.last_modified = Utc::now();
                next.revision = previous.map(|p| p.revision + 1).unwrap_or(1);
                next
            })
            .await
    }

    // ===== Media =====

    /// Persist media bytes and their record. The blob lands before the record.
    pub async fn put_media(&self, asset: MediaAsset, bytes: &[u8]) -> Result<(), StoreError> {
        match &self.dir {
            Some(dir) => {
                let path = dir.join(MEDIA_DIR).join(asset.blob_name());
                tokio::fs::write(&path, bytes)
                    .await
                    .map_err(|source| StoreError::Io {
                        family: "media",
                        key: asset.url.clone(),
                        source,
                    })?;
            }
            None => {
                self.memory_blobs
                    .lock()
                    .await
                    .insert(asset.url.clone(), bytes.to_vec());
            }
        }
        self.media.put(asset).await
    }

    /// Read cached media bytes. `None` is a cache miss.
    pub async fn read_media(&self, url: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if self.media.get(&url.to_string()).await.is_none() {
            return Ok(None);
        }
        match &self.dir {
            Some(dir) => {
                let path = dir.join(MEDIA_DIR).join(blob_name(url));
                match tokio::fs::read(&path).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(source) => Err(StoreError::Io {
                        family: "media",
                        key: url.to_string(),
                        source,
                    }),
                }
            }
            None => Ok(self.memory_blobs.lock().await.get(url).cloned()),
        }
    }

    /// Remove a media record, then its blob.
    pub async fn delete_media(&self, url: &str) -> Result<Option<MediaAsset>, StoreError> {
        let removed = self.media.delete(&url.to_string()).await?;
        if removed.is_some() {
            self.remove_blob(url).await;
        }
        Ok(removed)
    }

    /// Remove every media record and blob.
    pub async fn clear_media(&self) -> Result<Vec<MediaAsset>, StoreError> {
        let removed = self.media.clear().await?;
        for asset in &removed {
            self.remove_blob(&asset.url).await;
        }
        Ok(removed)
    }

    async fn remove_blob(&self, url: &str) {
        match &self.dir {
            Some(dir) => {
                let path = dir.join(MEDIA_DIR).join(blob_name(url));
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(url = url, error = %e, "Failed to remove media blob");
                    }
                }
            }
            None => {
                self.memory_blobs.lock().await.remove(url);
            }
        }
    }

    // ===== Footprint =====

    /// Bytes the store occupies on disk (family files and blobs).
    pub async fn footprint(&self) -> u64 {
        let Some(dir) = &self.dir else {
            let blobs = self.memory_blobs.lock().await;
            return blobs.values().map(|b| b.len() as u64).sum();
        };
        let mut total = 0;
        for d in [dir.clone(), dir.join(MEDIA_DIR)] {
            let mut entries = match tokio::fs::read_dir(&d).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(dir = %d.display(), error = %e, "Skipping unreadable directory");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(meta) = entry.metadata().await {
                    if meta.is_file() {
                        total += meta.len();
                    }
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_progress_replaces_and_resets_status() {
        let store = Store::in_memory();
        let key = ProgressKey::new("m", "s", "u");

        let first = store
            .save_progress(ProgressRecord::new(key.clone(), 0.5).with_score(80.0))
            .await
            .expect("save");
        assert_eq!(first.revision, 1);

        store
            .progress
            .update(&key, |r| {
                r.sync_status = SyncStatus::Synced;
                true
            })
            .await
            .expect("mark synced");

        let second = store
            .save_progress(ProgressRecord::new(key.clone(), 0.9))
            .await
            .expect("save");
        assert_eq!(second.revision, 2);
        assert_eq!(second.sync_status, SyncStatus::Pending);
        assert_eq!(second.score, None);
        assert!(second.last_modified >= first.last_modified);
        assert_eq!(store.progress.get(&key).await, Some(second));
    }

    #[tokio::test]
    async fn test_media_blobs_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).await.expect("open");
        let asset = MediaAsset::new("https://cdn/a.png", 3);
        store.put_media(asset.clone(), b"abc").await.expect("put media");

        assert_eq!(
            store.read_media("https://cdn/a.png").await.expect("read"),
            Some(b"abc".to_vec())
        );
        assert!(store.footprint().await >= 3);

        store.delete_media("https://cdn/a.png").await.expect("delete");
        assert_eq!(store.read_media("https://cdn/a.png").await.expect("read"), None);
        assert!(!dir.path().join(MEDIA_DIR).join(asset.blob_name()).exists());
    }

    #[tokio::test]
    async fn test_clear_media_in_memory() {
        let store = Store::in_memory();
        store
            .put_media(MediaAsset::new("u1", 1), b"a")
            .await
            .expect("put");
        store
            .put_media(MediaAsset::new("u2", 2), b"bb")
            .await
            .expect("put");
        let removed = store.clear_media().await.expect("clear");
        assert_eq!(removed.len(), 2);
        assert_eq!(store.read_media("u1").await.expect("read"), None);
        assert_eq!(store.footprint().await, 0);
    }

    #[tokio::test]
    async fn test_settings_persist_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = Store::open(dir.path()).await.expect("open");
            let mut settings = store.settings.get().await;
            settings.download_on_cellular = true;
            store.settings.put(settings).await.expect("put settings");
        }
        let store = Store::open(dir.path()).await.expect("reopen");
        assert!(store.settings.get().await.download_on_cellular);
    }
}
