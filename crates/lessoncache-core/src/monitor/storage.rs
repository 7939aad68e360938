//! Device storage accounting.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::StorageSnapshot;
use crate::store::Store;

/// What the platform reports about device storage, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    pub quota: u64,
    pub usage: u64,
}

impl Quota {
    pub fn available(&self) -> u64 {
        self.quota.saturating_sub(self.usage)
    }
}

/// Platform storage-quota facility.
#[async_trait]
pub trait QuotaProvider: Send + Sync {
    async fn estimate(&self) -> Result<Quota>;
}

/// A quota with fixed numbers, for tests and embedders that already know them.
#[derive(Debug, Clone, Copy)]
pub struct FixedQuota(pub Quota);

impl FixedQuota {
    pub fn new(quota: u64, usage: u64) -> Self {
        Self(Quota { quota, usage })
    }
}

#[async_trait]
impl QuotaProvider for FixedQuota {
    async fn estimate(&self) -> Result<Quota> {
        Ok(self.0)
    }
}

/// A configured capacity for the data directory; usage is what the store
/// currently occupies on disk.
pub struct DirectoryQuota {
    capacity: u64,
    store: Arc<Store>,
}

impl DirectoryQuota {
    pub fn new(capacity: u64, store: Arc<Store>) -> Self {
        Self { capacity, store }
    }
}

#[async_trait]
impl QuotaProvider for DirectoryQuota {
    async fn estimate(&self) -> Result<Quota> {
        if self.capacity == 0 {
            return Err(Error::Quota("storage capacity is not configured".to_string()));
        }
        Ok(Quota {
            quota: self.capacity,
            usage: self.store.footprint().await,
        })
    }
}

/// Combines the platform quota with the engine's own footprint.
#[derive(Clone)]
pub struct StorageMonitor {
    quota: Arc<dyn QuotaProvider>,
}

impl StorageMonitor {
    pub fn new(quota: Arc<dyn QuotaProvider>) -> Self {
        Self { quota }
    }

    pub async fn snapshot(&self, store: &Store) -> Result<StorageSnapshot> {
        let quota = self.quota.estimate().await?;
        let module_bytes = store
            .modules
            .get_all(|m| m.is_downloaded())
            .await
            .iter()
            .map(|m| m.downloaded_size)
            .sum();
        let media_bytes = store
            .media
            .get_all(|_| true)
            .await
            .iter()
            .map(|a| a.size)
            .sum();
        let settings = store.settings.get().await;

        Ok(StorageSnapshot {
            total: quota.quota,
            used: quota.usage,
            available: quota.available(),
            module_bytes,
            media_bytes,
            max_storage_size: settings.max_storage_size,
        })
    }
}
