//! Expiration sweep and media reclamation.
//!
//! Module records are always deleted before media references are counted, so
//! no remaining module can point at media that is about to go away.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::models::StorageSnapshot;
use crate::store::Store;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub modules_removed: Vec<String>,
    pub media_removed: usize,
    pub bytes_reclaimed: u64,
    /// Per-record failures; they do not stop the sweep.
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.modules_removed.is_empty() && self.media_removed == 0
    }
}

#[derive(Clone)]
pub struct Sweeper {
    store: Arc<Store>,
    events: EventBus,
}

impl Sweeper {
    pub fn new(store: Arc<Store>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Delete expired, unpinned modules, then every media asset no remaining
    /// module references.
    pub async fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let expired = self
            .store
            .modules
            .get_all(|m| m.is_expired_at(now) && !m.is_pinned)
            .await;

        let mut report = SweepReport::default();
        for module in expired {
            match self.store.modules.delete(&module.id).await {
                Ok(Some(m)) => {
                    report.bytes_reclaimed += m.downloaded_size;
                    report.modules_removed.push(m.id);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(module_id = %module.id, error = %e, "Failed to delete expired module");
                    report.errors.push(e.to_string());
                }
            }
        }

        // Also catches media left behind by failed or reverted downloads.
        let cached: HashSet<String> = self
            .store
            .media
            .get_all(|_| true)
            .await
            .into_iter()
            .map(|asset| asset.url)
            .collect();
        self.release_media(cached, &mut report).await;

        if report.is_empty() {
            debug!("Sweep found nothing to reclaim");
            return report;
        }
        info!(
            modules = report.modules_removed.len(),
            media = report.media_removed,
            bytes = report.bytes_reclaimed,
            "Sweep complete"
        );
        if !report.modules_removed.is_empty() {
            self.events.emit(EngineEvent::ModulesChanged);
        }
        if report.media_removed > 0 {
            self.events.emit(EngineEvent::MediaChanged);
        }
        report
    }

    /// Sweep only if the engine's footprint is over the soft ceiling.
    pub async fn maintain(&self, snapshot: &StorageSnapshot) -> Option<SweepReport> {
        if !snapshot.over_ceiling() {
            return None;
        }
        info!(
            used = snapshot.engine_bytes(),
            ceiling = snapshot.max_storage_size,
            "Storage ceiling exceeded, sweeping"
        );
        Some(self.sweep().await)
    }

    /// Delete one module record and release its media.
    pub async fn remove_module(&self, module_id: &str) -> Result<Option<SweepReport>> {
        let Some(module) = self.store.modules.delete(&module_id.to_string()).await? else {
            return Ok(None);
        };
        let mut report = SweepReport {
            bytes_reclaimed: module.downloaded_size,
            modules_removed: vec![module.id.clone()],
            ..Default::default()
        };
        let candidates = module.media_urls().map(str::to_string).collect();
        self.release_media(candidates, &mut report).await;
        info!(module_id = module_id, media = report.media_removed, "Module removed");
        self.events.emit(EngineEvent::ModulesChanged);
        if report.media_removed > 0 {
            self.events.emit(EngineEvent::MediaChanged);
        }
        Ok(Some(report))
    }

    /// Remove every cached media asset, referenced or not.
    pub async fn clear_cache(&self) -> Result<SweepReport> {
        let removed = self.store.clear_media().await?;
        let report = SweepReport {
            media_removed: removed.len(),
            bytes_reclaimed: removed.iter().map(|a| a.size).sum(),
            ..Default::default()
        };
        info!(media = report.media_removed, bytes = report.bytes_reclaimed, "Media cache cleared");
        self.events.emit(EngineEvent::MediaChanged);
        Ok(report)
    }

    /// Delete each candidate media URL that no remaining module references.
    async fn release_media(&self, candidates: HashSet<String>, report: &mut SweepReport) {
        if candidates.is_empty() {
            return;
        }

        let still_referenced: HashSet<String> = self
            .store
            .modules
            .get_all(|m| m.holds_media())
            .await
            .iter()
            .flat_map(|m| m.media_urls().map(str::to_string))
            .collect();

        for url in candidates {
            if still_referenced.contains(&url) {
                continue;
            }
            match self.store.delete_media(&url).await {
                Ok(Some(asset)) => {
                    report.media_removed += 1;
                    report.bytes_reclaimed += asset.size;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to delete orphaned media");
                    report.errors.push(e.to_string());
                }
            }
        }
    }
}
