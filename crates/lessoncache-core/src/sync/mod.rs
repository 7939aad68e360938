//! Progress synchronization with the remote authority.
//!
//! One cycle pushes every `Pending` or `Failed` record in a single batch.
//! A transport failure leaves every record as it was; a success marks exactly
//! the records that were sent, unless they were rewritten while the batch was
//! in flight.
//!
//! Conflicts: when the remote answers with its own copy of a record, the copy
//! with the later `last_modified` wins. A newer remote copy replaces ours and
//! is `Synced`; an older one is ignored and our record goes out again next cycle.

pub mod remote;
pub mod scheduler;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::models::{ProgressKey, ProgressRecord, SyncStatus};
use crate::store::{Store, SyncMeta};

pub use remote::{PushOutcome, RemoteAuthority};
pub use scheduler::SyncScheduler;

/// Result of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Records sent to the remote.
    pub pushed: usize,
    pub synced: usize,
    pub failed: usize,
    /// Local records replaced by a newer remote copy.
    pub adopted: usize,
    /// Records left pending because they changed while the batch was in flight.
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    /// Completed cycles, including empty ones.
    pub cycles: u64,
    pub records_synced: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<Store>,
    remote: Arc<dyn RemoteAuthority>,
    events: EventBus,
    /// Serializes cycles; held for the whole of `sync_now`.
    cycle: Mutex<()>,
    stats: Mutex<SyncStats>,
}

impl SyncManager {
    pub async fn new(store: Arc<Store>, remote: Arc<dyn RemoteAuthority>, events: EventBus) -> Self {
        let meta = store.sync_meta.get().await;
        let stats = SyncStats {
            last_sync_at: meta.last_sync_at,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                events,
                cycle: Mutex::new(()),
                stats: Mutex::new(stats),
            }),
        }
    }

    pub async fn stats(&self) -> SyncStats {
        self.inner.stats.lock().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner
            .store
            .progress
            .get_all(|r| r.sync_status.needs_sync())
            .await
            .len()
    }

    /// Run one sync cycle.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let inner = &self.inner;
        let _cycle = inner.cycle.lock().await;

        let batch = inner
            .store
            .progress
            .get_all(|r| r.sync_status.needs_sync())
            .await;
        if batch.is_empty() {
            debug!("Nothing to sync");
            self.record_success(0).await?;
            return Ok(SyncReport::default());
        }

        info!(records = batch.len(), "Sync cycle started");
        inner.events.emit(EngineEvent::SyncStarted {
            records: batch.len(),
        });

        let outcome = match inner.remote.push_progress(&batch).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, records = batch.len(), "Sync push failed, records left unchanged");
                self.record_failure(e.to_string()).await;
                inner.events.emit(EngineEvent::SyncFailed {
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let report = match self.apply_outcome(&batch, outcome).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Failed to record sync results");
                self.record_failure(e.to_string()).await;
                inner.events.emit(EngineEvent::SyncFailed {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        self.record_success(report.synced + report.adopted).await?;

        info!(
            synced = report.synced,
            failed = report.failed,
            adopted = report.adopted,
            skipped = report.skipped,
            "Sync cycle finished"
        );
        inner.events.emit(EngineEvent::SyncFinished {
            synced: report.synced + report.adopted,
            failed: report.failed,
        });
        Ok(report)
    }

    async fn apply_outcome(&self, batch: &[ProgressRecord], outcome: PushOutcome) -> Result<SyncReport> {
        let sent: HashMap<&ProgressKey, u64> = batch.iter().map(|r| (&r.key, r.revision)).collect();
        let rejected: HashSet<ProgressKey> = outcome.rejected.into_iter().collect();
        let superseded: HashMap<ProgressKey, ProgressRecord> = outcome
            .superseded
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();

        let mut report = SyncReport {
            pushed: batch.len(),
            ..Default::default()
        };
        self.inner
            .store
            .progress
            .update_all(|record| {
                let Some(revision) = sent.get(&record.key) else {
                    return false;
                };
                if record.revision != *revision {
                    report.skipped += 1;
                    return false;
                }
                if let Some(theirs) = superseded.get(&record.key) {
                    if theirs.last_modified > record.last_modified {
                        let revision = record.revision;
                        *record = theirs.clone();
                        record.revision = revision;
                        record.sync_status = SyncStatus::Synced;
                        report.adopted += 1;
                        return true;
                    }
                    return false;
                }
                record.sync_status = if rejected.contains(&record.key) {
                    report.failed += 1;
                    SyncStatus::Failed
                } else {
                    report.synced += 1;
                    SyncStatus::Synced
                };
                true
            })
            .await?;

        Ok(report)
    }

    async fn record_success(&self, synced: usize) -> Result<()> {
        let now = Utc::now();
        self.inner
            .store
            .sync_meta
            .put(SyncMeta {
                last_sync_at: Some(now),
            })
            .await?;
        let mut stats = self.inner.stats.lock().await;
        stats.cycles += 1;
        stats.records_synced += synced as u64;
        stats.last_sync_at = Some(now);
        stats.last_error = None;
        stats.consecutive_failures = 0;
        Ok(())
    }

    async fn record_failure(&self, message: String) {
        let mut stats = self.inner.stats.lock().await;
        stats.last_error = Some(message);
        stats.consecutive_failures += 1;
    }
}
