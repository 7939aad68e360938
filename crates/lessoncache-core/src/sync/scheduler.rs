//! Background sync timer and the debounced post-save trigger.
//!
//! At most one timer exists. `reschedule` cancels the current timer before it
//! creates the next one, under the same lock, so two timers never coexist.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SyncManager;
use crate::models::EngineSettings;

/// Delay between a progress save and the sync it triggers.
pub const DEBOUNCE_DELAY: Duration = Duration::from_secs(2);

/// Cap on ticks skipped after consecutive failures (exponential backoff).
const MAX_BACKOFF_SKIPPED_TICKS: u32 = 8;

struct Timer {
    period: Duration,
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

pub struct SyncScheduler {
    sync: SyncManager,
    timer: Mutex<Option<Timer>>,
    debounce: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl SyncScheduler {
    pub fn new(sync: SyncManager) -> Self {
        Self {
            sync,
            timer: Mutex::new(None),
            debounce: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Bring the timer in line with the settings and connectivity.
    ///
    /// The timer runs only while background sync is enabled and the device is
    /// online. An unchanged period keeps the running timer and its phase.
    pub async fn reschedule(&self, settings: &EngineSettings, online: bool) {
        let mut timer = self.timer.lock().await;
        let wanted = (settings.background_sync && online && !self.shutdown.is_cancelled())
            .then(|| settings.sync_interval());

        match (timer.as_ref(), wanted) {
            (Some(current), Some(period)) if current.period == period => return,
            (None, None) => return,
            _ => {}
        }

        if let Some(old) = timer.take() {
            old.cancel.cancel();
            debug!(period = ?old.period, "Sync timer stopped");
        }
        if let Some(period) = wanted {
            *timer = Some(self.spawn_timer(period));
            info!(period_secs = period.as_secs(), "Sync timer scheduled");
        }
    }

    pub async fn stop(&self) {
        if let Some(old) = self.timer.lock().await.take() {
            old.cancel.cancel();
            debug!("Sync timer stopped");
        }
        if let Some(pending) = self.debounce.lock().await.take() {
            pending.cancel();
        }
    }

    /// Stop all background activity for good.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stop().await;
    }

    pub async fn timer_period(&self) -> Option<Duration> {
        self.timer.lock().await.as_ref().map(|t| t.period)
    }

    /// Sync after `delay`, replacing any trigger that has not fired yet.
    pub async fn trigger_debounced(&self, delay: Duration) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let cancel = self.shutdown.child_token();
        if let Some(previous) = self.debounce.lock().await.replace(cancel.clone()) {
            previous.cancel();
        }

        let sync = self.sync.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = sync.sync_now().await {
                        warn!(error = %e, "Triggered sync failed");
                    }
                }
            }
        });
    }

    fn spawn_timer(&self, period: Duration) -> Timer {
        let cancel = self.shutdown.child_token();
        let sync = self.sync.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut skip: u32 = 0;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if skip > 0 {
                    skip -= 1;
                    debug!(remaining = skip, "Backing off scheduled sync");
                    continue;
                }
                // Runs to completion even if cancelled meanwhile; a cancelled
                // timer never ticks again.
                if let Err(e) = sync.sync_now().await {
                    let failures = sync.stats().await.consecutive_failures;
                    skip = backoff_ticks(failures);
                    warn!(error = %e, failures = failures, skip = skip, "Scheduled sync failed");
                }
            }
        });
        Timer {
            period,
            cancel,
            _handle: handle,
        }
    }
}

/// Ticks to skip after `failures` consecutive failures: 0, 1, 3, 7, then capped.
fn backoff_ticks(failures: u32) -> u32 {
    if failures <= 1 {
        return 0;
    }
    let exponent = (failures - 1).min(4);
    ((1u32 << exponent) - 1).min(MAX_BACKOFF_SKIPPED_TICKS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_ticks() {
        assert_eq!(backoff_ticks(0), 0);
        assert_eq!(backoff_ticks(1), 0);
        assert_eq!(backoff_ticks(2), 1);
        assert_eq!(backoff_ticks(3), 3);
        assert_eq!(backoff_ticks(4), 7);
        assert_eq!(backoff_ticks(5), 8);
        assert_eq!(backoff_ticks(50), 8);
    }
}
