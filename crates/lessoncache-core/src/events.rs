//! Change notifications for callers.
//!
//! Every component publishes on one broadcast channel; a presentation layer
//! subscribes once and refreshes whichever list the event names.

use tokio::sync::broadcast;
use tracing::trace;

use crate::models::ProgressKey;
use crate::monitor::NetworkStatus;

/// Buffer size for the event channel.
/// Slow subscribers that fall further behind than this see `Lagged` and should re-read state.
const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The module list changed (catalog load, removal, sweep, state change).
    ModulesChanged,
    DownloadProgress {
        module_id: String,
        downloaded: u64,
        total: u64,
    },
    DownloadCompleted {
        module_id: String,
    },
    DownloadFailed {
        module_id: String,
        kind: &'static str,
        message: String,
    },
    DownloadCancelled {
        module_id: String,
    },
    ProgressChanged {
        key: ProgressKey,
    },
    /// Cached media was removed.
    MediaChanged,
    NetworkChanged(NetworkStatus),
    SyncStarted {
        records: usize,
    },
    SyncFinished {
        synced: usize,
        failed: usize,
    },
    SyncFailed {
        message: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event dropped - no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::ModulesChanged);

        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::MediaChanged);
        assert_eq!(rx.recv().await.expect("event"), EngineEvent::MediaChanged);
    }
}
