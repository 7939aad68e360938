//! The byte-moving side of a download.
//!
//! The download manager owns admission, queuing and progress accounting; a
//! `Transfer` implementation only fetches bytes and reports how many arrived.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransferError;
use crate::models::CachedModule;

/// Bytes fetched for one media URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    pub url: String,
    pub bytes: Vec<u8>,
}

/// Receives incremental byte counts from a transfer.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<u64>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report `bytes` more bytes received.
    pub fn advance(&self, bytes: u64) {
        if bytes > 0 {
            // Receiver gone means the download was abandoned; nothing to report to.
            let _ = self.tx.send(bytes);
        }
    }
}

#[async_trait]
pub trait Transfer: Send + Sync {
    /// Fetch module content and the given media URLs.
    ///
    /// `media_urls` excludes media that is already cached. Implementations call
    /// `progress.advance` as bytes arrive.
    async fn fetch(
        &self,
        module: &CachedModule,
        media_urls: &[String],
        progress: &ProgressSink,
    ) -> Result<Vec<FetchedMedia>, TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_skips_empty_reports() {
        let (sink, mut rx) = ProgressSink::channel();
        sink.advance(0);
        sink.advance(12);
        drop(sink);
        assert_eq!(rx.recv().await, Some(12));
        assert_eq!(rx.recv().await, None);
    }
}
