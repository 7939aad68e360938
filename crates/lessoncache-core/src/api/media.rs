//! HTTP media transfer and connectivity probe.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::Client;
use tracing::debug;

use super::client::REQUEST_TIMEOUT_SECS;
use crate::download::{FetchedMedia, ProgressSink, Transfer};
use crate::error::TransferError;
use crate::models::CachedModule;
use crate::monitor::{ConnectionType, ConnectivityProbe, NetworkStatus};

/// Media URLs of one module fetched in parallel.
const MEDIA_FETCH_CONCURRENCY: usize = 4;

/// Probe timeout; a slower answer counts as offline.
const PROBE_TIMEOUT_SECS: u64 = 5;

/// Streams media over HTTP, reporting every chunk as it arrives.
#[derive(Clone)]
pub struct HttpTransfer {
    client: Client,
}

impl HttpTransfer {
    pub fn new() -> Result<Self, TransferError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS * 10))
            .build()
            .map_err(|e| TransferError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    async fn fetch_one(&self, url: &str, progress: &ProgressSink) -> Result<FetchedMedia, TransferError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransferError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let mut bytes = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?
        {
            progress.advance(chunk.len() as u64);
            bytes.extend_from_slice(&chunk);
        }
        debug!(url = url, bytes = bytes.len(), "Media fetched");
        Ok(FetchedMedia {
            url: url.to_string(),
            bytes,
        })
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn fetch(
        &self,
        module: &CachedModule,
        media_urls: &[String],
        progress: &ProgressSink,
    ) -> Result<Vec<FetchedMedia>, TransferError> {
        // Section text arrives with the catalog; only media needs fetching.
        progress.advance(module.sections.iter().map(|s| s.content.len() as u64).sum());
        stream::iter(media_urls.iter().cloned())
            .map(|url| async move { self.fetch_one(&url, progress).await })
            .buffer_unordered(MEDIA_FETCH_CONCURRENCY)
            .try_collect()
            .await
    }
}

/// Reports the device online if the remote answers a HEAD request.
pub struct HttpProbe {
    client: Client,
    url: String,
    connection_type: ConnectionType,
}

impl HttpProbe {
    /// `connection_type` is what an answering link is reported as; the
    /// platform link layer is not visible over HTTP.
    pub fn new(url: impl Into<String>, connection_type: ConnectionType) -> Result<Self, TransferError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .build()
            .map_err(|e| TransferError::Network(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            connection_type,
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> NetworkStatus {
        let started = Instant::now();
        match self.client.head(&self.url).send().await {
            // Any answer, even an error status, means the link is up.
            Ok(_) => {
                let rtt = started.elapsed().as_millis().min(u32::MAX as u128) as u32;
                NetworkStatus::online(self.connection_type).with_rtt(rtt)
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "Connectivity probe failed");
                NetworkStatus::offline()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_probe_reports_offline() {
        // Port 9 on loopback refuses connections on any sane test host.
        let probe = HttpProbe::new("http://127.0.0.1:9/", ConnectionType::Wifi).expect("probe");
        let status = probe.probe().await;
        assert!(!status.online);
    }

    #[tokio::test]
    async fn test_empty_media_list_fetches_nothing() {
        let transfer = HttpTransfer::new().expect("transfer");
        let module = CachedModule::new("m1", 0, Vec::new());
        let (sink, _rx) = ProgressSink::channel();
        let fetched = transfer.fetch(&module, &[], &sink).await.expect("fetch");
        assert!(fetched.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_media_fails_the_fetch() {
        let transfer = HttpTransfer::new().expect("transfer");
        let module = CachedModule::new("m1", 0, Vec::new());
        let (sink, _rx) = ProgressSink::channel();
        let urls = vec![
            "http://127.0.0.1:9/a.png".to_string(),
            "http://127.0.0.1:9/b.png".to_string(),
        ];
        let err = transfer.fetch(&module, &urls, &sink).await.unwrap_err();
        assert!(matches!(err, TransferError::Network(_)));
    }
}
