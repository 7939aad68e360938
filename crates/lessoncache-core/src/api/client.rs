//! REST client for the remote authority.
//!
//! `ApiClient` pushes progress batches and reads the module catalog.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::RemoteError;
use crate::models::{CachedModule, Priority, ProgressRecord, Section};
use crate::sync::{PushOutcome, RemoteAuthority};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// One entry of the remote catalog, metadata only.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogEntry {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    priority: Priority,
    size_estimate: u64,
    #[serde(default)]
    sections: Vec<Section>,
}

impl CatalogEntry {
    fn into_module(self) -> CachedModule {
        let mut module = CachedModule::new(self.id, self.size_estimate, self.sections);
        module.title = self.title;
        module.priority = self.priority;
        module
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressBatch<'a> {
    records: &'a [ProgressRecord],
}

/// Client for the remote authority.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, RemoteError> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = self.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| RemoteError::MalformedToken)?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, RemoteError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_status(status, &url, &body))
        }
    }

    async fn send_with_retry(
        &self,
        request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RemoteError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = request().headers(self.auth_headers()?).send().await?;
            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(RemoteError::Throttled {
                            retries: MAX_RATE_LIMIT_RETRIES,
                        });
                    }
                    warn!(retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let url = self.url(path);
        let response = self.send_with_retry(|| self.client.get(&url)).await?;
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::InvalidResponse(format!("Failed to parse {}: {}", url, e)))
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<String, RemoteError> {
        let url = self.url(path);
        let response = self
            .send_with_retry(|| self.client.post(&url).json(body))
            .await?;
        Ok(response.text().await?)
    }
}

/// Parse a push response; an empty body means the whole batch was accepted.
fn parse_push_outcome(body: &str) -> Result<PushOutcome, RemoteError> {
    if body.trim().is_empty() {
        return Ok(PushOutcome::accepted());
    }
    serde_json::from_str(body)
        .map_err(|e| RemoteError::InvalidResponse(format!("Failed to parse push outcome: {}", e)))
}

fn parse_catalog(entries: Vec<CatalogEntry>) -> Vec<CachedModule> {
    entries.into_iter().map(CatalogEntry::into_module).collect()
}

#[async_trait]
impl RemoteAuthority for ApiClient {
    async fn push_progress(&self, records: &[ProgressRecord]) -> Result<PushOutcome, RemoteError> {
        debug!(records = records.len(), "Pushing progress batch");
        let body = self.post("progress", &ProgressBatch { records }).await?;
        parse_push_outcome(&body)
    }

    async fn fetch_catalog(&self) -> Result<Vec<CachedModule>, RemoteError> {
        let entries: Vec<CatalogEntry> = self.get("modules").await?;
        debug!(modules = entries.len(), "Fetched catalog");
        Ok(parse_catalog(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DownloadState, ProgressKey, SectionKind};

    #[test]
    fn test_catalog_entries_become_metadata_only_modules() {
        let json = r#"[
            {"id": "m1", "title": "Fractions", "priority": "high", "sizeEstimate": 2048,
             "sections": [{"id": "s1", "type": "video", "content": "", "mediaUrls": ["https://cdn/a.mp4"]}]},
            {"id": "m2", "sizeEstimate": 10}
        ]"#;
        let entries: Vec<CatalogEntry> = serde_json::from_str(json).expect("parse");
        let modules = parse_catalog(entries);

        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].title, "Fractions");
        assert_eq!(modules[0].priority, Priority::High);
        assert_eq!(modules[0].sections[0].kind, SectionKind::Video);
        assert_eq!(modules[0].state, DownloadState::NotDownloaded);
        assert_eq!(modules[0].downloaded_size, 0);
        assert_eq!(modules[1].priority, Priority::Medium);
        assert!(modules[1].sections.is_empty());
    }

    #[test]
    fn test_empty_push_body_is_full_acceptance() {
        assert_eq!(parse_push_outcome("").expect("parse"), PushOutcome::accepted());
        assert_eq!(parse_push_outcome("  \n").expect("parse"), PushOutcome::accepted());
    }

    #[test]
    fn test_push_outcome_lists_rejected_keys() {
        let body = r#"{"rejected": [{"moduleId": "m1", "sectionId": "s1", "userId": "u1"}]}"#;
        let outcome = parse_push_outcome(body).expect("parse");
        assert_eq!(outcome.rejected, vec![ProgressKey::new("m1", "s1", "u1")]);
        assert!(outcome.superseded.is_empty());
    }

    #[test]
    fn test_malformed_push_body() {
        let err = parse_push_outcome("<html>").unwrap_err();
        assert!(matches!(err, RemoteError::InvalidResponse(_)));
    }

    #[test]
    fn test_url_joining() {
        let client = ApiClient::new("https://lessons.example/api/").expect("client");
        assert_eq!(client.base_url(), "https://lessons.example/api");
        assert_eq!(client.url("/modules"), "https://lessons.example/api/modules");
        assert_eq!(client.url("progress"), "https://lessons.example/api/progress");
    }
}
