//! Cached learning modules and their sections.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::SyncStatus;

/// Download priority tag assigned by the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    #[default]
    Text,
    Video,
    Audio,
    Image,
    Quiz,
    Interactive,
}

/// Smallest addressable content fragment within a module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: SectionKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    #[default]
    NotDownloaded,
    Downloading,
    Downloaded,
}

/// A downloadable content unit.
///
/// `downloaded_size` never exceeds `size_estimate`; the progress helpers
/// below are the only code that moves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedModule {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub priority: Priority,
    pub size_estimate: u64,
    #[serde(default)]
    pub downloaded_size: u64,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub state: DownloadState,
    #[serde(default)]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub sync_status: SyncStatus,
}

impl CachedModule {
    /// Catalog metadata for a module that has not been downloaded yet.
    pub fn new(id: impl Into<String>, size_estimate: u64, sections: Vec<Section>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            priority: Priority::default(),
            size_estimate,
            downloaded_size: 0,
            sections,
            state: DownloadState::NotDownloaded,
            downloaded_at: None,
            expires_at: None,
            is_pinned: false,
            sync_status: SyncStatus::Synced,
        }
    }

    pub fn is_downloaded(&self) -> bool {
        self.state == DownloadState::Downloaded
    }

    pub fn is_downloading(&self) -> bool {
        self.state == DownloadState::Downloading
    }

    /// Whether this module currently holds references to cached media.
    pub fn holds_media(&self) -> bool {
        matches!(self.state, DownloadState::Downloading | DownloadState::Downloaded)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|expires| now > expires).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// All media URLs referenced by this module's sections, in section order.
    pub fn media_urls(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .flat_map(|s| s.media_urls.iter().map(String::as_str))
    }

    /// Fraction downloaded, 0.0 to 1.0.
    pub fn download_fraction(&self) -> f64 {
        if self.size_estimate == 0 {
            return if self.is_downloaded() { 1.0 } else { 0.0 };
        }
        self.downloaded_size as f64 / self.size_estimate as f64
    }

    pub(crate) fn begin_download(&mut self) {
        self.state = DownloadState::Downloading;
        self.downloaded_size = 0;
        self.downloaded_at = None;
        self.expires_at = None;
    }

    /// Apply a progress report. Never moves backwards, never passes the estimate.
    pub(crate) fn record_progress(&mut self, downloaded: u64) -> u64 {
        let clamped = downloaded.min(self.size_estimate);
        if clamped > self.downloaded_size {
            self.downloaded_size = clamped;
        }
        self.downloaded_size
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>, expiration_days: u32) {
        self.state = DownloadState::Downloaded;
        self.downloaded_size = self.size_estimate;
        self.downloaded_at = Some(now);
        // Out-of-range TTLs leave the module without an expiry.
        self.expires_at = Duration::try_days(i64::from(expiration_days))
            .and_then(|ttl| now.checked_add_signed(ttl));
    }

    pub(crate) fn reset_download(&mut self) {
        self.state = DownloadState::NotDownloaded;
        self.downloaded_size = 0;
        self.downloaded_at = None;
        self.expires_at = None;
    }

    /// Merge fresh catalog metadata into a locally known module,
    /// keeping local download state and pin.
    pub(crate) fn merge_catalog(&mut self, remote: CachedModule) {
        self.title = remote.title;
        self.priority = remote.priority;
        if !self.holds_media() {
            self.size_estimate = remote.size_estimate;
            self.sections = remote.sections;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(size: u64) -> CachedModule {
        CachedModule::new(
            "intro",
            size,
            vec![
                Section {
                    id: "s1".into(),
                    kind: SectionKind::Video,
                    content: String::new(),
                    media_urls: vec!["https://cdn/a.mp4".into()],
                },
                Section {
                    id: "s2".into(),
                    kind: SectionKind::Text,
                    content: "hello".into(),
                    media_urls: vec!["https://cdn/b.png".into(), "https://cdn/a.mp4".into()],
                },
            ],
        )
    }

    #[test]
    fn test_progress_is_clamped_and_monotonic() {
        let mut m = module(100);
        m.begin_download();
        assert_eq!(m.record_progress(40), 40);
        assert_eq!(m.record_progress(30), 40);
        assert_eq!(m.record_progress(500), 100);
        assert!(m.downloaded_size <= m.size_estimate);
    }

    #[test]
    fn test_complete_sets_expiry_exactly() {
        let mut m = module(100);
        m.begin_download();
        let now = Utc::now();
        m.complete(now, 7);
        assert!(m.is_downloaded());
        assert_eq!(m.downloaded_size, 100);
        assert_eq!(m.downloaded_at, Some(now));
        assert_eq!(m.expires_at.unwrap() - now, Duration::seconds(7 * 86_400));
    }

    #[test]
    fn test_complete_with_huge_ttl_does_not_panic() {
        let mut m = module(10);
        m.begin_download();
        m.complete(Utc::now(), u32::MAX);
        assert!(m.is_downloaded());
        assert!(m.expires_at.is_none());
    }

    #[test]
    fn test_expiry() {
        let mut m = module(10);
        assert!(!m.is_expired());
        let now = Utc::now();
        m.complete(now - Duration::days(31), 30);
        assert!(m.is_expired_at(now));
        assert!(!m.is_expired_at(now - Duration::days(2)));
    }

    #[test]
    fn test_reset_download() {
        let mut m = module(10);
        m.begin_download();
        m.record_progress(5);
        m.reset_download();
        assert_eq!(m.state, DownloadState::NotDownloaded);
        assert_eq!(m.downloaded_size, 0);
        assert!(m.downloaded_at.is_none());
    }

    #[test]
    fn test_media_urls_in_section_order() {
        let m = module(10);
        let urls: Vec<&str> = m.media_urls().collect();
        assert_eq!(urls, vec!["https://cdn/a.mp4", "https://cdn/b.png", "https://cdn/a.mp4"]);
    }

    #[test]
    fn test_parse_catalog_entry() {
        let json = r#"{"id":"safety-101","title":"Safety","priority":"critical","sizeEstimate":2048,"sections":[{"id":"s1","type":"quiz","content":"Q1","mediaUrls":[]}]}"#;
        let m: CachedModule = serde_json::from_str(json).expect("Failed to parse catalog test JSON");
        assert_eq!(m.priority, Priority::Critical);
        assert_eq!(m.state, DownloadState::NotDownloaded);
        assert_eq!(m.sections[0].kind, SectionKind::Quiz);
        assert!(!m.is_pinned);
    }
}
