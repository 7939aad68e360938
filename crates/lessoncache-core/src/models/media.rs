use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cached binary resource, keyed by its URL.
///
/// Owned collectively by every module whose sections reference the URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAsset {
    pub url: String,
    pub size: u64,
    pub cached_at: DateTime<Utc>,
}

impl MediaAsset {
    pub fn new(url: impl Into<String>, size: u64) -> Self {
        Self {
            url: url.into(),
            size,
            cached_at: Utc::now(),
        }
    }

    /// Blob file name for this asset: BLAKE3 of the URL, hex encoded.
    pub fn blob_name(&self) -> String {
        blob_name(&self.url)
    }
}

pub(crate) fn blob_name(url: &str) -> String {
    format!("{}.bin", blake3::hash(url.as_bytes()).to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_name_is_stable_and_distinct() {
        let a = MediaAsset::new("https://cdn/a.mp4", 10);
        let b = MediaAsset::new("https://cdn/b.mp4", 10);
        assert_eq!(a.blob_name(), blob_name("https://cdn/a.mp4"));
        assert_ne!(a.blob_name(), b.blob_name());
        assert!(a.blob_name().ends_with(".bin"));
        assert_eq!(a.blob_name().len(), 64 + 4);
    }
}
