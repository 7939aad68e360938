//! Error types for the offline engine.
//!
//! Each concern gets its own enum so callers can tell an admission rejection
//! ("connect to Wi-Fi") apart from a storage failure ("free up space").
//! Every error exposes a stable `kind()` code for presentation layers.

use thiserror::Error;

pub use crate::api::RemoteError;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a download request is refused before any transfer starts.
///
/// Admission errors are never retried automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Module {0} is already downloaded")]
    AlreadyDownloaded(String),

    #[error("Not enough storage: {required} bytes required, {available} available")]
    InsufficientStorage { required: u64, available: u64 },

    #[error("Device is offline")]
    OfflineUnavailable,

    #[error("Downloads over cellular are disabled")]
    CellularRestricted,

    #[error("Downloads over Wi-Fi are disabled")]
    WifiRestricted,

    #[error("Storage ceiling of {ceiling} bytes would be exceeded")]
    StorageCeilingExceeded { ceiling: u64 },
}

impl AdmissionError {
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionError::UnknownModule(_) => "unknown_module",
            AdmissionError::AlreadyDownloaded(_) => "already_downloaded",
            AdmissionError::InsufficientStorage { .. } => "insufficient_storage",
            AdmissionError::OfflineUnavailable => "offline_unavailable",
            AdmissionError::CellularRestricted => "cellular_restricted",
            AdmissionError::WifiRestricted => "wifi_restricted",
            AdmissionError::StorageCeilingExceeded { .. } => "storage_ceiling_exceeded",
        }
    }
}

/// Failures raised by a transfer mechanism while fetching module content.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Transfer network error: {0}")]
    Network(String),

    #[error("Transfer failed with status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Transfer I/O error: {0}")]
    Io(String),
}

/// Failures of the persistent store. Always scoped to one family and key.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error writing {family} record {key}: {source}")]
    Io {
        family: &'static str,
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode {family} records: {source}")]
    Serialize {
        family: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Corrupt {family} file: {source}")]
    Corrupt {
        family: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{family} record not found: {key}")]
    NotFound { family: &'static str, key: String },
}

/// A progress write that cannot be stored as given.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProgressError {
    #[error("Progress {field} must be a finite number, got {value}")]
    NotFinite { field: &'static str, value: f32 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level engine error.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error("Storage quota unavailable: {0}")]
    Quota(String),

    #[error("Engine is shut down")]
    Shutdown,
}

impl Error {
    /// Stable machine-readable code for the error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Admission(e) => e.kind(),
            Error::Transfer(TransferError::Cancelled) => "transfer_cancelled",
            Error::Transfer(_) => "transfer_failed",
            Error::Remote(_) => "sync_transport",
            Error::Store(StoreError::NotFound { .. }) => "not_found",
            Error::Store(_) => "storage_io",
            Error::Settings(_) => "invalid_settings",
            Error::Progress(_) => "invalid_progress",
            Error::Quota(_) => "quota_unavailable",
            Error::Shutdown => "shutdown",
        }
    }

    /// Returns `true` if the engine itself will try again later.
    ///
    /// Only sync transport failures are retried automatically (on the next
    /// cycle). Everything else needs a caller or user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Remote(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_kinds_are_distinct() {
        let kinds = [
            AdmissionError::UnknownModule("m".into()).kind(),
            AdmissionError::AlreadyDownloaded("m".into()).kind(),
            AdmissionError::InsufficientStorage { required: 2, available: 1 }.kind(),
            AdmissionError::OfflineUnavailable.kind(),
            AdmissionError::CellularRestricted.kind(),
            AdmissionError::WifiRestricted.kind(),
            AdmissionError::StorageCeilingExceeded { ceiling: 1 }.kind(),
        ];
        let mut unique = kinds.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), kinds.len());
    }

    #[test]
    fn test_error_kind_passthrough() {
        let err: Error = AdmissionError::CellularRestricted.into();
        assert_eq!(err.kind(), "cellular_restricted");
        assert!(!err.is_retryable());

        let err: Error = TransferError::Cancelled.into();
        assert_eq!(err.kind(), "transfer_cancelled");
    }

    #[test]
    fn test_progress_error_kind() {
        let err: Error = ProgressError::NotFinite {
            field: "completion",
            value: f32::NAN,
        }
        .into();
        assert_eq!(err.kind(), "invalid_progress");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_remote_errors_are_retryable() {
        let err: Error = RemoteError::Server {
            status: 503,
            body: "boom".into(),
        }.into();
        assert_eq!(err.kind(), "sync_transport");
        assert!(err.is_retryable());
    }
}
