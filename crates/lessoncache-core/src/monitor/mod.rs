//! Network and storage monitors that feed admission decisions.

pub mod network;
pub mod storage;

pub use network::{
    BandwidthClass, ConnectionType, ConnectivityProbe, NetworkMonitor, NetworkQuality,
    NetworkStatus,
};
pub use storage::{DirectoryQuota, FixedQuota, Quota, QuotaProvider, StorageMonitor};
