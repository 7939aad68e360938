//! Connectivity state and link quality.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Downlink above which a high-bandwidth link counts as excellent.
const EXCELLENT_DOWNLINK_MBPS: f64 = 10.0;

/// Downlink above which any link counts as good.
const GOOD_DOWNLINK_MBPS: f64 = 5.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    #[default]
    Unknown,
    None,
}

/// Coarse bandwidth class as reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthClass {
    High,
    Medium,
    Low,
    #[default]
    Unknown,
}

impl BandwidthClass {
    /// Map a platform "effective type" hint (`4g`, `3g`, `2g`, `slow-2g`).
    pub fn from_effective_type(effective_type: &str) -> Self {
        match effective_type.trim().to_ascii_lowercase().as_str() {
            "4g" | "5g" => BandwidthClass::High,
            "3g" => BandwidthClass::Medium,
            "2g" | "slow-2g" => BandwidthClass::Low,
            _ => BandwidthClass::Unknown,
        }
    }
}

/// Advisory link quality. Never blocks an operation by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    Offline,
    Poor,
    Fair,
    Good,
    Excellent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub online: bool,
    pub connection_type: ConnectionType,
    pub bandwidth: BandwidthClass,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<u32>,
    pub data_saver: bool,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::offline()
    }
}

impl NetworkStatus {
    pub fn offline() -> Self {
        Self {
            online: false,
            connection_type: ConnectionType::None,
            bandwidth: BandwidthClass::Unknown,
            downlink_mbps: None,
            rtt_ms: None,
            data_saver: false,
        }
    }

    pub fn online(connection_type: ConnectionType) -> Self {
        Self {
            online: true,
            connection_type,
            bandwidth: BandwidthClass::Unknown,
            downlink_mbps: None,
            rtt_ms: None,
            data_saver: false,
        }
    }

    pub fn with_bandwidth(mut self, bandwidth: BandwidthClass, downlink_mbps: Option<f64>) -> Self {
        self.bandwidth = bandwidth;
        self.downlink_mbps = downlink_mbps;
        self
    }

    pub fn with_rtt(mut self, rtt_ms: u32) -> Self {
        self.rtt_ms = Some(rtt_ms);
        self
    }

    pub fn quality(&self) -> NetworkQuality {
        if !self.online {
            return NetworkQuality::Offline;
        }
        let downlink = self.downlink_mbps.unwrap_or(0.0);
        match self.bandwidth {
            BandwidthClass::High if downlink > EXCELLENT_DOWNLINK_MBPS => NetworkQuality::Excellent,
            BandwidthClass::High => NetworkQuality::Good,
            _ if downlink > GOOD_DOWNLINK_MBPS => NetworkQuality::Good,
            BandwidthClass::Medium => NetworkQuality::Fair,
            _ => NetworkQuality::Poor,
        }
    }

    pub fn is_cellular(&self) -> bool {
        self.connection_type == ConnectionType::Cellular
    }

    /// Wi-Fi and wired links are governed by the same "download on Wi-Fi" switch.
    pub fn is_unmetered(&self) -> bool {
        matches!(self.connection_type, ConnectionType::Wifi | ConnectionType::Ethernet)
    }
}

/// Platform connectivity facility.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> NetworkStatus;
}

/// Holds the current network status and notifies subscribers on every change.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn status(&self) -> NetworkStatus {
        self.tx.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    pub fn quality(&self) -> NetworkQuality {
        self.tx.borrow().quality()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    /// Replace the status. Subscribers are only woken if a field changed.
    pub fn set_status(&self, status: NetworkStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if changed {
            info!(
                online = status.online,
                connection = ?status.connection_type,
                quality = ?status.quality(),
                "Network status changed"
            );
        }
        changed
    }

    pub fn set_online(&self, online: bool) -> bool {
        let mut status = self.status();
        if status.online == online {
            return false;
        }
        status.online = online;
        if !online {
            status.connection_type = ConnectionType::None;
        } else if status.connection_type == ConnectionType::None {
            status.connection_type = ConnectionType::Unknown;
        }
        self.set_status(status)
    }

    /// Poll a platform probe every `period` until `cancel` fires.
    pub fn spawn_probe(
        &self,
        probe: Arc<dyn ConnectivityProbe>,
        period: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Connectivity probe stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let status = probe.probe().await;
                        monitor.set_status(status);
                    }
                }
            }
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::offline())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_classification() {
        assert_eq!(NetworkStatus::offline().quality(), NetworkQuality::Offline);

        let high = NetworkStatus::online(ConnectionType::Wifi);
        assert_eq!(
            high.clone().with_bandwidth(BandwidthClass::High, Some(20.0)).quality(),
            NetworkQuality::Excellent
        );
        assert_eq!(
            high.clone().with_bandwidth(BandwidthClass::High, Some(2.0)).quality(),
            NetworkQuality::Good
        );
        assert_eq!(
            high.clone().with_bandwidth(BandwidthClass::Low, Some(6.0)).quality(),
            NetworkQuality::Good
        );
        assert_eq!(
            high.clone().with_bandwidth(BandwidthClass::Medium, Some(1.0)).quality(),
            NetworkQuality::Fair
        );
        assert_eq!(
            high.clone().with_bandwidth(BandwidthClass::Low, None).quality(),
            NetworkQuality::Poor
        );
        assert_eq!(high.quality(), NetworkQuality::Poor);
    }

    #[test]
    fn test_effective_type_mapping() {
        assert_eq!(BandwidthClass::from_effective_type("4g"), BandwidthClass::High);
        assert_eq!(BandwidthClass::from_effective_type("3G"), BandwidthClass::Medium);
        assert_eq!(BandwidthClass::from_effective_type("slow-2g"), BandwidthClass::Low);
        assert_eq!(BandwidthClass::from_effective_type(""), BandwidthClass::Unknown);
    }

    #[tokio::test]
    async fn test_notifies_only_on_change() {
        let monitor = NetworkMonitor::new(NetworkStatus::offline());
        let mut rx = monitor.subscribe();

        assert!(!monitor.set_status(NetworkStatus::offline()));
        assert!(!rx.has_changed().expect("sender alive"));

        assert!(monitor.set_online(true));
        assert!(rx.has_changed().expect("sender alive"));
        let status = rx.borrow_and_update().clone();
        assert!(status.online);
        assert_eq!(status.connection_type, ConnectionType::Unknown);

        let wifi = NetworkStatus::online(ConnectionType::Wifi).with_rtt(40);
        assert!(monitor.set_status(wifi.clone()));
        assert_eq!(monitor.status(), wifi);
        assert!(!monitor.set_online(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_feeds_monitor() {
        struct AlwaysWifi;

        #[async_trait]
        impl ConnectivityProbe for AlwaysWifi {
            async fn probe(&self) -> NetworkStatus {
                NetworkStatus::online(ConnectionType::Wifi)
            }
        }

        let monitor = NetworkMonitor::default();
        let cancel = CancellationToken::new();
        let handle = monitor.spawn_probe(Arc::new(AlwaysWifi), Duration::from_secs(5), cancel.clone());

        let mut rx = monitor.subscribe();
        rx.changed().await.expect("status change");
        assert!(monitor.is_online());

        cancel.cancel();
        handle.await.expect("probe task");
    }
}
