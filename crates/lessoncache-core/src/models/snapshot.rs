use serde::{Deserialize, Serialize};

/// Derived storage accounting. Recomputed on demand, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSnapshot {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    /// Sum of `downloaded_size` over downloaded modules.
    pub module_bytes: u64,
    /// Sum of cached media asset sizes.
    pub media_bytes: u64,
    /// Soft ceiling from settings at the time of the snapshot.
    pub max_storage_size: u64,
}

impl StorageSnapshot {
    /// Bytes attributable to the engine itself.
    pub fn engine_bytes(&self) -> u64 {
        self.module_bytes.saturating_add(self.media_bytes)
    }

    pub fn over_ceiling(&self) -> bool {
        self.engine_bytes() > self.max_storage_size
    }

    /// Share of the soft ceiling in use, as a percentage.
    pub fn ceiling_percent(&self) -> f64 {
        if self.max_storage_size == 0 {
            return 100.0;
        }
        self.engine_bytes() as f64 * 100.0 / self.max_storage_size as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_over_ceiling() {
        let snap = StorageSnapshot {
            module_bytes: 60,
            media_bytes: 50,
            max_storage_size: 100,
            ..Default::default()
        };
        assert_eq!(snap.engine_bytes(), 110);
        assert!(snap.over_ceiling());
        assert!((snap.ceiling_percent() - 110.0).abs() < f64::EPSILON);

        let snap = StorageSnapshot {
            module_bytes: 60,
            max_storage_size: 100,
            ..Default::default()
        };
        assert!(!snap.over_ceiling());
    }
}
