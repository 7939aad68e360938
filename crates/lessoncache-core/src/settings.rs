//! Settings store: the only write path for engine policy.

use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::models::{EngineSettings, SettingsPatch};
use crate::store::Store;

/// Settings before and after an update.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsChange {
    pub previous: EngineSettings,
    pub current: EngineSettings,
}

impl SettingsChange {
    /// Whether the sync timer has to be rebuilt.
    pub fn reschedule_needed(&self) -> bool {
        self.current.sync_schedule_changed(&self.previous)
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    store: Arc<Store>,
}

impl SettingsStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self) -> EngineSettings {
        self.store.settings.get().await
    }

    /// Merge `patch` into the persisted settings.
    ///
    /// Invalid patches are rejected without touching the stored settings.
    pub async fn update(&self, patch: &SettingsPatch) -> Result<SettingsChange> {
        let (previous, current) = self
            .store
            .settings
            .modify(|current| current.merged(patch).map_err(Error::from))
            .await?;
        info!(?patch, "Settings updated");
        Ok(SettingsChange { previous, current })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_merges_and_reports_change() {
        let settings = SettingsStore::new(Arc::new(Store::in_memory()));
        let change = settings
            .update(&SettingsPatch {
                sync_interval_minutes: Some(5),
                ..Default::default()
            })
            .await
            .expect("update");
        assert!(change.reschedule_needed());
        assert_eq!(settings.get().await.sync_interval_minutes, 5);

        let change = settings
            .update(&SettingsPatch {
                low_data_mode: Some(true),
                ..Default::default()
            })
            .await
            .expect("update");
        assert!(!change.reschedule_needed());
        assert_eq!(change.current.sync_interval_minutes, 5);
    }

    #[tokio::test]
    async fn test_invalid_patch_leaves_settings_alone() {
        let settings = SettingsStore::new(Arc::new(Store::in_memory()));
        let err = settings
            .update(&SettingsPatch {
                cache_expiration_days: Some(0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_settings");
        assert_eq!(settings.get().await, EngineSettings::default());
    }
}
