//! Engine policy knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Default soft storage ceiling: 500 MiB.
pub const DEFAULT_MAX_STORAGE_SIZE: u64 = 500 * 1024 * 1024;

/// Default time-to-live for downloaded modules.
pub const DEFAULT_CACHE_EXPIRATION_DAYS: u32 = 30;

/// Longest time-to-live a module may be given (ten years).
pub const MAX_CACHE_EXPIRATION_DAYS: u32 = 3650;

/// Default background sync period.
pub const DEFAULT_SYNC_INTERVAL_MINUTES: u32 = 15;

/// Advisory hint for the transfer mechanism.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    None,
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub auto_download: bool,
    pub download_on_wifi: bool,
    pub download_on_cellular: bool,
    /// Soft ceiling in bytes; the sweeper runs when the footprint passes it.
    pub max_storage_size: u64,
    pub cache_expiration_days: u32,
    pub sync_interval_minutes: u32,
    pub compression_level: CompressionLevel,
    pub prefetch_next_modules: bool,
    pub background_sync: bool,
    pub low_data_mode: bool,
    pub battery_optimization: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            auto_download: false,
            download_on_wifi: true,
            download_on_cellular: false,
            max_storage_size: DEFAULT_MAX_STORAGE_SIZE,
            cache_expiration_days: DEFAULT_CACHE_EXPIRATION_DAYS,
            sync_interval_minutes: DEFAULT_SYNC_INTERVAL_MINUTES,
            compression_level: CompressionLevel::default(),
            prefetch_next_modules: true,
            background_sync: true,
            low_data_mode: false,
            battery_optimization: true,
        }
    }
}

impl EngineSettings {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.sync_interval_minutes) * 60)
    }

    /// Whether moving from `previous` to `self` requires rescheduling the sync timer.
    pub fn sync_schedule_changed(&self, previous: &EngineSettings) -> bool {
        self.sync_interval_minutes != previous.sync_interval_minutes
            || self.background_sync != previous.background_sync
    }

    /// Merge a partial update, returning the new settings if they are valid.
    pub fn merged(&self, patch: &SettingsPatch) -> Result<EngineSettings, SettingsError> {
        let mut next = self.clone();
        if let Some(v) = patch.auto_download {
            next.auto_download = v;
        }
        if let Some(v) = patch.download_on_wifi {
            next.download_on_wifi = v;
        }
        if let Some(v) = patch.download_on_cellular {
            next.download_on_cellular = v;
        }
        if let Some(v) = patch.max_storage_size {
            next.max_storage_size = v;
        }
        if let Some(v) = patch.cache_expiration_days {
            next.cache_expiration_days = v;
        }
        if let Some(v) = patch.sync_interval_minutes {
            next.sync_interval_minutes = v;
        }
        if let Some(v) = patch.compression_level {
            next.compression_level = v;
        }
        if let Some(v) = patch.prefetch_next_modules {
            next.prefetch_next_modules = v;
        }
        if let Some(v) = patch.background_sync {
            next.background_sync = v;
        }
        if let Some(v) = patch.low_data_mode {
            next.low_data_mode = v;
        }
        if let Some(v) = patch.battery_optimization {
            next.battery_optimization = v;
        }
        next.validate()?;
        Ok(next)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.sync_interval_minutes == 0 {
            return Err(SettingsError::Invalid {
                field: "syncIntervalMinutes",
                reason: "must be at least 1 minute".to_string(),
            });
        }
        if self.cache_expiration_days == 0 {
            return Err(SettingsError::Invalid {
                field: "cacheExpirationDays",
                reason: "must be at least 1 day".to_string(),
            });
        }
        if self.cache_expiration_days > MAX_CACHE_EXPIRATION_DAYS {
            return Err(SettingsError::Invalid {
                field: "cacheExpirationDays",
                reason: format!("must be at most {} days", MAX_CACHE_EXPIRATION_DAYS),
            });
        }
        Ok(())
    }
}

/// A partial settings update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct SettingsPatch {
    pub auto_download: Option<bool>,
    pub download_on_wifi: Option<bool>,
    pub download_on_cellular: Option<bool>,
    pub max_storage_size: Option<u64>,
    pub cache_expiration_days: Option<u32>,
    pub sync_interval_minutes: Option<u32>,
    pub compression_level: Option<CompressionLevel>,
    pub prefetch_next_modules: Option<bool>,
    pub background_sync: Option<bool>,
    pub low_data_mode: Option<bool>,
    pub battery_optimization: Option<bool>,
}

impl SettingsPatch {
    /// Parse a single `key=value` assignment, using the camelCase field names.
    pub fn from_assignment(assignment: &str) -> Result<Self, SettingsError> {
        let (key, value) = assignment.split_once('=').ok_or_else(|| SettingsError::Invalid {
            field: "assignment",
            reason: format!("expected key=value, got {:?}", assignment),
        })?;
        let value = value.trim();
        let raw = match value.parse::<serde_json::Value>() {
            Ok(v) => v,
            Err(_) => serde_json::Value::String(value.to_string()),
        };
        let mut object = serde_json::Map::new();
        object.insert(key.trim().to_string(), raw);
        serde_json::from_value(serde_json::Value::Object(object)).map_err(|e| {
            SettingsError::Invalid {
                field: "assignment",
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = EngineSettings::default();
        assert!(s.download_on_wifi);
        assert!(!s.download_on_cellular);
        assert_eq!(s.cache_expiration_days, 30);
        assert_eq!(s.sync_interval(), Duration::from_secs(15 * 60));
    }

    #[test]
    fn test_merge_only_touches_given_fields() {
        let s = EngineSettings::default();
        let patch = SettingsPatch {
            download_on_cellular: Some(true),
            cache_expiration_days: Some(7),
            ..Default::default()
        };
        let next = s.merged(&patch).expect("valid patch");
        assert!(next.download_on_cellular);
        assert_eq!(next.cache_expiration_days, 7);
        assert_eq!(next.sync_interval_minutes, s.sync_interval_minutes);
        assert!(!next.sync_schedule_changed(&s));
    }

    #[test]
    fn test_schedule_change_detection() {
        let s = EngineSettings::default();
        let next = s
            .merged(&SettingsPatch {
                sync_interval_minutes: Some(5),
                ..Default::default()
            })
            .expect("valid patch");
        assert!(next.sync_schedule_changed(&s));

        let next = s
            .merged(&SettingsPatch {
                background_sync: Some(false),
                ..Default::default()
            })
            .expect("valid patch");
        assert!(next.sync_schedule_changed(&s));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = EngineSettings::default()
            .merged(&SettingsPatch {
                sync_interval_minutes: Some(0),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field: "syncIntervalMinutes", .. }));
    }

    #[test]
    fn test_rejects_out_of_range_expiration() {
        let err = EngineSettings::default()
            .merged(&SettingsPatch {
                cache_expiration_days: Some(u32::MAX),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field: "cacheExpirationDays", .. }));

        let s = EngineSettings::default()
            .merged(&SettingsPatch {
                cache_expiration_days: Some(MAX_CACHE_EXPIRATION_DAYS),
                ..Default::default()
            })
            .expect("upper bound is allowed");
        assert_eq!(s.cache_expiration_days, MAX_CACHE_EXPIRATION_DAYS);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let s: EngineSettings =
            serde_json::from_str(r#"{"downloadOnCellular":true}"#).expect("parse settings");
        assert!(s.download_on_cellular);
        assert_eq!(s.max_storage_size, DEFAULT_MAX_STORAGE_SIZE);
    }

    #[test]
    fn test_patch_from_assignment() {
        let patch = SettingsPatch::from_assignment("syncIntervalMinutes=5").expect("parse");
        assert_eq!(patch.sync_interval_minutes, Some(5));

        let patch = SettingsPatch::from_assignment("compressionLevel=high").expect("parse");
        assert_eq!(patch.compression_level, Some(CompressionLevel::High));

        let patch = SettingsPatch::from_assignment("backgroundSync=false").expect("parse");
        assert_eq!(patch.background_sync, Some(false));

        assert!(SettingsPatch::from_assignment("noEquals").is_err());
        assert!(SettingsPatch::from_assignment("colour=blue").is_err());
        assert!(SettingsPatch::from_assignment("syncIntervalMinutes=soon").is_err());
    }
}
