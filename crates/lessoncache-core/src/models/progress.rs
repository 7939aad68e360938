//! Per-user, per-section progress records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProgressError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Failed,
    /// Reserved. Never assigned by the engine; see the conflict policy in `sync`.
    Conflict,
}

impl SyncStatus {
    /// Whether a record in this state goes out with the next sync cycle.
    pub fn needs_sync(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Failed)
    }
}

/// Composite identity of a progress record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressKey {
    pub module_id: String,
    pub section_id: String,
    pub user_id: String,
}

impl ProgressKey {
    pub fn new(
        module_id: impl Into<String>,
        section_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            section_id: section_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.module_id, self.section_id, self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    #[serde(flatten)]
    pub key: ProgressKey,
    /// Completion fraction, 0.0 to 1.0.
    pub completion: f32,
    pub completed: bool,
    #[serde(default)]
    pub time_spent_secs: u64,
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub responses: Option<serde_json::Value>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    /// Write counter assigned by the store on every save of this key.
    #[serde(default)]
    pub revision: u64,
}

impl ProgressRecord {
    pub fn new(key: ProgressKey, completion: f32) -> Self {
        let completion = completion.clamp(0.0, 1.0);
        Self {
            key,
            completion,
            completed: completion >= 1.0,
            time_spent_secs: 0,
            score: None,
            responses: None,
            last_modified: Utc::now(),
            sync_status: SyncStatus::Pending,
            revision: 0,
        }
    }

    pub fn with_time_spent(mut self, secs: u64) -> Self {
        self.time_spent_secs = secs;
        self
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_responses(mut self, responses: serde_json::Value) -> Self {
        self.responses = Some(responses);
        self
    }

    /// Reject values JSON cannot carry. NaN would be written as `null` and
    /// make the whole progress file unreadable.
    pub fn validate(&self) -> Result<(), ProgressError> {
        if !self.completion.is_finite() {
            return Err(ProgressError::NotFinite {
                field: "completion",
                value: self.completion,
            });
        }
        match self.score {
            Some(score) if !score.is_finite() => Err(ProgressError::NotFinite {
                field: "score",
                value: score,
            }),
            _ => Ok(()),
        }
    }

    /// True when `other` is the same write of the same key.
    pub fn same_revision(&self, other: &ProgressRecord) -> bool {
        self.key == other.key && self.revision == other.revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_sync() {
        assert!(SyncStatus::Pending.needs_sync());
        assert!(SyncStatus::Failed.needs_sync());
        assert!(!SyncStatus::Synced.needs_sync());
        assert!(!SyncStatus::Conflict.needs_sync());
    }

    #[test]
    fn test_completion_is_clamped() {
        let key = ProgressKey::new("m", "s", "u");
        assert_eq!(ProgressRecord::new(key.clone(), 1.7).completion, 1.0);
        assert!(ProgressRecord::new(key.clone(), 1.0).completed);
        assert_eq!(ProgressRecord::new(key, -0.2).completion, 0.0);
    }

    #[test]
    fn test_validate_rejects_non_finite_values() {
        let key = ProgressKey::new("m", "s", "u");
        let err = ProgressRecord::new(key.clone(), f32::NAN).validate().unwrap_err();
        assert!(matches!(err, ProgressError::NotFinite { field: "completion", .. }));

        let err = ProgressRecord::new(key.clone(), 0.5)
            .with_score(f32::INFINITY)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ProgressError::NotFinite { field: "score", .. }));

        assert!(ProgressRecord::new(key, 0.5).with_score(88.0).validate().is_ok());
    }

    #[test]
    fn test_key_is_flattened_on_the_wire() {
        let record = ProgressRecord::new(ProgressKey::new("m1", "s1", "u1"), 0.5);
        let json = serde_json::to_value(&record).expect("serialize record");
        assert_eq!(json["moduleId"], "m1");
        assert_eq!(json["sectionId"], "s1");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["syncStatus"], "pending");
    }

    #[test]
    fn test_key_display() {
        assert_eq!(ProgressKey::new("m", "s", "u").to_string(), "m/s/u");
    }
}
