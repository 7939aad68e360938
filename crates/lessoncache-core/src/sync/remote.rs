use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::api::RemoteError;
use crate::models::{CachedModule, ProgressKey, ProgressRecord};

/// Response to a progress push.
///
/// An empty outcome means the whole batch was accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushOutcome {
    /// Records the remote refused; they are marked `Failed` and retried next cycle.
    pub rejected: Vec<ProgressKey>,
    /// Remote copies the server holds instead of ours, for keys it did not take.
    pub superseded: Vec<ProgressRecord>,
}

impl PushOutcome {
    pub fn accepted() -> Self {
        Self::default()
    }
}

/// The remote authority that stores canonical content and progress.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    async fn push_progress(&self, records: &[ProgressRecord]) -> Result<PushOutcome, RemoteError>;

    /// The catalog of available modules, metadata only.
    async fn fetch_catalog(&self) -> Result<Vec<CachedModule>, RemoteError>;
}
