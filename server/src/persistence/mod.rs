use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metrics::tracker_metrics::PersistedMetrics;
use crate::types::HubResult;

pub mod file;
pub mod redis;

/// The hierarchy cache as stored: the taxonomy document plus its fetch time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedHierarchy {
    #[serde(rename = "cachedAtMs")]
    pub cached_at_ms: i64,
    pub data: Value,
}

/// Durable storage for the two documents the hub persists. The hub stays
/// correct when every call here fails; callers log and move on.
#[async_trait]
pub trait HubPersistence: Send + Sync {
    async fn load_hierarchy(&self) -> HubResult<Option<PersistedHierarchy>>;
    async fn save_hierarchy(&self, hierarchy: &PersistedHierarchy) -> HubResult<()>;
    async fn load_tracker_metrics(&self) -> HubResult<Option<PersistedMetrics>>;
    async fn save_tracker_metrics(&self, metrics: &PersistedMetrics) -> HubResult<()>;
}
