use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use crate::error::HubError;
use crate::metrics::tracker_metrics::PersistedMetrics;
use crate::types::HubResult;

use super::{HubPersistence, PersistedHierarchy};

pub struct FilePersister {
    pub storage_path: PathBuf,
}

impl TryFrom<&str> for FilePersister {
    type Error = HubError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        PathBuf::from_str(value)
            .map(|path| Self { storage_path: path })
            .map_err(|_e| {
                HubError::PersistenceError(format!("Could not build a path from {value}"))
            })
    }
}

impl FilePersister {
    pub fn new(storage_path: &Path) -> Self {
        let _ = std::fs::create_dir_all(storage_path);
        FilePersister {
            storage_path: storage_path.to_path_buf(),
        }
    }

    pub fn hierarchy_path(&self) -> PathBuf {
        let mut path = self.storage_path.clone();
        path.push("dob_edge_hierarchy.json");
        path
    }

    pub fn metrics_path(&self) -> PathBuf {
        let mut path = self.storage_path.clone();
        path.push("dob_edge_tracker_metrics.json");
        path
    }

    async fn load<T: serde::de::DeserializeOwned>(&self, path: PathBuf) -> HubResult<Option<T>> {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(HubError::PersistenceError(format!(
                    "opening {} failed: {e}",
                    path.display()
                )));
            }
        };
        let mut contents = vec![];
        file.read_to_end(&mut contents).await.map_err(|e| {
            HubError::PersistenceError(format!("reading {} failed: {e}", path.display()))
        })?;
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| {
                HubError::PersistenceError(format!("parsing {} failed: {e}", path.display()))
            })
    }

    async fn save<T: serde::Serialize>(&self, path: PathBuf, value: &T) -> HubResult<()> {
        let body = serde_json::to_vec(value)
            .map_err(|e| HubError::PersistenceError(format!("serialize failed: {e}")))?;
        let mut file = tokio::fs::File::create(&path).await.map_err(|e| {
            HubError::PersistenceError(format!("creating {} failed: {e}", path.display()))
        })?;
        file.write_all(&body).await.map_err(|e| {
            HubError::PersistenceError(format!("writing {} failed: {e}", path.display()))
        })
    }
}

#[async_trait]
impl HubPersistence for FilePersister {
    async fn load_hierarchy(&self) -> HubResult<Option<PersistedHierarchy>> {
        self.load(self.hierarchy_path()).await
    }

    async fn save_hierarchy(&self, hierarchy: &PersistedHierarchy) -> HubResult<()> {
        self.save(self.hierarchy_path(), hierarchy).await
    }

    async fn load_tracker_metrics(&self) -> HubResult<Option<PersistedMetrics>> {
        self.load(self.metrics_path()).await
    }

    async fn save_tracker_metrics(&self, metrics: &PersistedMetrics) -> HubResult<()> {
        self.save(self.metrics_path(), metrics).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::metrics::tracker_metrics::{HealthLease, MetricsTotals};

    use super::*;

    fn temp_persister(tag: &str) -> FilePersister {
        let mut dir = std::env::temp_dir();
        dir.push(format!("dob-edge-test-{tag}-{}", std::process::id()));
        FilePersister::new(&dir)
    }

    #[tokio::test]
    async fn hierarchy_round_trips() {
        let persister = temp_persister("hierarchy");
        let stored = PersistedHierarchy {
            cached_at_ms: 1_700_000_000_000,
            data: json!({"sport": {"1": {"name": "Soccer"}}}),
        };
        persister.save_hierarchy(&stored).await.unwrap();
        let reloaded = persister.load_hierarchy().await.unwrap();
        assert_eq!(reloaded, Some(stored));
    }

    #[tokio::test]
    async fn metrics_round_trip() {
        let persister = temp_persister("metrics");
        let mut metrics = PersistedMetrics {
            totals: MetricsTotals {
                messages: 10,
                parse_errors: 1,
                last_seen_ms: Some(123),
            },
            buckets: vec![],
            leases: Default::default(),
        };
        metrics.leases.insert(
            "42".into(),
            HealthLease {
                sse_clients: 2,
                upstream_connected: true,
                expires_at_ms: 456,
            },
        );
        persister.save_tracker_metrics(&metrics).await.unwrap();
        let reloaded = persister.load_tracker_metrics().await.unwrap();
        assert_eq!(reloaded, Some(metrics));
    }

    #[tokio::test]
    async fn missing_backup_is_not_an_error() {
        let persister = temp_persister("missing");
        assert_eq!(persister.load_hierarchy().await.unwrap(), None);
        assert_eq!(persister.load_tracker_metrics().await.unwrap(), None);
    }
}
