use std::sync::Arc;

use async_trait::async_trait;
use redis::{Client, Commands, RedisError};
use tokio::sync::RwLock;

use crate::error::HubError;
use crate::metrics::tracker_metrics::PersistedMetrics;
use crate::types::HubResult;

use super::{HubPersistence, PersistedHierarchy};

pub const HIERARCHY_KEY: &str = "dob-edge-hierarchy";
pub const METRICS_KEY: &str = "dob-edge-tracker-metrics";

impl From<RedisError> for HubError {
    fn from(err: RedisError) -> Self {
        HubError::PersistenceError(format!("Error talking to Redis: {err}"))
    }
}

pub struct RedisPersister {
    redis_client: Arc<RwLock<Client>>,
}

impl RedisPersister {
    pub fn new(url: &str) -> Result<RedisPersister, HubError> {
        let client = Client::open(url)?;
        Ok(Self {
            redis_client: Arc::new(RwLock::new(client)),
        })
    }

    async fn read_key<T: serde::de::DeserializeOwned>(&self, key: &str) -> HubResult<Option<T>> {
        let mut client = self.redis_client.write().await;
        let raw: Option<String> = client.get(key)?;
        match raw {
            None => Ok(None),
            Some(body) => serde_json::from_str(&body).map(Some).map_err(|e| {
                HubError::PersistenceError(format!("failed to parse {key} from redis: {e}"))
            }),
        }
    }

    async fn write_key<T: serde::Serialize>(&self, key: &str, value: &T) -> HubResult<()> {
        let mut client = self.redis_client.write().await;
        let body = serde_json::to_string(value)?;
        let _: () = client.set(key, body)?;
        Ok(())
    }
}

#[async_trait]
impl HubPersistence for RedisPersister {
    async fn load_hierarchy(&self) -> HubResult<Option<PersistedHierarchy>> {
        self.read_key(HIERARCHY_KEY).await
    }

    async fn save_hierarchy(&self, hierarchy: &PersistedHierarchy) -> HubResult<()> {
        self.write_key(HIERARCHY_KEY, hierarchy).await
    }

    async fn load_tracker_metrics(&self) -> HubResult<Option<PersistedMetrics>> {
        self.read_key(METRICS_KEY).await
    }

    async fn save_tracker_metrics(&self, metrics: &PersistedMetrics) -> HubResult<()> {
        self.write_key(METRICS_KEY, metrics).await
    }
}
