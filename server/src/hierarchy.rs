use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::feed::session::FeedSession;
use crate::normalize::unwrap_data;
use crate::persistence::{HubPersistence, PersistedHierarchy};
use crate::types::HubResult;
use crate::error::HubError;

pub fn hierarchy_ttl() -> Duration {
    Duration::minutes(30)
}

/// Name maps derived from the cached taxonomy. Rebuilt whenever the
/// underlying document is replaced, never patched in place.
#[derive(Debug, Clone, Default)]
pub struct NameMaps {
    pub sports: HashMap<u64, String>,
    pub regions: HashMap<u64, String>,
    pub competitions: HashMap<u64, String>,
    pub sport_aliases: HashMap<String, u64>,
}

struct CachedHierarchy {
    cached_at: DateTime<Utc>,
    doc: Value,
    names: NameMaps,
}

/// TTL cache of the sport/region/competition taxonomy with
/// stale-while-revalidate: an expired entry survives any refresh that fails
/// or comes back empty (a known feed glitch).
pub struct HierarchyCache {
    session: Arc<FeedSession>,
    persistence: Option<Arc<dyn HubPersistence>>,
    cached: RwLock<Option<CachedHierarchy>>,
    refresh_lock: tokio::sync::Mutex<()>,
    ttl: Duration,
}

fn named_entries<'a>(container: &'a Value, field: &str) -> Vec<(u64, &'a Value)> {
    container
        .get(field)
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(key, value)| {
                    let id = value
                        .get("id")
                        .and_then(crate::normalize::id_of)
                        .or_else(|| key.parse().ok())?;
                    value.is_object().then_some((id, value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn name_of(entity: &Value) -> Option<String> {
    entity.get("name").and_then(Value::as_str).map(str::to_owned)
}

pub fn derive_names(doc: &Value) -> NameMaps {
    let mut names = NameMaps::default();
    for (sport_id, sport) in named_entries(doc, "sport") {
        if let Some(name) = name_of(sport) {
            names.sports.insert(sport_id, name);
        }
        if let Some(alias) = sport.get("alias").and_then(Value::as_str) {
            names.sport_aliases.insert(alias.to_lowercase(), sport_id);
        }
        for (region_id, region) in named_entries(sport, "region") {
            if let Some(name) = name_of(region) {
                names.regions.insert(region_id, name);
            }
            for (comp_id, competition) in named_entries(region, "competition") {
                if let Some(name) = name_of(competition) {
                    names.competitions.insert(comp_id, name);
                }
            }
        }
    }
    // flat sibling maps appear alongside the nested walk on some feeds
    for (region_id, region) in named_entries(doc, "region") {
        if let Some(name) = name_of(region) {
            names.regions.entry(region_id).or_insert(name);
        }
        for (comp_id, competition) in named_entries(region, "competition") {
            if let Some(name) = name_of(competition) {
                names.competitions.entry(comp_id).or_insert(name);
            }
        }
    }
    for (comp_id, competition) in named_entries(doc, "competition") {
        if let Some(name) = name_of(competition) {
            names.competitions.entry(comp_id).or_insert(name);
        }
    }
    names
}

impl HierarchyCache {
    pub fn new(
        session: Arc<FeedSession>,
        persistence: Option<Arc<dyn HubPersistence>>,
    ) -> Arc<Self> {
        Arc::new(HierarchyCache {
            session,
            persistence,
            cached: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            ttl: hierarchy_ttl(),
        })
    }

    /// Installs a taxonomy document, replacing the derived name maps.
    pub fn install_document(&self, doc: Value, cached_at: DateTime<Utc>) {
        let names = derive_names(&doc);
        *self.cached.write() = Some(CachedHierarchy {
            cached_at,
            doc,
            names,
        });
    }

    pub async fn restore_persisted(&self) {
        let Some(persistence) = self.persistence.as_ref() else {
            return;
        };
        match persistence.load_hierarchy().await {
            Ok(Some(persisted)) => {
                let cached_at = Utc
                    .timestamp_millis_opt(persisted.cached_at_ms)
                    .single()
                    .unwrap_or_else(Utc::now);
                self.install_document(persisted.data, cached_at);
                debug!("hierarchy restored from persistence");
            }
            Ok(None) => {}
            Err(e) => warn!("hierarchy restore failed: {e}"),
        }
    }

    pub fn persisted_snapshot(&self) -> Option<PersistedHierarchy> {
        self.cached.read().as_ref().map(|cached| PersistedHierarchy {
            cached_at_ms: cached.cached_at.timestamp_millis(),
            data: cached.doc.clone(),
        })
    }

    fn fresh_document(&self) -> Option<(Value, bool)> {
        self.cached.read().as_ref().map(|cached| {
            (
                cached.doc.clone(),
                Utc::now() - cached.cached_at < self.ttl,
            )
        })
    }

    /// Returns `(document, served_from_cache)`. `force` skips the TTL check
    /// but still falls back to the cached copy when the refresh fails.
    pub async fn get(&self, force: bool) -> HubResult<(Value, bool)> {
        if !force {
            if let Some((doc, fresh)) = self.fresh_document() {
                if fresh {
                    return Ok((doc, true));
                }
            }
        }
        let _guard = self.refresh_lock.lock().await;
        if !force {
            // a concurrent refresher may have already won
            if let Some((doc, fresh)) = self.fresh_document() {
                if fresh {
                    return Ok((doc, true));
                }
            }
        }
        match self.fetch().await {
            Ok(doc) if !derive_names(&doc).sports.is_empty() => {
                self.install_document(doc.clone(), Utc::now());
                self.persist().await;
                Ok((doc, false))
            }
            Ok(_) => {
                warn!("hierarchy refresh returned no sports; keeping cached copy");
                self.stale_or(HubError::HierarchyUnavailable(
                    "feed returned an empty taxonomy".into(),
                ))
            }
            Err(e) => {
                debug!("hierarchy refresh failed: {e}");
                self.stale_or(e)
            }
        }
    }

    fn stale_or(&self, err: HubError) -> HubResult<(Value, bool)> {
        match self.cached.read().as_ref() {
            Some(cached) => Ok((cached.doc.clone(), true)),
            None => Err(err),
        }
    }

    async fn fetch(&self) -> HubResult<Value> {
        let reply = self
            .session
            .one_shot(
                json!({
                    "sport": ["id", "name", "alias", "order"],
                    "region": ["id", "name"],
                    "competition": ["id", "name", "order"],
                }),
                json!({}),
            )
            .await?;
        Ok(unwrap_data(&reply).clone())
    }

    async fn persist(&self) {
        let (Some(persistence), Some(snapshot)) =
            (self.persistence.as_ref(), self.persisted_snapshot())
        else {
            return;
        };
        if let Err(e) = persistence.save_hierarchy(&snapshot).await {
            warn!("hierarchy persist failed: {e}");
        }
    }

    pub fn sport_name(&self, sport_id: u64) -> Option<String> {
        self.cached
            .read()
            .as_ref()
            .and_then(|cached| cached.names.sports.get(&sport_id).cloned())
    }

    pub fn region_name(&self, region_id: u64) -> Option<String> {
        self.cached
            .read()
            .as_ref()
            .and_then(|cached| cached.names.regions.get(&region_id).cloned())
    }

    pub fn competition_name(&self, competition_id: u64) -> Option<String> {
        self.cached
            .read()
            .as_ref()
            .and_then(|cached| cached.names.competitions.get(&competition_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use crate::feed::session::FeedConfig;

    use super::*;

    fn taxonomy() -> Value {
        json!({
            "sport": {
                "1": {
                    "id": 1,
                    "name": "Soccer",
                    "alias": "Soccer",
                    "region": {
                        "10": {
                            "id": 10,
                            "name": "England",
                            "competition": {
                                "100": {"id": 100, "name": "Premier League"}
                            }
                        }
                    }
                }
            },
            "region": {"20": {"id": 20, "name": "Spain"}},
            "competition": {"200": {"id": 200, "name": "La Liga"}}
        })
    }

    fn disconnected_cache() -> Arc<HierarchyCache> {
        let session = FeedSession::new(FeedConfig {
            url: "ws://127.0.0.1:1/ws".into(),
            site_id: 1,
            language: "eng".into(),
            connect_timeout: StdDuration::from_millis(100),
            request_timeout: StdDuration::from_millis(100),
        });
        HierarchyCache::new(session, None)
    }

    #[test]
    fn derives_names_from_nested_and_flat_maps() {
        let names = derive_names(&taxonomy());
        assert_eq!(names.sports.get(&1), Some(&"Soccer".to_string()));
        assert_eq!(names.regions.get(&10), Some(&"England".to_string()));
        assert_eq!(names.regions.get(&20), Some(&"Spain".to_string()));
        assert_eq!(
            names.competitions.get(&100),
            Some(&"Premier League".to_string())
        );
        assert_eq!(names.competitions.get(&200), Some(&"La Liga".to_string()));
        assert_eq!(names.sport_aliases.get("soccer"), Some(&1));
    }

    #[tokio::test]
    async fn fresh_cache_is_served_without_refresh() {
        let cache = disconnected_cache();
        cache.install_document(taxonomy(), Utc::now());
        let (doc, cached) = cache.get(false).await.unwrap();
        assert!(cached);
        assert_eq!(doc, taxonomy());
    }

    #[tokio::test]
    async fn expired_cache_survives_a_failing_refresh() {
        let cache = disconnected_cache();
        cache.install_document(taxonomy(), Utc::now() - Duration::hours(2));
        let (doc, cached) = cache.get(false).await.unwrap();
        assert!(cached);
        assert_eq!(doc, taxonomy());
    }

    #[tokio::test]
    async fn no_cache_and_no_feed_is_an_error() {
        let cache = disconnected_cache();
        assert!(cache.get(false).await.is_err());
    }

    #[test]
    fn name_maps_are_replaced_with_the_document() {
        let cache = disconnected_cache();
        cache.install_document(taxonomy(), Utc::now());
        assert_eq!(cache.sport_name(1), Some("Soccer".into()));
        cache.install_document(json!({"sport": {"3": {"id": 3, "name": "Tennis"}}}), Utc::now());
        assert_eq!(cache.sport_name(1), None);
        assert_eq!(cache.sport_name(3), Some("Tennis".into()));
    }
}
