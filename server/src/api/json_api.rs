use actix_web::{
    get,
    web::{self, Json},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::feed::session::{FeedSession, FeedStatsSnapshot};
use crate::hierarchy::HierarchyCache;
use crate::metrics::tracker_metrics::{TrackerMetrics, TrackerRollups};
use crate::types::{HubJsonResult, now_millis};

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub live_tracker: TrackerRollups,
    pub swarm_ws: FeedStatsSnapshot,
}

#[get("/health")]
pub async fn health(
    session: web::Data<FeedSession>,
    metrics: web::Data<TrackerMetrics>,
) -> HubJsonResult<HealthStatus> {
    Ok(Json(HealthStatus {
        status: "ok".into(),
        live_tracker: metrics.rollups(),
        swarm_ws: session.stats_snapshot(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct HierarchyQuery {
    refresh: Option<String>,
}

#[get("/hierarchy")]
pub async fn hierarchy(
    cache: web::Data<HierarchyCache>,
    query: web::Query<HierarchyQuery>,
) -> HubJsonResult<Value> {
    let force = query.refresh.as_deref() == Some("true");
    let (data, cached) = cache.get(force).await?;
    Ok(Json(json!({
        "data": data,
        "cached": cached,
        "timestamp": now_millis(),
    })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health).service(hierarchy);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use actix_web::{App, test};
    use chrono::Utc;
    use serde_json::json;

    use crate::feed::session::FeedConfig;

    use super::*;

    fn test_session() -> Arc<FeedSession> {
        FeedSession::new(FeedConfig {
            url: "ws://127.0.0.1:1/ws".into(),
            site_id: 1,
            language: "eng".into(),
            connect_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_millis(100),
        })
    }

    #[actix_web::test]
    async fn health_reports_ok_with_both_feeds() {
        let session = test_session();
        let metrics = Arc::new(TrackerMetrics::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(session))
                .app_data(web::Data::from(metrics))
                .service(web::scope("/api").configure(configure)),
        )
        .await;
        let req = test::TestRequest::get().uri("/api/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["swarm_ws"]["connected"], false);
        assert_eq!(body["live_tracker"]["activeGames"], 0);
    }

    #[actix_web::test]
    async fn hierarchy_serves_cached_document() {
        let session = test_session();
        let cache = HierarchyCache::new(session.clone(), None);
        cache.install_document(
            json!({"sport": {"1": {"id": 1, "name": "Soccer"}}}),
            Utc::now(),
        );
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(cache))
                .service(web::scope("/api").configure(|cfg| {
                    cfg.service(hierarchy);
                })),
        )
        .await;
        let req = test::TestRequest::get().uri("/api/hierarchy").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["cached"], true);
        assert_eq!(body["data"]["sport"]["1"]["name"], "Soccer");
    }

    #[actix_web::test]
    async fn hierarchy_without_cache_or_feed_is_a_500() {
        let session = test_session();
        let cache = HierarchyCache::new(session, None);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(cache))
                .service(web::scope("/api").configure(|cfg| {
                    cfg.service(hierarchy);
                })),
        )
        .await;
        let req = test::TestRequest::get().uri("/api/hierarchy").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_server_error());
    }
}
