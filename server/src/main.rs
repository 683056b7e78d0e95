use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use clap::Parser;
use dashmap::DashMap;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dob_edge::api;
use dob_edge::cli::{CliArgs, LogFormat};
use dob_edge::feed::session::FeedSession;
use dob_edge::hierarchy::HierarchyCache;
use dob_edge::http::results_client::ResultsClient;
use dob_edge::hub::broadcaster::Broadcaster;
use dob_edge::hub::markets::MarketPriorities;
use dob_edge::hub::{CountsFeed, GroupCtx, GroupManager};
use dob_edge::metrics::tracker_metrics::{TrackerMetrics, flush_metrics_task};
use dob_edge::persistence::HubPersistence;
use dob_edge::tracker::LiveTracker;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[actix_web::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = CliArgs::parse();
    init_tracing(args.log_format);

    let persistence = args.persistence.build();
    let session = FeedSession::new(args.feed.to_config());
    let broadcaster = Broadcaster::new();

    let metrics = Arc::new(TrackerMetrics::default());
    if let Some(persistence) = persistence.as_ref() {
        match persistence.load_tracker_metrics().await {
            Ok(Some(persisted)) => {
                metrics.restore(persisted);
                info!("tracker metrics restored from persistence");
            }
            Ok(None) => {}
            Err(e) => warn!("tracker metrics restore failed: {e}"),
        }
    }

    let hierarchy = HierarchyCache::new(session.clone(), persistence.clone());
    hierarchy.restore_persisted().await;

    let manager = GroupManager::new(GroupCtx {
        session: session.clone(),
        broadcaster: broadcaster.clone(),
        groups: Arc::new(DashMap::new()),
        counts: Arc::new(CountsFeed::default()),
        hierarchy: hierarchy.clone(),
        priorities: Arc::new(MarketPriorities::default()),
        config: args.hub.to_config(),
    });
    let tracker = LiveTracker::new(args.tracker.to_config(), broadcaster.clone(), metrics.clone());
    let results_client = Arc::new(ResultsClient::new(args.results.to_args())?);

    let http_args = args.http.clone();
    let server_manager = manager.clone();
    let server_session = session.clone();
    let server_metrics = metrics.clone();
    let server_hierarchy = hierarchy.clone();
    let server = HttpServer::new(move || {
        let cors = http_args.cors.middleware();
        App::new()
            .app_data(web::Data::from(server_manager.clone()))
            .app_data(web::Data::from(server_session.clone()))
            .app_data(web::Data::from(server_metrics.clone()))
            .app_data(web::Data::from(server_hierarchy.clone()))
            .app_data(web::Data::from(tracker.clone()))
            .app_data(web::Data::from(results_client.clone()))
            .service(
                web::scope("/api")
                    .wrap(cors)
                    .configure(api::configure_api),
            )
    })
    .bind(args.http.http_server_tuple())?
    .workers(args.http.workers)
    .shutdown_timeout(5)
    .run();

    info!(
        "dob-edge listening on {}:{}",
        args.http.interface, args.http.port
    );

    match persistence.clone() {
        Some(persistence_for_flush) => {
            tokio::select! {
                res = server => {
                    res?;
                    info!("actix is shutting down, persisting data");
                    clean_shutdown(persistence, &hierarchy, &metrics).await;
                    info!("actix was shutdown properly");
                }
                _ = flush_metrics_task(metrics.clone(), persistence_for_flush) => {
                    info!("metrics flusher unexpectedly shut down");
                }
            }
        }
        None => {
            server.await?;
            info!("actix is shutting down, no persistence configured");
        }
    }
    Ok(())
}

async fn clean_shutdown(
    persistence: Option<Arc<dyn HubPersistence>>,
    hierarchy: &Arc<HierarchyCache>,
    metrics: &Arc<TrackerMetrics>,
) {
    let Some(persistence) = persistence else {
        return;
    };
    if let Some(snapshot) = hierarchy.persisted_snapshot() {
        if let Err(e) = persistence.save_hierarchy(&snapshot).await {
            warn!("failed backing up hierarchy: {e}");
        }
    }
    if let Err(e) = persistence.save_tracker_metrics(&metrics.snapshot()).await {
        warn!("failed backing up tracker metrics: {e}");
    }
}
