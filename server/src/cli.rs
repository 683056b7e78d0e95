use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::http::header;
use clap::{Args, Parser, ValueEnum};
use tracing::warn;

use crate::feed::session::FeedConfig;
use crate::http::results_client::ResultsClientArgs;
use crate::hub::HubConfig;
use crate::persistence::{HubPersistence, file::FilePersister, redis::RedisPersister};
use crate::tracker::TrackerConfig;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

#[derive(Args, Debug, Clone)]
pub struct HttpServerArgs {
    /// Which local interface to bind to
    #[clap(long, env, default_value = "0.0.0.0")]
    pub interface: String,
    /// Which port to listen on
    #[clap(long, env, default_value_t = 3000)]
    pub port: u16,
    /// Number of actix workers
    #[clap(long, env, default_value_t = 4)]
    pub workers: usize,
    #[clap(flatten)]
    pub cors: CorsOptions,
}

impl HttpServerArgs {
    pub fn http_server_tuple(&self) -> (String, u16) {
        (self.interface.clone(), self.port)
    }
}

#[derive(Args, Debug, Clone)]
pub struct CorsOptions {
    /// Origins allowed in addition to the dob-edge pages.dev deployments
    #[clap(long, env, value_delimiter = ',', default_value = "https://dob-edge.pages.dev")]
    pub cors_origin: Vec<String>,
    /// Max age for preflight caching, in seconds
    #[clap(long, env, default_value_t = 86400)]
    pub cors_max_age: usize,
}

impl CorsOptions {
    /// Any `dob-edge*.pages.dev` deployment passes, plus the configured
    /// origins.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        if self.cors_origin.iter().any(|allowed| allowed == origin) {
            return true;
        }
        origin
            .strip_prefix("https://dob-edge")
            .map(|rest| rest.ends_with(".pages.dev"))
            .unwrap_or(false)
    }

    pub fn middleware(&self) -> Cors {
        let options = self.clone();
        Cors::default()
            .allowed_origin_fn(move |origin, _req_head| {
                origin
                    .to_str()
                    .map(|o| options.origin_allowed(o))
                    .unwrap_or(false)
            })
            .allowed_methods(vec!["GET", "POST", "OPTIONS"])
            .allowed_headers(vec![header::CONTENT_TYPE])
            .max_age(self.cors_max_age)
    }
}

#[derive(Args, Debug, Clone)]
pub struct FeedArgs {
    /// Upstream sportsbook feed websocket URL
    #[clap(long, env, default_value = "wss://eu-swarm-newm.betconstruct.com/")]
    pub feed_url: String,
    /// Partner (site) id used in the feed handshake
    #[clap(long, env, default_value_t = 1777)]
    pub partner_id: u64,
    /// Feed content language
    #[clap(long, env, default_value = "eng")]
    pub language: String,
    /// Deadline for the websocket connect + handshake
    #[clap(long, env, default_value_t = 15)]
    pub feed_connect_timeout_seconds: u64,
    /// Default deadline for correlated feed requests
    #[clap(long, env, default_value_t = 60)]
    pub feed_request_timeout_seconds: u64,
}

impl FeedArgs {
    pub fn to_config(&self) -> FeedConfig {
        FeedConfig {
            url: self.feed_url.clone(),
            site_id: self.partner_id,
            language: self.language.clone(),
            connect_timeout: Duration::from_secs(self.feed_connect_timeout_seconds),
            request_timeout: Duration::from_secs(self.feed_request_timeout_seconds),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct TrackerArgs {
    /// Live-tracker animation feed websocket URL
    #[clap(long, env, default_value = "wss://lt-feed.betconstruct.com/socket")]
    pub tracker_feed_url: String,
    /// Partner id for the tracker feed
    #[clap(long, env, default_value_t = 1777)]
    pub tracker_partner_id: u64,
    /// Site reference the tracker feed expects
    #[clap(long, env, default_value = "https://dob-edge.pages.dev")]
    pub tracker_site_ref: String,
    #[clap(long, env, default_value_t = 15)]
    pub tracker_connect_timeout_seconds: u64,
}

impl TrackerArgs {
    pub fn to_config(&self) -> TrackerConfig {
        TrackerConfig {
            url: self.tracker_feed_url.clone(),
            partner_id: self.tracker_partner_id,
            site_ref: self.tracker_site_ref.clone(),
            connect_timeout: Duration::from_secs(self.tracker_connect_timeout_seconds),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct HubArgs {
    /// How long a group with zero subscribers stays alive, in seconds
    #[clap(long, env, default_value_t = 30)]
    pub grace_seconds: u64,
}

impl HubArgs {
    pub fn to_config(&self) -> HubConfig {
        HubConfig {
            grace: Duration::from_secs(self.grace_seconds),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ResultsArgs {
    /// Base URL of the read-only results API
    #[clap(long, env, default_value = "https://results.betconstruct.com/api")]
    pub results_api_url: String,
    #[clap(long, env, default_value_t = 5)]
    pub results_connect_timeout_seconds: u64,
    #[clap(long, env, default_value_t = 20)]
    pub results_request_timeout_seconds: u64,
}

impl ResultsArgs {
    pub fn to_args(&self) -> ResultsClientArgs {
        ResultsClientArgs {
            base_url: self.results_api_url.clone(),
            connect_timeout: Duration::from_secs(self.results_connect_timeout_seconds),
            socket_timeout: Duration::from_secs(self.results_request_timeout_seconds),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct PersistenceArgs {
    /// Folder for JSON backups of the hierarchy cache and metrics aggregate
    #[clap(long, env)]
    pub backup_folder: Option<PathBuf>,
    /// Redis connection URL; takes precedence over the backup folder
    #[clap(long, env)]
    pub redis_url: Option<String>,
}

impl PersistenceArgs {
    pub fn build(&self) -> Option<Arc<dyn HubPersistence>> {
        if let Some(url) = self.redis_url.as_deref() {
            match RedisPersister::new(url) {
                Ok(persister) => return Some(Arc::new(persister)),
                Err(e) => warn!("could not configure redis persistence: {e}"),
            }
        }
        self.backup_folder
            .as_deref()
            .map(|folder| Arc::new(FilePersister::new(folder)) as Arc<dyn HubPersistence>)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "dob-edge", version, about = "Real-time sports-data fan-out hub")]
pub struct CliArgs {
    #[clap(flatten)]
    pub http: HttpServerArgs,
    #[clap(flatten)]
    pub feed: FeedArgs,
    #[clap(flatten)]
    pub tracker: TrackerArgs,
    #[clap(flatten)]
    pub hub: HubArgs,
    #[clap(flatten)]
    pub results: ResultsArgs,
    #[clap(flatten)]
    pub persistence: PersistenceArgs,
    #[clap(long, env, default_value = "plain", value_enum)]
    pub log_format: LogFormat,
}
