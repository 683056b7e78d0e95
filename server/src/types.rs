use std::fmt::{Display, Formatter};
use std::str::FromStr;

use actix_web::web::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;

pub type HubResult<T> = Result<T, HubError>;
pub type HubJsonResult<T> = Result<Json<T>, HubError>;

/// Which side of the book a stream serves. Keys groups together with the
/// sport or competition id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Live,
    Prematch,
}

impl Display for StreamMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamMode::Live => write!(f, "live"),
            StreamMode::Prematch => write!(f, "prematch"),
        }
    }
}

impl FromStr for StreamMode {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(StreamMode::Live),
            "prematch" => Ok(StreamMode::Prematch),
            other => Err(HubError::BadRequest(format!(
                "mode must be live or prematch, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SportCount {
    pub name: String,
    pub count: u64,
}

/// Body of `live_counts` / `prematch_counts` / `counts` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountsPayload {
    pub sports: Vec<SportCount>,
    pub total_games: u64,
}

impl CountsPayload {
    pub fn new(mut sports: Vec<SportCount>) -> Self {
        sports.sort_by(|a, b| a.name.cmp(&b.name));
        let total_games = sports.iter().map(|s| s.count).sum();
        CountsPayload {
            sports,
            total_games,
        }
    }
}

/// Body of `games` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GamesPayload {
    #[serde(rename = "sportId")]
    pub sport_id: u64,
    #[serde(rename = "sportName")]
    pub sport_name: String,
    pub data: Vec<Value>,
    pub last_updated: i64,
}

/// One selection row inside an `odds` update. Labels are `1`/`2` or
/// `1`/`X`/`2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsRow {
    pub label: String,
    pub price: f64,
    pub blocked: bool,
}

/// Per-game entry inside an `odds` event. `odds: null` means the game has no
/// main market right now but is still listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsUpdate {
    #[serde(rename = "gameId")]
    pub game_id: u64,
    pub odds: Option<Vec<OddsRow>>,
    pub markets_count: u64,
}

/// Body of `odds` events. `competitionId` is set only on the competition
/// scoped variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OddsPayload {
    #[serde(rename = "sportId")]
    pub sport_id: u64,
    #[serde(rename = "competitionId", skip_serializing_if = "Option::is_none")]
    pub competition_id: Option<u64>,
    pub updates: Vec<OddsUpdate>,
}

/// Body of `game` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GamePayload {
    #[serde(rename = "gameId")]
    pub game_id: u64,
    pub data: Value,
    pub last_updated: i64,
}

/// Body of `error` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

impl From<&HubError> for ErrorPayload {
    fn from(value: &HubError) -> Self {
        ErrorPayload {
            error: value.to_string(),
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
