use actix_web::{Responder, get, web};
use serde::Deserialize;

use crate::api::sse_response;
use crate::error::HubError;
use crate::hub::{AttachOptions, GroupKey, GroupManager};
use crate::tracker::LiveTracker;
use crate::types::{HubResult, StreamMode};

fn required<T>(value: Option<T>, name: &str) -> HubResult<T> {
    value.ok_or_else(|| HubError::BadRequest(format!("missing required query parameter {name}")))
}

#[derive(Debug, Deserialize)]
pub struct SportQuery {
    #[serde(rename = "sportId")]
    sport_id: Option<u64>,
    #[serde(rename = "sportName")]
    sport_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GameQuery {
    #[serde(rename = "gameId")]
    game_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CompetitionQuery {
    #[serde(rename = "competitionId")]
    competition_id: Option<u64>,
    #[serde(rename = "sportId")]
    sport_id: Option<u64>,
    mode: Option<String>,
    #[serde(rename = "sportName")]
    sport_name: Option<String>,
}

#[get("/counts-stream")]
pub async fn counts_stream(manager: web::Data<GroupManager>) -> HubResult<impl Responder> {
    let stream = manager
        .attach(GroupKey::Counts, AttachOptions::default())
        .await?;
    Ok(sse_response(stream))
}

#[get("/live-stream")]
pub async fn live_stream(
    manager: web::Data<GroupManager>,
    query: web::Query<SportQuery>,
) -> HubResult<impl Responder> {
    let query = query.into_inner();
    let sport_id = required(query.sport_id, "sportId")?;
    let stream = manager
        .attach(
            GroupKey::Sport {
                mode: StreamMode::Live,
                sport_id,
            },
            AttachOptions {
                sport_name: query.sport_name,
                sport_id: Some(sport_id),
            },
        )
        .await?;
    Ok(sse_response(stream))
}

#[get("/prematch-stream")]
pub async fn prematch_stream(
    manager: web::Data<GroupManager>,
    query: web::Query<SportQuery>,
) -> HubResult<impl Responder> {
    let query = query.into_inner();
    let sport_id = required(query.sport_id, "sportId")?;
    let stream = manager
        .attach(
            GroupKey::Sport {
                mode: StreamMode::Prematch,
                sport_id,
            },
            AttachOptions {
                sport_name: query.sport_name,
                sport_id: Some(sport_id),
            },
        )
        .await?;
    Ok(sse_response(stream))
}

#[get("/live-game-stream")]
pub async fn live_game_stream(
    manager: web::Data<GroupManager>,
    query: web::Query<GameQuery>,
) -> HubResult<impl Responder> {
    let game_id = required(query.into_inner().game_id, "gameId")?;
    let stream = manager
        .attach(GroupKey::Game { game_id }, AttachOptions::default())
        .await?;
    Ok(sse_response(stream))
}

#[get("/competition-odds-stream")]
pub async fn competition_odds_stream(
    manager: web::Data<GroupManager>,
    query: web::Query<CompetitionQuery>,
) -> HubResult<impl Responder> {
    let query = query.into_inner();
    let competition_id = required(query.competition_id, "competitionId")?;
    let sport_id = required(query.sport_id, "sportId")?;
    let mode: StreamMode = required(query.mode, "mode")?.parse()?;
    let stream = manager
        .attach(
            GroupKey::CompetitionOdds {
                mode,
                competition_id,
            },
            AttachOptions {
                sport_name: query.sport_name,
                sport_id: Some(sport_id),
            },
        )
        .await?;
    Ok(sse_response(stream))
}

#[get("/live-tracker")]
pub async fn live_tracker(
    tracker: web::Data<LiveTracker>,
    query: web::Query<GameQuery>,
) -> HubResult<impl Responder> {
    let game_id = required(query.into_inner().game_id, "gameId")?;
    let stream = tracker.into_inner().attach(game_id).await?;
    Ok(sse_response(stream))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(counts_stream)
        .service(live_stream)
        .service(prematch_stream)
        .service(live_game_stream)
        .service(competition_odds_stream)
        .service(live_tracker);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_parameters_turn_into_bad_requests() {
        let missing: HubResult<u64> = required(None, "sportId");
        match missing {
            Err(HubError::BadRequest(msg)) => assert!(msg.contains("sportId")),
            other => panic!("expected BadRequest, got {other:?}"),
        }
        assert_eq!(required(Some(7u64), "sportId").unwrap(), 7);
    }

    #[test]
    fn mode_parsing_rejects_unknown_modes() {
        let mode: HubResult<StreamMode> = "live".parse().map_err(Into::into);
        assert_eq!(mode.unwrap(), StreamMode::Live);
        assert!("later".parse::<StreamMode>().is_err());
    }
}
