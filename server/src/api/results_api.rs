use actix_web::{
    get,
    web::{self, Json},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::HubError;
use crate::http::results_client::ResultsClient;
use crate::types::{HubJsonResult, now_millis};

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    from: Option<String>,
    to: Option<String>,
}

fn parse_id(raw: &str, name: &str) -> Result<u64, HubError> {
    raw.parse()
        .map_err(|_| HubError::BadRequest(format!("{name} must be a numeric id, got {raw}")))
}

fn embedded_list(body: &Value, key: &str) -> Vec<Value> {
    body.get(key)
        .or_else(|| body.get("data"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

#[get("/results/competitions")]
pub async fn competitions(
    client: web::Data<ResultsClient>,
    query: web::Query<RangeQuery>,
) -> HubJsonResult<Value> {
    let data = client
        .competitions(query.from.as_deref(), query.to.as_deref())
        .await?;
    Ok(Json(json!({
        "success": true,
        "data": data,
        "timestamp": now_millis(),
    })))
}

#[get("/results/games/{sportId}")]
pub async fn games(
    client: web::Data<ResultsClient>,
    path: web::Path<String>,
    query: web::Query<RangeQuery>,
) -> HubJsonResult<Value> {
    let sport_id = parse_id(&path.into_inner(), "sportId")?;
    let body = client
        .games(sport_id, query.from.as_deref(), query.to.as_deref())
        .await?;
    let games = embedded_list(&body, "games");
    Ok(Json(json!({
        "success": true,
        "sportId": sport_id,
        "count": games.len(),
        "games": games,
        "timestamp": now_millis(),
    })))
}

#[get("/results/game/{gameId}")]
pub async fn game(
    client: web::Data<ResultsClient>,
    path: web::Path<String>,
) -> HubJsonResult<Value> {
    let game_id = parse_id(&path.into_inner(), "gameId")?;
    let body = client.game(game_id).await?;
    let settlements = embedded_list(&body, "settlements");
    Ok(Json(json!({
        "success": true,
        "gameId": game_id,
        "settlements": settlements,
        "raw": body,
        "timestamp": now_millis(),
    })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(competitions).service(games).service(game);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_must_be_numeric() {
        assert_eq!(parse_id("42", "gameId").unwrap(), 42);
        assert!(matches!(
            parse_id("abc", "gameId"),
            Err(HubError::BadRequest(_))
        ));
    }

    #[test]
    fn embedded_lists_fall_back_to_data_key() {
        let body = json!({"games": [{"id": 1}]});
        assert_eq!(embedded_list(&body, "games").len(), 1);
        let body = json!({"data": [{"id": 1}, {"id": 2}]});
        assert_eq!(embedded_list(&body, "games").len(), 2);
        assert!(embedded_list(&json!({}), "games").is_empty());
    }
}
