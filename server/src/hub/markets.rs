use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use lazy_static::lazy_static;
use serde_json::{Value, json};
use tracing::debug;

use crate::feed::session::FeedSession;
use crate::fingerprint::odds_fingerprint;
use crate::normalize::id_of;
use crate::types::OddsRow;

lazy_static! {
    /// Match-result market types for football-like sports, in preference
    /// order.
    static ref FOOTBALL_PRIORITY: Vec<&'static str> =
        vec!["P1XP2", "W1XW2", "1X2", "MATCH_RESULT", "MATCHRESULT"];
    /// Two-way first for everything else.
    static ref DEFAULT_PRIORITY: Vec<&'static str> = vec!["P1P2", "P1XP2", "W1W2", "W1XW2"];
}

const SOCCER_SPORT_ID: u64 = 1;

pub fn is_football_like(sport_id: u64, sport_name: Option<&str>) -> bool {
    if sport_id == SOCCER_SPORT_ID {
        return true;
    }
    sport_name
        .map(|name| {
            let lowered = name.to_lowercase();
            lowered.contains("soccer") || lowered.contains("football")
        })
        .unwrap_or(false)
}

pub fn static_priority(sport_id: u64, sport_name: Option<&str>) -> Vec<String> {
    let table: &[&str] = if is_football_like(sport_id, sport_name) {
        &FOOTBALL_PRIORITY
    } else {
        &DEFAULT_PRIORITY
    };
    table.iter().map(|t| t.to_string()).collect()
}

/// Per-sport main-market preference lists. A dynamic list may be fetched
/// upstream and is cached for twelve hours; the static fallback is always
/// appended, without duplicates. An empty upstream reply is legitimate and
/// falls back cleanly.
pub struct MarketPriorities {
    cache: DashMap<u64, (DateTime<Utc>, Vec<String>)>,
    ttl: Duration,
}

impl Default for MarketPriorities {
    fn default() -> Self {
        MarketPriorities {
            cache: DashMap::new(),
            ttl: Duration::hours(12),
        }
    }
}

impl MarketPriorities {
    pub async fn for_sport(
        &self,
        session: &Arc<FeedSession>,
        sport_id: u64,
        sport_name: Option<&str>,
    ) -> Vec<String> {
        let fallback = static_priority(sport_id, sport_name);
        if let Some(cached) = self.cache.get(&sport_id) {
            let (fetched_at, dynamic) = cached.value();
            if Utc::now() - *fetched_at < self.ttl {
                return merge_priorities(dynamic, &fallback);
            }
        }
        let dynamic = match self.fetch_dynamic(session, sport_id).await {
            Ok(list) => list,
            Err(e) => {
                debug!("dynamic market priority fetch failed for sport {sport_id}: {e}");
                Vec::new()
            }
        };
        self.cache.insert(sport_id, (Utc::now(), dynamic.clone()));
        merge_priorities(&dynamic, &fallback)
    }

    async fn fetch_dynamic(
        &self,
        session: &Arc<FeedSession>,
        sport_id: u64,
    ) -> crate::types::HubResult<Vec<String>> {
        let reply = session
            .one_shot(
                json!({"market": ["type", "order"]}),
                json!({"sport": {"id": sport_id}, "market": {"main_order": 1}}),
            )
            .await?;
        Ok(parse_dynamic_priority(&reply))
    }
}

fn parse_dynamic_priority(reply: &Value) -> Vec<String> {
    let doc = crate::normalize::unwrap_data(reply);
    let Some(markets) = doc.get("market").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut typed: Vec<(i64, String)> = markets
        .values()
        .filter_map(|market| {
            let market_type = market.get("type").and_then(Value::as_str)?;
            let order = market.get("order").and_then(Value::as_i64).unwrap_or(i64::MAX);
            Some((order, market_type.to_string()))
        })
        .collect();
    typed.sort();
    typed.into_iter().map(|(_, t)| t).collect()
}

/// Dynamic list first, fallback appended, duplicates removed
/// case-insensitively while preserving first occurrence.
pub fn merge_priorities(dynamic: &[String], fallback: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    dynamic
        .iter()
        .chain(fallback.iter())
        .filter(|t| seen.insert(t.to_uppercase()))
        .cloned()
        .collect()
}

/// First market of the game matching the priority list.
pub fn main_market<'a>(game: &'a Value, priority: &[String]) -> Option<&'a Value> {
    let markets = game.get("market")?.as_object()?;
    for wanted in priority {
        let hit = markets.values().find(|market| {
            market
                .get("type")
                .and_then(Value::as_str)
                .map(|t| t.eq_ignore_ascii_case(wanted))
                .unwrap_or(false)
        });
        if hit.is_some() {
            return hit;
        }
    }
    None
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(s)) => s == "1" || s == "true",
        _ => false,
    }
}

fn sorted_events(market: &Value) -> Vec<&Value> {
    let Some(events) = market.get("event").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut list: Vec<(&String, &Value)> = events.iter().collect();
    list.sort_by(|(a_key, a), (b_key, b)| {
        let a_order = a.get("order").and_then(Value::as_i64).unwrap_or(i64::MAX);
        let b_order = b.get("order").and_then(Value::as_i64).unwrap_or(i64::MAX);
        a_order.cmp(&b_order).then_with(|| a_key.cmp(b_key))
    });
    list.into_iter().map(|(_, event)| event).collect()
}

fn event_label(event: &Value, position: usize, total: usize) -> String {
    if let Some(event_type) = event.get("type").and_then(Value::as_str) {
        match event_type.to_uppercase().as_str() {
            "P1" | "W1" => return "1".into(),
            "P2" | "W2" => return "2".into(),
            "X" => return "X".into(),
            _ => {}
        }
    }
    if let Some(name) = event.get("name").and_then(Value::as_str) {
        let lowered = name.to_lowercase();
        if lowered == "x" || lowered.contains("draw") {
            return "X".into();
        }
    }
    let positional: &[&str] = if total == 3 { &["1", "X", "2"] } else { &["1", "2"] };
    positional.get(position).copied().unwrap_or("?").to_string()
}

/// Rows for the main market: two-way `{1, 2}` or three-way `{1, X, 2}`.
/// Anything else is not a displayable main market.
pub fn odds_rows(market: &Value) -> Option<Vec<OddsRow>> {
    let events = sorted_events(market);
    if events.len() != 2 && events.len() != 3 {
        return None;
    }
    let market_blocked = truthy(market.get("is_blocked"));
    Some(
        events
            .iter()
            .enumerate()
            .map(|(position, event)| OddsRow {
                label: event_label(event, position, events.len()),
                price: event.get("price").and_then(Value::as_f64).unwrap_or(0.0),
                blocked: market_blocked || truthy(event.get("blocked")),
            })
            .collect(),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct GameOdds {
    pub odds: Option<Vec<OddsRow>>,
    pub markets_count: u64,
    pub fingerprint: String,
}

/// The emit-ready odds of one game under a priority list. A game without a
/// usable main market yields `odds: None` with an empty fingerprint, so
/// losing the market registers as a change.
pub fn game_odds(game: &Value, priority: &[String]) -> GameOdds {
    let markets_count = game
        .get("markets_count")
        .and_then(id_of)
        .unwrap_or_else(|| {
            game.get("market")
                .and_then(Value::as_object)
                .map(|m| m.len() as u64)
                .unwrap_or(0)
        });
    match main_market(game, priority).and_then(|market| {
        odds_rows(market).map(|rows| (odds_fingerprint(market), rows))
    }) {
        Some((fingerprint, rows)) => GameOdds {
            odds: Some(rows),
            markets_count,
            fingerprint,
        },
        None => GameOdds {
            odds: None,
            markets_count,
            fingerprint: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn three_way_market() -> Value {
        json!({
            "id": 900,
            "type": "P1XP2",
            "event": {
                "a": {"type": "P1", "price": 1.5, "order": 0},
                "b": {"type": "X", "price": 3.4, "order": 1},
                "c": {"type": "P2", "price": 5.25, "order": 2}
            }
        })
    }

    #[test_case(1, None, true ; "soccer by id")]
    #[test_case(6, Some("American Football"), true ; "football by name")]
    #[test_case(3, Some("Tennis"), false ; "tennis")]
    fn football_detection(sport_id: u64, name: Option<&str>, expected: bool) {
        assert_eq!(is_football_like(sport_id, name), expected);
    }

    #[test]
    fn static_tables_differ_by_sport_family() {
        assert_eq!(static_priority(1, None)[0], "P1XP2");
        assert_eq!(static_priority(3, Some("Tennis"))[0], "P1P2");
    }

    #[test]
    fn merge_prepends_dynamic_and_deduplicates() {
        let dynamic = vec!["MATCH_RESULT".to_string(), "P1XP2".to_string()];
        let fallback = static_priority(1, None);
        let merged = merge_priorities(&dynamic, &fallback);
        assert_eq!(merged[0], "MATCH_RESULT");
        assert_eq!(merged[1], "P1XP2");
        assert_eq!(
            merged.iter().filter(|t| t.eq_ignore_ascii_case("p1xp2")).count(),
            1
        );
        // fallback is always appended
        assert!(merged.iter().any(|t| t == "1X2"));
    }

    #[test]
    fn empty_dynamic_list_falls_back_to_static() {
        let merged = merge_priorities(&[], &static_priority(1, None));
        assert_eq!(merged, static_priority(1, None));
    }

    #[test]
    fn main_market_follows_priority_order() {
        let game = json!({
            "market": {
                "1": {"type": "TOTALS", "event": {}},
                "2": three_way_market()
            }
        });
        let market = main_market(&game, &static_priority(1, None)).unwrap();
        assert_eq!(market["type"], "P1XP2");
        assert!(main_market(&game, &["OUTRIGHT".to_string()]).is_none());
    }

    #[test]
    fn three_way_rows_are_labelled_1_x_2() {
        let rows = odds_rows(&three_way_market()).unwrap();
        let labels: Vec<&str> = rows.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["1", "X", "2"]);
        assert_eq!(rows[1].price, 3.4);
    }

    #[test]
    fn labels_fall_back_to_name_then_position() {
        let market = json!({
            "type": "1X2",
            "event": {
                "a": {"name": "Home", "price": 1.9, "order": 0},
                "b": {"name": "Draw", "price": 3.1, "order": 1},
                "c": {"name": "Away", "price": 4.0, "order": 2}
            }
        });
        let rows = odds_rows(&market).unwrap();
        let labels: Vec<&str> = rows.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["1", "X", "2"]);
    }

    #[test]
    fn one_event_markets_are_not_displayable() {
        let market = json!({"type": "P1P2", "event": {"a": {"type": "P1", "price": 1.0}}});
        assert!(odds_rows(&market).is_none());
    }

    #[test]
    fn blocked_flags_propagate_from_market_and_event() {
        let market = json!({
            "type": "P1P2",
            "is_blocked": 1,
            "event": {
                "a": {"type": "P1", "price": 1.5, "order": 0},
                "b": {"type": "P2", "price": 2.5, "order": 1}
            }
        });
        let rows = odds_rows(&market).unwrap();
        assert!(rows.iter().all(|r| r.blocked));
    }

    #[test]
    fn game_odds_reports_missing_main_market_as_none() {
        let game = json!({"markets_count": 4, "market": {"1": {"type": "TOTALS", "event": {}}}});
        let odds = game_odds(&game, &static_priority(1, None));
        assert!(odds.odds.is_none());
        assert_eq!(odds.markets_count, 4);
        assert!(odds.fingerprint.is_empty());
    }

    #[test]
    fn dynamic_priority_parses_in_order() {
        let reply = json!({
            "data": {
                "market": {
                    "m1": {"type": "MATCH_RESULT", "order": 2},
                    "m2": {"type": "1X2", "order": 1}
                }
            }
        });
        assert_eq!(
            parse_dynamic_priority(&reply),
            vec!["1X2".to_string(), "MATCH_RESULT".to_string()]
        );
        assert!(parse_dynamic_priority(&json!({"data": {}})).is_empty());
    }
}
