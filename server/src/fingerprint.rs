//! Deterministic content fingerprints. These are value identities used only
//! to detect change between successive emissions; a collision merely skips
//! one emission, it never duplicates.

use itertools::Itertools;
use serde_json::Value;

use crate::types::SportCount;

fn scalar(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn field(entity: &Value, key: &str) -> String {
    scalar(entity.get(key))
}

/// Events ordered by `(order asc, id lex)`, each contributing `id:price:base`.
fn events_concat(market: &Value) -> String {
    let Some(events) = market.get("event").and_then(Value::as_object) else {
        return String::new();
    };
    events
        .iter()
        .sorted_by(|(a_key, a), (b_key, b)| {
            let a_order = a.get("order").and_then(Value::as_i64).unwrap_or(i64::MAX);
            let b_order = b.get("order").and_then(Value::as_i64).unwrap_or(i64::MAX);
            a_order.cmp(&b_order).then_with(|| a_key.cmp(b_key))
        })
        .map(|(key, event)| {
            let id = match field(event, "id") {
                ref s if s.is_empty() => key.clone(),
                s => s,
            };
            format!("{id}:{}:{}", field(event, "price"), field(event, "base"))
        })
        .join(",")
}

fn market_line(market_id: &str, market: &Value) -> String {
    format!(
        "{market_id}|{}|{}|{}|{}",
        field(market, "id"),
        field(market, "type"),
        field(market, "display_key"),
        events_concat(market)
    )
}

/// Fingerprint of one full game document: every market, sorted by market id.
pub fn game_fingerprint(game: &Value) -> String {
    let Some(markets) = game.get("market").and_then(Value::as_object) else {
        return String::new();
    };
    markets
        .iter()
        .sorted_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(market_id, market)| market_line(market_id, market))
        .join(";")
}

/// Fingerprint of one market, for per-game odds change detection.
pub fn odds_fingerprint(market: &Value) -> String {
    format!(
        "{}|{}|{}|{}",
        field(market, "id"),
        field(market, "type"),
        field(market, "display_key"),
        events_concat(market)
    )
}

/// Fingerprint of a sport's game list: the list-shaping fields of each game,
/// sorted so upstream ordering churn does not register as change.
pub fn sport_fingerprint(games: &[Value]) -> String {
    games
        .iter()
        .map(|game| {
            format!(
                "{}|{}|{}|{}|{}|{}|{}",
                field(game, "id"),
                field(game, "markets_count"),
                field(game, "text_info"),
                score_of(game),
                scalar(game.pointer("/info/current_game_state")),
                scalar(game.pointer("/info/current_game_time")),
                scalar(game.pointer("/info/add_minutes")),
            )
        })
        .sorted()
        .join(";")
}

fn score_of(game: &Value) -> String {
    let score1 = scalar(game.pointer("/info/score1"));
    let score2 = scalar(game.pointer("/info/score2"));
    if score1.is_empty() && score2.is_empty() {
        String::new()
    } else {
        format!("{score1}-{score2}")
    }
}

/// Fingerprint of a counts list.
pub fn counts_fingerprint(counts: &[SportCount]) -> String {
    counts
        .iter()
        .map(|entry| format!("{}:{}", entry.name, entry.count))
        .sorted()
        .join(",")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn market() -> Value {
        json!({
            "id": 900,
            "type": "P1XP2",
            "display_key": "WINNER",
            "event": {
                "2": {"id": 2, "price": 3.4, "base": 0, "order": 1, "type": "X"},
                "1": {"id": 1, "price": 1.5, "base": 0, "order": 0, "type": "P1"},
                "3": {"id": 3, "price": 5.25, "base": 0, "order": 2, "type": "P2"}
            }
        })
    }

    #[test]
    fn events_are_ordered_by_order_then_id() {
        let fp = odds_fingerprint(&market());
        assert_eq!(fp, "900|P1XP2|WINNER|1:1.5:0,2:3.4:0,3:5.25:0");
    }

    #[test]
    fn equal_content_has_equal_fingerprint_regardless_of_key_order() {
        let a = json!({"market": {"900": market(), "800": {"id": 800, "type": "TOTALS", "event": {}}}});
        let b = json!({"market": {"800": {"id": 800, "type": "TOTALS", "event": {}}, "900": market()}});
        assert_eq!(game_fingerprint(&a), game_fingerprint(&b));
    }

    #[test]
    fn price_change_changes_game_fingerprint() {
        let before = json!({"market": {"900": market()}});
        let mut after = before.clone();
        after["market"]["900"]["event"]["1"]["price"] = json!(1.55);
        assert_ne!(game_fingerprint(&before), game_fingerprint(&after));
    }

    #[test]
    fn sport_fingerprint_ignores_game_order() {
        let g1 = json!({"id": 1, "markets_count": 3, "text_info": "HT"});
        let g2 = json!({"id": 2, "markets_count": 5, "info": {"score1": "1", "score2": "0"}});
        assert_eq!(
            sport_fingerprint(&[g1.clone(), g2.clone()]),
            sport_fingerprint(&[g2, g1])
        );
    }

    #[test]
    fn sport_fingerprint_tracks_score_and_clock() {
        let before = json!({"id": 1, "info": {"score1": "0", "score2": "0", "current_game_time": "41"}});
        let after = json!({"id": 1, "info": {"score1": "1", "score2": "0", "current_game_time": "42"}});
        assert_ne!(
            sport_fingerprint(&[before.clone()]),
            sport_fingerprint(&[after])
        );
        // same content fingerprints identically on re-parse
        assert_eq!(
            sport_fingerprint(&[before.clone()]),
            sport_fingerprint(&[before])
        );
    }

    #[test]
    fn counts_fingerprint_sorts_by_name() {
        let a = vec![
            SportCount { name: "Tennis".into(), count: 4 },
            SportCount { name: "Soccer".into(), count: 9 },
        ];
        let b = vec![
            SportCount { name: "Soccer".into(), count: 9 },
            SportCount { name: "Tennis".into(), count: 4 },
        ];
        assert_eq!(counts_fingerprint(&a), counts_fingerprint(&b));
        let changed = vec![
            SportCount { name: "Soccer".into(), count: 10 },
            SportCount { name: "Tennis".into(), count: 4 },
        ];
        assert_ne!(counts_fingerprint(&a), counts_fingerprint(&changed));
    }
}
