use serde_json::Value;

use crate::normalize::id_of;

/// Phases and free-text markers that mean a game is over. Matched
/// case-insensitively as substrings.
const FINISH_MARKERS: [&str; 5] = ["finished", "final", "ended", "after penalties", "game over"];

fn text_matches_finish(text: &str) -> bool {
    let lowered = text.to_lowercase();
    FINISH_MARKERS.iter().any(|marker| lowered.contains(marker))
}

fn is_explicit_false(value: &Value) -> bool {
    match value {
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_i64() == Some(0),
        Value::String(s) => s == "0" || s == "false",
        _ => false,
    }
}

fn is_outright(game: &Value) -> bool {
    game.get("show_type")
        .and_then(Value::as_str)
        .map(|t| t.eq_ignore_ascii_case("outright"))
        .unwrap_or(false)
}

fn is_finished(game: &Value) -> bool {
    if let Some(state) = game
        .pointer("/info/current_game_state")
        .and_then(Value::as_str)
    {
        if text_matches_finish(state) {
            return true;
        }
    }
    for field in ["last_event", "text_info"] {
        if let Some(text) = game.get(field).and_then(Value::as_str) {
            if text_matches_finish(text) {
                return true;
            }
        }
    }
    false
}

/// Live list membership: in-play match type, not an outright, not over, and
/// not explicitly flagged non-live.
pub fn is_live_listable(game: &Value) -> bool {
    if game.get("type").and_then(id_of) != Some(1) {
        return false;
    }
    if is_outright(game) || is_finished(game) {
        return false;
    }
    if let Some(is_live) = game.get("is_live") {
        if is_explicit_false(is_live) {
            return false;
        }
    }
    true
}

/// Prematch list membership: visible in the prematch book, or one of the
/// prematch match types.
pub fn is_prematch_listable(game: &Value) -> bool {
    if game
        .get("visible_in_prematch")
        .and_then(id_of)
        .map(|v| v == 1)
        .unwrap_or(false)
    {
        return true;
    }
    matches!(game.get("type").and_then(id_of), Some(0) | Some(2))
}
