use serde_json::{Map, Value};

/// Fields that mark a value as a direct entity rather than an id reference.
const ENTITY_FIELDS: [&str; 5] = ["name", "game", "competition", "market", "event"];

/// Upstream wraps payloads in one or two `data` layers depending on whether
/// the frame is a reply or a delta. Peeling is deterministic: take `data`
/// when present, then `data` again when the inner value still has one.
pub fn unwrap_data(value: &Value) -> &Value {
    let first = value.get("data").unwrap_or(value);
    first.get("data").unwrap_or(first)
}

/// Applies a delta document onto accumulated state.
///
/// Per key: null deletes, a sequence replaces, a sub-mapping merges
/// recursively, a scalar replaces. A non-mapping delta replaces the whole
/// accumulated value.
pub fn deep_merge(acc: &mut Value, delta: &Value) {
    match (acc.as_object().is_some(), delta.as_object()) {
        (true, Some(delta_map)) => {
            let acc_map = acc.as_object_mut().expect("checked above");
            for (key, incoming) in delta_map {
                match incoming {
                    Value::Null => {
                        acc_map.remove(key);
                    }
                    Value::Object(_) => {
                        let slot = acc_map
                            .entry(key.clone())
                            .or_insert_with(|| Value::Object(Map::new()));
                        if !slot.is_object() {
                            *slot = Value::Object(Map::new());
                        }
                        deep_merge(slot, incoming);
                    }
                    other => {
                        acc_map.insert(key.clone(), other.clone());
                    }
                }
            }
        }
        _ => *acc = delta.clone(),
    }
}

/// Ids arrive as numbers or numeric strings depending on the producing
/// subsystem upstream.
pub fn id_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn game_id(game: &Value) -> Option<u64> {
    game.get("id").and_then(id_of)
}

fn is_entity(value: &Value) -> bool {
    value
        .as_object()
        .map(|obj| ENTITY_FIELDS.iter().any(|f| obj.contains_key(*f)))
        .unwrap_or(false)
}

/// Children of `parent[field]`, resolving id references against the sibling
/// map `root[field]` when the held value is not entity-shaped. Falls back to
/// trying the key itself as the reference.
fn entity_children<'a>(
    parent: &'a Value,
    field: &str,
    root: &'a Value,
) -> Vec<(String, &'a Value)> {
    let Some(children) = parent.get(field).and_then(Value::as_object) else {
        return Vec::new();
    };
    let siblings = root.get(field).and_then(Value::as_object);
    children
        .iter()
        .filter_map(|(key, held)| {
            if is_entity(held) {
                return Some((key.clone(), held));
            }
            let reference = match held {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            };
            let lookup = |id: &str| {
                siblings
                    .and_then(|map| map.get(id))
                    .filter(|candidate| is_entity(candidate))
            };
            if let Some(id) = reference {
                if let Some(entity) = lookup(&id) {
                    return Some((id, entity));
                }
            }
            lookup(key).map(|entity| (key.clone(), entity))
        })
        .collect()
}

fn set_if_absent(game: &mut Map<String, Value>, key: &str, value: Value) {
    if !game.contains_key(key) {
        game.insert(key.to_string(), value);
    }
}

fn annotated_game(
    key: &str,
    game: &Value,
    sport: (&str, &Value),
    region: (&str, &Value),
    competition: (&str, &Value),
) -> Option<Value> {
    let mut out = game.clone();
    let map = out.as_object_mut()?;
    set_if_absent(map, "id", id_key_value(key));
    if let Some(id) = parse_id_key(sport.0) {
        set_if_absent(map, "sport_id", Value::from(id));
    }
    if let Some(id) = parse_id_key(region.0) {
        set_if_absent(map, "region_id", Value::from(id));
    }
    if let Some(id) = parse_id_key(competition.0) {
        set_if_absent(map, "competition_id", Value::from(id));
    }
    for (field, entity) in [
        ("sport", sport.1),
        ("region", region.1),
        ("competition", competition.1),
    ] {
        if let Some(name) = entity.get("name").and_then(Value::as_str) {
            set_if_absent(map, field, Value::from(name));
        }
    }
    Some(out)
}

fn parse_id_key(key: &str) -> Option<u64> {
    key.parse().ok()
}

fn id_key_value(key: &str) -> Value {
    parse_id_key(key).map(Value::from).unwrap_or(Value::from(key))
}

/// Extracts the games of an upstream document.
///
/// Handles the three shapes the feed produces: the full taxonomy walk
/// (sport, region, competition, game), a flat mapping keyed by game id, and
/// a plain sequence. Games from the taxonomy walk are annotated with the ids
/// and names of their ancestors; a game's own fields always win.
pub fn extract_games(document: &Value) -> Vec<Value> {
    let doc = unwrap_data(document);
    if let Some(list) = doc.as_array() {
        return list.iter().filter(|g| g.is_object()).cloned().collect();
    }
    let Some(obj) = doc.as_object() else {
        return Vec::new();
    };
    if obj.contains_key("sport") {
        let mut games = Vec::new();
        for (sport_key, sport) in entity_children(doc, "sport", doc) {
            for (region_key, region) in entity_children(sport, "region", doc) {
                for (comp_key, competition) in entity_children(region, "competition", doc) {
                    for (game_key, game) in entity_children(competition, "game", doc) {
                        if let Some(annotated) = annotated_game(
                            &game_key,
                            game,
                            (&sport_key, sport),
                            (&region_key, region),
                            (&comp_key, competition),
                        ) {
                            games.push(annotated);
                        }
                    }
                }
            }
        }
        if !games.is_empty() {
            return games;
        }
    }
    if let Some(flat) = obj.get("game").and_then(Value::as_object) {
        return flat
            .iter()
            .filter(|(_, v)| v.is_object())
            .map(|(key, v)| {
                let mut game = v.clone();
                if let Some(map) = game.as_object_mut() {
                    set_if_absent(map, "id", id_key_value(key));
                }
                game
            })
            .collect();
    }
    Vec::new()
}

/// A single game document, for per-game subscriptions. First game found in
/// any of the supported shapes.
pub fn extract_game(document: &Value) -> Option<Value> {
    extract_games(document).into_iter().next()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unwrap_peels_one_or_two_data_layers() {
        let single = json!({"data": {"sport": {}}});
        assert_eq!(unwrap_data(&single), &json!({"sport": {}}));
        let double = json!({"data": {"data": {"sport": {}}}});
        assert_eq!(unwrap_data(&double), &json!({"sport": {}}));
        let bare = json!({"sport": {}});
        assert_eq!(unwrap_data(&bare), &json!({"sport": {}}));
    }

    #[test]
    fn merge_null_deletes_and_scalars_replace() {
        let mut acc = json!({"a": 1, "b": {"x": 1, "y": 2}, "c": [1, 2]});
        deep_merge(
            &mut acc,
            &json!({"a": null, "b": {"y": 3}, "c": [9]}),
        );
        assert_eq!(acc, json!({"b": {"x": 1, "y": 3}, "c": [9]}));
    }

    #[test]
    fn merge_is_idempotent() {
        let state = json!({"game": {"42": {"markets_count": 3, "info": {"score1": "1"}}}});
        let mut acc = state.clone();
        deep_merge(&mut acc, &state);
        assert_eq!(acc, state);
    }

    #[test]
    fn merge_inserts_missing_branches() {
        let mut acc = json!({});
        deep_merge(&mut acc, &json!({"game": {"42": {"id": 42}}}));
        assert_eq!(acc, json!({"game": {"42": {"id": 42}}}));
    }

    #[test]
    fn extracts_games_from_taxonomy_walk() {
        let doc = json!({
            "sport": {
                "1": {
                    "name": "Soccer",
                    "region": {
                        "10": {
                            "name": "England",
                            "competition": {
                                "100": {
                                    "name": "Premier League",
                                    "game": {
                                        "42": {"id": 42, "team1_name": "Arsenal"}
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });
        let games = extract_games(&doc);
        assert_eq!(games.len(), 1);
        let game = &games[0];
        assert_eq!(game["id"], 42);
        assert_eq!(game["sport_id"], 1);
        assert_eq!(game["region_id"], 10);
        assert_eq!(game["competition_id"], 100);
        assert_eq!(game["sport"], "Soccer");
        assert_eq!(game["competition"], "Premier League");
    }

    #[test]
    fn resolves_id_references_against_sibling_maps() {
        let doc = json!({
            "sport": {
                "1": {"name": "Soccer", "region": {"10": "10"}}
            },
            "region": {
                "10": {
                    "name": "Spain",
                    "competition": {
                        "200": {"name": "La Liga", "game": {"7": {"id": 7}}}
                    }
                }
            }
        });
        let games = extract_games(&doc);
        assert_eq!(games.len(), 1);
        assert_eq!(games[0]["region"], "Spain");
        assert_eq!(games[0]["competition"], "La Liga");
    }

    #[test]
    fn extracts_flat_game_map_and_backfills_ids() {
        let doc = json!({"game": {"42": {"team1_name": "A"}, "43": {"id": 43}}});
        let mut games = extract_games(&doc);
        games.sort_by_key(|g| game_id(g));
        assert_eq!(games.len(), 2);
        assert_eq!(games[0]["id"], 42);
        assert_eq!(games[1]["id"], 43);
    }

    #[test]
    fn extracts_sequences_in_order() {
        let doc = json!([{"id": 1}, {"id": 2}]);
        let games = extract_games(&doc);
        assert_eq!(game_id(&games[0]), Some(1));
        assert_eq!(game_id(&games[1]), Some(2));
        // parsing twice yields the same sequence
        assert_eq!(games, extract_games(&doc));
    }

    #[test]
    fn game_ids_parse_from_numbers_and_strings() {
        assert_eq!(game_id(&json!({"id": 42})), Some(42));
        assert_eq!(game_id(&json!({"id": "42"})), Some(42));
        assert_eq!(game_id(&json!({"id": "abc"})), None);
    }
}
