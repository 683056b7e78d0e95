use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::types::{OddsRow, OddsUpdate};

/// Upper bound on cached per-game odds entries per group.
pub const MAX_CACHE: usize = 1000;
/// Entries untouched for this long are dropped on the next emission pass.
pub fn odds_ttl() -> Duration {
    Duration::hours(1)
}
/// Minimum spacing of coalesced full snapshots.
pub fn snapshot_every() -> Duration {
    Duration::seconds(15)
}

/// Last-sent fingerprint per event kind. An emission passes when the
/// fingerprint differs from the last sent one, or nothing was sent yet.
#[derive(Debug, Default)]
pub struct EmitGate {
    last: HashMap<String, String>,
}

impl EmitGate {
    /// Records and passes the payload when it differs from the previous one
    /// of the same kind.
    pub fn admit(&mut self, kind: &str, fingerprint: &str) -> bool {
        match self.last.get(kind) {
            Some(previous) if previous == fingerprint => false,
            _ => {
                self.last.insert(kind.to_string(), fingerprint.to_string());
                true
            }
        }
    }

    pub fn reset(&mut self, kind: &str) {
        self.last.remove(kind);
    }
}

#[derive(Debug, Clone)]
pub struct OddsCacheEntry {
    pub odds: Option<Vec<OddsRow>>,
    pub markets_count: u64,
    pub fingerprint: String,
    pub updated_at: DateTime<Utc>,
}

/// Per-group bounded cache of the last odds sent per game. Sits between a
/// freshly computed payload and the broadcaster: only changed games pass,
/// and the cache doubles as the source of the coalesced attach-replay
/// snapshot.
#[derive(Debug)]
pub struct OddsCache {
    entries: HashMap<u64, OddsCacheEntry>,
    max_entries: usize,
    ttl: Duration,
    last_snapshot_at: Option<DateTime<Utc>>,
}

impl Default for OddsCache {
    fn default() -> Self {
        OddsCache::new(MAX_CACHE, odds_ttl())
    }
}

impl OddsCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        OddsCache {
            entries: HashMap::new(),
            max_entries,
            ttl,
            last_snapshot_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compares `(fingerprint, markets_count)` against the cached entry and
    /// returns the update to emit when either differs or the game is new.
    /// Unchanged entries have their timestamp refreshed so they age from the
    /// last confirmation, not the last change.
    pub fn upsert(
        &mut self,
        game_id: u64,
        odds: Option<Vec<OddsRow>>,
        markets_count: u64,
        fingerprint: String,
        now: DateTime<Utc>,
    ) -> Option<OddsUpdate> {
        let changed = match self.entries.get(&game_id) {
            Some(entry) => {
                entry.fingerprint != fingerprint || entry.markets_count != markets_count
            }
            None => true,
        };
        self.entries.insert(
            game_id,
            OddsCacheEntry {
                odds: odds.clone(),
                markets_count,
                fingerprint,
                updated_at: now,
            },
        );
        changed.then_some(OddsUpdate {
            game_id,
            odds,
            markets_count,
        })
    }

    /// Game ids among `candidates` with no cache entry or one older than
    /// `max_age`. Order of `candidates` is preserved.
    pub fn due_for_refresh(
        &self,
        candidates: &[u64],
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Vec<u64> {
        candidates
            .iter()
            .copied()
            .filter(|id| {
                self.entries
                    .get(id)
                    .map(|entry| now - entry.updated_at > max_age)
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Opportunistic bound enforcement: TTL prune, then oldest-by-update
    /// eviction down to the cap.
    pub fn enforce_bounds(&mut self, now: DateTime<Utc>) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| now - entry.updated_at <= ttl);
        if self.entries.len() <= self.max_entries {
            return;
        }
        let mut by_age: Vec<(u64, DateTime<Utc>)> = self
            .entries
            .iter()
            .map(|(id, entry)| (*id, entry.updated_at))
            .collect();
        by_age.sort_by_key(|(_, updated_at)| *updated_at);
        let excess = self.entries.len() - self.max_entries;
        for (id, _) in by_age.into_iter().take(excess) {
            self.entries.remove(&id);
        }
    }

    /// Drops games that fell out of the group's game list.
    pub fn retain_games(&mut self, keep: &std::collections::HashSet<u64>) {
        self.entries.retain(|id, _| keep.contains(id));
    }

    /// The coalesced union of the latest per-game entries, ordered by game
    /// id for determinism.
    pub fn snapshot(&self) -> Vec<OddsUpdate> {
        let mut updates: Vec<OddsUpdate> = self
            .entries
            .iter()
            .map(|(id, entry)| OddsUpdate {
                game_id: *id,
                odds: entry.odds.clone(),
                markets_count: entry.markets_count,
            })
            .collect();
        updates.sort_by_key(|u| u.game_id);
        updates
    }

    /// True at most once per snapshot interval; records the emission time.
    pub fn snapshot_due(&mut self, now: DateTime<Utc>) -> bool {
        let due = self
            .last_snapshot_at
            .map(|at| now - at >= snapshot_every())
            .unwrap_or(true);
        if due {
            self.last_snapshot_at = Some(now);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(price: f64) -> Option<Vec<OddsRow>> {
        Some(vec![OddsRow {
            label: "1".into(),
            price,
            blocked: false,
        }])
    }

    #[test]
    fn gate_admits_first_and_changed_only() {
        let mut gate = EmitGate::default();
        assert!(gate.admit("games", "fp-a"));
        assert!(!gate.admit("games", "fp-a"));
        assert!(gate.admit("games", "fp-b"));
        assert!(gate.admit("odds", "fp-a"));
    }

    #[test]
    fn upsert_emits_new_and_changed_games_only() {
        let mut cache = OddsCache::default();
        let now = Utc::now();
        assert!(cache.upsert(42, rows(1.5), 10, "fp-a".into(), now).is_some());
        assert!(cache.upsert(42, rows(1.5), 10, "fp-a".into(), now).is_none());
        assert!(cache.upsert(42, rows(1.55), 10, "fp-b".into(), now).is_some());
    }

    #[test]
    fn markets_count_change_emits_even_with_equal_fingerprint() {
        let mut cache = OddsCache::default();
        let now = Utc::now();
        cache.upsert(42, rows(1.5), 10, "fp-a".into(), now);
        let update = cache.upsert(42, rows(1.5), 11, "fp-a".into(), now);
        assert_eq!(update.unwrap().markets_count, 11);
    }

    #[test]
    fn unchanged_upsert_refreshes_entry_age() {
        let mut cache = OddsCache::default();
        let t0 = Utc::now();
        cache.upsert(42, rows(1.5), 10, "fp-a".into(), t0);
        let t1 = t0 + Duration::seconds(90);
        cache.upsert(42, rows(1.5), 10, "fp-a".into(), t1);
        let due = cache.due_for_refresh(&[42], Duration::seconds(60), t1 + Duration::seconds(30));
        assert!(due.is_empty());
    }

    #[test]
    fn due_for_refresh_lists_missing_and_aged_entries() {
        let mut cache = OddsCache::default();
        let t0 = Utc::now();
        cache.upsert(1, rows(1.5), 5, "a".into(), t0);
        cache.upsert(2, rows(2.5), 5, "b".into(), t0 - Duration::seconds(120));
        let due = cache.due_for_refresh(&[1, 2, 3], Duration::seconds(60), t0);
        assert_eq!(due, vec![2, 3]);
    }

    #[test]
    fn bounds_drop_expired_then_oldest() {
        let mut cache = OddsCache::new(2, Duration::hours(1));
        let now = Utc::now();
        cache.upsert(1, rows(1.1), 1, "a".into(), now - Duration::hours(2));
        cache.upsert(2, rows(1.2), 1, "b".into(), now - Duration::minutes(30));
        cache.upsert(3, rows(1.3), 1, "c".into(), now - Duration::minutes(10));
        cache.upsert(4, rows(1.4), 1, "d".into(), now);
        cache.enforce_bounds(now);
        assert_eq!(cache.len(), 2);
        let snapshot = cache.snapshot();
        let ids: Vec<u64> = snapshot.iter().map(|u| u.game_id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn snapshot_is_ordered_and_coalesced() {
        let mut cache = OddsCache::default();
        let now = Utc::now();
        cache.upsert(9, rows(1.9), 2, "i".into(), now);
        cache.upsert(3, rows(1.3), 1, "c".into(), now);
        cache.upsert(9, rows(2.0), 2, "j".into(), now);
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].game_id, 3);
        assert_eq!(snapshot[1].game_id, 9);
        assert_eq!(snapshot[1].odds, rows(2.0));
    }

    #[test]
    fn snapshot_due_rate_limits() {
        let mut cache = OddsCache::default();
        let t0 = Utc::now();
        assert!(cache.snapshot_due(t0));
        assert!(!cache.snapshot_due(t0 + Duration::seconds(5)));
        assert!(cache.snapshot_due(t0 + Duration::seconds(15)));
    }
}
