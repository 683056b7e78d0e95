use std::collections::HashSet;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::HubError;
use crate::filters::{is_live_listable, is_prematch_listable};
use crate::fingerprint::sport_fingerprint;
use crate::hub::broadcaster::named_event;
use crate::hub::counts::PREMATCH_COUNTS_EVENT;
use crate::hub::gate::{EmitGate, OddsCache};
use crate::hub::markets::game_odds;
use crate::hub::{
    CountsEvent, FEATURED_WINDOW_SECS, GroupCmd, GroupCtx, GroupHandle, GroupKey, HEARTBEAT,
    ODDS_CHUNK, ODDS_CURSOR_TICK, ODDS_REFRESH_AGE_SECS, PREMATCH_POLL, resubscribe_delay,
};
use crate::normalize::{extract_games, game_id};
use crate::types::{
    ErrorPayload, GamesPayload, OddsPayload, OddsUpdate, StreamMode, now_millis,
};

pub fn spawn(
    ctx: GroupCtx,
    mode: StreamMode,
    sport_id: u64,
    sport_name: Option<String>,
) -> GroupHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = GroupHandle { tx: tx.clone() };
    tokio::spawn(run(ctx, mode, sport_id, sport_name, tx, rx));
    handle
}

fn games_what() -> Value {
    json!({
        "sport": ["id", "name", "alias"],
        "region": ["id", "name"],
        "competition": ["id", "name"],
        "game": [
            "id", "type", "start_ts", "team1_name", "team2_name", "markets_count",
            "is_blocked", "is_live", "show_type", "text_info", "info", "last_event",
            "visible_in_prematch", "sport_id", "region_id", "competition_id"
        ],
    })
}

fn odds_what() -> Value {
    json!({
        "game": ["id", "markets_count"],
        "market": ["id", "type", "display_key", "is_blocked", "order"],
        "event": ["id", "price", "base", "order", "type", "name"],
    })
}

struct SportGroup {
    ctx: GroupCtx,
    mode: StreamMode,
    sport_id: u64,
    sport_name: String,
    group_id: String,
    self_tx: mpsc::UnboundedSender<GroupCmd>,
    priority: Vec<String>,
    games_subid: Option<String>,
    odds_subid: Option<String>,
    featured_subid: Option<String>,
    game_ids: Vec<u64>,
    games_gate: EmitGate,
    odds_cache: OddsCache,
    last_games: Option<GamesPayload>,
    grace_deadline: Option<Instant>,
    resubscribe_at: Option<Instant>,
    exiting: bool,
}

async fn run(
    ctx: GroupCtx,
    mode: StreamMode,
    sport_id: u64,
    sport_name: Option<String>,
    self_tx: mpsc::UnboundedSender<GroupCmd>,
    mut rx: mpsc::UnboundedReceiver<GroupCmd>,
) {
    let group_id = GroupKey::Sport { mode, sport_id }.to_string();
    let resolved_name = sport_name
        .or_else(|| ctx.hierarchy.sport_name(sport_id))
        .unwrap_or_else(|| format!("Sport {sport_id}"));
    let mut group = SportGroup {
        ctx,
        mode,
        sport_id,
        sport_name: resolved_name,
        group_id,
        self_tx,
        priority: Vec::new(),
        games_subid: None,
        odds_subid: None,
        featured_subid: None,
        game_ids: Vec::new(),
        games_gate: EmitGate::default(),
        odds_cache: OddsCache::default(),
        last_games: None,
        grace_deadline: None,
        resubscribe_at: Some(Instant::now()),
        exiting: false,
    };
    let (games_tx, mut games_rx) = mpsc::unbounded_channel();
    let (odds_tx, mut odds_rx) = mpsc::unbounded_channel();
    let mut counts_rx = group.ctx.counts.subscribe();
    let mut session_events = group.ctx.session.subscribe_events();
    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut poll = tokio::time::interval(PREMATCH_POLL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut odds_cursor = tokio::time::interval(ODDS_CURSOR_TICK);
    odds_cursor.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let is_live = mode == StreamMode::Live;

    while !group.exiting {
        let grace_at = group.grace_deadline;
        let resubscribe_at = group.resubscribe_at;
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(GroupCmd::Attach { reply }) => group.handle_attach(reply),
                Some(GroupCmd::Sweep) => group.refresh_grace(),
                None => break,
            },
            Some(doc) = games_rx.recv() => group.handle_games(&doc),
            Some(doc) = odds_rx.recv() => group.handle_odds(&doc),
            event = counts_rx.recv(), if is_live => group.forward_counts(event),
            event = session_events.recv() => group.handle_session_event(event),
            _ = heartbeat.tick() => group.refresh_grace(),
            _ = poll.tick() => group.poll_games().await,
            _ = odds_cursor.tick(), if !is_live => group.poll_odds_chunk().await,
            _ = async { tokio::time::sleep_until(grace_at.unwrap()).await }, if grace_at.is_some() => {
                group.on_grace_expired();
            }
            _ = async { tokio::time::sleep_until(resubscribe_at.unwrap()).await }, if resubscribe_at.is_some() => {
                group.try_subscribe(&games_tx, &odds_tx).await;
            }
        }
    }

    group.teardown(&mut rx).await;
}

impl SportGroup {
    fn games_where(&self) -> Value {
        match self.mode {
            StreamMode::Live => json!({"sport": {"id": self.sport_id}, "game": {"type": 1}}),
            StreamMode::Prematch => {
                json!({"sport": {"id": self.sport_id}, "game": {"type": {"@in": [0, 2]}}})
            }
        }
    }

    fn handle_attach(
        &mut self,
        reply: tokio::sync::oneshot::Sender<crate::hub::broadcaster::SseStream>,
    ) {
        self.grace_deadline = None;
        let mut replay = Vec::new();
        if self.mode == StreamMode::Live {
            if let Some(payload) = self.ctx.counts.last_live() {
                if let Ok(event) = named_event("counts", &payload) {
                    replay.push(event);
                }
            }
            if let Some(payload) = self.ctx.counts.last_prematch() {
                if let Ok(event) = named_event(PREMATCH_COUNTS_EVENT, &payload) {
                    replay.push(event);
                }
            }
        }
        if let Some(payload) = self.last_games.as_ref() {
            if let Ok(event) = named_event("games", payload) {
                replay.push(event);
            }
        }
        if !self.odds_cache.is_empty() {
            for chunk in self.odds_chunks(self.odds_cache.snapshot()) {
                if let Ok(event) = named_event("odds", &chunk) {
                    replay.push(event);
                }
            }
        }
        let (stream, sink) = self.ctx.broadcaster.connect(&self.group_id, replay);
        let watcher_tx = self.self_tx.clone();
        tokio::spawn(async move {
            sink.closed().await;
            let _ = watcher_tx.send(GroupCmd::Sweep);
        });
        let _ = reply.send(stream);
    }

    fn listable(&self, game: &Value) -> bool {
        match self.mode {
            StreamMode::Live => is_live_listable(game),
            StreamMode::Prematch => is_prematch_listable(game),
        }
    }

    fn handle_games(&mut self, doc: &Value) {
        let games: Vec<Value> = extract_games(doc)
            .into_iter()
            .filter(|game| self.listable(game))
            .collect();
        self.game_ids = games.iter().filter_map(game_id).collect();
        let keep: HashSet<u64> = self.game_ids.iter().copied().collect();
        self.odds_cache.retain_games(&keep);
        if let Some(name) = games
            .first()
            .and_then(|g| g.get("sport"))
            .and_then(Value::as_str)
        {
            self.sport_name = name.to_string();
        }
        let fingerprint = sport_fingerprint(&games);
        if !self.games_gate.admit("games", &fingerprint) {
            return;
        }
        let payload = GamesPayload {
            sport_id: self.sport_id,
            sport_name: self.sport_name.clone(),
            data: games,
            last_updated: now_millis(),
        };
        if let Err(e) = self.ctx.broadcaster.emit_json(&self.group_id, "games", &payload) {
            warn!("games emission failed: {e}");
        }
        self.last_games = Some(payload);
    }

    fn odds_chunks(&self, updates: Vec<OddsUpdate>) -> Vec<OddsPayload> {
        updates
            .chunks(ODDS_CHUNK)
            .map(|chunk| OddsPayload {
                sport_id: self.sport_id,
                competition_id: None,
                updates: chunk.to_vec(),
            })
            .collect()
    }

    fn emit_odds(&self, updates: Vec<OddsUpdate>) {
        for payload in self.odds_chunks(updates) {
            if let Err(e) = self.ctx.broadcaster.emit_json(&self.group_id, "odds", &payload) {
                warn!("odds emission failed: {e}");
            }
        }
    }

    fn handle_odds(&mut self, doc: &Value) {
        let now = Utc::now();
        let mut changed = Vec::new();
        for game in extract_games(doc) {
            let Some(id) = game_id(&game) else { continue };
            let odds = game_odds(&game, &self.priority);
            if let Some(update) =
                self.odds_cache
                    .upsert(id, odds.odds, odds.markets_count, odds.fingerprint, now)
            {
                changed.push(update);
            }
        }
        self.odds_cache.enforce_bounds(now);
        if !changed.is_empty() {
            self.emit_odds(changed);
        }
        if !self.odds_cache.is_empty() && self.odds_cache.snapshot_due(now) {
            self.emit_odds(self.odds_cache.snapshot());
        }
    }

    fn forward_counts(
        &mut self,
        event: Result<CountsEvent, tokio::sync::broadcast::error::RecvError>,
    ) {
        let (name, payload) = match event {
            Ok(CountsEvent::Live(payload)) => ("counts", payload),
            Ok(CountsEvent::Prematch(payload)) => (PREMATCH_COUNTS_EVENT, payload),
            Err(_) => return,
        };
        if let Err(e) = self.ctx.broadcaster.emit_json(&self.group_id, name, &payload) {
            warn!("counts forward failed: {e}");
        }
    }

    fn handle_session_event(
        &mut self,
        event: Result<crate::feed::session::SessionEvent, tokio::sync::broadcast::error::RecvError>,
    ) {
        use crate::feed::session::SessionEvent;
        match event {
            Ok(SessionEvent::Disconnected) => {
                self.games_subid = None;
                self.odds_subid = None;
                self.featured_subid = None;
                self.games_gate.reset("games");
                if self.ctx.broadcaster.subscriber_count(&self.group_id) > 0 {
                    self.resubscribe_at = Some(Instant::now() + resubscribe_delay());
                }
            }
            Ok(SessionEvent::Connected) => {
                if self.needs_subscriptions() {
                    self.resubscribe_at = Some(Instant::now());
                }
            }
            Err(_) => {}
        }
    }

    fn needs_subscriptions(&self) -> bool {
        match self.mode {
            StreamMode::Live => self.games_subid.is_none() || self.odds_subid.is_none(),
            StreamMode::Prematch => self.featured_subid.is_none(),
        }
    }

    async fn ensure_priority(&mut self) {
        if self.priority.is_empty() {
            self.priority = self
                .ctx
                .priorities
                .for_sport(&self.ctx.session, self.sport_id, Some(&self.sport_name))
                .await;
        }
    }

    async fn try_subscribe(
        &mut self,
        games_tx: &mpsc::UnboundedSender<Value>,
        odds_tx: &mpsc::UnboundedSender<Value>,
    ) {
        self.resubscribe_at = None;
        self.ensure_priority().await;
        match self.mode {
            StreamMode::Live => {
                if self.games_subid.is_none() {
                    match self
                        .ctx
                        .session
                        .subscribe(games_what(), self.games_where(), games_tx.clone())
                        .await
                    {
                        Ok((subid, initial)) => {
                            self.games_subid = Some(subid);
                            self.handle_games(&initial);
                        }
                        Err(e) => return self.subscribe_failed(e),
                    }
                }
                if self.odds_subid.is_none() {
                    let where_clause = json!({
                        "sport": {"id": self.sport_id},
                        "game": {"type": 1},
                        "market": {"type": {"@in": self.priority}},
                    });
                    match self
                        .ctx
                        .session
                        .subscribe(odds_what(), where_clause, odds_tx.clone())
                        .await
                    {
                        Ok((subid, initial)) => {
                            self.odds_subid = Some(subid);
                            self.handle_odds(&initial);
                        }
                        Err(e) => self.subscribe_failed(e),
                    }
                }
            }
            StreamMode::Prematch => {
                if self.featured_subid.is_none() {
                    let cutoff = Utc::now().timestamp() + FEATURED_WINDOW_SECS;
                    let where_clause = json!({
                        "sport": {"id": self.sport_id},
                        "game": {"type": {"@in": [0, 2]}, "start_ts": {"@lt": cutoff}},
                        "market": {"type": {"@in": self.priority}},
                    });
                    match self
                        .ctx
                        .session
                        .subscribe(odds_what(), where_clause, odds_tx.clone())
                        .await
                    {
                        Ok((subid, initial)) => {
                            self.featured_subid = Some(subid);
                            self.handle_odds(&initial);
                        }
                        Err(e) => self.subscribe_failed(e),
                    }
                }
            }
        }
    }

    /// Subscribe rejections leave the group in polling mode; the next timer
    /// tick retries.
    fn subscribe_failed(&mut self, e: HubError) {
        debug!("{} subscribe failed: {e}", self.group_id);
        let _ = self
            .ctx
            .broadcaster
            .emit_json(&self.group_id, "error", &ErrorPayload::from(&e));
        self.resubscribe_at = Some(Instant::now() + resubscribe_delay());
    }

    /// Prematch always polls its game list; live only as a fallback while
    /// the subscription is down.
    async fn poll_games(&mut self) {
        let poll_needed = match self.mode {
            StreamMode::Prematch => true,
            StreamMode::Live => self.games_subid.is_none(),
        };
        if !poll_needed {
            return;
        }
        match self
            .ctx
            .session
            .one_shot(games_what(), self.games_where())
            .await
        {
            Ok(reply) => self.handle_games(&reply),
            Err(e) => {
                debug!("{} games poll failed: {e}", self.group_id);
                if matches!(e, HubError::RequestTimeout(_)) {
                    let _ = self.ctx.broadcaster.emit_json(
                        &self.group_id,
                        "error",
                        &ErrorPayload::from(&e),
                    );
                }
            }
        }
    }

    /// Cursor-driven prematch odds refresh: the next chunk of game ids whose
    /// cache entry is missing or older than the refresh age. Upserts refresh
    /// entry timestamps, which rotates the cursor naturally.
    async fn poll_odds_chunk(&mut self) {
        if self.game_ids.is_empty() {
            return;
        }
        self.ensure_priority().await;
        let due = self.odds_cache.due_for_refresh(
            &self.game_ids,
            ChronoDuration::seconds(ODDS_REFRESH_AGE_SECS),
            Utc::now(),
        );
        let chunk: Vec<u64> = due.into_iter().take(ODDS_CHUNK).collect();
        if chunk.is_empty() {
            return;
        }
        let where_clause = json!({
            "game": {"id": {"@in": chunk}},
            "market": {"type": {"@in": self.priority}},
        });
        match self.ctx.session.one_shot(odds_what(), where_clause).await {
            Ok(reply) => self.handle_odds(&reply),
            Err(e) => debug!("{} odds chunk poll failed: {e}", self.group_id),
        }
    }

    fn refresh_grace(&mut self) {
        self.ctx.broadcaster.heartbeat(&self.group_id);
        if self.ctx.broadcaster.subscriber_count(&self.group_id) > 0 {
            self.grace_deadline = None;
        } else if self.grace_deadline.is_none() {
            self.grace_deadline = Some(Instant::now() + self.ctx.config.grace);
        }
    }

    fn on_grace_expired(&mut self) {
        self.grace_deadline = None;
        if self.ctx.broadcaster.subscriber_count(&self.group_id) == 0 {
            debug!("{} idle past grace; shutting down", self.group_id);
            self.exiting = true;
        }
    }

    async fn teardown(&mut self, rx: &mut mpsc::UnboundedReceiver<GroupCmd>) {
        for subid in [
            self.games_subid.take(),
            self.odds_subid.take(),
            self.featured_subid.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.ctx.session.unsubscribe(&subid).await;
        }
        self.ctx.broadcaster.remove_group(&self.group_id);
        rx.close();
        while rx.recv().await.is_some() {}
        self.ctx
            .groups
            .remove_if(&self.group_id, |_, handle| handle.tx.is_closed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn games_projection_includes_list_shaping_fields() {
        let what = games_what();
        let fields = what["game"].as_array().unwrap();
        for required in ["id", "markets_count", "text_info", "info", "is_live"] {
            assert!(fields.iter().any(|f| f == required), "missing {required}");
        }
    }

    #[test]
    fn odds_projection_carries_market_and_event_shape() {
        let what = odds_what();
        assert!(what["market"].as_array().unwrap().iter().any(|f| f == "type"));
        assert!(what["event"].as_array().unwrap().iter().any(|f| f == "price"));
    }
}
