use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::HubError;
use crate::hub::broadcaster::named_event;
use crate::hub::gate::OddsCache;
use crate::hub::markets::game_odds;
use crate::hub::{
    GroupCmd, GroupCtx, GroupHandle, GroupKey, HEARTBEAT, ODDS_CHUNK, ODDS_CURSOR_TICK,
    ODDS_REFRESH_AGE_SECS, PREMATCH_POLL, resubscribe_delay,
};
use crate::normalize::{extract_games, game_id};
use crate::types::{ErrorPayload, OddsPayload, OddsUpdate, StreamMode};

pub fn spawn(
    ctx: GroupCtx,
    mode: StreamMode,
    competition_id: u64,
    sport_id: u64,
    sport_name: Option<String>,
) -> GroupHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = GroupHandle { tx: tx.clone() };
    tokio::spawn(run(ctx, mode, competition_id, sport_id, sport_name, tx, rx));
    handle
}

fn odds_what() -> Value {
    json!({
        "game": ["id", "markets_count", "type", "start_ts", "visible_in_prematch"],
        "market": ["id", "type", "display_key", "is_blocked", "order"],
        "event": ["id", "price", "base", "order", "type", "name"],
    })
}

fn ids_what() -> Value {
    json!({"game": ["id", "type", "start_ts", "visible_in_prematch"]})
}

fn game_type_clause(mode: StreamMode) -> Value {
    match mode {
        StreamMode::Live => json!(1),
        StreamMode::Prematch => json!({"@in": [0, 2]}),
    }
}

/// Same contract as the sport-odds machine, scoped to one competition. The
/// UI uses these groups to hydrate a collapsed or expanded tree node.
struct CompetitionGroup {
    ctx: GroupCtx,
    mode: StreamMode,
    competition_id: u64,
    sport_id: u64,
    sport_name: Option<String>,
    group_id: String,
    self_tx: mpsc::UnboundedSender<GroupCmd>,
    priority: Vec<String>,
    subid: Option<String>,
    game_ids: Vec<u64>,
    odds_cache: OddsCache,
    grace_deadline: Option<Instant>,
    resubscribe_at: Option<Instant>,
    exiting: bool,
}

async fn run(
    ctx: GroupCtx,
    mode: StreamMode,
    competition_id: u64,
    sport_id: u64,
    sport_name: Option<String>,
    self_tx: mpsc::UnboundedSender<GroupCmd>,
    mut rx: mpsc::UnboundedReceiver<GroupCmd>,
) {
    let group_id = GroupKey::CompetitionOdds {
        mode,
        competition_id,
    }
    .to_string();
    let mut group = CompetitionGroup {
        ctx,
        mode,
        competition_id,
        sport_id,
        sport_name,
        group_id,
        self_tx,
        priority: Vec::new(),
        subid: None,
        game_ids: Vec::new(),
        odds_cache: OddsCache::default(),
        grace_deadline: None,
        resubscribe_at: Some(Instant::now()),
        exiting: false,
    };
    let (odds_tx, mut odds_rx) = mpsc::unbounded_channel();
    let mut session_events = group.ctx.session.subscribe_events();
    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut poll = tokio::time::interval(PREMATCH_POLL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut odds_cursor = tokio::time::interval(ODDS_CURSOR_TICK);
    odds_cursor.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let is_prematch = mode == StreamMode::Prematch;

    while !group.exiting {
        let grace_at = group.grace_deadline;
        let resubscribe_at = group.resubscribe_at;
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(GroupCmd::Attach { reply }) => group.handle_attach(reply),
                Some(GroupCmd::Sweep) => group.refresh_grace(),
                None => break,
            },
            Some(doc) = odds_rx.recv() => group.handle_odds(&doc),
            event = session_events.recv() => group.handle_session_event(event),
            _ = heartbeat.tick() => group.refresh_grace(),
            _ = poll.tick(), if is_prematch => group.poll_game_ids().await,
            _ = odds_cursor.tick(), if is_prematch => group.poll_odds_chunk().await,
            _ = async { tokio::time::sleep_until(grace_at.unwrap()).await }, if grace_at.is_some() => {
                group.on_grace_expired();
            }
            _ = async { tokio::time::sleep_until(resubscribe_at.unwrap()).await }, if resubscribe_at.is_some() => {
                group.try_subscribe(&odds_tx).await;
            }
        }
    }

    group.teardown(&mut rx).await;
}

impl CompetitionGroup {
    fn handle_attach(
        &mut self,
        reply: tokio::sync::oneshot::Sender<crate::hub::broadcaster::SseStream>,
    ) {
        self.grace_deadline = None;
        let mut replay = Vec::new();
        if !self.odds_cache.is_empty() {
            for payload in self.odds_chunks(self.odds_cache.snapshot()) {
                if let Ok(event) = named_event("odds", &payload) {
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

    fn odds_chunks(&self, updates: Vec<OddsUpdate>) -> Vec<OddsPayload> {
        updates
            .chunks(ODDS_CHUNK)
            .map(|chunk| OddsPayload {
                sport_id: self.sport_id,
                competition_id: Some(self.competition_id),
                updates: chunk.to_vec(),
            })
            .collect()
    }

    fn emit_odds(&self, updates: Vec<OddsUpdate>) {
        for payload in self.odds_chunks(updates) {
            if let Err(e) = self.ctx.broadcaster.emit_json(&self.group_id, "odds", &payload) {
                warn!("competition odds emission failed: {e}");
            }
        }
    }

    fn handle_odds(&mut self, doc: &Value) {
        let now = Utc::now();
        let mut changed = Vec::new();
        for game in extract_games(doc) {
            let Some(id) = game_id(&game) else { continue };
            if !self.game_ids.contains(&id) {
                self.game_ids.push(id);
            }
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

    fn handle_session_event(
        &mut self,
        event: Result<crate::feed::session::SessionEvent, tokio::sync::broadcast::error::RecvError>,
    ) {
        use crate::feed::session::SessionEvent;
        match event {
            Ok(SessionEvent::Disconnected) => {
                self.subid = None;
                if self.ctx.broadcaster.subscriber_count(&self.group_id) > 0 {
                    self.resubscribe_at = Some(Instant::now() + resubscribe_delay());
                }
            }
            Ok(SessionEvent::Connected) => {
                if self.mode == StreamMode::Live && self.subid.is_none() {
                    self.resubscribe_at = Some(Instant::now());
                }
            }
            Err(_) => {}
        }
    }

    async fn ensure_priority(&mut self) {
        if self.priority.is_empty() {
            self.priority = self
                .ctx
                .priorities
                .for_sport(
                    &self.ctx.session,
                    self.sport_id,
                    self.sport_name.as_deref(),
                )
                .await;
        }
    }

    async fn try_subscribe(&mut self, odds_tx: &mpsc::UnboundedSender<Value>) {
        self.resubscribe_at = None;
        self.ensure_priority().await;
        if self.mode == StreamMode::Prematch || self.subid.is_some() {
            return;
        }
        let where_clause = json!({
            "competition": {"id": self.competition_id},
            "game": {"type": game_type_clause(self.mode)},
            "market": {"type": {"@in": self.priority}},
        });
        match self
            .ctx
            .session
            .subscribe(odds_what(), where_clause, odds_tx.clone())
            .await
        {
            Ok((subid, initial)) => {
                self.subid = Some(subid);
                self.handle_odds(&initial);
            }
            Err(e) => {
                debug!("{} subscribe failed: {e}", self.group_id);
                let _ = self.ctx.broadcaster.emit_json(
                    &self.group_id,
                    "error",
                    &ErrorPayload::from(&e),
                );
                self.resubscribe_at = Some(Instant::now() + resubscribe_delay());
            }
        }
    }

    async fn poll_game_ids(&mut self) {
        let where_clause = json!({
            "competition": {"id": self.competition_id},
            "game": {"type": game_type_clause(self.mode)},
        });
        match self.ctx.session.one_shot(ids_what(), where_clause).await {
            Ok(reply) => {
                self.game_ids = extract_games(&reply).iter().filter_map(game_id).collect();
                let keep = self.game_ids.iter().copied().collect();
                self.odds_cache.retain_games(&keep);
            }
            Err(e) => {
                debug!("{} game id poll failed: {e}", self.group_id);
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
            self.exiting = true;
        }
    }

    async fn teardown(&mut self, rx: &mut mpsc::UnboundedReceiver<GroupCmd>) {
        if let Some(subid) = self.subid.take() {
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
    fn live_and_prematch_type_clauses_differ() {
        assert_eq!(game_type_clause(StreamMode::Live), json!(1));
        assert_eq!(
            game_type_clause(StreamMode::Prematch),
            json!({"@in": [0, 2]})
        );
    }

    #[test]
    fn id_projection_is_minimal() {
        let what = ids_what();
        let fields = what["game"].as_array().unwrap();
        assert!(fields.iter().any(|f| f == "id"));
        assert!(fields.len() <= 4);
    }
}
