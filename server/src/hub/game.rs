use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::HubError;
use crate::fingerprint::game_fingerprint;
use crate::hub::broadcaster::named_event;
use crate::hub::gate::EmitGate;
use crate::hub::{
    GAME_FALLBACK_POLL, GroupCmd, GroupCtx, GroupHandle, GroupKey, HEARTBEAT, resubscribe_delay,
};
use crate::normalize::extract_game;
use crate::types::{ErrorPayload, GamePayload, now_millis};

pub fn spawn(ctx: GroupCtx, game_id: u64) -> GroupHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = GroupHandle { tx: tx.clone() };
    tokio::spawn(run(ctx, game_id, tx, rx));
    handle
}

fn game_what() -> Value {
    json!({
        "game": [
            "id", "type", "start_ts", "team1_name", "team2_name", "markets_count",
            "is_blocked", "is_live", "show_type", "text_info", "info", "last_event",
            "sport_id", "region_id", "competition_id", "stats", "match_length"
        ],
        "market": [
            "id", "type", "name", "display_key", "display_sub_key", "is_blocked",
            "order", "col_count", "base", "express_id"
        ],
        "event": ["id", "price", "base", "order", "type", "name", "base2"],
    })
}

struct GameGroup {
    ctx: GroupCtx,
    game_id: u64,
    group_id: String,
    self_tx: mpsc::UnboundedSender<GroupCmd>,
    subid: Option<String>,
    gate: EmitGate,
    last_game: Option<GamePayload>,
    grace_deadline: Option<Instant>,
    resubscribe_at: Option<Instant>,
    exiting: bool,
}

async fn run(
    ctx: GroupCtx,
    game_id: u64,
    self_tx: mpsc::UnboundedSender<GroupCmd>,
    mut rx: mpsc::UnboundedReceiver<GroupCmd>,
) {
    let group_id = GroupKey::Game { game_id }.to_string();
    let mut group = GameGroup {
        ctx,
        game_id,
        group_id,
        self_tx,
        subid: None,
        gate: EmitGate::default(),
        last_game: None,
        grace_deadline: None,
        resubscribe_at: Some(Instant::now()),
        exiting: false,
    };
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let mut session_events = group.ctx.session.subscribe_events();
    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut fallback_poll = tokio::time::interval(GAME_FALLBACK_POLL);
    fallback_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while !group.exiting {
        let grace_at = group.grace_deadline;
        let resubscribe_at = group.resubscribe_at;
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(GroupCmd::Attach { reply }) => group.handle_attach(reply),
                Some(GroupCmd::Sweep) => group.refresh_grace(),
                None => break,
            },
            Some(doc) = updates_rx.recv() => group.handle_update(&doc),
            event = session_events.recv() => group.handle_session_event(event),
            _ = heartbeat.tick() => group.refresh_grace(),
            _ = fallback_poll.tick() => group.fallback_poll().await,
            _ = async { tokio::time::sleep_until(grace_at.unwrap()).await }, if grace_at.is_some() => {
                group.on_grace_expired();
            }
            _ = async { tokio::time::sleep_until(resubscribe_at.unwrap()).await }, if resubscribe_at.is_some() => {
                group.try_subscribe(&updates_tx).await;
            }
        }
    }

    group.teardown(&mut rx).await;
}

impl GameGroup {
    fn game_where(&self) -> Value {
        json!({"game": {"id": self.game_id}})
    }

    fn handle_attach(
        &mut self,
        reply: tokio::sync::oneshot::Sender<crate::hub::broadcaster::SseStream>,
    ) {
        self.grace_deadline = None;
        let mut replay = Vec::new();
        if let Some(payload) = self.last_game.as_ref() {
            if let Ok(event) = named_event("game", payload) {
                replay.push(event);
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

    fn handle_update(&mut self, doc: &Value) {
        let Some(game) = extract_game(doc) else {
            return;
        };
        let fingerprint = game_fingerprint(&game);
        if !self.gate.admit("game", &fingerprint) {
            return;
        }
        let payload = GamePayload {
            game_id: self.game_id,
            data: game,
            last_updated: now_millis(),
        };
        if let Err(e) = self.ctx.broadcaster.emit_json(&self.group_id, "game", &payload) {
            warn!("game emission failed: {e}");
        }
        self.last_game = Some(payload);
    }

    fn handle_session_event(
        &mut self,
        event: Result<crate::feed::session::SessionEvent, tokio::sync::broadcast::error::RecvError>,
    ) {
        use crate::feed::session::SessionEvent;
        match event {
            Ok(SessionEvent::Disconnected) => {
                self.subid = None;
                self.gate.reset("game");
                if self.ctx.broadcaster.subscriber_count(&self.group_id) > 0 {
                    self.resubscribe_at = Some(Instant::now() + resubscribe_delay());
                }
            }
            Ok(SessionEvent::Connected) => {
                if self.subid.is_none() {
                    self.resubscribe_at = Some(Instant::now());
                }
            }
            Err(_) => {}
        }
    }

    async fn try_subscribe(&mut self, updates_tx: &mpsc::UnboundedSender<Value>) {
        self.resubscribe_at = None;
        match self
            .ctx
            .session
            .subscribe(game_what(), self.game_where(), updates_tx.clone())
            .await
        {
            Ok((subid, initial)) => {
                self.subid = Some(subid);
                self.handle_update(&initial);
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

    /// Runs only while the subscription could not be established.
    async fn fallback_poll(&mut self) {
        if self.subid.is_some() || !self.ctx.session.is_connected() {
            return;
        }
        match self
            .ctx
            .session
            .one_shot(game_what(), self.game_where())
            .await
        {
            Ok(reply) => self.handle_update(&reply),
            Err(e) => {
                debug!("{} fallback poll failed: {e}", self.group_id);
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
    fn game_projection_includes_markets_and_events() {
        let what = game_what();
        assert!(what["game"].as_array().unwrap().iter().any(|f| f == "info"));
        assert!(what["market"].as_array().unwrap().iter().any(|f| f == "display_key"));
        assert!(what["event"].as_array().unwrap().iter().any(|f| f == "price"));
    }
}
