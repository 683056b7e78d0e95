use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::HubError;
use crate::fingerprint::counts_fingerprint;
use crate::hub::gate::EmitGate;
use crate::hub::{
    COUNTS_WATCHDOG, GroupCmd, GroupCtx, GroupHandle, GroupKey, HEARTBEAT, any_live_sport_groups,
    resubscribe_delay,
};
use crate::normalize::{id_of, unwrap_data};
use crate::types::{CountsPayload, ErrorPayload, SportCount, StreamMode};

pub const LIVE_COUNTS_EVENT: &str = "live_counts";
pub const PREMATCH_COUNTS_EVENT: &str = "prematch_counts";

pub fn spawn(ctx: GroupCtx) -> GroupHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = GroupHandle { tx: tx.clone() };
    tokio::spawn(run(ctx, tx, rx));
    handle
}

fn counts_what() -> Value {
    json!({"sport": ["id", "name", "alias"], "game": "@count"})
}

fn live_where() -> Value {
    json!({"game": {"type": 1}})
}

fn prematch_where() -> Value {
    json!({"game": {"type": {"@in": [0, 2]}}})
}

/// Per-sport counts from a `@count` projection: each sport entry carries its
/// name and the matching game count.
pub fn parse_counts(doc: &Value) -> Vec<SportCount> {
    let doc = unwrap_data(doc);
    let Some(sports) = doc.get("sport").and_then(Value::as_object) else {
        return Vec::new();
    };
    sports
        .values()
        .filter_map(|sport| {
            let name = sport.get("name").and_then(Value::as_str)?.to_string();
            let count = sport
                .get("game")
                .and_then(|g| {
                    id_of(g).or_else(|| g.as_object().map(|games| games.len() as u64))
                })
                .unwrap_or(0);
            Some(SportCount { name, count })
        })
        .collect()
}

struct CountsGroup {
    ctx: GroupCtx,
    group_id: String,
    self_tx: mpsc::UnboundedSender<GroupCmd>,
    gate: EmitGate,
    live_subid: Option<String>,
    prematch_subid: Option<String>,
    grace_deadline: Option<Instant>,
    resubscribe_at: Option<Instant>,
    exiting: bool,
}

async fn run(
    ctx: GroupCtx,
    self_tx: mpsc::UnboundedSender<GroupCmd>,
    mut rx: mpsc::UnboundedReceiver<GroupCmd>,
) {
    let mut group = CountsGroup {
        group_id: GroupKey::Counts.to_string(),
        self_tx,
        ctx,
        gate: EmitGate::default(),
        live_subid: None,
        prematch_subid: None,
        grace_deadline: None,
        resubscribe_at: Some(Instant::now()),
        exiting: false,
    };
    let (live_tx, mut live_rx) = mpsc::unbounded_channel();
    let (prematch_tx, mut prematch_rx) = mpsc::unbounded_channel();
    let mut session_events = group.ctx.session.subscribe_events();
    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut watchdog = tokio::time::interval(COUNTS_WATCHDOG);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while !group.exiting {
        let grace_at = group.grace_deadline;
        let resubscribe_at = group.resubscribe_at;
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(GroupCmd::Attach { reply }) => group.handle_attach(reply),
                Some(GroupCmd::Sweep) => group.refresh_grace(),
                None => break,
            },
            Some(doc) = live_rx.recv() => group.handle_counts(StreamMode::Live, &doc),
            Some(doc) = prematch_rx.recv() => group.handle_counts(StreamMode::Prematch, &doc),
            event = session_events.recv() => group.handle_session_event(event),
            _ = heartbeat.tick() => group.refresh_grace(),
            _ = watchdog.tick() => group.watchdog_poll().await,
            _ = async { tokio::time::sleep_until(grace_at.unwrap()).await }, if grace_at.is_some() => {
                group.on_grace_expired();
            }
            _ = async { tokio::time::sleep_until(resubscribe_at.unwrap()).await }, if resubscribe_at.is_some() => {
                group.try_subscribe(&live_tx, &prematch_tx).await;
            }
        }
    }

    group.teardown(&mut rx).await;
}

impl CountsGroup {
    fn handle_attach(&mut self, reply: tokio::sync::oneshot::Sender<crate::hub::broadcaster::SseStream>) {
        self.grace_deadline = None;
        let mut replay = Vec::new();
        if let Some(payload) = self.ctx.counts.last_live() {
            if let Ok(event) = crate::hub::broadcaster::named_event(LIVE_COUNTS_EVENT, &payload) {
                replay.push(event);
            }
        }
        if let Some(payload) = self.ctx.counts.last_prematch() {
            if let Ok(event) =
                crate::hub::broadcaster::named_event(PREMATCH_COUNTS_EVENT, &payload)
            {
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

    fn handle_counts(&mut self, mode: StreamMode, doc: &Value) {
        let counts = parse_counts(doc);
        let event_name = match mode {
            StreamMode::Live => LIVE_COUNTS_EVENT,
            StreamMode::Prematch => PREMATCH_COUNTS_EVENT,
        };
        let fingerprint = counts_fingerprint(&counts);
        if !self.gate.admit(event_name, &fingerprint) {
            return;
        }
        let payload = CountsPayload::new(counts);
        match mode {
            StreamMode::Live => self.ctx.counts.publish_live(payload.clone()),
            StreamMode::Prematch => self.ctx.counts.publish_prematch(payload.clone()),
        }
        if let Err(e) = self
            .ctx
            .broadcaster
            .emit_json(&self.group_id, event_name, &payload)
        {
            warn!("counts emission failed: {e}");
        }
    }

    fn handle_session_event(
        &mut self,
        event: Result<crate::feed::session::SessionEvent, tokio::sync::broadcast::error::RecvError>,
    ) {
        use crate::feed::session::SessionEvent;
        match event {
            Ok(SessionEvent::Disconnected) => {
                self.live_subid = None;
                self.prematch_subid = None;
                self.gate.reset(LIVE_COUNTS_EVENT);
                self.gate.reset(PREMATCH_COUNTS_EVENT);
                if self.should_stay_alive() {
                    self.resubscribe_at = Some(Instant::now() + resubscribe_delay());
                }
            }
            Ok(SessionEvent::Connected) => {
                if self.live_subid.is_none() || self.prematch_subid.is_none() {
                    self.resubscribe_at = Some(Instant::now());
                }
            }
            Err(_) => {}
        }
    }

    async fn try_subscribe(
        &mut self,
        live_tx: &mpsc::UnboundedSender<Value>,
        prematch_tx: &mpsc::UnboundedSender<Value>,
    ) {
        self.resubscribe_at = None;
        if self.live_subid.is_none() {
            match self
                .ctx
                .session
                .subscribe(counts_what(), live_where(), live_tx.clone())
                .await
            {
                Ok((subid, initial)) => {
                    self.live_subid = Some(subid);
                    self.handle_counts(StreamMode::Live, &initial);
                }
                Err(e) => return self.subscribe_failed(e),
            }
        }
        if self.prematch_subid.is_none() {
            match self
                .ctx
                .session
                .subscribe(counts_what(), prematch_where(), prematch_tx.clone())
                .await
            {
                Ok((subid, initial)) => {
                    self.prematch_subid = Some(subid);
                    self.handle_counts(StreamMode::Prematch, &initial);
                }
                Err(e) => self.subscribe_failed(e),
            }
        }
    }

    fn subscribe_failed(&mut self, e: HubError) {
        debug!("counts subscribe failed: {e}");
        let _ = self.ctx.broadcaster.emit_json(
            &self.group_id,
            "error",
            &ErrorPayload::from(&e),
        );
        self.resubscribe_at = Some(Instant::now() + resubscribe_delay());
    }

    /// Stagnation guard: re-issues the one-shot counts queries; the gate
    /// keeps unchanged results silent.
    async fn watchdog_poll(&mut self) {
        if !self.ctx.session.is_connected() {
            return;
        }
        match self.ctx.session.one_shot(counts_what(), live_where()).await {
            Ok(reply) => self.handle_counts(StreamMode::Live, &reply),
            Err(e) => debug!("counts watchdog live query failed: {e}"),
        }
        match self
            .ctx
            .session
            .one_shot(counts_what(), prematch_where())
            .await
        {
            Ok(reply) => self.handle_counts(StreamMode::Prematch, &reply),
            Err(e) => debug!("counts watchdog prematch query failed: {e}"),
        }
    }

    fn should_stay_alive(&self) -> bool {
        self.ctx.broadcaster.subscriber_count(&self.group_id) > 0
            || any_live_sport_groups(&self.ctx.groups)
    }

    fn refresh_grace(&mut self) {
        self.ctx.broadcaster.heartbeat(&self.group_id);
        if self.should_stay_alive() {
            self.grace_deadline = None;
        } else if self.grace_deadline.is_none() {
            self.grace_deadline = Some(Instant::now() + self.ctx.config.grace);
        }
    }

    fn on_grace_expired(&mut self) {
        self.grace_deadline = None;
        if !self.should_stay_alive() {
            debug!("counts group idle past grace; shutting down");
            self.exiting = true;
        }
    }

    async fn teardown(&mut self, rx: &mut mpsc::UnboundedReceiver<GroupCmd>) {
        for subid in [self.live_subid.take(), self.prematch_subid.take()]
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
