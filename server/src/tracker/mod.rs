use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::hub::broadcaster::{Broadcaster, SseStream, named_event};
use crate::metrics::tracker_metrics::{BridgeReport, TrackerMetrics};
use crate::types::{ErrorPayload, HubResult};

/// Batch-report cadence and thresholds.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);
const REPORT_MESSAGE_THRESHOLD: u64 = 50;
const REPORT_PARSE_ERROR_THRESHOLD: u64 = 5;
const TRACKER_HEARTBEAT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub url: String,
    pub partner_id: u64,
    pub site_ref: String,
    pub connect_timeout: Duration,
}

enum BridgeCmd {
    Attach { reply: oneshot::Sender<SseStream> },
    Sweep,
}

struct BridgeHandle {
    tx: mpsc::UnboundedSender<BridgeCmd>,
}

/// Per-game bridge farm for the animation feed. Each game with at least one
/// subscriber gets its own upstream connection; frames are forwarded
/// verbatim as unnamed SSE events. The bridge disconnects when a heartbeat
/// tick observes an empty subscriber set.
pub struct LiveTracker {
    config: TrackerConfig,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<TrackerMetrics>,
    bridges: DashMap<u64, BridgeHandle>,
}

impl LiveTracker {
    pub fn new(
        config: TrackerConfig,
        broadcaster: Arc<Broadcaster>,
        metrics: Arc<TrackerMetrics>,
    ) -> Arc<Self> {
        Arc::new(LiveTracker {
            config,
            broadcaster,
            metrics,
            bridges: DashMap::new(),
        })
    }

    pub fn active_bridges(&self) -> usize {
        self.bridges.retain(|_, handle| !handle.tx.is_closed());
        self.bridges.len()
    }

    pub async fn attach(self: &Arc<Self>, game_id: u64) -> HubResult<SseStream> {
        for _ in 0..3 {
            let tx = self.ensure_bridge(game_id);
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(BridgeCmd::Attach { reply: reply_tx }).is_ok() {
                if let Ok(stream) = reply_rx.await {
                    return Ok(stream);
                }
            }
            self.bridges
                .remove_if(&game_id, |_, handle| handle.tx.is_closed());
        }
        Err(HubError::Fatal(format!(
            "live tracker bridge for game {game_id} would not accept an attach"
        )))
    }

    fn ensure_bridge(self: &Arc<Self>, game_id: u64) -> mpsc::UnboundedSender<BridgeCmd> {
        let mut entry = self.bridges.entry(game_id).or_insert_with(|| {
            debug!("spawning live tracker bridge for game {game_id}");
            self.spawn_bridge(game_id)
        });
        if entry.tx.is_closed() {
            *entry.value_mut() = self.spawn_bridge(game_id);
        }
        entry.tx.clone()
    }

    fn spawn_bridge(self: &Arc<Self>, game_id: u64) -> BridgeHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Arc::clone(self);
        let bridge_tx = tx.clone();
        tokio::spawn(async move {
            tracker.run_bridge(game_id, bridge_tx, rx).await;
        });
        BridgeHandle { tx }
    }

    fn connect_url(&self, game_id: u64) -> HubResult<String> {
        let mut url = url::Url::parse(&self.config.url)
            .map_err(|e| HubError::ConnectFailed(format!("bad tracker url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("partner", &self.config.partner_id.to_string())
            .append_pair("ref", &self.config.site_ref)
            .append_pair("gameId", &game_id.to_string());
        Ok(url.to_string())
    }

    fn register_client(
        &self,
        game_id: u64,
        group_id: &str,
        connected: bool,
        bridge_tx: &mpsc::UnboundedSender<BridgeCmd>,
        reply: oneshot::Sender<SseStream>,
    ) {
        let mut replay = Vec::new();
        if connected {
            if let Ok(event) = named_event("ready", &json!({ "gameId": game_id })) {
                replay.push(event);
            }
        }
        let (stream, sink) = self.broadcaster.connect(group_id, replay);
        let watcher = bridge_tx.clone();
        tokio::spawn(async move {
            sink.closed().await;
            let _ = watcher.send(BridgeCmd::Sweep);
        });
        let _ = reply.send(stream);
    }

    async fn run_bridge(
        self: Arc<Self>,
        game_id: u64,
        bridge_tx: mpsc::UnboundedSender<BridgeCmd>,
        mut rx: mpsc::UnboundedReceiver<BridgeCmd>,
    ) {
        let group_id = format!("tracker:{game_id}");

        // the bridge exists because a subscriber is on the way; register it
        // before dialling upstream
        match rx.recv().await {
            Some(BridgeCmd::Attach { reply }) => {
                self.register_client(game_id, &group_id, false, &bridge_tx, reply);
            }
            _ => {
                self.finish_bridge(game_id, &group_id, &mut rx).await;
                return;
            }
        }

        let stream = match self.dial(game_id).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("tracker connect for game {game_id} failed: {e}");
                let _ = self
                    .broadcaster
                    .emit_json(&group_id, "error", &ErrorPayload::from(&e));
                if let Ok(event) = named_event("end", &json!({ "gameId": game_id })) {
                    self.broadcaster.emit(&group_id, event);
                }
                self.finish_bridge(game_id, &group_id, &mut rx).await;
                return;
            }
        };
        let (mut sink, mut source) = stream.split();
        let subscribe = json!({
            "gameId": game_id,
            "feed_type": "live",
            "snapshot": true,
        });
        if let Ok(body) = serde_json::to_string(&subscribe) {
            let _ = sink.send(Message::Text(body.into())).await;
        }
        info!("tracker bridge for game {game_id} connected");
        if let Ok(event) = named_event("ready", &json!({ "gameId": game_id })) {
            self.broadcaster.emit(&group_id, event);
        }

        let mut heartbeat = tokio::time::interval(TRACKER_HEARTBEAT);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut report_tick = tokio::time::interval(REPORT_INTERVAL);
        report_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut messages: u64 = 0;
        let mut parse_errors: u64 = 0;
        let mut upstream_open = true;

        while upstream_open {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(BridgeCmd::Attach { reply }) => {
                        self.register_client(game_id, &group_id, true, &bridge_tx, reply);
                    }
                    Some(BridgeCmd::Sweep) => {
                        self.broadcaster.heartbeat(&group_id);
                    }
                    None => break,
                },
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        messages += 1;
                        if serde_json::from_str::<serde_json::Value>(text.as_str()).is_err() {
                            parse_errors += 1;
                        }
                        self.broadcaster
                            .emit(&group_id, actix_web_lab::sse::Data::new(text.to_string()).into());
                        if messages >= REPORT_MESSAGE_THRESHOLD
                            || parse_errors >= REPORT_PARSE_ERROR_THRESHOLD
                        {
                            self.report(game_id, &group_id, &mut messages, &mut parse_errors, true);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => upstream_open = false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("tracker read for game {game_id} failed: {e}");
                        upstream_open = false;
                    }
                },
                _ = heartbeat.tick() => {
                    self.broadcaster.heartbeat(&group_id);
                    if self.broadcaster.subscriber_count(&group_id) == 0 {
                        debug!("tracker bridge for game {game_id} has no subscribers; closing");
                        break;
                    }
                }
                _ = report_tick.tick() => {
                    self.report(game_id, &group_id, &mut messages, &mut parse_errors, true);
                }
            }
        }

        if !upstream_open {
            if let Ok(event) = named_event("end", &json!({ "gameId": game_id })) {
                self.broadcaster.emit(&group_id, event);
            }
        }
        let _ = sink.close().await;
        self.report(game_id, &group_id, &mut messages, &mut parse_errors, false);
        self.finish_bridge(game_id, &group_id, &mut rx).await;
    }

    async fn dial(
        &self,
        game_id: u64,
    ) -> HubResult<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let url = self.connect_url(game_id)?;
        let (stream, _) = timeout(self.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                HubError::ConnectFailed(format!(
                    "tracker connect exceeded {:?}",
                    self.config.connect_timeout
                ))
            })?
            .map_err(|e| HubError::ConnectFailed(e.to_string()))?;
        Ok(stream)
    }

    /// Fire-and-forget metrics; the bridge stays correct when this is a
    /// no-op downstream.
    fn report(
        &self,
        game_id: u64,
        group_id: &str,
        messages: &mut u64,
        parse_errors: &mut u64,
        upstream_connected: bool,
    ) {
        self.metrics.record_report(
            game_id,
            BridgeReport {
                messages: *messages,
                parse_errors: *parse_errors,
                sse_clients: self.broadcaster.subscriber_count(group_id) as u64,
                upstream_connected,
            },
        );
        *messages = 0;
        *parse_errors = 0;
    }

    async fn finish_bridge(
        &self,
        game_id: u64,
        group_id: &str,
        rx: &mut mpsc::UnboundedReceiver<BridgeCmd>,
    ) {
        self.metrics.drop_lease(game_id);
        self.broadcaster.remove_group(group_id);
        rx.close();
        while rx.recv().await.is_some() {}
        self.bridges
            .remove_if(&game_id, |_, handle| handle.tx.is_closed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> Arc<LiveTracker> {
        LiveTracker::new(
            TrackerConfig {
                url: "ws://127.0.0.1:1/feed".into(),
                partner_id: 1777,
                site_ref: "https://dob-edge.pages.dev".into(),
                connect_timeout: Duration::from_millis(100),
            },
            Broadcaster::new(),
            Arc::new(TrackerMetrics::default()),
        )
    }

    #[test]
    fn connect_url_carries_partner_and_game() {
        let url = tracker().connect_url(42).unwrap();
        assert!(url.starts_with("ws://127.0.0.1:1/feed?"));
        assert!(url.contains("partner=1777"));
        assert!(url.contains("gameId=42"));
        assert!(url.contains("ref=https"));
    }

    #[tokio::test]
    async fn attach_with_unreachable_upstream_yields_error_then_end() {
        let tracker = tracker();
        let _stream = tracker.attach(42).await.unwrap();
        // the bridge fails to dial and removes itself
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(tracker.active_bridges(), 0);
    }

    #[test]
    fn report_resets_batch_counters() {
        let tracker = tracker();
        let mut messages = 10;
        let mut parse_errors = 1;
        tracker.report(42, "tracker:42", &mut messages, &mut parse_errors, true);
        assert_eq!(messages, 0);
        assert_eq!(parse_errors, 0);
        assert_eq!(tracker.metrics.rollups().total_messages, 10);
    }
}
