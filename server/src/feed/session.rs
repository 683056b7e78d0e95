use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::feed::messages::{self, FeedFrame, FeedRequest, SOURCE_BETTING, commands};
use crate::feed::subscriptions::{DeltaListener, SubscriptionRegistry};
use crate::types::HubResult;

/// Capacity of the rolling message-timestamp ring.
pub const RING_CAPACITY: usize = 2000;
/// Deadline for short-form snapshot queries.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub site_id: u64,
    pub language: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
}

/// Fixed-size ring of message timestamps; insertion is O(1), the rolling
/// count scans at most `RING_CAPACITY` slots.
struct TimestampRing {
    slots: Vec<i64>,
    head: usize,
    len: usize,
}

impl TimestampRing {
    fn new(capacity: usize) -> Self {
        TimestampRing {
            slots: vec![0; capacity],
            head: 0,
            len: 0,
        }
    }

    fn record(&mut self, ts_millis: i64) {
        self.slots[self.head] = ts_millis;
        self.head = (self.head + 1) % self.slots.len();
        self.len = (self.len + 1).min(self.slots.len());
    }

    fn count_since(&self, cutoff_millis: i64) -> usize {
        self.slots
            .iter()
            .take(self.len.min(self.slots.len()))
            .filter(|&&ts| ts >= cutoff_millis)
            .count()
    }
}

pub struct FeedStats {
    total_messages: AtomicU64,
    parse_errors: AtomicU64,
    ring: Mutex<TimestampRing>,
    last_seen: Mutex<Option<DateTime<Utc>>>,
}

impl Default for FeedStats {
    fn default() -> Self {
        FeedStats {
            total_messages: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            ring: Mutex::new(TimestampRing::new(RING_CAPACITY)),
            last_seen: Mutex::new(None),
        }
    }
}

impl FeedStats {
    pub fn record_message(&self) {
        let now = Utc::now();
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.ring.lock().record(now.timestamp_millis());
        *self.last_seen.lock() = Some(now);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_last_minute(&self) -> usize {
        let cutoff = Utc::now().timestamp_millis() - 60_000;
        self.ring.lock().count_since(cutoff)
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedStatsSnapshot {
    pub connected: bool,
    pub total_messages: u64,
    pub parse_errors: u64,
    pub messages_last_minute: usize,
    pub last_seen: Option<DateTime<Utc>>,
}

struct ActiveSession {
    session_id: String,
    outbound: mpsc::UnboundedSender<Message>,
    epoch: u64,
}

/// Process-wide upstream feed session. Owns at most one duplex connection:
/// outbound frames carry a unique correlation id, inbound replies resolve
/// pending requests, and delta frames flow into the subscription registry.
///
/// Created lazily on first [`ensure`](FeedSession::ensure) and re-created on
/// disconnect; a disconnect invalidates every subscription and is announced
/// on the event channel so groups with subscribers can re-subscribe.
pub struct FeedSession {
    config: FeedConfig,
    registry: Arc<SubscriptionRegistry>,
    stats: Arc<FeedStats>,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
    connected: AtomicBool,
    pending: dashmap::DashMap<u64, oneshot::Sender<HubResult<Value>>>,
    next_rid: AtomicU64,
    epoch: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl FeedSession {
    pub fn new(config: FeedConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(FeedSession {
            config,
            registry: Arc::new(SubscriptionRegistry::default()),
            stats: Arc::new(FeedStats::default()),
            active: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            pending: dashmap::DashMap::new(),
            next_rid: AtomicU64::new(1),
            epoch: AtomicU64::new(0),
            events,
        })
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn stats_snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            connected: self.is_connected(),
            total_messages: self.stats.total_messages(),
            parse_errors: self.stats.parse_errors(),
            messages_last_minute: self.stats.messages_last_minute(),
            last_seen: *self.stats.last_seen.lock(),
        }
    }

    /// Idempotent connect-and-handshake. Returns once a session token is
    /// held; concurrent callers coalesce on the connection lock.
    pub async fn ensure(self: &Arc<Self>) -> HubResult<()> {
        let mut guard = self.active.lock().await;
        if let Some(active) = guard.as_ref() {
            if !active.outbound.is_closed() {
                return Ok(());
            }
            *guard = None;
        }

        let connect = connect_async(self.config.url.as_str());
        let (stream, _) = timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                HubError::ConnectFailed(format!(
                    "connect to {} exceeded {:?}",
                    self.config.url, self.config.connect_timeout
                ))
            })?
            .map_err(|e| HubError::ConnectFailed(e.to_string()))?;

        let (mut sink, source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });
        let reader = Arc::clone(self);
        let reader_out = out_tx.clone();
        tokio::spawn(async move {
            reader.read_loop(source, reader_out, epoch).await;
        });

        let handshake = self
            .request_via(
                &out_tx,
                commands::REQUEST_SESSION,
                messages::session_params(self.config.site_id, &self.config.language),
                self.config.connect_timeout,
            )
            .await
            .map_err(|e| HubError::ConnectFailed(format!("handshake failed: {e}")))
            .and_then(|reply| messages::parse_session_reply(&reply));
        let session_id = match handshake {
            Ok(session_id) => session_id,
            Err(e) => {
                // leave no half-open connection behind
                let _ = out_tx.send(Message::Close(None));
                return Err(e);
            }
        };
        info!("feed session established");

        *guard = Some(ActiveSession {
            session_id,
            outbound: out_tx,
            epoch,
        });
        self.connected.store(true, Ordering::Relaxed);
        drop(guard);
        let _ = self.events.send(SessionEvent::Connected);
        Ok(())
    }

    pub async fn session_id(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| a.session_id.clone())
    }

    /// Correlated request against the live connection. Fails with
    /// `UpstreamGone` when no connection is up, `RequestTimeout` on expiry.
    pub async fn request(
        &self,
        command: &str,
        params: Value,
        deadline: Duration,
    ) -> HubResult<Value> {
        let outbound = {
            let guard = self.active.lock().await;
            guard
                .as_ref()
                .filter(|a| !a.outbound.is_closed())
                .map(|a| a.outbound.clone())
        }
        .ok_or(HubError::UpstreamGone)?;
        self.request_via(&outbound, command, params, deadline).await
    }

    async fn request_via(
        &self,
        outbound: &mpsc::UnboundedSender<Message>,
        command: &str,
        params: Value,
        deadline: Duration,
    ) -> HubResult<Value> {
        let rid = self.next_rid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(rid, tx);

        let frame = FeedRequest::new(command, params, rid);
        let text = serde_json::to_string(&frame)?;
        if outbound.send(Message::Text(text.into())).is_err() {
            self.pending.remove(&rid);
            return Err(HubError::UpstreamGone);
        }

        match timeout(deadline, rx).await {
            Err(_) => {
                self.pending.remove(&rid);
                Err(HubError::RequestTimeout(command.to_string()))
            }
            Ok(Err(_)) => Err(HubError::UpstreamGone),
            Ok(Ok(outcome)) => outcome,
        }
    }

    /// Subscribe and register the delta listener. Returns the subscription id
    /// and the initial document.
    pub async fn subscribe(
        self: &Arc<Self>,
        what: Value,
        where_clause: Value,
        listener: DeltaListener,
    ) -> HubResult<(String, Value)> {
        self.ensure().await?;
        let params = json!({
            "source": SOURCE_BETTING,
            "what": what,
            "where": where_clause,
            "subscribe": true,
        });
        let reply = self
            .request(commands::GET, params, self.config.request_timeout)
            .await?;
        let (subid, initial) = messages::parse_subscribe_reply(&reply)?;
        self.registry.insert(subid.clone(), initial.clone(), listener);
        debug!("subscribed {subid}");
        Ok((subid, initial))
    }

    /// One-shot query with the short snapshot deadline.
    pub async fn one_shot(self: &Arc<Self>, what: Value, where_clause: Value) -> HubResult<Value> {
        self.ensure().await?;
        let params = json!({
            "source": SOURCE_BETTING,
            "what": what,
            "where": where_clause,
        });
        self.request(commands::GET, params, SNAPSHOT_TIMEOUT).await
    }

    /// Best-effort unsubscribe; the registry entry is removed regardless of
    /// the upstream outcome.
    pub async fn unsubscribe(&self, subid: &str) {
        self.registry.remove(subid);
        if let Err(e) = self
            .request(
                commands::UNSUBSCRIBE,
                json!({ "subid": subid }),
                SNAPSHOT_TIMEOUT,
            )
            .await
        {
            debug!("unsubscribe {subid} failed: {e}");
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut source: futures_util::stream::SplitStream<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
        >,
        outbound: mpsc::UnboundedSender<Message>,
        epoch: u64,
    ) {
        while let Some(item) = source.next().await {
            match item {
                Ok(Message::Text(text)) => self.handle_frame(text.as_str()),
                Ok(Message::Ping(payload)) => {
                    let _ = outbound.send(Message::Pong(payload));
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("feed read failed: {e}");
                    break;
                }
            }
        }
        self.teardown(epoch).await;
    }

    /// Parse failures are counted but never break the loop.
    fn handle_frame(&self, text: &str) {
        self.stats.record_message();
        let frame = match FeedFrame::decode(text) {
            Ok(frame) => frame,
            Err(_) => {
                self.stats.record_parse_error();
                return;
            }
        };
        if frame.is_delta() {
            if let Some(body) = frame.data.as_ref() {
                self.registry.apply_frame(body);
            }
            return;
        }
        let Some(rid) = frame.reply_rid() else {
            self.stats.record_parse_error();
            return;
        };
        if let Some((_, reply)) = self.pending.remove(&rid) {
            let outcome = match frame.code.unwrap_or(0) {
                0 => Ok(frame.data.unwrap_or(Value::Null)),
                code => Err(HubError::SubscribeFailed(format!("upstream code {code}"))),
            };
            let _ = reply.send(outcome);
        }
    }

    async fn teardown(self: &Arc<Self>, epoch: u64) {
        {
            let mut guard = self.active.lock().await;
            match guard.as_ref() {
                Some(active) if active.epoch == epoch => *guard = None,
                // a newer connection owns the session now
                _ => return,
            }
        }
        self.connected.store(false, Ordering::Relaxed);
        let rids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for rid in rids {
            if let Some((_, reply)) = self.pending.remove(&rid) {
                let _ = reply.send(Err(HubError::UpstreamGone));
            }
        }
        self.registry.clear();
        warn!("feed session lost; subscriptions invalidated");
        let _ = self.events.send(SessionEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_counts_exactly_within_capacity() {
        let mut ring = TimestampRing::new(8);
        let now = 1_000_000;
        for offset in [-70_000i64, -59_000, -30_000, -1_000, 0] {
            ring.record(now + offset);
        }
        assert_eq!(ring.count_since(now - 60_000), 4);
    }

    #[test]
    fn ring_overwrites_oldest_when_full() {
        let mut ring = TimestampRing::new(4);
        for ts in 1..=10i64 {
            ring.record(ts);
        }
        // only the last four survive
        assert_eq!(ring.count_since(0), 4);
        assert_eq!(ring.count_since(9), 2);
    }

    #[test]
    fn stats_track_totals_and_window() {
        let stats = FeedStats::default();
        stats.record_message();
        stats.record_message();
        stats.record_parse_error();
        assert_eq!(stats.total_messages(), 2);
        assert_eq!(stats.parse_errors(), 1);
        assert_eq!(stats.messages_last_minute(), 2);
    }

    #[tokio::test]
    async fn request_without_connection_is_upstream_gone() {
        let session = FeedSession::new(FeedConfig {
            url: "wss://localhost:1/ws".into(),
            site_id: 1,
            language: "eng".into(),
            connect_timeout: Duration::from_millis(50),
            request_timeout: Duration::from_millis(50),
        });
        let outcome = session
            .request(commands::GET, json!({}), Duration::from_millis(50))
            .await;
        assert_eq!(outcome.unwrap_err(), HubError::UpstreamGone);
    }

    #[tokio::test]
    async fn connect_failure_is_connect_failed() {
        let session = FeedSession::new(FeedConfig {
            url: "ws://127.0.0.1:9/ws".into(),
            site_id: 1,
            language: "eng".into(),
            connect_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_millis(200),
        });
        match session.ensure().await {
            Err(HubError::ConnectFailed(_)) => {}
            other => panic!("expected ConnectFailed, got {other:?}"),
        }
        assert!(!session.is_connected());
    }
}
