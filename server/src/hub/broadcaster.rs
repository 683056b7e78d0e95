use std::collections::HashMap;
use std::sync::Arc;

use actix_web_lab::{
    sse::{self, Sse},
    util::InfallibleStream,
};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use ulid::Ulid;

use crate::types::HubResult;

/// Response body type of every SSE endpoint.
pub type SseStream = Sse<InfallibleStream<ReceiverStream<sse::Event>>>;

/// Per-subscriber write buffer. A subscriber that lets this fill up is
/// treated as dead and removed.
const CLIENT_BUFFER: usize = 64;

lazy_static! {
    /// Oversized first comment, flushed at attach to defeat intermediary
    /// response buffering.
    static ref PADDING: String = " ".repeat(2048);
}

#[derive(Debug, Clone)]
struct StreamClient {
    id: String,
    sink: mpsc::Sender<sse::Event>,
}

#[derive(Default)]
struct BroadcasterInner {
    groups: HashMap<String, Vec<StreamClient>>,
}

/// Owns every group's subscriber set and all writes to them.
///
/// Writes are non-blocking: a full or closed sink marks the subscriber dead
/// and it is removed before the next write, so one slow subscriber never
/// stalls the rest of its group.
pub struct Broadcaster {
    inner: Mutex<BroadcasterInner>,
}

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Broadcaster {
            inner: Mutex::new(BroadcasterInner::default()),
        })
    }

    /// Registers a subscriber with a group and returns its SSE response plus
    /// a clone of its sink, whose `closed()` future resolves when the peer
    /// goes away.
    ///
    /// The attach replay is written in order before the client joins the
    /// fan-out set: padding comment, `ready` comment, then the frames the
    /// group retained for late joiners.
    pub fn connect(
        &self,
        group: &str,
        replay: Vec<sse::Event>,
    ) -> (SseStream, mpsc::Sender<sse::Event>) {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let mut frames = Vec::with_capacity(replay.len() + 2);
        frames.push(sse::Event::Comment(PADDING.clone().into()));
        frames.push(sse::Event::Comment("ready".into()));
        frames.extend(replay);
        for frame in frames {
            // fresh channel, capacity exceeds any replay
            let _ = tx.try_send(frame);
        }
        let client = StreamClient {
            id: Ulid::new().to_string(),
            sink: tx.clone(),
        };
        debug!("client {} attached to {group}", client.id);
        self.inner
            .lock()
            .groups
            .entry(group.to_string())
            .or_default()
            .push(client);
        (Sse::from_infallible_receiver(rx), tx)
    }

    /// Fans one event out to a group. Subscribers whose sink rejects the
    /// write are removed atomically, before any further write is attempted.
    pub fn emit(&self, group: &str, event: sse::Event) {
        let mut inner = self.inner.lock();
        let Some(clients) = inner.groups.get_mut(group) else {
            return;
        };
        clients.retain(|client| {
            let alive = client.sink.try_send(event.clone()).is_ok();
            if !alive {
                debug!("client {} removed from {group}", client.id);
            }
            alive
        });
    }

    pub fn emit_json<T: Serialize>(&self, group: &str, event_name: &str, payload: &T) -> HubResult<()> {
        self.emit(group, named_event(event_name, payload)?);
        Ok(())
    }

    pub fn comment(&self, group: &str, text: &str) {
        self.emit(group, sse::Event::Comment(text.to_string().into()));
    }

    /// Liveness tick: a comment write doubles as the dead-subscriber sweep.
    pub fn heartbeat(&self, group: &str) {
        self.comment(group, "hb");
    }

    pub fn subscriber_count(&self, group: &str) -> usize {
        self.inner
            .lock()
            .groups
            .get(group)
            .map(|clients| clients.len())
            .unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.inner
            .lock()
            .groups
            .values()
            .map(|clients| clients.len())
            .sum()
    }

    pub fn remove_group(&self, group: &str) {
        self.inner.lock().groups.remove(group);
    }
}

pub fn named_event<T: Serialize>(name: &str, payload: &T) -> HubResult<sse::Event> {
    Ok(sse::Data::new_json(payload)?.event(name.to_string()).into())
}

pub fn data_event<T: Serialize>(payload: &T) -> HubResult<sse::Event> {
    Ok(sse::Data::new_json(payload)?.into())
}
