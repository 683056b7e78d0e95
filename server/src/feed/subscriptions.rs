use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::normalize::deep_merge;

/// Receives the accumulated document after every applied delta.
pub type DeltaListener = mpsc::UnboundedSender<Value>;

struct SubscriptionEntry {
    state: Value,
    listener: DeltaListener,
}

/// Maps upstream subscription ids to accumulated state and the single
/// listener of the owning group. Deltas are merged here, and the merged
/// snapshot is handed to the listener, so groups only ever see whole
/// documents.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<String, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn insert(&self, subid: String, initial: Value, listener: DeltaListener) {
        self.entries.insert(
            subid,
            SubscriptionEntry {
                state: initial,
                listener,
            },
        );
    }

    pub fn remove(&self, subid: &str) {
        self.entries.remove(subid);
    }

    pub fn contains(&self, subid: &str) -> bool {
        self.entries.contains_key(subid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies one delta frame body (subscription id -> delta document).
    /// Unknown subscription ids are ignored; a closed listener drops its
    /// entry.
    pub fn apply_frame(&self, body: &Value) {
        let Some(map) = body.as_object() else {
            return;
        };
        for (subid, delta) in map {
            self.apply(subid, delta);
        }
    }

    fn apply(&self, subid: &str, delta: &Value) {
        let mut dead = false;
        if let Some(mut entry) = self.entries.get_mut(subid) {
            deep_merge(&mut entry.state, delta);
            let snapshot = entry.state.clone();
            dead = entry.listener.send(snapshot).is_err();
        }
        if dead {
            debug!("dropping subscription {subid}: listener is gone");
            self.entries.remove(subid);
        }
    }

    /// Invalidates everything. Called when the upstream session dies; groups
    /// obtain fresh subscription ids on re-subscribe.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
