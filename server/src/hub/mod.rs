use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::error::HubError;
use crate::feed::session::FeedSession;
use crate::hierarchy::HierarchyCache;
use crate::hub::broadcaster::{Broadcaster, SseStream};
use crate::hub::markets::MarketPriorities;
use crate::types::{CountsPayload, HubResult, StreamMode};

pub mod broadcaster;
pub mod competition;
pub mod counts;
pub mod game;
pub mod gate;
pub mod markets;
pub mod sport;

/// Liveness comment cadence; also the sweep cadence for dead subscribers.
pub const HEARTBEAT: Duration = Duration::from_secs(15);
/// Counts stagnation watchdog.
pub const COUNTS_WATCHDOG: Duration = Duration::from_secs(15);
/// Prematch game-list poll cadence.
pub const PREMATCH_POLL: Duration = Duration::from_secs(5);
/// Prematch odds cursor tick.
pub const ODDS_CURSOR_TICK: Duration = Duration::from_millis(2500);
/// Re-poll odds entries older than this.
pub const ODDS_REFRESH_AGE_SECS: i64 = 60;
/// Odds query chunk size; also the per-frame bound on odds updates.
pub const ODDS_CHUNK: usize = 30;
/// Fallback poll cadence when a per-game subscribe is rejected.
pub const GAME_FALLBACK_POLL: Duration = Duration::from_secs(5);
/// Featured-odds window for near-kickoff prematch games.
pub const FEATURED_WINDOW_SECS: i64 = 2 * 3600;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long a group with zero subscribers is kept alive.
    pub grace: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            grace: Duration::from_secs(30),
        }
    }
}

/// Natural key of a fan-out group. The display form is the broadcaster group
/// id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Counts,
    Sport { mode: StreamMode, sport_id: u64 },
    Game { game_id: u64 },
    CompetitionOdds { mode: StreamMode, competition_id: u64 },
}

impl Display for GroupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupKey::Counts => write!(f, "counts"),
            GroupKey::Sport { mode, sport_id } => write!(f, "{mode}:{sport_id}"),
            GroupKey::Game { game_id } => write!(f, "game:{game_id}"),
            GroupKey::CompetitionOdds {
                mode,
                competition_id,
            } => write!(f, "competition:{mode}:{competition_id}"),
        }
    }
}

impl GroupKey {
    pub fn is_live_sport(&self) -> bool {
        matches!(
            self,
            GroupKey::Sport {
                mode: StreamMode::Live,
                ..
            }
        )
    }
}

/// Control messages into a group task.
pub enum GroupCmd {
    Attach { reply: oneshot::Sender<SseStream> },
    /// A subscriber's connection ended; sweep and re-check emptiness.
    Sweep,
}

#[derive(Clone)]
pub struct GroupHandle {
    pub tx: mpsc::UnboundedSender<GroupCmd>,
}

/// Counts flow both to counts-stream subscribers and to every live
/// sport-games group. This is the one-way back-edge: the counts group
/// publishes here, live sport groups subscribe and re-emit. The last
/// payloads are retained for attach replay.
pub struct CountsFeed {
    tx: broadcast::Sender<CountsEvent>,
    last_live: RwLock<Option<CountsPayload>>,
    last_prematch: RwLock<Option<CountsPayload>>,
}

#[derive(Debug, Clone)]
pub enum CountsEvent {
    Live(CountsPayload),
    Prematch(CountsPayload),
}

impl Default for CountsFeed {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(32);
        CountsFeed {
            tx,
            last_live: RwLock::new(None),
            last_prematch: RwLock::new(None),
        }
    }
}

impl CountsFeed {
    pub fn subscribe(&self) -> broadcast::Receiver<CountsEvent> {
        self.tx.subscribe()
    }

    pub fn publish_live(&self, payload: CountsPayload) {
        *self.last_live.write() = Some(payload.clone());
        let _ = self.tx.send(CountsEvent::Live(payload));
    }

    pub fn publish_prematch(&self, payload: CountsPayload) {
        *self.last_prematch.write() = Some(payload.clone());
        let _ = self.tx.send(CountsEvent::Prematch(payload));
    }

    pub fn last_live(&self) -> Option<CountsPayload> {
        self.last_live.read().clone()
    }

    pub fn last_prematch(&self) -> Option<CountsPayload> {
        self.last_prematch.read().clone()
    }
}

/// Everything a group task needs. Cloned into each spawned group.
#[derive(Clone)]
pub struct GroupCtx {
    pub session: Arc<FeedSession>,
    pub broadcaster: Arc<Broadcaster>,
    pub groups: Arc<DashMap<String, GroupHandle>>,
    pub counts: Arc<CountsFeed>,
    pub hierarchy: Arc<HierarchyCache>,
    pub priorities: Arc<MarketPriorities>,
    pub config: HubConfig,
}

/// Attach-time hints from the request query. Only consulted when the attach
/// creates the group.
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    pub sport_name: Option<String>,
    pub sport_id: Option<u64>,
}

/// Owns the group table. Groups are spawned lazily on first attach and
/// remove themselves after their grace period expires.
pub struct GroupManager {
    ctx: GroupCtx,
}

impl GroupManager {
    pub fn new(ctx: GroupCtx) -> Arc<Self> {
        Arc::new(GroupManager { ctx })
    }

    pub fn ctx(&self) -> &GroupCtx {
        &self.ctx
    }

    /// Attaches one SSE subscriber to the group for `key`, creating the
    /// group if needed. The returned stream already carries the attach
    /// replay.
    pub async fn attach(&self, key: GroupKey, opts: AttachOptions) -> HubResult<SseStream> {
        // live sport streams re-emit counts, so the counts group must run
        if key.is_live_sport() {
            self.ensure_group(&GroupKey::Counts, &AttachOptions::default());
        }
        for _ in 0..3 {
            let tx = self.ensure_group(&key, &opts);
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(GroupCmd::Attach { reply: reply_tx }).is_ok() {
                if let Ok(stream) = reply_rx.await {
                    return Ok(stream);
                }
            }
            // raced a group that was tearing down; replace and retry
            let group_id = key.to_string();
            self.ctx
                .groups
                .remove_if(&group_id, |_, handle| handle.tx.is_closed());
        }
        Err(HubError::Fatal(format!(
            "group {key} would not accept an attach"
        )))
    }

    fn ensure_group(&self, key: &GroupKey, opts: &AttachOptions) -> mpsc::UnboundedSender<GroupCmd> {
        let group_id = key.to_string();
        let mut entry = self
            .ctx
            .groups
            .entry(group_id.clone())
            .or_insert_with(|| {
                debug!("spawning group {group_id}");
                spawn_group(self.ctx.clone(), key, opts)
            });
        if entry.tx.is_closed() {
            *entry.value_mut() = spawn_group(self.ctx.clone(), key, opts);
        }
        entry.tx.clone()
    }

    pub fn active_groups(&self) -> usize {
        self.ctx.groups.len()
    }
}

fn spawn_group(ctx: GroupCtx, key: &GroupKey, opts: &AttachOptions) -> GroupHandle {
    match key {
        GroupKey::Counts => counts::spawn(ctx),
        GroupKey::Sport { mode, sport_id } => {
            sport::spawn(ctx, *mode, *sport_id, opts.sport_name.clone())
        }
        GroupKey::Game { game_id } => game::spawn(ctx, *game_id),
        GroupKey::CompetitionOdds {
            mode,
            competition_id,
        } => competition::spawn(
            ctx,
            *mode,
            *competition_id,
            opts.sport_id.unwrap_or(0),
            opts.sport_name.clone(),
        ),
    }
}

/// Used by the counts group to stay alive while any live sport group exists.
pub fn any_live_sport_groups(groups: &DashMap<String, GroupHandle>) -> bool {
    groups
        .iter()
        .any(|entry| entry.key().starts_with("live:") && !entry.value().tx.is_closed())
}

/// Jittered re-subscribe delay, to avoid a thundering herd after reconnect.
pub fn resubscribe_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(1000..5000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_keys_have_stable_display_forms() {
        assert_eq!(GroupKey::Counts.to_string(), "counts");
        assert_eq!(
            GroupKey::Sport {
                mode: StreamMode::Live,
                sport_id: 1
            }
            .to_string(),
            "live:1"
        );
        assert_eq!(GroupKey::Game { game_id: 42 }.to_string(), "game:42");
        assert_eq!(
            GroupKey::CompetitionOdds {
                mode: StreamMode::Prematch,
                competition_id: 545
            }
            .to_string(),
            "competition:prematch:545"
        );
    }

    #[test]
    fn live_sport_keys_are_detected() {
        assert!(
            GroupKey::Sport {
                mode: StreamMode::Live,
                sport_id: 3
            }
            .is_live_sport()
        );
        assert!(
            !GroupKey::Sport {
                mode: StreamMode::Prematch,
                sport_id: 3
            }
            .is_live_sport()
        );
        assert!(!GroupKey::Counts.is_live_sport());
    }

    #[test]
    fn counts_feed_retains_last_payloads() {
        let feed = CountsFeed::default();
        assert!(feed.last_live().is_none());
        feed.publish_live(CountsPayload::new(vec![]));
        assert!(feed.last_live().is_some());
        assert!(feed.last_prematch().is_none());
    }

    #[tokio::test]
    async fn counts_feed_fans_out_to_subscribers() {
        let feed = CountsFeed::default();
        let mut rx = feed.subscribe();
        feed.publish_prematch(CountsPayload::new(vec![]));
        assert!(matches!(
            rx.recv().await.unwrap(),
            CountsEvent::Prematch(_)
        ));
    }

    #[test]
    fn live_group_detection_scans_key_prefixes() {
        let groups: DashMap<String, GroupHandle> = DashMap::new();
        assert!(!any_live_sport_groups(&groups));
        let (tx, _rx) = mpsc::unbounded_channel();
        groups.insert("prematch:1".into(), GroupHandle { tx: tx.clone() });
        assert!(!any_live_sport_groups(&groups));
        groups.insert("live:1".into(), GroupHandle { tx });
        assert!(any_live_sport_groups(&groups));
    }
}
