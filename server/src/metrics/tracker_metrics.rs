use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::persistence::HubPersistence;

/// A lease asserting a live-tracker instance is serving a game. Renewed by
/// batch reports; expired leases are pruned on every read.
pub const LEASE_TTL_SECS: i64 = 15;
/// Rolling per-second window length.
pub const BUCKET_WINDOW_SECS: i64 = 60;
/// Flush coalescing interval.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthLease {
    #[serde(rename = "sseClients")]
    pub sse_clients: u64,
    #[serde(rename = "upstreamConnected")]
    pub upstream_connected: bool,
    #[serde(rename = "expiresAt")]
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsTotals {
    pub messages: u64,
    pub parse_errors: u64,
    pub last_seen_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecondBucket {
    pub second: i64,
    pub count: u64,
}

/// The persisted shape of the aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedMetrics {
    pub totals: MetricsTotals,
    pub buckets: Vec<SecondBucket>,
    pub leases: HashMap<String, HealthLease>,
}

/// One batch report from a live-tracker bridge.
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeReport {
    pub messages: u64,
    pub parse_errors: u64,
    pub sse_clients: u64,
    pub upstream_connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerRollups {
    #[serde(rename = "activeGames")]
    pub active_games: usize,
    #[serde(rename = "activeSubscribers")]
    pub active_subscribers: u64,
    #[serde(rename = "upstreamConnectedGames")]
    pub upstream_connected_games: usize,
    #[serde(rename = "totalMessages")]
    pub total_messages: u64,
    #[serde(rename = "parseErrors")]
    pub parse_errors: u64,
    #[serde(rename = "messagesLastMinute")]
    pub messages_last_minute: u64,
    #[serde(rename = "lastSeenMs")]
    pub last_seen_ms: Option<i64>,
}

/// Singleton aggregator for live-tracker instances. Fire-and-forget: every
/// caller treats failures here as non-events.
#[derive(Default)]
pub struct TrackerMetrics {
    totals: Mutex<MetricsTotals>,
    buckets: Mutex<VecDeque<SecondBucket>>,
    leases: DashMap<u64, HealthLease>,
    dirty: AtomicBool,
}

impl TrackerMetrics {
    pub fn record_report(&self, game_id: u64, report: BridgeReport) {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        {
            let mut totals = self.totals.lock();
            totals.messages += report.messages;
            totals.parse_errors += report.parse_errors;
            totals.last_seen_ms = Some(now_ms);
        }
        if report.messages > 0 {
            let second = now.timestamp();
            let mut buckets = self.buckets.lock();
            match buckets.back_mut() {
                Some(bucket) if bucket.second == second => bucket.count += report.messages,
                _ => buckets.push_back(SecondBucket {
                    second,
                    count: report.messages,
                }),
            }
            while buckets
                .front()
                .map(|b| b.second < second - BUCKET_WINDOW_SECS)
                .unwrap_or(false)
            {
                buckets.pop_front();
            }
        }
        self.leases.insert(
            game_id,
            HealthLease {
                sse_clients: report.sse_clients,
                upstream_connected: report.upstream_connected,
                expires_at_ms: now_ms + LEASE_TTL_SECS * 1000,
            },
        );
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn drop_lease(&self, game_id: u64) {
        self.leases.remove(&game_id);
        self.dirty.store(true, Ordering::Relaxed);
    }

    fn prune_expired(&self) {
        let now_ms = Utc::now().timestamp_millis();
        self.leases.retain(|_, lease| lease.expires_at_ms > now_ms);
    }

    pub fn rollups(&self) -> TrackerRollups {
        self.prune_expired();
        let now = Utc::now().timestamp();
        let totals = self.totals.lock().clone();
        let messages_last_minute = self
            .buckets
            .lock()
            .iter()
            .filter(|b| b.second >= now - BUCKET_WINDOW_SECS)
            .map(|b| b.count)
            .sum();
        let mut active_games = 0;
        let mut active_subscribers = 0;
        let mut upstream_connected_games = 0;
        for lease in self.leases.iter() {
            if lease.sse_clients > 0 {
                active_games += 1;
            }
            active_subscribers += lease.sse_clients;
            if lease.upstream_connected {
                upstream_connected_games += 1;
            }
        }
        TrackerRollups {
            active_games,
            active_subscribers,
            upstream_connected_games,
            total_messages: totals.messages,
            parse_errors: totals.parse_errors,
            messages_last_minute,
            last_seen_ms: totals.last_seen_ms,
        }
    }

    pub fn snapshot(&self) -> PersistedMetrics {
        self.prune_expired();
        PersistedMetrics {
            totals: self.totals.lock().clone(),
            buckets: self.buckets.lock().iter().cloned().collect(),
            leases: self
                .leases
                .iter()
                .map(|entry| (entry.key().to_string(), entry.value().clone()))
                .collect(),
        }
    }

    pub fn restore(&self, persisted: PersistedMetrics) {
        *self.totals.lock() = persisted.totals;
        *self.buckets.lock() = persisted.buckets.into();
        self.leases.clear();
        for (game_id, lease) in persisted.leases {
            if let Ok(id) = game_id.parse() {
                self.leases.insert(id, lease);
            }
        }
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }
}

/// Opportunistic persistence: at most one write per flush interval, only
/// when something changed.
pub async fn flush_metrics_task(
    metrics: Arc<TrackerMetrics>,
    persistence: Arc<dyn HubPersistence>,
) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        interval.tick().await;
        if !metrics.take_dirty() {
            continue;
        }
        let snapshot = metrics.snapshot();
        if let Err(e) = persistence.save_tracker_metrics(&snapshot).await {
            warn!("metrics flush failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_accumulate_totals_and_buckets() {
        let metrics = TrackerMetrics::default();
        metrics.record_report(
            42,
            BridgeReport {
                messages: 50,
                parse_errors: 2,
                sse_clients: 3,
                upstream_connected: true,
            },
        );
        metrics.record_report(
            43,
            BridgeReport {
                messages: 10,
                parse_errors: 0,
                sse_clients: 0,
                upstream_connected: false,
            },
        );
        let rollups = metrics.rollups();
        assert_eq!(rollups.total_messages, 60);
        assert_eq!(rollups.parse_errors, 2);
        assert_eq!(rollups.messages_last_minute, 60);
        assert_eq!(rollups.active_games, 1);
        assert_eq!(rollups.active_subscribers, 3);
        assert_eq!(rollups.upstream_connected_games, 1);
    }

    #[test]
    fn expired_leases_are_pruned_on_read() {
        let metrics = TrackerMetrics::default();
        metrics.leases.insert(
            7,
            HealthLease {
                sse_clients: 5,
                upstream_connected: true,
                expires_at_ms: Utc::now().timestamp_millis() - 1000,
            },
        );
        let rollups = metrics.rollups();
        assert_eq!(rollups.active_games, 0);
        assert!(metrics.leases.is_empty());
    }

    #[test]
    fn snapshot_round_trips_through_restore() {
        let metrics = TrackerMetrics::default();
        metrics.record_report(
            42,
            BridgeReport {
                messages: 5,
                parse_errors: 1,
                sse_clients: 2,
                upstream_connected: true,
            },
        );
        let snapshot = metrics.snapshot();
        let restored = TrackerMetrics::default();
        restored.restore(snapshot.clone());
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[test]
    fn dirty_flag_coalesces_flushes() {
        let metrics = TrackerMetrics::default();
        assert!(!metrics.take_dirty());
        metrics.record_report(1, BridgeReport::default());
        assert!(metrics.take_dirty());
        assert!(!metrics.take_dirty());
    }

    #[test]
    fn lease_serde_uses_wire_names() {
        let lease = HealthLease {
            sse_clients: 2,
            upstream_connected: true,
            expires_at_ms: 123,
        };
        let json = serde_json::to_value(&lease).unwrap();
        assert_eq!(json["sseClients"], 2);
        assert_eq!(json["upstreamConnected"], true);
        assert_eq!(json["expiresAt"], 123);
    }
}
