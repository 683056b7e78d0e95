use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use actix_web::body::MessageBody;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use dob_edge::feed::session::{FeedConfig, FeedSession};
use dob_edge::hierarchy::HierarchyCache;
use dob_edge::hub::broadcaster::{Broadcaster, SseStream};
use dob_edge::hub::markets::MarketPriorities;
use dob_edge::hub::{AttachOptions, CountsFeed, GroupCtx, GroupKey, GroupManager, HubConfig};

/// Stub sportsbook feed: answers the handshake, serves counts and per-game
/// subscriptions, and pushes two deltas at the per-game subscriber (one
/// content-identical, one with a changed price).
async fn spawn_feed_stub() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                let (mut sink, mut source) = ws.split();
                let mut next_subid = 0;
                while let Some(Ok(message)) = source.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    let rid = frame["rid"].as_str().unwrap_or("0").to_string();
                    match frame["command"].as_str() {
                        Some("request_session") => {
                            let reply =
                                json!({"rid": rid, "code": 0, "data": {"sid": "stub-session"}});
                            let _ = sink.send(Message::Text(reply.to_string().into())).await;
                        }
                        Some("unsubscribe") => {
                            let reply = json!({"rid": rid, "code": 0, "data": {}});
                            let _ = sink.send(Message::Text(reply.to_string().into())).await;
                        }
                        Some("get") => {
                            next_subid += 1;
                            let subid = format!("s-{next_subid}");
                            let where_clause = &frame["params"]["where"];
                            let initial = if where_clause.pointer("/game/id").is_some() {
                                json!({
                                    "game": {
                                        "42": {
                                            "id": 42,
                                            "team1_name": "Arsenal",
                                            "team2_name": "Spurs",
                                            "market": {
                                                "900": {
                                                    "id": 900,
                                                    "type": "P1XP2",
                                                    "event": {
                                                        "1": {"id": 1, "price": 1.5, "order": 0, "type": "P1"},
                                                        "2": {"id": 2, "price": 3.4, "order": 1, "type": "X"},
                                                        "3": {"id": 3, "price": 5.0, "order": 2, "type": "P2"}
                                                    }
                                                }
                                            }
                                        }
                                    }
                                })
                            } else if where_clause.pointer("/game/type") == Some(&json!(1)) {
                                json!({"sport": {"1": {"id": 1, "name": "Soccer", "game": 3}}})
                            } else {
                                json!({"sport": {"1": {"id": 1, "name": "Soccer", "game": 57}}})
                            };
                            let reply = json!({
                                "rid": rid,
                                "code": 0,
                                "data": {"subid": subid, "data": initial}
                            });
                            let _ = sink.send(Message::Text(reply.to_string().into())).await;
                            if where_clause.pointer("/game/id").is_some() {
                                // one no-op delta, then a real price move
                                tokio::time::sleep(Duration::from_millis(200)).await;
                                let unchanged = json!({
                                    "rid": "0",
                                    "data": {(subid.as_str()): {"game": {"42": {"market": {"900": {"event": {"1": {"price": 1.5}}}}}}}}
                                });
                                let _ = sink
                                    .send(Message::Text(unchanged.to_string().into()))
                                    .await;
                                tokio::time::sleep(Duration::from_millis(200)).await;
                                let changed = json!({
                                    "rid": "0",
                                    "data": {(subid.as_str()): {"game": {"42": {"market": {"900": {"event": {"1": {"price": 1.55}}}}}}}}
                                });
                                let _ =
                                    sink.send(Message::Text(changed.to_string().into())).await;
                            }
                        }
                        _ => {}
                    }
                }
            });
        }
    });
    format!("ws://{addr}")
}

fn build_manager(url: String, grace: Duration) -> Arc<GroupManager> {
    let session = FeedSession::new(FeedConfig {
        url,
        site_id: 1777,
        language: "eng".into(),
        connect_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
    });
    let hierarchy = HierarchyCache::new(session.clone(), None);
    GroupManager::new(GroupCtx {
        session,
        broadcaster: Broadcaster::new(),
        groups: Arc::new(DashMap::new()),
        counts: Arc::new(CountsFeed::default()),
        hierarchy,
        priorities: Arc::new(MarketPriorities::default()),
        config: HubConfig { grace },
    })
}

/// Reads SSE body chunks into `buf` until it contains `needle`.
async fn read_until(
    body: &mut Pin<Box<SseStream>>,
    buf: &mut String,
    needle: &str,
    deadline: Duration,
) -> bool {
    timeout(deadline, async {
        loop {
            if buf.contains(needle) {
                return true;
            }
            match poll_fn(|cx| body.as_mut().poll_next(cx)).await {
                Some(Ok(bytes)) => buf.push_str(&String::from_utf8_lossy(&bytes)),
                _ => return false,
            }
        }
    })
    .await
    .unwrap_or(false)
}

#[tokio::test]
async fn counts_subscriber_gets_ready_marker_and_both_counts() {
    let url = spawn_feed_stub().await;
    let manager = build_manager(url, Duration::from_secs(30));
    let stream = manager
        .attach(GroupKey::Counts, AttachOptions::default())
        .await
        .unwrap();
    let mut body = Box::pin(stream);
    let mut buf = String::new();

    assert!(read_until(&mut body, &mut buf, "ready", Duration::from_secs(5)).await);
    // the padding comment precedes everything else
    assert!(buf.starts_with(':'));
    assert!(read_until(&mut body, &mut buf, "event: live_counts", Duration::from_secs(5)).await);
    assert!(
        read_until(&mut body, &mut buf, "event: prematch_counts", Duration::from_secs(5)).await
    );
    assert!(buf.contains("Soccer"));
    assert!(buf.contains("\"total_games\":3") || buf.contains("\"total_games\": 3"));
}

#[tokio::test]
async fn game_stream_deduplicates_identical_deltas() {
    let url = spawn_feed_stub().await;
    let manager = build_manager(url, Duration::from_secs(30));
    let stream = manager
        .attach(GroupKey::Game { game_id: 42 }, AttachOptions::default())
        .await
        .unwrap();
    let mut body = Box::pin(stream);
    let mut buf = String::new();

    // initial snapshot, then exactly one more frame for the price move
    assert!(read_until(&mut body, &mut buf, "1.55", Duration::from_secs(5)).await);
    assert_eq!(buf.matches("event: game\n").count(), 2);
    // the unchanged delta produced no frame in between
    let _ = read_until(&mut body, &mut buf, "never-matches", Duration::from_millis(300)).await;
    assert_eq!(buf.matches("event: game\n").count(), 2);
}

#[tokio::test]
async fn grace_expiry_tears_the_group_down() {
    let url = spawn_feed_stub().await;
    let manager = build_manager(url, Duration::from_millis(500));
    let stream = manager
        .attach(GroupKey::Game { game_id: 42 }, AttachOptions::default())
        .await
        .unwrap();
    assert_eq!(manager.active_groups(), 1);
    drop(stream);

    let mut removed = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        if manager.active_groups() == 0 {
            removed = true;
            break;
        }
    }
    assert!(removed, "group should be gone after the grace period");
}
