//! Client room behavior against an in-memory transport.
//!
//! The mock connector hands each connection's server side to the test, so
//! frames can be pushed to the room and frames the room sends can be read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tandem_collab::client::{ConnectionState, ReconnectPolicy, Room, RoomEvent, RoomOptions};
use tandem_collab::presence::CursorPosition;
use tandem_collab::transport::{Connector, Transport, TransportEvent};
use tandem_collab::RoomError;
use tandem_core::SerializedCrdt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Duration};

/// Server side of one mock connection.
struct MockServer {
    url: String,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl MockServer {
    fn push(&self, value: Value) {
        self.to_client
            .send(TransportEvent::Message(value.to_string()))
            .unwrap();
    }

    fn push_raw(&self, text: &str) {
        self.to_client
            .send(TransportEvent::Message(text.to_string()))
            .unwrap();
    }

    fn close(&self) {
        self.to_client.send(TransportEvent::Closed).unwrap();
    }

    async fn next_sent(&mut self) -> Value {
        let text = timeout(Duration::from_secs(1), self.from_client.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("transport closed");
        serde_json::from_str(&text).unwrap()
    }
}

struct MockConnector {
    sessions: mpsc::UnboundedSender<MockServer>,
    refuse: AtomicBool,
}

impl Connector for MockConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport, RoomError>> {
        let url = url.to_string();
        if self.refuse.load(Ordering::SeqCst) {
            return Box::pin(async move {
                Err(RoomError::Connect {
                    url,
                    reason: "connection refused".into(),
                })
            });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.sessions.send(MockServer {
            url,
            from_client: out_rx,
            to_client: in_tx,
        });
        Box::pin(async move {
            Ok(Transport {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

fn options() -> RoomOptions {
    let mut options = RoomOptions::new("ws://localhost:3000", "test-room", "alice", "Alice");
    options.reconnect = ReconnectPolicy::disabled();
    options
}

fn setup(
    options: RoomOptions,
) -> (
    Room,
    broadcast::Receiver<RoomEvent>,
    mpsc::UnboundedReceiver<MockServer>,
    Arc<MockConnector>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = Arc::new(MockConnector {
        sessions: tx,
        refuse: AtomicBool::new(false),
    });
    let room = Room::with_connector(options, connector.clone());
    let events = room.subscribe();
    (room, events, rx, connector)
}

async fn wait_for<F>(events: &mut broadcast::Receiver<RoomEvent>, pred: F) -> RoomEvent
where
    F: Fn(&RoomEvent) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_status(event: &RoomEvent, status: ConnectionState) -> bool {
    matches!(event, RoomEvent::Status(s) if *s == status)
}

/// Connect and return the server side once the room reports `connected`.
async fn connected(
    room: &Room,
    events: &mut broadcast::Receiver<RoomEvent>,
    sessions: &mut mpsc::UnboundedReceiver<MockServer>,
) -> MockServer {
    room.connect().await;
    let server = timeout(Duration::from_secs(1), sessions.recv())
        .await
        .unwrap()
        .unwrap();
    wait_for(events, |e| is_status(e, ConnectionState::Connected)).await;
    server
}

fn roster(users: &[(&str, Option<&str>)]) -> Value {
    let users: Vec<Value> = users
        .iter()
        .enumerate()
        .map(|(i, (id, following))| {
            let mut user = json!({
                "userId": id,
                "displayName": id.to_uppercase(),
                "color": "#336699",
                "connectedAt": i,
            });
            if let Some(target) = following {
                user["metadata"] = json!({ "following": target });
            }
            user
        })
        .collect();
    json!({ "type": "presence", "users": users })
}

fn cursor(user_id: &str, x: f64) -> Value {
    json!({
        "type": "cursor:update",
        "cursor": {
            "userId": user_id,
            "displayName": user_id,
            "color": "#336699",
            "x": x,
            "y": 0.0,
            "lastUpdate": 1,
        }
    })
}

#[tokio::test]
async fn test_connect_reports_connecting_then_connected() {
    let mut opts = options();
    opts.token = Some("my-secret-token".into());
    let (room, mut events, mut sessions, _) = setup(opts);

    room.connect().await;
    wait_for(&mut events, |e| is_status(e, ConnectionState::Connecting)).await;
    wait_for(&mut events, |e| is_status(e, ConnectionState::Connected)).await;
    assert_eq!(room.get_status().await, ConnectionState::Connected);

    let server = sessions.recv().await.unwrap();
    assert_eq!(
        server.url,
        "ws://localhost:3000/rooms/test-room?userId=alice&displayName=Alice&token=my-secret-token"
    );
}

#[tokio::test]
async fn test_presence_roster_and_self() {
    let (room, mut events, mut sessions, _) = setup(options());
    let server = connected(&room, &mut events, &mut sessions).await;
    assert!(room.get_self().await.is_none());

    server.push(roster(&[("alice", None), ("bob", None)]));
    wait_for(&mut events, |e| matches!(e, RoomEvent::Presence(_))).await;

    assert_eq!(room.get_self().await.unwrap().user_id, "alice");
    let others = room.get_others().await;
    assert_eq!(others.len(), 1);
    assert_eq!(others[0].user_id, "bob");
    assert_eq!(room.get_presence().await.len(), 2);
}

#[tokio::test]
async fn test_cursor_upsert_and_prune() {
    let (room, mut events, mut sessions, _) = setup(options());
    let server = connected(&room, &mut events, &mut sessions).await;

    server.push(roster(&[("alice", None), ("bob", None), ("carol", None)]));
    server.push(cursor("bob", 1.0));
    server.push(cursor("carol", 2.0));
    server.push(cursor("bob", 5.0));
    wait_for(&mut events, |e| {
        matches!(e, RoomEvent::Cursors(c) if c.get("bob").map(|b| b.x) == Some(5.0))
    })
    .await;
    assert_eq!(room.get_cursors().await.len(), 2);

    // Carol left: her cursor goes with her.
    server.push(roster(&[("alice", None), ("bob", None)]));
    wait_for(&mut events, |e| matches!(e, RoomEvent::Cursors(c) if c.len() == 1)).await;
    let cursors = room.get_cursors().await;
    assert!(cursors.contains_key("bob"));
    assert!(!cursors.contains_key("carol"));
}

#[tokio::test]
async fn test_custom_message_event() {
    let (room, mut events, mut sessions, _) = setup(options());
    let server = connected(&room, &mut events, &mut sessions).await;

    server.push(json!({"type": "chat", "text": "hello", "n": 2}));
    let event = wait_for(&mut events, |e| matches!(e, RoomEvent::Message(_))).await;
    match event {
        RoomEvent::Message(value) => {
            assert_eq!(value, json!({"type": "chat", "text": "hello", "n": 2}))
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frame_is_skipped() {
    let (room, mut events, mut sessions, _) = setup(options());
    let server = connected(&room, &mut events, &mut sessions).await;

    server.push_raw("not json");
    server.push_raw(r#"{"type":"presence","users":42}"#);
    server.push(json!({"type": "after"}));

    let event = wait_for(&mut events, |e| matches!(e, RoomEvent::Message(_))).await;
    assert!(matches!(event, RoomEvent::Message(v) if v["type"] == "after"));
    assert_eq!(room.get_status().await, ConnectionState::Connected);
    assert!(room.get_presence().await.is_empty());
}

#[tokio::test]
async fn test_send_serializes_json() {
    let (room, mut events, mut sessions, _) = setup(options());
    let mut server = connected(&room, &mut events, &mut sessions).await;

    room.send(&json!({"type": "test", "value": 42})).await.unwrap();
    assert_eq!(server.next_sent().await, json!({"type": "test", "value": 42}));
}

#[tokio::test]
async fn test_send_after_disconnect_is_dropped() {
    let (room, mut events, mut sessions, _) = setup(options());
    let mut server = connected(&room, &mut events, &mut sessions).await;

    room.disconnect().await;
    room.send(&json!({"type": "late"})).await.unwrap();
    assert_eq!(room.get_status().await, ConnectionState::Disconnected);
    let next = timeout(Duration::from_secs(1), server.from_client.recv())
        .await
        .unwrap();
    assert!(next.is_none(), "nothing may be sent after disconnect");
}

#[tokio::test]
async fn test_follow_and_stop_following() {
    let (room, mut events, mut sessions, _) = setup(options());
    let mut server = connected(&room, &mut events, &mut sessions).await;
    server.push(roster(&[("alice", None), ("bob", None)]));
    wait_for(&mut events, |e| matches!(e, RoomEvent::Presence(_))).await;

    room.follow_user("bob").await;
    assert_eq!(room.get_following().await.as_deref(), Some("bob"));
    assert_eq!(
        server.next_sent().await,
        json!({"type": "presence:update", "metadata": {"following": "bob"}})
    );
    assert_eq!(room.get_self().await.unwrap().following(), Some("bob"));

    room.stop_following().await;
    assert_eq!(room.get_following().await, None);
    assert_eq!(
        server.next_sent().await,
        json!({"type": "presence:update", "metadata": {"following": null}})
    );
}

#[tokio::test]
async fn test_followers_sorted() {
    let (room, mut events, mut sessions, _) = setup(options());
    let server = connected(&room, &mut events, &mut sessions).await;

    server.push(roster(&[
        ("alice", None),
        ("dave", Some("bob")),
        ("carol", Some("alice")),
        ("bob", Some("alice")),
    ]));
    wait_for(&mut events, |e| matches!(e, RoomEvent::Presence(_))).await;
    assert_eq!(room.get_followers().await, vec!["bob", "carol"]);
}

#[tokio::test]
async fn test_transport_error_keeps_status() {
    let (room, mut events, mut sessions, _) = setup(options());
    let server = connected(&room, &mut events, &mut sessions).await;

    server
        .to_client
        .send(TransportEvent::Error("reset by peer".into()))
        .unwrap();
    let event = wait_for(&mut events, |e| matches!(e, RoomEvent::Error(_))).await;
    match event {
        RoomEvent::Error(err) => assert!(err.to_string().starts_with("WebSocket error")),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(room.get_status().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_close_clears_presence_and_cursors() {
    let (room, mut events, mut sessions, _) = setup(options());
    let server = connected(&room, &mut events, &mut sessions).await;
    server.push(roster(&[("alice", None), ("bob", None)]));
    server.push(cursor("bob", 3.0));
    wait_for(&mut events, |e| matches!(e, RoomEvent::Cursors(_))).await;

    server.close();
    wait_for(&mut events, |e| is_status(e, ConnectionState::Disconnected)).await;
    assert!(room.get_presence().await.is_empty());
    assert!(room.get_cursors().await.is_empty());
}

#[tokio::test]
async fn test_reconnects_after_unexpected_close() {
    let mut opts = options();
    opts.reconnect = ReconnectPolicy {
        enabled: true,
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    };
    let (room, mut events, mut sessions, _) = setup(opts);
    let first = connected(&room, &mut events, &mut sessions).await;

    first.close();
    wait_for(&mut events, |e| is_status(e, ConnectionState::Reconnecting)).await;
    wait_for(&mut events, |e| is_status(e, ConnectionState::Connecting)).await;
    wait_for(&mut events, |e| is_status(e, ConnectionState::Connected)).await;

    let second = timeout(Duration::from_secs(1), sessions.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.url, first.url);
    room.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_gives_up() {
    let mut opts = options();
    opts.reconnect = ReconnectPolicy {
        enabled: true,
        max_attempts: 2,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(10),
    };
    let (room, mut events, _sessions, connector) = setup(opts);
    connector.refuse.store(true, Ordering::SeqCst);

    room.connect().await;
    wait_for(&mut events, |e| matches!(e, RoomEvent::Error(RoomError::Connect { .. }))).await;
    wait_for(&mut events, |e| is_status(e, ConnectionState::Disconnected)).await;

    // Stays down until an explicit connect.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(room.get_status().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_with_pending_cursor() {
    let mut opts = options();
    opts.cursor_throttle = Duration::from_millis(100);
    let (room, mut events, mut sessions, _) = setup(opts);
    let mut server = connected(&room, &mut events, &mut sessions).await;

    room.update_cursor(CursorPosition::at(1.0, 1.0)).await;
    room.update_cursor(CursorPosition::at(2.0, 2.0)).await;
    let first = server.next_sent().await;
    assert_eq!(first["type"], "cursor:update");
    assert_eq!(first["x"], 1.0);

    room.disconnect().await;
    assert_eq!(room.get_status().await, ConnectionState::Disconnected);

    sleep(Duration::from_millis(150)).await;
    assert_eq!(room.get_status().await, ConnectionState::Disconnected);
    assert!(server.from_client.recv().await.is_none());
}

#[tokio::test]
async fn test_cursor_throttle_sends_latest() {
    let mut opts = options();
    opts.cursor_throttle = Duration::from_millis(30);
    let (room, mut events, mut sessions, _) = setup(opts);
    let mut server = connected(&room, &mut events, &mut sessions).await;

    room.update_cursor(CursorPosition::at(1.0, 0.0)).await;
    room.update_cursor(CursorPosition::at(2.0, 0.0)).await;
    room.update_cursor(CursorPosition::at(3.0, 0.0)).await;

    assert_eq!(server.next_sent().await["x"], 1.0);
    assert_eq!(server.next_sent().await["x"], 3.0);
    room.disconnect().await;
}

#[tokio::test]
async fn test_storage_init_and_remote_ops() {
    let (room, mut events, mut sessions, _) = setup(options());
    let server = connected(&room, &mut events, &mut sessions).await;

    server.push(json!({
        "type": "storage:init",
        "root": { "type": "LiveObject", "data": { "title": "Board" } }
    }));
    wait_for(&mut events, |e| matches!(e, RoomEvent::StorageLoaded)).await;
    let title = room
        .storage(|doc| doc.get(doc.root(), "title").unwrap())
        .await;
    assert_eq!(title.as_ref().and_then(|v| v.as_str()), Some("Board"));

    let (changed_tx, mut changed_rx) = mpsc::unbounded_channel();
    room.mutate(|doc| {
        let root = doc.root();
        doc.subscribe(root, move || {
            let _ = changed_tx.send(());
        }, false)
    })
    .await
    .unwrap();

    server.push(json!({
        "type": "storage:ops",
        "ops": [{ "type": "set", "path": [], "key": "title", "value": "Remote", "clock": 7 }]
    }));
    timeout(Duration::from_secs(1), changed_rx.recv())
        .await
        .unwrap()
        .unwrap();

    let (title, clock) = room
        .storage(|doc| (doc.get(doc.root(), "title").unwrap(), doc.clock()))
        .await;
    assert_eq!(title.as_ref().and_then(|v| v.as_str()), Some("Remote"));
    assert_eq!(clock, 8);
}

#[tokio::test]
async fn test_local_mutations_are_sent_as_one_frame() {
    let (room, mut events, mut sessions, _) = setup(options());
    let mut server = connected(&room, &mut events, &mut sessions).await;

    room.batch(|doc| {
        let root = doc.root();
        doc.set(root, "a", 1.0)?;
        doc.set(root, "b", 2.0)
    })
    .await
    .unwrap();

    let frame = server.next_sent().await;
    assert_eq!(frame["type"], "storage:ops");
    assert_eq!(frame["ops"].as_array().unwrap().len(), 2);
    assert_eq!(frame["ops"][0]["key"], "a");
    assert_eq!(frame["clock"], 2);

    assert!(room.undo().await);
    let undo = server.next_sent().await;
    assert_eq!(undo["ops"].as_array().unwrap().len(), 2);
    assert_eq!(undo["ops"][0]["type"], "delete");
}

#[tokio::test]
async fn test_null_root_seeds_initial_storage() {
    let mut opts = options();
    opts.initial_storage = Some(SerializedCrdt::object([("title", "Untitled")]));
    let (room, mut events, mut sessions, _) = setup(opts);
    let mut server = connected(&room, &mut events, &mut sessions).await;

    server.push(json!({"type": "storage:init", "root": null}));
    wait_for(&mut events, |e| matches!(e, RoomEvent::StorageLoaded)).await;

    let frame = server.next_sent().await;
    assert_eq!(frame["type"], "storage:ops");
    assert_eq!(frame["ops"][0]["type"], "set");
    assert_eq!(frame["ops"][0]["key"], "title");
    assert_eq!(frame["ops"][0]["value"], "Untitled");

    // Seeding is not an undoable step.
    assert!(!room.undo().await);
}
