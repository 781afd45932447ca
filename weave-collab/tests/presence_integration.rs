//! Presence through a real relay: cursors, selections, late joiners,
//! text carets, and the raw client protocol underneath.

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;
use weave_collab::{
    provider_from_config, AwarenessMessage, CanvasPresence, CollabConfig, CollaborativeEditor,
    EditorOptions, PeerInfo, RoomHandle, ServerConfig, SharedProvider, SyncClient, SyncEvent,
    SyncServer, Viewport,
};
use weave_core::{Point, Presence, UserInfo};

async fn start_test_server(max_peers_per_room: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SyncServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        max_peers_per_room,
        broadcast_capacity: 64,
        heartbeat_interval_secs: 30,
    });
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://{addr}")
}

fn user_provider(url: &str) -> SharedProvider {
    let mut config = CollabConfig::with_sync_url(url);
    config.presence_throttle = Duration::from_millis(1);
    provider_from_config(&config)
}

async fn enter_synced(provider: &SharedProvider, room_id: &str, name: &str) -> RoomHandle {
    let user = UserInfo::from_identity(Some(name), Some(&format!("{name}@x.io")), None);
    let room = provider.enter(room_id, Presence::initial(user));
    assert!(timeout(Duration::from_secs(5), room.synced()).await.unwrap());
    room
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Connect a raw client, draining the initial Connected event.
async fn connect_client(name: &str, room_id: &str, url: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(PeerInfo::new(name), room_id, url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    let _ = timeout(Duration::from_secs(1), events.recv()).await;
    (client, events)
}

// ─── Room-level presence ─────────────────────────────────────────

#[tokio::test]
async fn test_cursor_and_selection_reach_peer() {
    let url = start_test_server(10).await;
    let alice = user_provider(&url);
    let bob = user_provider(&url);
    let a = enter_synced(&alice, "canvas-1", "alice").await;
    let b = enter_synced(&bob, "canvas-1", "bob").await;

    let mut pointer = CanvasPresence::new(a.clone());
    pointer.set_viewport(Viewport {
        zoom: 2.0,
        ..Viewport::default()
    });
    pointer.update_cursor(40.0, 60.0);
    pointer.update_selected_nodes(vec![7, 8]);

    let view = CanvasPresence::new(b.clone());
    assert!(eventually(|| !view.remote_cursors().is_empty() && !view.selection_highlight(8).is_empty()).await);
    let cursor = &view.remote_cursors()[0];
    assert_eq!(cursor.position, Point::new(20.0, 30.0));
    assert_eq!(cursor.name, "alice");
    assert_eq!(view.selection_highlight(7)[0].name, "alice");
    assert_eq!(view.selection_highlight(7)[0].color, a.my_presence().user.color);
}

#[tokio::test]
async fn test_clear_cursor_hides_it_for_peers() {
    let url = start_test_server(10).await;
    let alice = user_provider(&url);
    let bob = user_provider(&url);
    let a = enter_synced(&alice, "canvas-2", "alice").await;
    let b = enter_synced(&bob, "canvas-2", "bob").await;

    let pointer = CanvasPresence::new(a.clone());
    pointer.update_cursor(5.0, 5.0);
    assert!(eventually(|| b.presence().remote_cursors().len() == 1).await);

    pointer.clear_cursor();
    assert_eq!(a.my_presence().cursor, None);
    assert!(eventually(|| b.presence().remote_cursors().is_empty()).await);
    // Peer is still there, only the pointer is gone.
    assert_eq!(b.connected_users(), 2);
}

#[tokio::test]
async fn test_late_joiner_sees_existing_presence() {
    let url = start_test_server(10).await;
    let alice = user_provider(&url);
    let a = enter_synced(&alice, "canvas-3", "alice").await;
    CanvasPresence::new(a.clone()).update_selected_nodes(vec![3]);
    // Give the relay time to cache it.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let bob = user_provider(&url);
    let b = enter_synced(&bob, "canvas-3", "bob").await;
    assert!(eventually(|| b.others().len() == 1).await);
    let others = b.others();
    assert_eq!(others[0].presence.user.name, "alice");
    assert_eq!(others[0].presence.selected_node_ids, vec![3]);

    let list = b.presence().collaborators(5);
    assert_eq!(list.total, 2);
    assert!(list.visible[0].is_self);
    assert_eq!(list.visible[0].name, "bob");
}

#[tokio::test]
async fn test_editor_cursors_and_text_through_relay() {
    let url = start_test_server(10).await;
    let alice = user_provider(&url);
    let bob = user_provider(&url);
    let a = enter_synced(&alice, "doc-1", "alice").await;
    let b = enter_synced(&bob, "doc-1", "bob").await;

    let ea = CollaborativeEditor::open(&a, EditorOptions::default().with_namespace("node-4"));
    let eb = CollaborativeEditor::open(&b, EditorOptions::default().with_namespace("node-4"));
    assert!(!ea.settings().history);

    ea.insert(0, "Quarterly goals");
    assert!(eventually(|| eb.text() == "Quarterly goals").await);
    ea.set_selection(0, 9);
    assert!(eventually(|| eb.collaboration_cursors().len() == 1).await);
    let caret = &eb.collaboration_cursors()[0];
    assert_eq!((caret.anchor, caret.head), (0, 9));
    assert_eq!(caret.name, "alice");
    assert!(eventually(|| eb.connected_users() == 2).await);
}

// ─── Raw protocol ────────────────────────────────────────────────

#[tokio::test]
async fn test_raw_awareness_relay() {
    let url = start_test_server(10).await;
    let (a, _a_events) = connect_client("Alice", "canvas-4", &url).await;
    let (_b, mut b_events) = connect_client("Bob", "canvas-4", &url).await;

    let user_id = a.peer_info().peer_id;
    let cursor = AwarenessMessage::Cursor {
        user_id,
        position: Some(Point::new(1.0, 2.0)),
        timestamp: 1,
    };
    a.send_awareness(&cursor).await.unwrap();

    let received = timeout(Duration::from_secs(2), async {
        while let Some(event) = b_events.recv().await {
            if let SyncEvent::RemotePresence { message, .. } = event {
                return Some(message);
            }
        }
        None
    })
    .await
    .unwrap();
    assert_eq!(received, Some(cursor));
}

#[tokio::test]
async fn test_peer_left_on_disconnect() {
    let url = start_test_server(10).await;
    let (_a, mut a_events) = connect_client("Alice", "canvas-5", &url).await;
    let (mut b, _b_events) = connect_client("Bob", "canvas-5", &url).await;
    let bob_id: Uuid = b.peer_info().peer_id;

    b.disconnect().await;
    let left = timeout(Duration::from_secs(2), async {
        while let Some(event) = a_events.recv().await {
            if let SyncEvent::PeerLeft(id) = event {
                return Some(id);
            }
        }
        None
    })
    .await
    .unwrap();
    assert_eq!(left, Some(bob_id));
}

#[tokio::test]
async fn test_full_room_rejects_join() {
    let url = start_test_server(1).await;
    let (_a, _a_events) = connect_client("Alice", "canvas-6", &url).await;
    let (_b, mut b_events) = connect_client("Bob", "canvas-6", &url).await;

    let closed = timeout(Duration::from_secs(2), async {
        while let Some(event) = b_events.recv().await {
            if matches!(event, SyncEvent::Disconnected) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(closed);
}

#[tokio::test]
async fn test_ping_pong() {
    let url = start_test_server(10).await;
    let (a, mut events) = connect_client("Alice", "canvas-7", &url).await;
    a.send_ping().await.unwrap();
    let pong = timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if matches!(event, SyncEvent::Pong) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(pong);
}
