//! A room synced through the relay.
//!
//! ```text
//!  caller ──▶ MutationGateway ──▶ SharedStore (local, immediate)
//!                   │
//!                   ▼ Outbound (ordered)
//!            driver task ──▶ SyncClient ──▶ relay ──▶ other peers
//!                   ▲
//!                   └── SyncEvent ◀── SyncClient ◀── relay
//! ```
//!
//! The caller never waits on the network. The driver task owns the
//! socket: it performs the handshake, applies what arrives, flushes
//! throttled presence, and reconnects with backoff when the socket
//! drops. Every connection attempt gets a fresh connection id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;
use weave_core::{
    CanvasNode, NodeConnection, NodeId, NodePatch, Presence, RichText, SharedStore,
};

use crate::client::{SyncClient, SyncEvent};
use crate::config::CollabConfig;
use crate::events::{EventContext, EventHandler, EventListeners, RoomEvent};
use crate::gateway::{MutationGateway, Outbound, OutboundQueue};
use crate::presence::PresenceRoom;
use crate::protocol::{PeerInfo, ProtocolError};
use crate::room::{lock_presence, PresenceUpdate, Room, RoomStatus};

pub struct LiveRoom {
    room_id: String,
    store: SharedStore,
    presence: Mutex<PresenceRoom>,
    listeners: EventListeners,
    status: watch::Sender<RoomStatus>,
    synced_once: AtomicBool,
    outbound: OutboundQueue,
    shutdown: watch::Sender<bool>,
}

/// Why a connected session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Lost,
}

impl LiveRoom {
    /// Build the room without any transport. The caller owns the
    /// outbound queue, which starts open.
    pub(crate) fn detached(
        room_id: impl Into<String>,
        initial: Presence,
        cursor_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = OutboundQueue::new(true);
        let (status, _) = watch::channel(RoomStatus::Connecting);
        let (shutdown, _) = watch::channel(false);
        let room = Self {
            room_id: room_id.into(),
            store: SharedStore::new(),
            presence: Mutex::new(PresenceRoom::with_interval(Uuid::new_v4(), initial, cursor_interval)),
            listeners: EventListeners::new(),
            status,
            synced_once: AtomicBool::new(false),
            outbound,
            shutdown,
        };
        (room, outbound_rx)
    }

    /// Create the room and start syncing it with the relay at `url`.
    ///
    /// Needs a tokio runtime. Without one the room never leaves
    /// `Connecting`, same as an unreachable server.
    pub fn connect(
        room_id: impl Into<String>,
        initial: Presence,
        url: impl Into<String>,
        config: &CollabConfig,
    ) -> Arc<Self> {
        let (room, outbound_rx) = Self::detached(room_id, initial, config.presence_throttle);
        // Closed until the driver has a session.
        room.outbound.set_online(false);
        let room = Arc::new(room);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(drive(room.clone(), url.into(), config.clone(), outbound_rx));
            }
            Err(_) => log::error!("No tokio runtime; room {} stays offline", room.room_id),
        }
        room
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    fn gateway(&self) -> MutationGateway<'_> {
        MutationGateway::new(&self.store, &self.outbound)
    }

    fn set_status(&self, next: RoomStatus) {
        // Closed is terminal.
        self.status.send_if_modified(|current| {
            if *current == RoomStatus::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Apply one inbound event. Returns a diff to send back when the
    /// server asked for our state.
    pub(crate) fn handle_inbound(&self, event: SyncEvent) -> Option<Vec<u8>> {
        match event {
            SyncEvent::RemoteDelta { peer_id, update, .. } => {
                if let Err(e) = self.store.apply_update(&update) {
                    log::warn!("Dropping bad update from {peer_id}: {e}");
                }
                None
            }
            SyncEvent::StateSynced(diff) => {
                if let Err(e) = self.store.apply_update(&diff) {
                    log::warn!("Dropping bad sync diff in room {}: {e}", self.room_id);
                    return None;
                }
                if !self.synced_once.swap(true, Ordering::SeqCst) {
                    log::info!("Room {} synced", self.room_id);
                }
                self.set_status(RoomStatus::Synced);
                None
            }
            SyncEvent::SyncRequested(state_vector) => match self.store.diff_since(&state_vector) {
                Ok(diff) => Some(diff),
                Err(e) => {
                    log::warn!("Bad state vector in room {}: {e}", self.room_id);
                    None
                }
            },
            SyncEvent::RemotePresence { message, .. } => {
                lock_presence(&self.presence).handle_message(&message);
                None
            }
            SyncEvent::RemoteEvent { peer_id, event } => {
                let context = EventContext {
                    connection_id: peer_id,
                    event,
                };
                self.listeners.dispatch(&context);
                None
            }
            SyncEvent::PeerJoined(info) => {
                log::debug!("Peer {} ({}) joined room {}", info.name, info.peer_id, self.room_id);
                None
            }
            SyncEvent::PeerLeft(peer_id) => {
                lock_presence(&self.presence).remove_peer(&peer_id);
                None
            }
            SyncEvent::Connected | SyncEvent::Disconnected | SyncEvent::Pong => None,
        }
    }

    /// Drive one connected session until it drops or the room exits.
    async fn run_session(
        &self,
        client: &SyncClient,
        events: &mut mpsc::Receiver<SyncEvent>,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
        shutdown: &mut watch::Receiver<bool>,
        config: &CollabConfig,
    ) -> SessionEnd {
        // Anything queued before now is covered by the handshake below.
        self.outbound.set_online(true);
        while outbound.try_recv().is_ok() {}

        let state_vector = self.store.state_vector();
        let join = lock_presence(&self.presence).join_message();
        if client.send_sync_step1(state_vector).await.is_err()
            || client.send_awareness(&join).await.is_err()
        {
            return SessionEnd::Lost;
        }

        let mut flush = tokio::time::interval(config.presence_throttle.max(Duration::from_millis(1)));
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let heartbeat_every = config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + heartbeat_every, heartbeat_every);

        loop {
            let sent: Result<(), ProtocolError> = tokio::select! {
                changed = shutdown.changed() => {
                    let stop = changed.is_err() || *shutdown.borrow();
                    if stop {
                        let leave = lock_presence(&self.presence).leave_message();
                        if let Err(e) = client.send_awareness(&leave).await {
                            log::debug!("Leave for room {} not sent: {e}", self.room_id);
                        }
                        return SessionEnd::Shutdown;
                    }
                    Ok(())
                }

                out = outbound.recv() => match out {
                    Some(Outbound::Update(update)) => client.send_delta(update).await,
                    Some(Outbound::Event(event)) => client.send_event(&event).await,
                    Some(Outbound::Presence(message)) => client.send_awareness(&message).await,
                    None => return SessionEnd::Shutdown,
                },

                event = events.recv() => match event {
                    None | Some(SyncEvent::Disconnected) => return SessionEnd::Lost,
                    Some(event) => match self.handle_inbound(event) {
                        Some(diff) => client.send_sync_step2(diff).await,
                        None => Ok(()),
                    },
                },

                _ = flush.tick() => {
                    let pending = lock_presence(&self.presence).take_pending_cursor();
                    match pending {
                        Some(message) => client.send_awareness(&message).await,
                        None => Ok(()),
                    }
                }

                _ = heartbeat.tick() => client.send_ping().await,
            };

            if let Err(e) = sent {
                log::debug!("Send failed in room {}: {e}", self.room_id);
                return SessionEnd::Lost;
            }
        }
    }
}

/// Connection loop: connect, run the session, back off, repeat.
async fn drive(
    room: Arc<LiveRoom>,
    url: String,
    config: CollabConfig,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut shutdown = room.shutdown.subscribe();
    let mut backoff = config.reconnect_min;

    while !room.is_shut_down() {
        let connection_id = Uuid::new_v4();
        let user = {
            let mut presence = lock_presence(&room.presence);
            presence.set_local_id(connection_id);
            presence.local().user.clone()
        };
        let info = PeerInfo {
            peer_id: connection_id,
            name: user.name,
            color: user.color,
        };

        let mut client = SyncClient::new(info, room.room_id.clone(), url.clone());
        let Some(mut events) = client.take_event_rx() else {
            break;
        };

        match client.connect().await {
            Ok(()) => {
                backoff = config.reconnect_min;
                let end = room
                    .run_session(&client, &mut events, &mut outbound, &mut shutdown, &config)
                    .await;
                room.outbound.set_online(false);
                client.disconnect().await;
                lock_presence(&room.presence).clear_peers();
                if end == SessionEnd::Shutdown {
                    break;
                }
                log::info!("Lost connection to room {}", room.room_id);
            }
            Err(e) => log::debug!("Connecting room {} failed: {e}", room.room_id),
        }

        if room.synced_once.load(Ordering::SeqCst) {
            room.set_status(RoomStatus::Reconnecting);
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {}
        }
        backoff = (backoff * 2).min(config.reconnect_max);
    }

    log::debug!("Room {} driver stopped", room.room_id);
}

impl Room for LiveRoom {
    fn room_id(&self) -> &str {
        &self.room_id
    }

    fn connection_id(&self) -> Uuid {
        lock_presence(&self.presence).local_id()
    }

    fn status(&self) -> RoomStatus {
        *self.status.borrow()
    }

    fn subscribe_status(&self) -> watch::Receiver<RoomStatus> {
        self.status.subscribe()
    }

    fn is_synced(&self) -> bool {
        self.synced_once.load(Ordering::SeqCst)
    }

    fn upsert_node(&self, node: &CanvasNode) -> bool {
        self.gateway().upsert_node(node)
    }

    fn patch_node(&self, id: NodeId, patch: &NodePatch) -> bool {
        self.gateway().patch_node(id, patch)
    }

    fn move_node(&self, id: NodeId, x: f64, y: f64) -> bool {
        self.gateway().move_node(id, x, y)
    }

    fn remove_node(&self, id: NodeId) -> bool {
        self.gateway().remove_node(id)
    }

    fn append_connection(&self, connection: &NodeConnection) -> bool {
        self.gateway().append_connection(connection)
    }

    fn remove_connection_by_id(&self, id: &str) -> bool {
        self.gateway().remove_connection_by_id(id)
    }

    fn initialize_nodes(&self, nodes: &[CanvasNode]) -> bool {
        self.gateway().initialize_nodes(nodes)
    }

    fn initialize_connections(&self, connections: &[NodeConnection]) -> bool {
        self.gateway().initialize_connections(connections)
    }

    fn hydrate(&self, nodes: &[CanvasNode], connections: &[NodeConnection]) -> bool {
        self.gateway().hydrate(nodes, connections)
    }

    fn node(&self, id: NodeId) -> Option<CanvasNode> {
        self.store.node(id)
    }

    fn nodes(&self) -> Vec<CanvasNode> {
        self.store.nodes()
    }

    fn connections(&self) -> Vec<NodeConnection> {
        self.store.connections()
    }

    fn broadcast(&self, event: RoomEvent) {
        self.gateway().broadcast(event);
    }

    fn on_event(&self, key: &str, handler: EventHandler) {
        self.listeners.register(key, handler);
    }

    fn off_event(&self, key: &str) {
        self.listeners.unregister(key);
    }

    fn my_presence(&self) -> Presence {
        lock_presence(&self.presence).local().clone()
    }

    fn update_presence(&self, update: PresenceUpdate) {
        if self.is_shut_down() {
            return;
        }
        let message = {
            let mut presence = lock_presence(&self.presence);
            match update {
                PresenceUpdate::Cursor(position) => presence.update_local_cursor(position),
                PresenceUpdate::Selection(ids) => Some(presence.update_local_selection(ids)),
                PresenceUpdate::View {
                    view,
                    document_node_id,
                } => Some(presence.update_local_view(view, document_node_id)),
                PresenceUpdate::TextCursor(cursor) => Some(presence.update_local_text_cursor(cursor)),
            }
        };
        if let Some(message) = message {
            self.outbound.push(Outbound::Presence(message));
        }
    }

    fn presence(&self) -> PresenceRoom {
        lock_presence(&self.presence).clone()
    }

    fn connected_users(&self) -> usize {
        lock_presence(&self.presence).connected_users()
    }

    fn text_body(&self, namespace: &str) -> Option<RichText> {
        Some(self.store.text_body(namespace))
    }

    fn submit_update(&self, update: Vec<u8>) {
        self.outbound.push(Outbound::Update(update));
    }

    fn exit(&self) {
        self.listeners.clear();
        self.shutdown.send_replace(true);
        self.set_status(RoomStatus::Closed);
        log::info!("Left room {}", self.room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::AwarenessMessage;
    use std::sync::atomic::AtomicUsize;
    use weave_core::{NodeType, Point, UserInfo};

    fn presence(name: &str) -> Presence {
        Presence::initial(UserInfo::from_identity(Some(name), None, None))
    }

    fn room(name: &str) -> (LiveRoom, mpsc::UnboundedReceiver<Outbound>) {
        LiveRoom::detached("canvas-1", presence(name), Duration::ZERO)
    }

    /// Deliver everything `from` has queued to `to`, as the relay would.
    fn pump(from: &LiveRoom, queue: &mut mpsc::UnboundedReceiver<Outbound>, to: &LiveRoom) {
        let peer_id = from.connection_id();
        while let Ok(out) = queue.try_recv() {
            let event = match out {
                Outbound::Update(update) => SyncEvent::RemoteDelta { peer_id, clock: 0, update },
                Outbound::Event(event) => SyncEvent::RemoteEvent { peer_id, event },
                Outbound::Presence(message) => SyncEvent::RemotePresence { peer_id, message },
            };
            to.handle_inbound(event);
        }
    }

    #[test]
    fn test_starts_connecting() {
        let (room, _rx) = room("a");
        assert_eq!(room.status(), RoomStatus::Connecting);
        assert!(room.is_connecting());
        assert!(!room.is_synced());
    }

    #[test]
    fn test_first_sync_marks_synced() {
        let (a, _rx_a) = room("a");
        let (b, _rx_b) = room("b");
        a.upsert_node(&CanvasNode::new(1, NodeType::Doc));

        let diff = a.handle_inbound(SyncEvent::SyncRequested(b.store().state_vector())).unwrap();
        b.handle_inbound(SyncEvent::StateSynced(diff));
        assert!(b.is_synced());
        assert_eq!(b.status(), RoomStatus::Synced);
        assert!(b.node(1).is_some());
    }

    #[test]
    fn test_remote_event_reaches_listener_after_store() {
        let (a, mut rx_a) = room("a");
        let (b, _rx_b) = room("b");
        let b = Arc::new(b);

        let seen = Arc::new(Mutex::new(None));
        let reader = Arc::downgrade(&b);
        let sink = seen.clone();
        b.on_event("test", Arc::new(move |ctx: &EventContext| {
            if let (RoomEvent::NodeCreated { node_id }, Some(room)) = (&ctx.event, reader.upgrade()) {
                *sink.lock().unwrap() = room.node(*node_id);
            }
        }));

        let node = CanvasNode::new(7, NodeType::Metric).with_position(10.0, 20.0);
        assert!(a.upsert_node(&node));
        pump(&a, &mut rx_a, &b);

        assert_eq!(seen.lock().unwrap().as_ref(), Some(&node));
    }

    #[test]
    fn test_reregistered_listener_fires_once() {
        let (a, mut rx_a) = room("a");
        let (b, _rx_b) = room("b");
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = count.clone();
            b.on_event("canvas", Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        a.broadcast(RoomEvent::CursorClick { position: Point::new(1.0, 1.0) });
        pump(&a, &mut rx_a, &b);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_presence_flows_between_rooms() {
        let (a, mut rx_a) = room("alice");
        let (b, _rx_b) = room("bob");

        // Join is what the driver sends first on every connection.
        let join = lock_presence(&a.presence).join_message();
        b.handle_inbound(SyncEvent::RemotePresence { peer_id: a.connection_id(), message: join });
        a.update_presence(PresenceUpdate::Cursor(Some(Point::new(5.0, 6.0))));
        a.update_presence(PresenceUpdate::Selection(vec![7]));
        pump(&a, &mut rx_a, &b);

        assert_eq!(b.connected_users(), 2);
        let others = b.others();
        assert_eq!(others[0].presence.user.name, "alice");
        assert_eq!(others[0].presence.cursor, Some(Point::new(5.0, 6.0)));
        assert_eq!(others[0].presence.selected_node_ids, vec![7]);

        b.handle_inbound(SyncEvent::PeerLeft(a.connection_id()));
        assert_eq!(b.connected_users(), 1);
    }

    #[test]
    fn test_clear_cursor_is_sent_as_absent() {
        let (a, mut rx_a) = room("a");
        a.update_presence(PresenceUpdate::Cursor(Some(Point::new(0.0, 0.0))));
        a.update_presence(PresenceUpdate::Cursor(None));
        assert_eq!(a.my_presence().cursor, None);

        let mut last = None;
        while let Ok(out) = rx_a.try_recv() {
            last = Some(out);
        }
        assert!(matches!(
            last,
            Some(Outbound::Presence(AwarenessMessage::Cursor { position: None, .. }))
        ));
    }

    #[test]
    fn test_exit_clears_listeners_and_stops_presence() {
        let (a, mut rx_a) = room("a");
        a.on_event("x", Arc::new(|_| {}));
        a.exit();
        assert_eq!(a.status(), RoomStatus::Closed);
        assert!(a.listeners.is_empty());

        a.update_presence(PresenceUpdate::Selection(vec![1]));
        assert!(rx_a.try_recv().is_err());

        // Closed stays closed.
        a.set_status(RoomStatus::Reconnecting);
        assert_eq!(a.status(), RoomStatus::Closed);
    }

    #[test]
    fn test_concurrent_moves_converge_to_one_value() {
        let (a, mut rx_a) = room("a");
        let (b, mut rx_b) = room("b");
        a.upsert_node(&CanvasNode::new(7, NodeType::Metric));
        pump(&a, &mut rx_a, &b);

        a.move_node(7, 10.0, 20.0);
        b.move_node(7, 15.0, 25.0);
        pump(&a, &mut rx_a, &b);
        pump(&b, &mut rx_b, &a);

        let pa = a.node(7).unwrap().position;
        let pb = b.node(7).unwrap().position;
        assert_eq!(pa, pb);
        assert!(pa == Point::new(10.0, 20.0) || pa == Point::new(15.0, 25.0));
    }

    #[test]
    fn test_server_request_answered_with_local_edits() {
        let (a, _rx_a) = room("a");
        a.upsert_node(&CanvasNode::new(3, NodeType::Agent));
        let empty = SharedStore::new();
        let diff = a.handle_inbound(SyncEvent::SyncRequested(empty.state_vector())).unwrap();
        empty.apply_update(&diff).unwrap();
        assert!(empty.node(3).is_some());
    }

    #[tokio::test]
    async fn test_offline_room_queues_nothing() {
        let url = "ws://127.0.0.1:9";
        let room = LiveRoom::connect("canvas-1", presence("a"), url, &CollabConfig::with_sync_url(url));
        assert!(!room.outbound.is_online());

        for id in 0..50 {
            room.upsert_node(&CanvasNode::new(id, NodeType::Doc));
        }
        room.update_presence(PresenceUpdate::Selection(vec![1]));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!room.outbound.is_online());
        assert_eq!(room.nodes().len(), 50);
        assert_eq!(room.my_presence().selected_node_ids, vec![1]);
        room.exit();
    }

    #[test]
    fn test_text_body_shares_store_doc() {
        let (a, mut rx_a) = room("a");
        let (b, _rx_b) = room("b");
        let body = a.text_body("node-1").unwrap();
        a.submit_update(body.insert(0, "hello"));
        pump(&a, &mut rx_a, &b);
        assert_eq!(b.text_body("node-1").unwrap().text(), "hello");
    }
}
