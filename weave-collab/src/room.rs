//! Room sessions: the one interface canvas and editor code talk to.
//!
//! Whether collaboration is configured or not, callers get a
//! [`RoomHandle`] with the same methods. A live room syncs through the
//! relay; a [`NullRoom`] answers immediately and keeps everything local.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use uuid::Uuid;
use weave_core::{
    CanvasNode, NodeConnection, NodeId, NodePatch, Point, Presence, RichText, TextCursor, View,
};

use crate::events::{EventHandler, RoomEvent};
use crate::presence::{PeerPresence, PresenceRoom};

/// Opaque room partition key. Only the constructors know the
/// `canvas-<id>` / `doc-<id>` convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn canvas(id: impl fmt::Display) -> Self {
        Self(format!("canvas-{id}"))
    }

    pub fn document(id: impl fmt::Display) -> Self {
        Self(format!("doc-{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    /// First handshake in flight. Store reads are not meaningful yet.
    Connecting,
    Synced,
    /// Lost the connection after at least one sync; local edits continue.
    Reconnecting,
    Closed,
}

/// A change to the local user's presence.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceUpdate {
    /// Canvas-space pointer position, `None` once it leaves the canvas.
    Cursor(Option<Point>),
    Selection(Vec<NodeId>),
    View {
        view: View,
        document_node_id: Option<NodeId>,
    },
    TextCursor(Option<TextCursor>),
}

/// Everything downstream code can do with a room.
///
/// Mutations return whether they changed anything; none of them fail.
/// Events go to other peers only, never back to the sender.
pub trait Room: Send + Sync {
    fn room_id(&self) -> &str;

    /// This connection's id as peers see it.
    fn connection_id(&self) -> Uuid;

    fn status(&self) -> RoomStatus;

    fn subscribe_status(&self) -> watch::Receiver<RoomStatus>;

    /// At least one handshake has completed.
    fn is_synced(&self) -> bool;

    fn is_connecting(&self) -> bool {
        matches!(self.status(), RoomStatus::Connecting | RoomStatus::Reconnecting)
    }

    // ── Mutation gateway ─────────────────────────────────────────

    fn upsert_node(&self, node: &CanvasNode) -> bool;
    fn patch_node(&self, id: NodeId, patch: &NodePatch) -> bool;
    fn move_node(&self, id: NodeId, x: f64, y: f64) -> bool;
    fn remove_node(&self, id: NodeId) -> bool;
    fn append_connection(&self, connection: &NodeConnection) -> bool;
    fn remove_connection_by_id(&self, id: &str) -> bool;
    fn initialize_nodes(&self, nodes: &[CanvasNode]) -> bool;
    fn initialize_connections(&self, connections: &[NodeConnection]) -> bool;

    /// Seed the store from the persistence tier, once per room lifetime.
    fn hydrate(&self, nodes: &[CanvasNode], connections: &[NodeConnection]) -> bool;

    // ── Reads ────────────────────────────────────────────────────

    fn node(&self, id: NodeId) -> Option<CanvasNode>;
    fn nodes(&self) -> Vec<CanvasNode>;
    fn connections(&self) -> Vec<NodeConnection>;

    // ── Events ───────────────────────────────────────────────────

    fn broadcast(&self, event: RoomEvent);

    /// Register `handler` under `key`, replacing any earlier handler
    /// with the same key.
    fn on_event(&self, key: &str, handler: EventHandler);
    fn off_event(&self, key: &str);

    // ── Presence ─────────────────────────────────────────────────

    fn my_presence(&self) -> Presence;
    fn update_presence(&self, update: PresenceUpdate);

    /// Snapshot of local and remote presence for derived views.
    fn presence(&self) -> PresenceRoom;

    fn others(&self) -> Vec<PeerPresence> {
        self.presence().others()
    }

    fn connected_users(&self) -> usize;

    // ── Text bodies ──────────────────────────────────────────────

    /// Shared text body, `None` when the room does not sync text.
    fn text_body(&self, namespace: &str) -> Option<RichText>;

    /// Ship an update made directly on a text body.
    fn submit_update(&self, update: Vec<u8>);

    /// Leave the room. Stops presence and drops every listener.
    fn exit(&self);
}

pub type RoomHandle = Arc<dyn Room>;

impl dyn Room {
    /// Wait for the first handshake. Returns `false` if the room closed
    /// before it ever synced.
    pub async fn synced(&self) -> bool {
        if self.is_synced() {
            return true;
        }
        let mut status = self.subscribe_status();
        let synced = match status
            .wait_for(|s| matches!(s, RoomStatus::Synced | RoomStatus::Closed))
            .await
        {
            Ok(s) => *s == RoomStatus::Synced,
            Err(_) => self.is_synced(),
        };
        synced
    }
}

pub(crate) fn lock_presence(presence: &Mutex<PresenceRoom>) -> MutexGuard<'_, PresenceRoom> {
    presence.lock().unwrap_or_else(|e| e.into_inner())
}

/// Stand-in used when no sync backend is configured.
///
/// Synced from the start, alone in the room, and every shared-state
/// call is a no-op. The caller's own presence is still readable.
pub struct NullRoom {
    room_id: String,
    presence: Mutex<PresenceRoom>,
    status: watch::Sender<RoomStatus>,
}

impl NullRoom {
    pub fn new(room_id: impl Into<String>, initial: Presence) -> Self {
        let (status, _) = watch::channel(RoomStatus::Synced);
        Self {
            room_id: room_id.into(),
            presence: Mutex::new(PresenceRoom::new(Uuid::new_v4(), initial)),
            status,
        }
    }
}

impl Room for NullRoom {
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
        true
    }

    fn upsert_node(&self, _node: &CanvasNode) -> bool {
        false
    }

    fn patch_node(&self, _id: NodeId, _patch: &NodePatch) -> bool {
        false
    }

    fn move_node(&self, _id: NodeId, _x: f64, _y: f64) -> bool {
        false
    }

    fn remove_node(&self, _id: NodeId) -> bool {
        false
    }

    fn append_connection(&self, _connection: &NodeConnection) -> bool {
        false
    }

    fn remove_connection_by_id(&self, _id: &str) -> bool {
        false
    }

    fn initialize_nodes(&self, _nodes: &[CanvasNode]) -> bool {
        false
    }

    fn initialize_connections(&self, _connections: &[NodeConnection]) -> bool {
        false
    }

    fn hydrate(&self, _nodes: &[CanvasNode], _connections: &[NodeConnection]) -> bool {
        false
    }

    fn node(&self, _id: NodeId) -> Option<CanvasNode> {
        None
    }

    fn nodes(&self) -> Vec<CanvasNode> {
        Vec::new()
    }

    fn connections(&self) -> Vec<NodeConnection> {
        Vec::new()
    }

    fn broadcast(&self, _event: RoomEvent) {}

    fn on_event(&self, _key: &str, _handler: EventHandler) {}

    fn off_event(&self, _key: &str) {}

    fn my_presence(&self) -> Presence {
        lock_presence(&self.presence).local().clone()
    }

    fn update_presence(&self, update: PresenceUpdate) {
        let mut presence = lock_presence(&self.presence);
        // Messages are built and dropped; nobody is listening.
        match update {
            PresenceUpdate::Cursor(position) => {
                presence.update_local_cursor(position);
            }
            PresenceUpdate::Selection(ids) => {
                presence.update_local_selection(ids);
            }
            PresenceUpdate::View {
                view,
                document_node_id,
            } => {
                presence.update_local_view(view, document_node_id);
            }
            PresenceUpdate::TextCursor(cursor) => {
                presence.update_local_text_cursor(cursor);
            }
        }
    }

    fn presence(&self) -> PresenceRoom {
        lock_presence(&self.presence).clone()
    }

    fn connected_users(&self) -> usize {
        1
    }

    fn text_body(&self, _namespace: &str) -> Option<RichText> {
        None
    }

    fn submit_update(&self, _update: Vec<u8>) {}

    fn exit(&self) {
        self.status.send_replace(RoomStatus::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use weave_core::{NodeType, UserInfo};

    fn null_room() -> RoomHandle {
        let user = UserInfo::from_identity(Some("Solo"), Some("solo@x.io"), None);
        Arc::new(NullRoom::new("canvas-1", Presence::initial(user)))
    }

    #[test]
    fn test_room_id_convention() {
        assert_eq!(RoomId::canvas(42).as_str(), "canvas-42");
        assert_eq!(RoomId::document("abc").to_string(), "doc-abc");
        assert_eq!(RoomId::from("custom").as_str(), "custom");
    }

    #[tokio::test]
    async fn test_null_room_is_synced_immediately() {
        let room = null_room();
        assert!(room.is_synced());
        assert!(!room.is_connecting());
        assert_eq!(room.status(), RoomStatus::Synced);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), room.synced())
            .await
            .unwrap());
        assert_eq!(room.connected_users(), 1);
    }

    #[test]
    fn test_null_room_calls_are_noops() {
        let room = null_room();
        let node = CanvasNode::new(7, NodeType::Metric);
        assert!(!room.upsert_node(&node));
        assert!(!room.patch_node(7, &NodePatch::position(1.0, 1.0)));
        assert!(!room.move_node(7, 1.0, 1.0));
        assert!(!room.remove_node(7));
        assert!(!room.append_connection(&NodeConnection::new("e", 1, 2)));
        assert!(!room.remove_connection_by_id("e"));
        assert!(!room.hydrate(&[node], &[]));
        room.broadcast(RoomEvent::NodeCreated { node_id: 7 });
        room.on_event("k", Arc::new(|_| {}));
        room.off_event("k");
        room.submit_update(vec![0, 0]);

        assert!(room.nodes().is_empty());
        assert!(room.connections().is_empty());
        assert!(room.node(7).is_none());
        assert!(room.text_body("default").is_none());
        assert!(room.others().is_empty());
    }

    #[test]
    fn test_null_room_keeps_own_presence() {
        let room = null_room();
        room.update_presence(PresenceUpdate::Cursor(Some(Point::new(3.0, 4.0))));
        room.update_presence(PresenceUpdate::Selection(vec![1, 2]));
        let me = room.my_presence();
        assert_eq!(me.cursor, Some(Point::new(3.0, 4.0)));
        assert_eq!(me.selected_node_ids, vec![1, 2]);
        assert_eq!(me.user.name, "Solo");

        room.update_presence(PresenceUpdate::Cursor(None));
        assert_eq!(room.my_presence().cursor, None);
    }

    #[tokio::test]
    async fn test_synced_resolves_on_first_handshake() {
        use crate::client::SyncEvent;
        use crate::live::LiveRoom;

        let (live, _rx) = LiveRoom::detached("canvas-1", Presence::initial(UserInfo::anonymous()), Duration::ZERO);
        let live = Arc::new(live);
        let room: RoomHandle = live.clone();
        let waiter = tokio::spawn({
            let room = room.clone();
            async move { room.synced().await }
        });
        tokio::task::yield_now().await;

        let diff = weave_core::SharedStore::new().encode_state();
        live.handle_inbound(SyncEvent::StateSynced(diff));
        let synced = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(synced);
    }

    #[tokio::test]
    async fn test_synced_is_false_when_closed_first() {
        use crate::live::LiveRoom;

        let (live, _rx) = LiveRoom::detached("canvas-1", Presence::initial(UserInfo::anonymous()), Duration::ZERO);
        let room: RoomHandle = Arc::new(live);
        let waiter = tokio::spawn({
            let room = room.clone();
            async move { room.synced().await }
        });
        tokio::task::yield_now().await;

        room.exit();
        let synced = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(!synced);
    }

    #[tokio::test]
    async fn test_exit_closes() {
        let room = null_room();
        let status = room.subscribe_status();
        room.exit();
        assert_eq!(room.status(), RoomStatus::Closed);
        assert!(status.has_changed().unwrap());
    }
}
