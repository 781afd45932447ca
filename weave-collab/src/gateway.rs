//! The single writer for a room's shared store.
//!
//! Every call writes the store first, then queues the resulting CRDT
//! update, then queues the matching [`RoomEvent`]. Both go through the
//! same ordered outbox, so on the wire a peer always receives the delta
//! before the notification. Calls that change nothing (missing target,
//! empty patch) queue nothing.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use weave_core::{CanvasNode, NodeConnection, NodeId, NodePatch, SharedStore};

use crate::events::RoomEvent;
use crate::presence::AwarenessMessage;

/// Everything a room sends to its peers, in send order.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Update(Vec<u8>),
    Event(RoomEvent),
    Presence(AwarenessMessage),
}

/// Ordered sink for outbound traffic.
pub trait Outbox {
    fn send_update(&self, update: Vec<u8>);
    fn send_event(&self, event: RoomEvent);
}

impl Outbound {
    fn kind(&self) -> &'static str {
        match self {
            Self::Update(_) => "update",
            Self::Event(_) => "event",
            Self::Presence(_) => "presence",
        }
    }
}

/// A live room's send queue.
///
/// Only fills while a session is running. Offline, frames are dropped:
/// the next handshake diff carries every store write and the join
/// carries the latest presence, so nothing queued then would be sent.
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<Outbound>,
    online: AtomicBool,
}

impl OutboundQueue {
    pub fn new(online: bool) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            online: AtomicBool::new(online),
        };
        (queue, rx)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn push(&self, out: Outbound) {
        if !self.is_online() {
            log::trace!("Offline, not queueing {}", out.kind());
            return;
        }
        if let Err(e) = self.tx.send(out) {
            // Receiver gone: the room is shutting down.
            log::debug!("Outbound queue closed, dropping {}", e.0.kind());
        }
    }
}

impl Outbox for OutboundQueue {
    fn send_update(&self, update: Vec<u8>) {
        self.push(Outbound::Update(update));
    }

    fn send_event(&self, event: RoomEvent) {
        self.push(Outbound::Event(event));
    }
}

pub struct MutationGateway<'a> {
    store: &'a SharedStore,
    outbox: &'a dyn Outbox,
}

impl<'a> MutationGateway<'a> {
    pub fn new(store: &'a SharedStore, outbox: &'a dyn Outbox) -> Self {
        Self { store, outbox }
    }

    fn commit(&self, update: Option<Vec<u8>>, event: Option<RoomEvent>) -> bool {
        let Some(update) = update else {
            return false;
        };
        self.outbox.send_update(update);
        if let Some(event) = event {
            log::debug!("Broadcasting {}", event.kind().as_str());
            self.outbox.send_event(event);
        }
        true
    }

    /// Insert or fully replace a node.
    pub fn upsert_node(&self, node: &CanvasNode) -> bool {
        let existed = self.store.contains_node(node.id);
        let update = self.store.upsert_node(node);
        let event = if existed {
            RoomEvent::NodeUpdated { node_id: node.id }
        } else {
            RoomEvent::NodeCreated { node_id: node.id }
        };
        self.commit(Some(update), Some(event))
    }

    pub fn patch_node(&self, id: NodeId, patch: &NodePatch) -> bool {
        let update = self.store.patch_node(id, patch);
        self.commit(update, Some(RoomEvent::NodeUpdated { node_id: id }))
    }

    /// Position-only patch, the hot path while dragging.
    pub fn move_node(&self, id: NodeId, x: f64, y: f64) -> bool {
        let update = self.store.move_node(id, x, y);
        self.commit(update, Some(RoomEvent::NodeUpdated { node_id: id }))
    }

    pub fn remove_node(&self, id: NodeId) -> bool {
        let update = self.store.remove_node(id);
        self.commit(update, Some(RoomEvent::NodeDeleted { node_id: id }))
    }

    pub fn append_connection(&self, connection: &NodeConnection) -> bool {
        let update = self.store.append_connection(connection);
        self.commit(
            Some(update),
            Some(RoomEvent::ConnectionCreated {
                connection_id: connection.id.clone(),
            }),
        )
    }

    pub fn remove_connection_by_id(&self, id: &str) -> bool {
        let update = self.store.remove_connection(id);
        self.commit(
            update,
            Some(RoomEvent::ConnectionDeleted {
                connection_id: id.to_string(),
            }),
        )
    }

    /// Replace all nodes. Peers pick the result up from the delta alone.
    pub fn initialize_nodes(&self, nodes: &[CanvasNode]) -> bool {
        self.commit(Some(self.store.initialize_nodes(nodes)), None)
    }

    pub fn initialize_connections(&self, connections: &[NodeConnection]) -> bool {
        self.commit(Some(self.store.initialize_connections(connections)), None)
    }

    /// One-time hydration from the persistence tier.
    pub fn hydrate(&self, nodes: &[CanvasNode], connections: &[NodeConnection]) -> bool {
        self.commit(self.store.hydrate(nodes, connections), None)
    }

    /// Ephemeral signal with no store write.
    pub fn broadcast(&self, event: RoomEvent) {
        self.outbox.send_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use weave_core::NodeType;

    #[derive(Default)]
    struct Recorder {
        sent: RefCell<Vec<Outbound>>,
    }

    impl Outbox for Recorder {
        fn send_update(&self, update: Vec<u8>) {
            self.sent.borrow_mut().push(Outbound::Update(update));
        }

        fn send_event(&self, event: RoomEvent) {
            self.sent.borrow_mut().push(Outbound::Event(event));
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<RoomEvent> {
            self.sent
                .borrow()
                .iter()
                .filter_map(|o| match o {
                    Outbound::Event(e) => Some(e.clone()),
                    _ => None,
                })
                .collect()
        }

        fn take(&self) -> Vec<Outbound> {
            std::mem::take(&mut *self.sent.borrow_mut())
        }
    }

    #[test]
    fn test_upsert_created_then_updated() {
        let store = SharedStore::new();
        let outbox = Recorder::default();
        let gateway = MutationGateway::new(&store, &outbox);
        let node = CanvasNode::new(7, NodeType::Metric).with_position(10.0, 20.0);

        assert!(gateway.upsert_node(&node));
        assert!(gateway.upsert_node(&node.clone().with_name("renamed")));
        assert_eq!(
            outbox.events(),
            vec![
                RoomEvent::NodeCreated { node_id: 7 },
                RoomEvent::NodeUpdated { node_id: 7 },
            ]
        );
    }

    #[test]
    fn test_write_then_notify_order() {
        let store = SharedStore::new();
        let outbox = Recorder::default();
        let gateway = MutationGateway::new(&store, &outbox);
        gateway.upsert_node(&CanvasNode::new(1, NodeType::Doc));

        let sent = outbox.take();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Outbound::Update(_)));
        assert_eq!(sent[1], Outbound::Event(RoomEvent::NodeCreated { node_id: 1 }));
    }

    #[test]
    fn test_noops_emit_nothing() {
        let store = SharedStore::new();
        let outbox = Recorder::default();
        let gateway = MutationGateway::new(&store, &outbox);
        gateway.upsert_node(&CanvasNode::new(1, NodeType::Doc));
        outbox.take();

        assert!(!gateway.patch_node(1, &NodePatch::default()));
        assert!(!gateway.patch_node(99, &NodePatch::position(1.0, 1.0)));
        assert!(!gateway.move_node(99, 1.0, 1.0));
        assert!(!gateway.remove_node(99));
        assert!(!gateway.remove_connection_by_id("missing"));
        assert!(outbox.take().is_empty());
    }

    #[test]
    fn test_connection_events() {
        let store = SharedStore::new();
        let outbox = Recorder::default();
        let gateway = MutationGateway::new(&store, &outbox);

        assert!(gateway.append_connection(&NodeConnection::new("e1", 1, 2)));
        assert!(gateway.remove_connection_by_id("e1"));
        assert_eq!(
            outbox.events(),
            vec![
                RoomEvent::ConnectionCreated { connection_id: "e1".into() },
                RoomEvent::ConnectionDeleted { connection_id: "e1".into() },
            ]
        );
        assert!(store.connections().is_empty());
    }

    #[test]
    fn test_hydrate_once_without_events() {
        let store = SharedStore::new();
        let outbox = Recorder::default();
        let gateway = MutationGateway::new(&store, &outbox);
        let nodes = vec![CanvasNode::new(1, NodeType::Objective)];

        assert!(gateway.hydrate(&nodes, &[]));
        assert!(!gateway.hydrate(&nodes, &[]));
        let sent = outbox.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Outbound::Update(_)));
    }

    #[test]
    fn test_queue_drops_while_offline() {
        let (queue, mut rx) = OutboundQueue::new(false);
        let store = SharedStore::new();
        let gateway = MutationGateway::new(&store, &queue);

        for id in 0..100 {
            assert!(gateway.upsert_node(&CanvasNode::new(id, NodeType::Doc)));
        }
        queue.push(Outbound::Presence(AwarenessMessage::Leave { user_id: uuid::Uuid::nil() }));
        assert!(rx.try_recv().is_err());
        // The store still has every write for the next handshake.
        assert_eq!(store.node_count(), 100);

        queue.set_online(true);
        gateway.remove_node(0);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Update(_))));
        assert_eq!(rx.try_recv().ok(), Some(Outbound::Event(RoomEvent::NodeDeleted { node_id: 0 })));
    }

    #[test]
    fn test_queue_tolerates_closed_receiver() {
        let (queue, rx) = OutboundQueue::new(true);
        drop(rx);
        queue.push(Outbound::Update(vec![0]));
        assert!(queue.is_online());
    }

    #[test]
    fn test_remove_then_patch_is_noop() {
        let store = SharedStore::new();
        let outbox = Recorder::default();
        let gateway = MutationGateway::new(&store, &outbox);
        gateway.upsert_node(&CanvasNode::new(3, NodeType::Problem));
        assert!(gateway.remove_node(3));
        assert!(!gateway.patch_node(3, &NodePatch::position(5.0, 5.0)));
        assert!(store.node(3).is_none());
        assert_eq!(outbox.events().last(), Some(&RoomEvent::NodeDeleted { node_id: 3 }));
    }
}
