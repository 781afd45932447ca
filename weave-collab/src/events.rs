//! Ephemeral room events and the listener registry.
//!
//! Events say *that* something changed, never *what*: receivers re-read
//! the shared store. They are not persisted, only reach peers connected
//! at the time, and are never delivered back to the sender.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weave_core::{ConnectionId, NodeId, Point};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeCreated,
    NodeUpdated,
    NodeDeleted,
    ConnectionCreated,
    ConnectionDeleted,
    CursorClick,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NodeCreated => "NODE_CREATED",
            EventKind::NodeUpdated => "NODE_UPDATED",
            EventKind::NodeDeleted => "NODE_DELETED",
            EventKind::ConnectionCreated => "CONNECTION_CREATED",
            EventKind::ConnectionDeleted => "CONNECTION_DELETED",
            EventKind::CursorClick => "CURSOR_CLICK",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoomEvent {
    NodeCreated { node_id: NodeId },
    NodeUpdated { node_id: NodeId },
    NodeDeleted { node_id: NodeId },
    ConnectionCreated { connection_id: ConnectionId },
    ConnectionDeleted { connection_id: ConnectionId },
    /// Click ripple on the canvas, canvas-space coordinates.
    CursorClick { position: Point },
}

/// Identifier of the thing an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectId {
    Node(NodeId),
    Connection(ConnectionId),
}

impl RoomEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RoomEvent::NodeCreated { .. } => EventKind::NodeCreated,
            RoomEvent::NodeUpdated { .. } => EventKind::NodeUpdated,
            RoomEvent::NodeDeleted { .. } => EventKind::NodeDeleted,
            RoomEvent::ConnectionCreated { .. } => EventKind::ConnectionCreated,
            RoomEvent::ConnectionDeleted { .. } => EventKind::ConnectionDeleted,
            RoomEvent::CursorClick { .. } => EventKind::CursorClick,
        }
    }

    pub fn subject_id(&self) -> Option<SubjectId> {
        match self {
            RoomEvent::NodeCreated { node_id }
            | RoomEvent::NodeUpdated { node_id }
            | RoomEvent::NodeDeleted { node_id } => Some(SubjectId::Node(*node_id)),
            RoomEvent::ConnectionCreated { connection_id }
            | RoomEvent::ConnectionDeleted { connection_id } => {
                Some(SubjectId::Connection(connection_id.clone()))
            }
            RoomEvent::CursorClick { .. } => None,
        }
    }
}

/// A received event together with the connection that sent it.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub connection_id: Uuid,
    pub event: RoomEvent,
}

pub type EventHandler = Arc<dyn Fn(&EventContext) + Send + Sync>;

/// Keyed handler registry.
///
/// Registering under an existing key replaces the previous handler, so
/// a subscriber that re-registers on every render is still called once
/// per event.
#[derive(Default)]
pub struct EventListeners {
    handlers: Mutex<HashMap<String, EventHandler>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EventHandler>> {
        // A panicking handler runs outside the lock, so poisoning only
        // happens on a bug inside this type; keep serving anyway.
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, key: impl Into<String>, handler: EventHandler) {
        self.lock().insert(key.into(), handler);
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every handler once. Handlers may (un)register re-entrantly.
    pub fn dispatch(&self, context: &EventContext) -> usize {
        let handlers: Vec<EventHandler> = self.lock().values().cloned().collect();
        for handler in &handlers {
            handler(context);
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(event: RoomEvent) -> EventContext {
        EventContext {
            connection_id: Uuid::new_v4(),
            event,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, EventHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_kind_and_subject() {
        let e = RoomEvent::NodeUpdated { node_id: 4 };
        assert_eq!(e.kind(), EventKind::NodeUpdated);
        assert_eq!(e.kind().as_str(), "NODE_UPDATED");
        assert_eq!(e.subject_id(), Some(SubjectId::Node(4)));

        let e = RoomEvent::ConnectionDeleted { connection_id: "c1".into() };
        assert_eq!(e.subject_id(), Some(SubjectId::Connection("c1".into())));

        let e = RoomEvent::CursorClick { position: Point::new(1.0, 2.0) };
        assert_eq!(e.subject_id(), None);
    }

    #[test]
    fn test_reregistering_does_not_duplicate() {
        let listeners = EventListeners::new();
        let (count, handler) = counter();
        listeners.register("canvas", handler.clone());
        listeners.register("canvas", handler.clone());
        listeners.register("canvas", handler);

        let delivered = listeners.dispatch(&context(RoomEvent::NodeCreated { node_id: 1 }));
        assert_eq!(delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_distinct_keys_each_receive() {
        let listeners = EventListeners::new();
        let (a, ha) = counter();
        let (b, hb) = counter();
        listeners.register("a", ha);
        listeners.register("b", hb);
        listeners.dispatch(&context(RoomEvent::NodeDeleted { node_id: 1 }));
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_and_clear() {
        let listeners = EventListeners::new();
        let (count, handler) = counter();
        listeners.register("a", handler.clone());
        assert!(listeners.unregister("a"));
        assert!(!listeners.unregister("a"));
        listeners.dispatch(&context(RoomEvent::NodeCreated { node_id: 1 }));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        listeners.register("b", handler);
        listeners.clear();
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_handler_can_unregister_itself() {
        let listeners = Arc::new(EventListeners::new());
        let inner = listeners.clone();
        listeners.register("once", Arc::new(move |_| {
            inner.unregister("once");
        }));
        listeners.dispatch(&context(RoomEvent::NodeCreated { node_id: 1 }));
        assert!(listeners.is_empty());
    }
}
