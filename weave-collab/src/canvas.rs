//! Canvas-side helpers on top of a [`RoomHandle`].
//!
//! [`CanvasSync`] turns remote "something changed" events into observer
//! callbacks carrying the record as it is in the store *now*.
//! [`CanvasPresence`] converts pointer pixels to canvas space before
//! publishing them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use uuid::Uuid;
use weave_core::{CanvasNode, ConnectionId, NodeConnection, NodeId, Point};

use crate::events::{EventContext, RoomEvent};
use crate::presence::{RemoteCursor, Selector, Viewport};
use crate::room::{PresenceUpdate, Room, RoomHandle};

/// Listener key used by [`CanvasSync::attach`].
pub const CANVAS_SYNC_KEY: &str = "canvas-sync";

/// Receives canvas changes made by other peers. Every method has an
/// empty default.
pub trait CanvasObserver: Send + Sync {
    fn node_created(&self, _node: &CanvasNode) {}
    fn node_updated(&self, _node: &CanvasNode) {}
    fn node_deleted(&self, _node_id: NodeId) {}
    fn connection_created(&self, _connection: &NodeConnection) {}
    fn connection_deleted(&self, _connection_id: &ConnectionId) {}
    fn cursor_click(&self, _from: Uuid, _position: Point) {}
}

/// Live subscription of one observer to one room. Detaches on drop.
pub struct CanvasSync {
    room: RoomHandle,
    key: String,
}

impl CanvasSync {
    pub fn attach(room: &RoomHandle, observer: Arc<dyn CanvasObserver>) -> Self {
        Self::attach_as(room, CANVAS_SYNC_KEY, observer)
    }

    /// Attach under an explicit listener key. Attaching again with the
    /// same key replaces the previous observer.
    pub fn attach_as(room: &RoomHandle, key: &str, observer: Arc<dyn CanvasObserver>) -> Self {
        let reader: Weak<dyn Room> = Arc::downgrade(room);
        room.on_event(
            key,
            Arc::new(move |ctx: &EventContext| {
                if let Some(room) = reader.upgrade() {
                    deliver(room.as_ref(), observer.as_ref(), ctx);
                }
            }),
        );
        Self {
            room: room.clone(),
            key: key.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn detach(&self) {
        self.room.off_event(&self.key);
    }
}

impl Drop for CanvasSync {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Re-read the store for the event's subject and notify.
fn deliver(room: &dyn Room, observer: &dyn CanvasObserver, ctx: &EventContext) {
    match &ctx.event {
        RoomEvent::NodeCreated { node_id } => match room.node(*node_id) {
            Some(node) => observer.node_created(&node),
            None => log::debug!("Node {node_id} already gone, skipping create"),
        },
        RoomEvent::NodeUpdated { node_id } => {
            if let Some(node) = room.node(*node_id) {
                observer.node_updated(&node);
            }
        }
        RoomEvent::NodeDeleted { node_id } => {
            // Recreated concurrently: the record wins over the event.
            if room.node(*node_id).is_none() {
                observer.node_deleted(*node_id);
            }
        }
        RoomEvent::ConnectionCreated { connection_id } => {
            let found = room
                .connections()
                .into_iter()
                .find(|c| &c.id == connection_id);
            if let Some(connection) = found {
                observer.connection_created(&connection);
            }
        }
        RoomEvent::ConnectionDeleted { connection_id } => {
            if !room.connections().iter().any(|c| &c.id == connection_id) {
                observer.connection_deleted(connection_id);
            }
        }
        RoomEvent::CursorClick { position } => observer.cursor_click(ctx.connection_id, *position),
    }
}

/// Pointer and selection presence in canvas coordinates.
pub struct CanvasPresence {
    room: RoomHandle,
    viewport: Viewport,
}

impl CanvasPresence {
    pub fn new(room: RoomHandle) -> Self {
        Self {
            room,
            viewport: Viewport::default(),
        }
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    /// Publish the pointer. Returns the canvas-space position.
    pub fn update_cursor(&self, client_x: f64, client_y: f64) -> Point {
        let position = self.viewport.to_canvas(client_x, client_y);
        self.room.update_presence(PresenceUpdate::Cursor(Some(position)));
        position
    }

    /// Pointer left the canvas.
    pub fn clear_cursor(&self) {
        self.room.update_presence(PresenceUpdate::Cursor(None));
    }

    pub fn update_selected_nodes(&self, node_ids: Vec<NodeId>) {
        self.room.update_presence(PresenceUpdate::Selection(node_ids));
    }

    /// Show a click ripple to the other peers.
    pub fn click(&self, client_x: f64, client_y: f64) -> Point {
        let position = self.viewport.to_canvas(client_x, client_y);
        self.room.broadcast(RoomEvent::CursorClick { position });
        position
    }

    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.room.presence().remote_cursors()
    }

    pub fn others_selected_nodes(&self) -> HashMap<NodeId, Vec<Selector>> {
        self.room.presence().others_selected_nodes()
    }

    /// Who else has `node_id` selected.
    pub fn selection_highlight(&self, node_id: NodeId) -> Vec<Selector> {
        self.others_selected_nodes()
            .remove(&node_id)
            .unwrap_or_default()
    }
}
