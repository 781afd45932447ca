//! Presence: who is here, where their pointer is, what they selected.
//!
//! ## Architecture
//!
//! ```text
//! pointer move ──▶ Viewport::to_canvas() ──▶ PresenceRoom::update_local_cursor()
//!                                                 │  (rate-limited, latest kept pending)
//!                                                 ▼
//!                                   AwarenessMessage::Cursor { … }
//!                                                 │  (WebSocket broadcast)
//!                                                 ▼
//!                                   remote PresenceRoom::handle_message()
//!                                                 │
//!                                                 ▼
//!                           others() / remote_cursors() / others_selected_nodes()
//! ```
//!
//! Presence never touches the shared store and is dropped on disconnect.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weave_core::{initials, NodeId, Point, Presence, TextCursor, View};

/// Default minimum gap between outbound cursor updates (~60 fps).
pub const DEFAULT_CURSOR_INTERVAL: Duration = Duration::from_millis(16);

/// Highlight color used when a peer has not published one.
pub const FALLBACK_COLOR: &str = "#888888";
pub const FALLBACK_NAME: &str = "Anonymous";

// ───────────────────────────────────────────────────────────────────
// Viewport transform
// ───────────────────────────────────────────────────────────────────

/// Screen placement of the canvas: container offset, pan and zoom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub container_left: f64,
    pub container_top: f64,
    pub pan_x: f64,
    pub pan_y: f64,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            container_left: 0.0,
            container_top: 0.0,
            pan_x: 0.0,
            pan_y: 0.0,
            zoom: 1.0,
        }
    }
}

impl Viewport {
    /// Convert a pixel coordinate to canvas space:
    /// `canvas = (client - container - pan) / zoom`.
    pub fn to_canvas(&self, client_x: f64, client_y: f64) -> Point {
        let zoom = if self.zoom.is_finite() && self.zoom > 0.0 {
            self.zoom
        } else {
            1.0
        };
        Point::new(
            (client_x - self.container_left - self.pan_x) / zoom,
            (client_y - self.container_top - self.pan_y) / zoom,
        )
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire protocol messages
// ───────────────────────────────────────────────────────────────────

/// Presence messages, carried inside `SyncMessage::Awareness` payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    /// Full presence snapshot. Sent on join and replayed to late joiners.
    Join { user_id: Uuid, presence: Presence },

    /// Clean disconnect.
    Leave { user_id: Uuid },

    /// Pointer moved (`Some`) or left the canvas (`None`).
    Cursor {
        user_id: Uuid,
        position: Option<Point>,
        /// Monotonic per-sender counter; older updates are dropped.
        timestamp: u64,
    },

    /// Selection replaced.
    Selection { user_id: Uuid, node_ids: Vec<NodeId> },

    /// Switched between canvas and document view.
    View {
        user_id: Uuid,
        view: View,
        document_node_id: Option<NodeId>,
    },

    /// Caret moved inside a document body.
    TextCursor {
        user_id: Uuid,
        cursor: Option<TextCursor>,
    },
}

impl AwarenessMessage {
    /// Get the user_id from any variant.
    pub fn user_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { user_id, .. }
            | AwarenessMessage::Leave { user_id }
            | AwarenessMessage::Cursor { user_id, .. }
            | AwarenessMessage::Selection { user_id, .. }
            | AwarenessMessage::View { user_id, .. }
            | AwarenessMessage::TextCursor { user_id, .. } => *user_id,
        }
    }

    /// Fold an incremental update into a presence record.
    /// `Join` replaces the record, `Leave` leaves it untouched.
    pub fn apply_to(&self, presence: &mut Presence) {
        match self {
            AwarenessMessage::Join { presence: full, .. } => *presence = full.clone(),
            AwarenessMessage::Leave { .. } => {}
            AwarenessMessage::Cursor { position, .. } => presence.cursor = *position,
            AwarenessMessage::Selection { node_ids, .. } => {
                presence.selected_node_ids = node_ids.clone();
            }
            AwarenessMessage::View {
                view,
                document_node_id,
                ..
            } => {
                presence.current_view = *view;
                presence.document_node_id = *document_node_id;
            }
            AwarenessMessage::TextCursor { cursor, .. } => presence.text_cursor = cursor.clone(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Derived views for rendering
// ───────────────────────────────────────────────────────────────────

/// Another connection's presence.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPresence {
    pub connection_id: Uuid,
    pub presence: Presence,
}

/// "Selected by" entry for a node highlight ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub connection_id: Uuid,
    pub color: String,
    pub name: String,
}

/// A remote pointer to draw.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub connection_id: Uuid,
    pub position: Point,
    pub name: String,
    pub color: String,
}

/// A remote caret inside a document body.
#[derive(Debug, Clone, PartialEq)]
pub struct CollaborationCursor {
    pub connection_id: Uuid,
    pub name: String,
    pub color: String,
    pub anchor: u32,
    pub head: u32,
}

/// Avatar stack entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Collaborator {
    pub connection_id: Uuid,
    pub name: String,
    pub color: String,
    pub avatar: Option<String>,
    pub initials: String,
    pub is_self: bool,
}

/// Avatar stack: self first, then peers, cut at a display limit.
#[derive(Debug, Clone, PartialEq)]
pub struct CollaboratorList {
    pub visible: Vec<Collaborator>,
    /// Collaborators beyond the display limit ("+N").
    pub hidden: usize,
    pub total: usize,
}

fn display_name(presence: &Presence) -> String {
    if presence.user.name.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        presence.user.name.clone()
    }
}

fn display_color(presence: &Presence) -> String {
    if presence.user.color.is_empty() {
        FALLBACK_COLOR.to_string()
    } else {
        presence.user.color.clone()
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RemotePeer {
    presence: Presence,
    last_timestamp: u64,
}

/// Local presence plus everything known about the other connections
/// in one room.
#[derive(Debug, Clone)]
pub struct PresenceRoom {
    local_id: Uuid,
    local: Presence,
    peers: HashMap<Uuid, RemotePeer>,
    /// Rate limiter: last time we broadcast a cursor update.
    last_cursor_broadcast: Instant,
    cursor_interval: Duration,
    /// A throttled cursor position is waiting to be sent.
    pending_cursor: bool,
    timestamp_counter: u64,
}

impl PresenceRoom {
    pub fn new(local_id: Uuid, local: Presence) -> Self {
        Self::with_interval(local_id, local, DEFAULT_CURSOR_INTERVAL)
    }

    /// Create with custom cursor broadcast interval.
    pub fn with_interval(local_id: Uuid, local: Presence, interval: Duration) -> Self {
        Self {
            local_id,
            local,
            peers: HashMap::new(),
            last_cursor_broadcast: Instant::now()
                .checked_sub(interval)
                .unwrap_or_else(Instant::now),
            cursor_interval: interval,
            pending_cursor: false,
            timestamp_counter: 0,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    /// Adopt a new connection id (each reconnect gets a fresh one).
    pub fn set_local_id(&mut self, id: Uuid) {
        self.local_id = id;
    }

    pub fn local(&self) -> &Presence {
        &self.local
    }

    pub fn join_message(&self) -> AwarenessMessage {
        AwarenessMessage::Join {
            user_id: self.local_id,
            presence: self.local.clone(),
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            user_id: self.local_id,
        }
    }

    /// Handle an incoming presence message from the network.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) {
        let user_id = msg.user_id();
        if user_id == self.local_id {
            return;
        }

        match msg {
            AwarenessMessage::Join { presence, .. } => {
                self.peers.insert(
                    user_id,
                    RemotePeer {
                        presence: presence.clone(),
                        last_timestamp: 0,
                    },
                );
            }
            AwarenessMessage::Leave { .. } => {
                self.peers.remove(&user_id);
            }
            AwarenessMessage::Cursor { timestamp, .. } => {
                // Cursor before Join: the join snapshot is still in
                // flight, nothing to attach the position to yet.
                if let Some(peer) = self.peers.get_mut(&user_id) {
                    if *timestamp < peer.last_timestamp {
                        return;
                    }
                    peer.last_timestamp = *timestamp;
                    msg.apply_to(&mut peer.presence);
                }
            }
            _ => {
                if let Some(peer) = self.peers.get_mut(&user_id) {
                    msg.apply_to(&mut peer.presence);
                }
            }
        }
    }

    fn cursor_message(&mut self) -> AwarenessMessage {
        self.timestamp_counter += 1;
        self.last_cursor_broadcast = Instant::now();
        self.pending_cursor = false;
        AwarenessMessage::Cursor {
            user_id: self.local_id,
            position: self.local.cursor,
            timestamp: self.timestamp_counter,
        }
    }

    /// Update the local cursor and return a message if it should go out now.
    ///
    /// Moves are rate-limited; a throttled move is kept pending for
    /// [`take_pending_cursor`](Self::take_pending_cursor). Clearing the
    /// cursor is never throttled.
    pub fn update_local_cursor(&mut self, position: Option<Point>) -> Option<AwarenessMessage> {
        self.local.cursor = position;

        if position.is_some() && self.last_cursor_broadcast.elapsed() < self.cursor_interval {
            self.pending_cursor = true;
            return None;
        }
        Some(self.cursor_message())
    }

    /// The latest throttled cursor, once the rate limit allows it.
    pub fn take_pending_cursor(&mut self) -> Option<AwarenessMessage> {
        if !self.pending_cursor || self.last_cursor_broadcast.elapsed() < self.cursor_interval {
            return None;
        }
        Some(self.cursor_message())
    }

    pub fn has_pending_cursor(&self) -> bool {
        self.pending_cursor
    }

    pub fn update_local_selection(&mut self, node_ids: Vec<NodeId>) -> AwarenessMessage {
        self.local.selected_node_ids = node_ids.clone();
        AwarenessMessage::Selection {
            user_id: self.local_id,
            node_ids,
        }
    }

    pub fn update_local_view(&mut self, view: View, document_node_id: Option<NodeId>) -> AwarenessMessage {
        self.local.current_view = view;
        self.local.document_node_id = document_node_id;
        AwarenessMessage::View {
            user_id: self.local_id,
            view,
            document_node_id,
        }
    }

    pub fn update_local_text_cursor(&mut self, cursor: Option<TextCursor>) -> AwarenessMessage {
        self.local.text_cursor = cursor.clone();
        AwarenessMessage::TextCursor {
            user_id: self.local_id,
            cursor,
        }
    }

    pub fn remove_peer(&mut self, id: &Uuid) -> bool {
        self.peers.remove(id).is_some()
    }

    /// Forget every remote peer (on disconnect).
    pub fn clear_peers(&mut self) {
        self.peers.clear();
    }

    pub fn peer(&self, id: &Uuid) -> Option<&Presence> {
        self.peers.get(id).map(|p| &p.presence)
    }

    /// Number of remote peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Remote peers plus ourselves.
    pub fn connected_users(&self) -> usize {
        self.peers.len() + 1
    }

    /// Other connections, ordered by connection id.
    pub fn others(&self) -> Vec<PeerPresence> {
        let mut others: Vec<PeerPresence> = self
            .peers
            .iter()
            .map(|(id, peer)| PeerPresence {
                connection_id: *id,
                presence: peer.presence.clone(),
            })
            .collect();
        others.sort_by_key(|p| p.connection_id);
        others
    }

    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.others()
            .into_iter()
            .filter_map(|peer| {
                let position = peer.presence.cursor?;
                Some(RemoteCursor {
                    connection_id: peer.connection_id,
                    position,
                    name: display_name(&peer.presence),
                    color: display_color(&peer.presence),
                })
            })
            .collect()
    }

    /// Node id → who (other than us) has it selected.
    pub fn others_selected_nodes(&self) -> HashMap<NodeId, Vec<Selector>> {
        let mut selected: HashMap<NodeId, Vec<Selector>> = HashMap::new();
        for peer in self.others() {
            for node_id in &peer.presence.selected_node_ids {
                selected.entry(*node_id).or_default().push(Selector {
                    connection_id: peer.connection_id,
                    color: display_color(&peer.presence),
                    name: display_name(&peer.presence),
                });
            }
        }
        selected
    }

    /// Remote carets inside the body stored under `namespace`.
    ///
    /// `resolve` maps an encoded caret position to a byte offset in the
    /// local replica; carets it cannot place yet are left out.
    pub fn text_cursors(
        &self,
        namespace: &str,
        resolve: impl Fn(&[u8]) -> Option<u32>,
    ) -> Vec<CollaborationCursor> {
        self.others()
            .into_iter()
            .filter_map(|peer| {
                let cursor = peer.presence.text_cursor.as_ref()?;
                if cursor.namespace != namespace {
                    return None;
                }
                Some(CollaborationCursor {
                    connection_id: peer.connection_id,
                    name: display_name(&peer.presence),
                    color: display_color(&peer.presence),
                    anchor: resolve(&cursor.anchor)?,
                    head: resolve(&cursor.head)?,
                })
            })
            .collect()
    }

    pub fn collaborators(&self, max_display: usize) -> CollaboratorList {
        let me = std::iter::once((self.local_id, &self.local, true));
        let mut peers: Vec<(Uuid, &Presence, bool)> = self
            .peers
            .iter()
            .map(|(id, p)| (*id, &p.presence, false))
            .collect();
        peers.sort_by_key(|(id, _, _)| *id);

        let all: Vec<Collaborator> = me
            .chain(peers)
            .map(|(id, presence, is_self)| {
                let name = display_name(presence);
                Collaborator {
                    connection_id: id,
                    initials: initials(&name),
                    name,
                    color: display_color(presence),
                    avatar: presence.user.avatar.clone(),
                    is_self,
                }
            })
            .collect();

        let total = all.len();
        let visible: Vec<Collaborator> = all.into_iter().take(max_display).collect();
        CollaboratorList {
            hidden: total - visible.len(),
            visible,
            total,
        }
    }
}
