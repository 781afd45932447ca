//! # weave-collab — real-time rooms for the canvas
//!
//! Everything between a canvas/editor and the relay: rooms, the
//! mutation gateway, ephemeral events, presence, and the WebSocket
//! client and server that carry them.
//!
//! ## Architecture
//!
//! ```text
//!  canvas / editor
//!        │  RoomHandle (Arc<dyn Room>)
//!        ▼
//! ┌──────────────────┐  provider_from_config()
//! │ LiveRoom         │◄──────────── RealCollaborationProvider
//! │  SharedStore     │
//! │  PresenceRoom    │  NullRoom ◄── NullCollaborationProvider
//! │  EventListeners  │  (no backend: synced, alone, no-ops)
//! └────────┬─────────┘
//!          │ SyncClient          WebSocket, bincode frames
//!          ▼
//! ┌──────────────────┐        ┌────────────────┐
//! │ SyncServer       │───────►│ BroadcastGroup │──► other peers
//! │  store per room  │        │ (fan-out)      │
//! └──────────────────┘        └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`room`] / [`live`] / [`provider`] — room sessions and strategy selection
//! - [`gateway`] — store writes paired with change notifications
//! - [`events`] — ephemeral room events and keyed listeners
//! - [`presence`] — cursors, selections and who is online
//! - [`canvas`] / [`editor`] — canvas observers and the text binding
//! - [`protocol`] / [`client`] / [`server`] / [`broadcast`] — the wire

pub mod broadcast;
pub mod canvas;
pub mod client;
pub mod config;
pub mod editor;
pub mod events;
pub mod gateway;
pub mod live;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomFull};
pub use canvas::{CanvasObserver, CanvasPresence, CanvasSync};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use config::CollabConfig;
pub use editor::{CollaborativeEditor, EditorOptions, EditorSettings};
pub use events::{EventContext, EventHandler, EventKind, EventListeners, RoomEvent, SubjectId};
pub use gateway::{MutationGateway, Outbound, OutboundQueue, Outbox};
pub use live::LiveRoom;
pub use presence::{
    AwarenessMessage, CollaborationCursor, Collaborator, CollaboratorList, PeerPresence,
    PresenceRoom, RemoteCursor, Selector, Viewport,
};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use provider::{
    provider_from_config, CollaborationProvider, NullCollaborationProvider,
    RealCollaborationProvider, SharedProvider,
};
pub use room::{NullRoom, PresenceUpdate, Room, RoomHandle, RoomId, RoomStatus};
pub use server::{ServerConfig, ServerStats, SyncServer};
