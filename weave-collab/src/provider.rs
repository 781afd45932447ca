//! Collaboration strategy, chosen once at startup.
//!
//! ```text
//! CollabConfig ──▶ provider_from_config()
//!                      ├── sync url set   ──▶ RealCollaborationProvider ──▶ LiveRoom
//!                      └── no sync url    ──▶ NullCollaborationProvider ──▶ NullRoom
//! ```
//!
//! Both providers hand out [`RoomHandle`]s with identical methods, so
//! nothing downstream branches on configuration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use weave_core::Presence;

use crate::config::CollabConfig;
use crate::live::LiveRoom;
use crate::room::{NullRoom, RoomHandle};

pub trait CollaborationProvider: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Join `room_id`. Entering a room that is already open returns the
    /// same handle and ignores `initial`.
    fn enter(&self, room_id: &str, initial: Presence) -> RoomHandle;

    /// Release one `enter`. The room is left once every caller exited;
    /// other peers are unaffected.
    fn exit(&self, handle: &RoomHandle);

    fn open_rooms(&self) -> usize;
}

pub type SharedProvider = Arc<dyn CollaborationProvider>;

/// Ref-counted open rooms, shared by both providers.
#[derive(Default)]
struct RoomRegistry {
    rooms: Mutex<HashMap<String, (RoomHandle, usize)>>,
}

impl RoomRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, (RoomHandle, usize)>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, room_id: &str, open: impl FnOnce() -> RoomHandle) -> RoomHandle {
        let mut rooms = self.lock();
        let entry = rooms.entry(room_id.to_string()).or_insert_with(|| {
            log::info!("Entering room {room_id}");
            (open(), 0)
        });
        entry.1 += 1;
        entry.0.clone()
    }

    fn exit(&self, handle: &RoomHandle) {
        let closed = {
            let mut rooms = self.lock();
            let room_id = handle.room_id();
            match rooms.get_mut(room_id) {
                Some((open, refs)) if Arc::ptr_eq(open, handle) => {
                    *refs -= 1;
                    if *refs == 0 {
                        rooms.remove(room_id)
                    } else {
                        None
                    }
                }
                _ => {
                    log::debug!("Exit for room {room_id} that is not open here");
                    None
                }
            }
        };
        // Outside the registry lock: exit clears listeners.
        if let Some((room, _)) = closed {
            room.exit();
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// No backend configured: every room is a [`NullRoom`].
#[derive(Default)]
pub struct NullCollaborationProvider {
    registry: RoomRegistry,
}

impl NullCollaborationProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CollaborationProvider for NullCollaborationProvider {
    fn is_enabled(&self) -> bool {
        false
    }

    fn enter(&self, room_id: &str, initial: Presence) -> RoomHandle {
        self.registry
            .enter(room_id, || Arc::new(NullRoom::new(room_id, initial)))
    }

    fn exit(&self, handle: &RoomHandle) {
        self.registry.exit(handle);
    }

    fn open_rooms(&self) -> usize {
        self.registry.len()
    }
}

/// Rooms sync through the relay at `config.sync_url`.
pub struct RealCollaborationProvider {
    url: String,
    config: CollabConfig,
    registry: RoomRegistry,
}

impl RealCollaborationProvider {
    pub fn new(url: impl Into<String>, config: CollabConfig) -> Self {
        Self {
            url: url.into(),
            config,
            registry: RoomRegistry::default(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl CollaborationProvider for RealCollaborationProvider {
    fn is_enabled(&self) -> bool {
        true
    }

    fn enter(&self, room_id: &str, initial: Presence) -> RoomHandle {
        self.registry.enter(room_id, || {
            LiveRoom::connect(room_id, initial, self.url.clone(), &self.config) as RoomHandle
        })
    }

    fn exit(&self, handle: &RoomHandle) {
        self.registry.exit(handle);
    }

    fn open_rooms(&self) -> usize {
        self.registry.len()
    }
}

/// Pick the strategy for this process.
pub fn provider_from_config(config: &CollabConfig) -> SharedProvider {
    match &config.sync_url {
        Some(url) => {
            log::info!("Collaboration enabled, relay at {url}");
            Arc::new(RealCollaborationProvider::new(url.clone(), config.clone()))
        }
        None => {
            log::info!("Collaboration disabled, rooms are local only");
            Arc::new(NullCollaborationProvider::new())
        }
    }
}
