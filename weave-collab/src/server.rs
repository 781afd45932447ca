//! WebSocket relay with room-based routing.
//!
//! ```text
//! Client A ──┐
//!            ├── ServerRoom ("canvas-42") ── SharedStore (authority)
//! Client B ──┘        │                   ── presence cache
//!                     │                   ── BroadcastGroup
//!          ┌──────────┼───────────┐
//!          ▼          ▼           ▼
//!       Client A   Client B    Client C
//! ```
//!
//! The server merges every update into the room's store so late joiners
//! can catch up with a single diff, and relays deltas, events and
//! presence to the other peers in the order it received them. Rooms
//! live in memory and disappear with their last peer; durable state
//! comes from the application's own persistence tier through hydration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use weave_core::{Presence, SharedStore};

use crate::broadcast::{BroadcastGroup, Relay, RoomFull};
use crate::config::parse_or;
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

pub const ENV_BIND_ADDR: &str = "WEAVE_BIND_ADDR";
pub const ENV_MAX_PEERS_PER_ROOM: &str = "WEAVE_MAX_PEERS_PER_ROOM";
pub const ENV_BROADCAST_CAPACITY: &str = "WEAVE_BROADCAST_CAPACITY";

/// A connection silent for this many heartbeat intervals is dropped.
const IDLE_HEARTBEATS: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Frames buffered per connection before it starts lagging
    pub broadcast_capacity: usize,
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: lookup(ENV_BIND_ADDR)
                .map(|addr| addr.trim().to_string())
                .filter(|addr| !addr.is_empty())
                .unwrap_or(defaults.bind_addr),
            max_peers_per_room: parse_or(
                &lookup,
                ENV_MAX_PEERS_PER_ROOM,
                defaults.max_peers_per_room,
                |n: usize| n,
            ),
            broadcast_capacity: parse_or(
                &lookup,
                ENV_BROADCAST_CAPACITY,
                defaults.broadcast_capacity,
                |n: usize| n.max(1),
            ),
            heartbeat_interval_secs: parse_or(
                &lookup,
                crate::config::ENV_HEARTBEAT_SECS,
                defaults.heartbeat_interval_secs,
                |n: u64| n,
            ),
        }
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1)) * IDLE_HEARTBEATS
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_joins: u64,
}

/// Authoritative state for one room.
struct ServerRoom {
    store: SharedStore,
    /// Latest presence per connection, replayed to late joiners.
    presence: Mutex<HashMap<Uuid, Presence>>,
    broadcast: BroadcastGroup,
}

impl ServerRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            store: SharedStore::new(),
            presence: Mutex::new(HashMap::new()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        }
    }

    fn presence_snapshot(&self) -> Vec<(Uuid, Presence)> {
        self.presence
            .lock()
            .map(|cache| cache.iter().map(|(id, p)| (*id, p.clone())).collect())
            .unwrap_or_default()
    }

    fn record_presence(&self, from: Uuid, message: &AwarenessMessage) {
        let Ok(mut cache) = self.presence.lock() else {
            return;
        };
        match message {
            AwarenessMessage::Join { presence, .. } => {
                cache.insert(from, presence.clone());
            }
            AwarenessMessage::Leave { .. } => {
                cache.remove(&from);
            }
            other => {
                if let Some(presence) = cache.get_mut(&from) {
                    other.apply_to(presence);
                }
            }
        }
    }

    /// Everything a lagging peer needs to catch up: the full store as a
    /// sync reply, then the presence of everyone in the room.
    fn resync_frames(&self, room_id: &str) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let mut frames = vec![SyncMessage::sync_step2(Uuid::nil(), room_id, self.store.encode_state()).encode()?];
        for (user_id, presence) in self.presence_snapshot() {
            let join = AwarenessMessage::Join { user_id, presence };
            frames.push(SyncMessage::awareness(user_id, room_id, 0, &join)?.encode()?);
        }
        Ok(frames)
    }

    fn forget_presence(&self, peer_id: &Uuid) {
        if let Ok(mut cache) = self.presence.lock() {
            cache.remove(peer_id);
        }
    }
}

type Rooms = RwLock<HashMap<String, Arc<ServerRoom>>>;

struct ServerState {
    config: ServerConfig,
    rooms: Rooms,
    stats: RwLock<ServerStats>,
}

impl ServerState {
    /// Add a peer to a room, creating the room on first join. Runs under
    /// the rooms write lock so a concurrent last-peer-leaves cannot drop
    /// the room between lookup and join.
    async fn join_room(
        &self,
        room_id: &str,
        info: PeerInfo,
        max_peers: usize,
    ) -> Result<(Arc<ServerRoom>, broadcast::Receiver<Relay>), RoomFull> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                log::info!("Room {room_id} created");
                Arc::new(ServerRoom::new(self.config.broadcast_capacity))
            })
            .clone();

        let joined = room.broadcast.try_add_peer(info, max_peers).await;
        let result = match joined {
            Ok(rx) => Ok((room, rx)),
            Err(full) => {
                if room.broadcast.peer_count().await == 0 {
                    rooms.remove(room_id);
                }
                Err(full)
            }
        };
        let room_count = rooms.len();
        drop(rooms);
        self.stats.write().await.active_rooms = room_count;
        result
    }

    async fn remove_room_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get(room_id) {
            Some(room) => room.broadcast.peer_count().await == 0,
            None => false,
        };
        if empty {
            rooms.remove(room_id);
            log::info!("Room {room_id} removed (empty)");
        }
        let room_count = rooms.len();
        drop(rooms);
        self.stats.write().await.active_rooms = room_count;
        empty
    }
}

/// Per-connection routing state.
struct Session {
    peer_id: Uuid,
    room_id: String,
    room: Arc<ServerRoom>,
}

pub struct SyncServer {
    state: Arc<ServerState>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(ServerState {
                config,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, state).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<ServerState>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = state.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let idle_timeout = state.config.idle_timeout();
        let mut last_seen = Instant::now();
        let mut session: Option<Session> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Relay>> = None;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        last_seen = Instant::now();
                        let data = match msg {
                            Some(Ok(Message::Binary(data))) => data,
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        {
                            let mut s = state.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }

                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };

                        if sync_msg.msg_type == MessageType::PeerJoined {
                            if session.is_some() {
                                log::debug!("Duplicate join from {addr} ignored");
                                continue;
                            }
                            let info = sync_msg
                                .peer_info()
                                .unwrap_or_else(|_| PeerInfo::with_id(sync_msg.peer_id, "Anonymous"));
                            let (room, rx) = match state
                                .join_room(&sync_msg.room_id, info.clone(), state.config.max_peers_per_room)
                                .await
                            {
                                Ok(joined) => joined,
                                Err(full) => {
                                    log::warn!(
                                        "Rejecting {} from room {}: {} peers max",
                                        info.peer_id,
                                        sync_msg.room_id,
                                        full.max_peers
                                    );
                                    state.stats.write().await.rejected_joins += 1;
                                    ws_sender.send(Message::Close(None)).await?;
                                    break;
                                }
                            };
                            broadcast_rx = Some(rx);

                            // Presence of everyone already here.
                            for (user_id, presence) in room.presence_snapshot() {
                                let snapshot = SyncMessage::awareness(
                                    user_id,
                                    &sync_msg.room_id,
                                    0,
                                    &AwarenessMessage::Join { user_id, presence },
                                )?;
                                ws_sender.send(Message::Binary(snapshot.encode()?.into())).await?;
                            }

                            room.broadcast.broadcast_raw(info.peer_id, Arc::new(data.to_vec()));

                            log::info!("Peer {} ({}) joined room {}", info.name, info.peer_id, sync_msg.room_id);
                            session = Some(Session {
                                peer_id: info.peer_id,
                                room_id: sync_msg.room_id,
                                room,
                            });
                            continue;
                        }

                        let Some(current) = session.as_ref() else {
                            log::debug!("{:?} before join from {addr} ignored", sync_msg.msg_type);
                            continue;
                        };

                        match sync_msg.msg_type {
                            MessageType::SyncStep1 => {
                                match current.room.store.diff_since(&sync_msg.payload) {
                                    Ok(diff) => {
                                        let reply = SyncMessage::sync_step2(Uuid::nil(), &current.room_id, diff);
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        // Ask back for anything the client made offline.
                                        let ask = SyncMessage::sync_step1(
                                            Uuid::nil(),
                                            &current.room_id,
                                            current.room.store.state_vector(),
                                        );
                                        ws_sender.send(Message::Binary(ask.encode()?.into())).await?;
                                    }
                                    Err(e) => log::warn!("Bad state vector from {}: {e}", current.peer_id),
                                }
                            }

                            MessageType::SyncStep2 | MessageType::Delta => {
                                if let Err(e) = current.room.store.apply_update(&sync_msg.payload) {
                                    log::warn!("Dropping bad update from {}: {e}", current.peer_id);
                                    continue;
                                }
                                let relay = if sync_msg.msg_type == MessageType::Delta {
                                    Arc::new(data.to_vec())
                                } else {
                                    let delta = SyncMessage::delta(
                                        current.peer_id,
                                        &current.room_id,
                                        sync_msg.clock,
                                        sync_msg.payload,
                                    );
                                    Arc::new(delta.encode()?)
                                };
                                current.room.broadcast.broadcast_raw(current.peer_id, relay);
                            }

                            MessageType::Event => {
                                match sync_msg.room_event() {
                                    Ok(event) => log::debug!(
                                        "Relaying {} in room {}",
                                        event.kind().as_str(),
                                        current.room_id
                                    ),
                                    Err(e) => {
                                        log::warn!("Dropping bad event from {}: {e}", current.peer_id);
                                        continue;
                                    }
                                }
                                current.room.broadcast.broadcast_raw(current.peer_id, Arc::new(data.to_vec()));
                            }

                            MessageType::Awareness => {
                                let message = match sync_msg.awareness_message() {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Dropping bad presence from {}: {e}", current.peer_id);
                                        continue;
                                    }
                                };
                                match &message {
                                    AwarenessMessage::Join { presence, .. } => {
                                        log::info!("Presence: {} joined room {}", presence.user.name, current.room_id);
                                    }
                                    AwarenessMessage::Leave { user_id } => {
                                        log::info!("Presence: {user_id} left room {}", current.room_id);
                                    }
                                    AwarenessMessage::Cursor { .. } => {
                                        log::trace!("Presence: cursor update in room {}", current.room_id);
                                    }
                                    other => {
                                        log::debug!("Presence: {:?} from {}", other, current.peer_id);
                                    }
                                }
                                current.room.record_presence(current.peer_id, &message);
                                current.room.broadcast.broadcast_raw(current.peer_id, Arc::new(data.to_vec()));
                            }

                            MessageType::Ping => {
                                // Nil sender: clients drop frames carrying their own id.
                                let pong = SyncMessage::pong(Uuid::nil());
                                ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                            }

                            other => log::debug!("Unhandled message type: {other:?}"),
                        }
                    }

                    relay = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match relay {
                            Ok(relay) => {
                                if session.as_ref().is_some_and(|s| s.peer_id == relay.from) {
                                    continue;
                                }
                                ws_sender.send(Message::Binary(relay.frame.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer {addr} lagged by {n} messages, resyncing");
                                if let Some(s) = session.as_ref() {
                                    s.room.broadcast.record_dropped(n);
                                    // Skipped deltas are already merged into the store.
                                    for frame in s.room.resync_frames(&s.room_id)? {
                                        ws_sender.send(Message::Binary(frame.into())).await?;
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }

                    _ = tokio::time::sleep_until(last_seen + idle_timeout) => {
                        log::info!("Closing idle connection from {addr}");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        if let Some(s) = session {
            s.room.broadcast.remove_peer(&s.peer_id).await;
            s.room.forget_presence(&s.peer_id);
            let _ = s.room.broadcast.broadcast(&SyncMessage::peer_left(s.peer_id, &s.room_id));
            log::info!("Peer {} left room {}", s.peer_id, s.room_id);
            state.remove_room_if_empty(&s.room_id).await;
        }
        state.stats.write().await.active_connections -= 1;

        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.state.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.state.rooms.read().await.len()
    }

    pub async fn room_peer_count(&self, room_id: &str) -> usize {
        let room = self.state.rooms.read().await.get(room_id).cloned();
        match room {
            Some(room) => room.broadcast.peer_count().await,
            None => 0,
        }
    }

    /// Full state of a room's authoritative store, if the room is open.
    pub async fn room_state(&self, room_id: &str) -> Option<Vec<u8>> {
        let rooms = self.state.rooms.read().await;
        rooms.get(room_id).map(|room| room.store.encode_state())
    }
}
