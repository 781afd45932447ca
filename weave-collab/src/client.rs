//! WebSocket sync client: one connection to one room.
//!
//! The client only moves frames. It does not own the room's store; the
//! room driver applies what arrives on the event channel and decides
//! what to send. A new client (and a new peer id) is used for every
//! connection attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::events::RoomEvent;
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What arrived from the server.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Incremental CRDT update from another peer.
    RemoteDelta {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    /// Server's answer to our state vector.
    StateSynced(Vec<u8>),
    /// Server asks for what we have that it lacks (its state vector).
    SyncRequested(Vec<u8>),
    RemotePresence {
        peer_id: Uuid,
        message: AwarenessMessage,
    },
    RemoteEvent {
        peer_id: Uuid,
        event: RoomEvent,
    },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    Pong,
}

/// Map one decoded frame to the event the application cares about.
fn to_event(msg: SyncMessage) -> Option<SyncEvent> {
    match msg.msg_type {
        MessageType::Delta => Some(SyncEvent::RemoteDelta {
            peer_id: msg.peer_id,
            clock: msg.clock,
            update: msg.payload,
        }),
        MessageType::SyncStep1 => Some(SyncEvent::SyncRequested(msg.payload)),
        MessageType::SyncStep2 => Some(SyncEvent::StateSynced(msg.payload)),
        MessageType::Awareness => match msg.awareness_message() {
            Ok(message) => Some(SyncEvent::RemotePresence {
                peer_id: msg.peer_id,
                message,
            }),
            Err(e) => {
                log::warn!("Dropping malformed presence from {}: {e}", msg.peer_id);
                None
            }
        },
        MessageType::Event => match msg.room_event() {
            Ok(event) => Some(SyncEvent::RemoteEvent {
                peer_id: msg.peer_id,
                event,
            }),
            Err(e) => {
                log::warn!("Dropping malformed event from {}: {e}", msg.peer_id);
                None
            }
        },
        MessageType::PeerJoined => msg.peer_info().ok().map(SyncEvent::PeerJoined),
        MessageType::PeerLeft => Some(SyncEvent::PeerLeft(msg.peer_id)),
        MessageType::Pong => Some(SyncEvent::Pong),
        MessageType::Ping => None,
    }
}

pub struct SyncClient {
    peer_info: PeerInfo,
    room_id: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Per-connection send counter
    clock: AtomicU64,
    /// Frames for the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, room_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_info,
            room_id: room_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: AtomicU64::new(0),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the socket, announce ourselves and spawn the reader/writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        // The room travels in the join frame, so any room id works
        // regardless of what a URL path would allow.
        let url = self.server_url.as_str();
        let ws_stream = match tokio_tungstenite::connect_async(url).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::debug!("Connect to {url} failed: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(frame).await.is_err() {
                    return;
                }
            }
            // Every sender dropped: close politely so the server
            // announces our departure right away.
            let _ = ws_writer.send(Message::Close(None)).await;
        });
        self.outgoing_tx = Some(out_tx);

        let join = SyncMessage::peer_joined(self.peer_info.peer_id, &self.room_id, &self.peer_info)?;
        self.send(join).await?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!("Connected to room {} as {}", self.room_id, self.peer_info.peer_id);

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let peer_id = self.peer_info.peer_id;
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => {
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode frame: {e}");
                                continue;
                            }
                        };
                        if sync_msg.peer_id == peer_id {
                            continue;
                        }
                        if let Some(event) = to_event(sync_msg) {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the socket. Idempotent.
    pub async fn disconnect(&mut self) {
        // Dropping the sender makes the writer send a Close frame.
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn next_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Send a CRDT update. Fails when not connected; nothing is queued,
    /// the next handshake carries whatever the server missed.
    pub async fn send_delta(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let msg = SyncMessage::delta(self.peer_info.peer_id, &self.room_id, self.next_clock(), update);
        self.send(msg).await
    }

    pub async fn send_event(&self, event: &RoomEvent) -> Result<(), ProtocolError> {
        let msg = SyncMessage::event(self.peer_info.peer_id, &self.room_id, self.next_clock(), event)?;
        self.send(msg).await
    }

    pub async fn send_awareness(&self, message: &AwarenessMessage) -> Result<(), ProtocolError> {
        let msg = SyncMessage::awareness(
            self.peer_info.peer_id,
            &self.room_id,
            self.clock.load(Ordering::Relaxed),
            message,
        )?;
        self.send(msg).await
    }

    pub async fn send_sync_step1(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(SyncMessage::sync_step1(self.peer_info.peer_id, &self.room_id, state_vector))
            .await
    }

    pub async fn send_sync_step2(&self, diff: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(SyncMessage::sync_step2(self.peer_info.peer_id, &self.room_id, diff))
            .await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(SyncMessage::ping(self.peer_info.peer_id)).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SyncClient {
        SyncClient::new(PeerInfo::new("TestUser"), "canvas-1", "ws://127.0.0.1:9")
    }

    #[test]
    fn test_client_creation() {
        let client = client();
        assert_eq!(client.peer_info().name, "TestUser");
        assert_eq!(client.room_id(), "canvas-1");
        assert_eq!(client.server_url(), "ws://127.0.0.1:9");
        assert_eq!(client.clock(), 0);
    }

    #[tokio::test]
    async fn test_initial_state() {
        assert_eq!(client().connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let client = client();
        assert!(matches!(
            client.send_delta(vec![1, 2, 3]).await,
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(client.send_ping().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut client = client();
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_frame_to_event() {
        let peer = Uuid::new_v4();
        match to_event(SyncMessage::delta(peer, "r", 4, vec![9])) {
            Some(SyncEvent::RemoteDelta { peer_id, clock, update }) => {
                assert_eq!((peer_id, clock, update), (peer, 4, vec![9]));
            }
            other => panic!("unexpected {other:?}"),
        }

        let event = RoomEvent::NodeDeleted { node_id: 2 };
        let msg = SyncMessage::event(peer, "r", 1, &event).unwrap();
        assert!(matches!(
            to_event(msg),
            Some(SyncEvent::RemoteEvent { event: RoomEvent::NodeDeleted { node_id: 2 }, .. })
        ));

        assert!(matches!(
            to_event(SyncMessage::sync_step1(peer, "r", vec![0])),
            Some(SyncEvent::SyncRequested(_))
        ));
        assert!(to_event(SyncMessage::ping(peer)).is_none());
    }

    #[test]
    fn test_malformed_presence_dropped() {
        let mut msg = SyncMessage::ping(Uuid::new_v4());
        msg.msg_type = MessageType::Awareness;
        msg.payload = vec![0xFF, 0xFF];
        assert!(to_event(msg).is_none());
    }
}
