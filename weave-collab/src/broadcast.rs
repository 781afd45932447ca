//! Fan-out of encoded frames to every connection in a room.
//!
//! One tokio broadcast channel per room; each connection holds its own
//! receiver that buffers up to `capacity` frames. Frames carry the
//! sender's id so a connection can skip its own traffic without
//! decoding it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// One encoded frame on its way to the other peers.
#[derive(Debug, Clone)]
pub struct Relay {
    pub from: Uuid,
    pub frame: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters are atomics so the send path never takes a lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Join refused because the room is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomFull {
    pub max_peers: usize,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Relay>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per receiver before a
    /// slow peer starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Relay> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    /// Add a peer unless `max_peers` others are already present.
    /// Re-joining with a known id never counts against the limit.
    pub async fn try_add_peer(
        &self,
        info: PeerInfo,
        max_peers: usize,
    ) -> Result<broadcast::Receiver<Relay>, RoomFull> {
        let mut peers = self.peers.write().await;
        if !peers.contains_key(&info.peer_id) && peers.len() >= max_peers {
            return Err(RoomFull { max_peers });
        }
        peers.insert(info.peer_id, info);
        Ok(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and send to every receiver, sender included; filtering
    /// on [`Relay::from`] is the receiver's job.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(msg.peer_id, Arc::new(encoded)))
    }

    /// Send an already-encoded frame.
    pub fn broadcast_raw(&self, from: Uuid, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Relay { from, frame }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
