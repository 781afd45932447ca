//! CRDT-backed shared document store.
//!
//! One yrs `Doc` per room with three root types:
//!
//! ```text
//! nodes        Map<"<id>", Map<field, Any>>   per-field last-writer-wins
//! connections  Array<Map<field, Any>>         ordered edge sequence
//!                                              (seeded duplicates collapse)
//! meta         Map<key, Any>                  room flags ("hydrated")
//! ```
//!
//! Document bodies live in the same doc as `body:<namespace>` text roots
//! (see [`crate::document`]), so one update stream carries everything.
//!
//! Every mutation returns the encoded v1 update when it changed state
//! and `None` when it was a no-op (missing id, empty patch).

mod codec;

use std::collections::HashSet;
use std::fmt;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, Doc, Map, MapPrelim, Out, ReadTxn, StateVector, Transact, Update, WriteTxn,
};

use crate::document::RichText;
use crate::{CanvasNode, NodeConnection, NodeId, NodePatch};
use codec::{
    connection_fields, is_seeded, node_fields, patch_fields, read_connection, read_node,
    seeded_connection_fields,
};

const NODES: &str = "nodes";
const CONNECTIONS: &str = "connections";
const META: &str = "meta";
const HYDRATED: &str = "hydrated";

/// Errors from decoding or applying remote sync payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    Decode(String),
    Apply(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "Decode error: {e}"),
            Self::Apply(e) => write!(f, "Apply error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<yrs::encoding::read::Error> for StoreError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        StoreError::Decode(e.to_string())
    }
}

fn node_key(id: NodeId) -> String {
    id.to_string()
}

/// Shared canvas state for one room.
///
/// Cheap to share behind an `Arc`; all methods take `&self` and open
/// their own transaction.
pub struct SharedStore {
    doc: Doc,
}

impl Default for SharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore {
    pub fn new() -> Self {
        let doc = Doc::new();
        // Root types must exist before any transaction is opened.
        doc.get_or_insert_map(NODES);
        doc.get_or_insert_array(CONNECTIONS);
        doc.get_or_insert_map(META);
        Self { doc }
    }

    /// Underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Rich-text body stored under `namespace` in this room.
    pub fn text_body(&self, namespace: &str) -> RichText {
        RichText::new(self.doc.clone(), namespace)
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Insert or fully replace a node record.
    pub fn upsert_node(&self, node: &CanvasNode) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let nodes = txn.get_or_insert_map(NODES);
        let record: MapPrelim = node_fields(node).into_iter().collect();
        nodes.insert(&mut txn, node_key(node.id), record);
        txn.encode_update_v1()
    }

    /// Write the present fields of `patch` onto an existing node.
    pub fn patch_node(&self, id: NodeId, patch: &NodePatch) -> Option<Vec<u8>> {
        let fields = patch_fields(patch);
        if fields.is_empty() {
            return None;
        }

        let mut txn = self.doc.transact_mut();
        let nodes = txn.get_or_insert_map(NODES);
        let record = match nodes.get(&txn, &node_key(id)) {
            Some(Out::YMap(record)) => record,
            _ => return None,
        };
        for (key, value) in fields {
            record.insert(&mut txn, key, value);
        }
        Some(txn.encode_update_v1())
    }

    pub fn move_node(&self, id: NodeId, x: f64, y: f64) -> Option<Vec<u8>> {
        self.patch_node(id, &NodePatch::position(x, y))
    }

    pub fn remove_node(&self, id: NodeId) -> Option<Vec<u8>> {
        let key = node_key(id);
        let mut txn = self.doc.transact_mut();
        let nodes = txn.get_or_insert_map(NODES);
        if !nodes.contains_key(&txn, &key) {
            return None;
        }
        nodes.remove(&mut txn, &key);
        Some(txn.encode_update_v1())
    }

    /// Append an edge. Duplicate ids are accepted.
    pub fn append_connection(&self, connection: &NodeConnection) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let connections = txn.get_or_insert_array(CONNECTIONS);
        let record: MapPrelim = connection_fields(connection).into_iter().collect();
        connections.push_back(&mut txn, record);
        txn.encode_update_v1()
    }

    /// Remove the first edge with the given id. A seeded edge takes its
    /// seeded twins from concurrent hydrations with it.
    pub fn remove_connection(&self, id: &str) -> Option<Vec<u8>> {
        let mut txn = self.doc.transact_mut();
        let connections = txn.get_or_insert_array(CONNECTIONS);
        let hits: Vec<(u32, bool)> = connections
            .iter(&txn)
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Out::YMap(record) => read_connection(&record, &txn)
                    .filter(|c| c.id == id)
                    .map(|_| (index as u32, is_seeded(&record, &txn))),
                _ => None,
            })
            .collect();

        let (first, seeded) = *hits.first()?;
        let doomed: Vec<u32> = if seeded {
            hits.iter().filter(|(_, s)| *s).map(|(index, _)| *index).collect()
        } else {
            vec![first]
        };
        // Back to front keeps the remaining indices valid.
        for index in doomed.into_iter().rev() {
            connections.remove(&mut txn, index);
        }
        Some(txn.encode_update_v1())
    }

    /// Replace every node with `nodes` in a single transaction.
    pub fn initialize_nodes(&self, nodes: &[CanvasNode]) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let map = txn.get_or_insert_map(NODES);
        map.clear(&mut txn);
        for node in nodes {
            let record: MapPrelim = node_fields(node).into_iter().collect();
            map.insert(&mut txn, node_key(node.id), record);
        }
        txn.encode_update_v1()
    }

    /// Replace the edge sequence with `connections` in a single transaction.
    pub fn initialize_connections(&self, connections: &[NodeConnection]) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let array = txn.get_or_insert_array(CONNECTIONS);
        let len = array.len(&txn);
        if len > 0 {
            array.remove_range(&mut txn, 0, len);
        }
        for connection in connections {
            let record: MapPrelim = seeded_connection_fields(connection).into_iter().collect();
            array.push_back(&mut txn, record);
        }
        txn.encode_update_v1()
    }

    /// Seed the room from durable storage, once per room lifetime.
    ///
    /// The `hydrated` flag is written in the same transaction as the
    /// data, so any peer that has seen the seeded state skips this.
    pub fn hydrate(&self, nodes: &[CanvasNode], connections: &[NodeConnection]) -> Option<Vec<u8>> {
        let mut txn = self.doc.transact_mut();
        let meta = txn.get_or_insert_map(META);
        if matches!(meta.get(&txn, HYDRATED), Some(Out::Any(Any::Bool(true)))) {
            return None;
        }

        let node_map = txn.get_or_insert_map(NODES);
        node_map.clear(&mut txn);
        for node in nodes {
            let record: MapPrelim = node_fields(node).into_iter().collect();
            node_map.insert(&mut txn, node_key(node.id), record);
        }

        let array = txn.get_or_insert_array(CONNECTIONS);
        let len = array.len(&txn);
        if len > 0 {
            array.remove_range(&mut txn, 0, len);
        }
        for connection in connections {
            let record: MapPrelim = seeded_connection_fields(connection).into_iter().collect();
            array.push_back(&mut txn, record);
        }

        meta.insert(&mut txn, HYDRATED, Any::Bool(true));
        log::debug!(
            "Hydrated store with {} nodes and {} connections",
            nodes.len(),
            connections.len()
        );
        Some(txn.encode_update_v1())
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn node(&self, id: NodeId) -> Option<CanvasNode> {
        let txn = self.doc.transact();
        let nodes = txn.get_map(NODES)?;
        match nodes.get(&txn, &node_key(id))? {
            Out::YMap(record) => Some(read_node(id, &record, &txn)),
            _ => None,
        }
    }

    /// All nodes, ordered by id.
    pub fn nodes(&self) -> Vec<CanvasNode> {
        let txn = self.doc.transact();
        let Some(map) = txn.get_map(NODES) else {
            return Vec::new();
        };
        let mut nodes: Vec<CanvasNode> = map
            .iter(&txn)
            .filter_map(|(key, value)| {
                let id = key.parse::<NodeId>().ok()?;
                match value {
                    Out::YMap(record) => Some(read_node(id, &record, &txn)),
                    _ => None,
                }
            })
            .collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        let txn = self.doc.transact();
        txn.get_map(NODES)
            .is_some_and(|nodes| nodes.contains_key(&txn, &node_key(id)))
    }

    pub fn node_count(&self) -> u32 {
        let txn = self.doc.transact();
        txn.get_map(NODES).map_or(0, |m| m.len(&txn))
    }

    /// The edge sequence in order.
    ///
    /// Two peers hydrating an empty room at the same time both append the
    /// seed; only the first seeded copy of each id is returned. Edges
    /// appended one by one are returned as stored, duplicates included.
    pub fn connections(&self) -> Vec<NodeConnection> {
        let txn = self.doc.transact();
        let Some(array) = txn.get_array(CONNECTIONS) else {
            return Vec::new();
        };
        let mut seeded = HashSet::new();
        array
            .iter(&txn)
            .filter_map(|entry| match entry {
                Out::YMap(record) => {
                    let connection = read_connection(&record, &txn)?;
                    if is_seeded(&record, &txn) && !seeded.insert(connection.id.clone()) {
                        return None;
                    }
                    Some(connection)
                }
                _ => None,
            })
            .collect()
    }

    pub fn is_hydrated(&self) -> bool {
        let txn = self.doc.transact();
        txn.get_map(META)
            .and_then(|meta| meta.get(&txn, HYDRATED))
            .is_some_and(|v| matches!(v, Out::Any(Any::Bool(true))))
    }

    // ── Sync ───────────────────────────────────────────────────────

    /// Merge a v1 update from a peer.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), StoreError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| StoreError::Apply(e.to_string()))
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this store has that the owner of `state_vector` lacks.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, StoreError> {
        let remote = StateVector::decode_v1(state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// Full state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}
