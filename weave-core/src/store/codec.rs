//! Field-level encoding of records into yrs maps.

use yrs::{Any, Map, MapRef, Out, ReadTxn};

use crate::{AnchorPosition, CanvasNode, NodeConnection, NodeId, NodePatch, NodeType, Point, Size};

mod field {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const NODE_TYPE: &str = "node_type";
    pub const POSITION_X: &str = "position_x";
    pub const POSITION_Y: &str = "position_y";
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const Z_INDEX: &str = "z_index";
    pub const IS_LOCKED: &str = "is_locked";
    pub const IS_COLLAPSED: &str = "is_collapsed";
    pub const CONTENT: &str = "content";
    pub const PAYLOAD: &str = "payload";

    pub const SOURCE_NODE_ID: &str = "source_node_id";
    pub const TARGET_NODE_ID: &str = "target_node_id";
    pub const SOURCE_ANCHOR: &str = "source_anchor";
    pub const TARGET_ANCHOR: &str = "target_anchor";
    pub const CONNECTION_TYPE: &str = "connection_type";
    /// Written by bulk seeding; duplicate seeded ids collapse on read.
    pub const SEEDED: &str = "seeded";
}

fn string(value: &str) -> Any {
    Any::String(value.into())
}

fn payload(value: &serde_json::Value) -> Any {
    // Stored as text: the payload shape is owned by the node type.
    string(&value.to_string())
}

pub(super) fn node_fields(node: &CanvasNode) -> Vec<(&'static str, Any)> {
    vec![
        (field::ID, Any::BigInt(node.id)),
        (field::NAME, string(&node.name)),
        (field::NODE_TYPE, string(node.node_type.as_str())),
        (field::POSITION_X, Any::Number(node.position.x)),
        (field::POSITION_Y, Any::Number(node.position.y)),
        (field::WIDTH, Any::Number(node.size.width)),
        (field::HEIGHT, Any::Number(node.size.height)),
        (field::Z_INDEX, Any::BigInt(node.z_index)),
        (field::IS_LOCKED, Any::Bool(node.is_locked)),
        (field::IS_COLLAPSED, Any::Bool(node.is_collapsed)),
        (field::CONTENT, string(&node.content)),
        (field::PAYLOAD, payload(&node.payload)),
    ]
}

pub(super) fn patch_fields(patch: &NodePatch) -> Vec<(&'static str, Any)> {
    let mut fields = Vec::new();
    if let Some(name) = &patch.name {
        fields.push((field::NAME, string(name)));
    }
    if let Some(node_type) = patch.node_type {
        fields.push((field::NODE_TYPE, string(node_type.as_str())));
    }
    if let Some(x) = patch.x {
        fields.push((field::POSITION_X, Any::Number(x)));
    }
    if let Some(y) = patch.y {
        fields.push((field::POSITION_Y, Any::Number(y)));
    }
    if let Some(width) = patch.width {
        fields.push((field::WIDTH, Any::Number(width)));
    }
    if let Some(height) = patch.height {
        fields.push((field::HEIGHT, Any::Number(height)));
    }
    if let Some(z) = patch.z_index {
        fields.push((field::Z_INDEX, Any::BigInt(z)));
    }
    if let Some(locked) = patch.is_locked {
        fields.push((field::IS_LOCKED, Any::Bool(locked)));
    }
    if let Some(collapsed) = patch.is_collapsed {
        fields.push((field::IS_COLLAPSED, Any::Bool(collapsed)));
    }
    if let Some(content) = &patch.content {
        fields.push((field::CONTENT, string(content)));
    }
    if let Some(value) = &patch.payload {
        fields.push((field::PAYLOAD, payload(value)));
    }
    fields
}

pub(super) fn connection_fields(connection: &NodeConnection) -> Vec<(&'static str, Any)> {
    let mut fields = vec![
        (field::ID, string(&connection.id)),
        (field::SOURCE_NODE_ID, Any::BigInt(connection.source_node_id)),
        (field::TARGET_NODE_ID, Any::BigInt(connection.target_node_id)),
        (field::CONNECTION_TYPE, string(&connection.connection_type)),
    ];
    if let Some(anchor) = connection.source_anchor {
        fields.push((field::SOURCE_ANCHOR, string(anchor.as_str())));
    }
    if let Some(anchor) = connection.target_anchor {
        fields.push((field::TARGET_ANCHOR, string(anchor.as_str())));
    }
    fields
}

/// Fields for an edge written by `initialize_connections` or `hydrate`.
pub(super) fn seeded_connection_fields(connection: &NodeConnection) -> Vec<(&'static str, Any)> {
    let mut fields = connection_fields(connection);
    fields.push((field::SEEDED, Any::Bool(true)));
    fields
}

pub(super) fn is_seeded<T: ReadTxn>(record: &MapRef, txn: &T) -> bool {
    read_bool(record, txn, field::SEEDED).unwrap_or_default()
}

fn read_f64<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<f64> {
    match map.get(txn, key)? {
        Out::Any(Any::Number(n)) => Some(n),
        Out::Any(Any::BigInt(n)) => Some(n as f64),
        _ => None,
    }
}

fn read_i64<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<i64> {
    match map.get(txn, key)? {
        Out::Any(Any::BigInt(n)) => Some(n),
        Out::Any(Any::Number(n)) if n.fract() == 0.0 => Some(n as i64),
        _ => None,
    }
}

fn read_bool<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<bool> {
    match map.get(txn, key)? {
        Out::Any(Any::Bool(b)) => Some(b),
        _ => None,
    }
}

fn read_string<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<String> {
    match map.get(txn, key)? {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

/// Decode a node record. Missing fields take their defaults, the id
/// always comes from the map key.
pub(super) fn read_node<T: ReadTxn>(id: NodeId, record: &MapRef, txn: &T) -> CanvasNode {
    let node_type = read_string(record, txn, field::NODE_TYPE)
        .map(|tag| NodeType::parse(&tag))
        .unwrap_or(NodeType::Custom);
    let mut node = CanvasNode::new(id, node_type);

    node.name = read_string(record, txn, field::NAME).unwrap_or_default();
    node.position = Point::new(
        read_f64(record, txn, field::POSITION_X).unwrap_or_default(),
        read_f64(record, txn, field::POSITION_Y).unwrap_or_default(),
    );
    node.size = Size::new(
        read_f64(record, txn, field::WIDTH).unwrap_or(node.size.width),
        read_f64(record, txn, field::HEIGHT).unwrap_or(node.size.height),
    );
    node.z_index = read_i64(record, txn, field::Z_INDEX).unwrap_or_default();
    node.is_locked = read_bool(record, txn, field::IS_LOCKED).unwrap_or_default();
    node.is_collapsed = read_bool(record, txn, field::IS_COLLAPSED).unwrap_or_default();
    node.content = read_string(record, txn, field::CONTENT).unwrap_or_default();
    node.payload = read_string(record, txn, field::PAYLOAD)
        .and_then(|raw| match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Unreadable payload on node {id}: {e}");
                None
            }
        })
        .unwrap_or_default();
    node
}

/// Decode an edge. Entries without an id or endpoints are skipped.
pub(super) fn read_connection<T: ReadTxn>(record: &MapRef, txn: &T) -> Option<NodeConnection> {
    Some(NodeConnection {
        id: read_string(record, txn, field::ID)?,
        source_node_id: read_i64(record, txn, field::SOURCE_NODE_ID)?,
        target_node_id: read_i64(record, txn, field::TARGET_NODE_ID)?,
        source_anchor: read_string(record, txn, field::SOURCE_ANCHOR)
            .and_then(|tag| AnchorPosition::parse(&tag)),
        target_anchor: read_string(record, txn, field::TARGET_ANCHOR)
            .and_then(|tag| AnchorPosition::parse(&tag)),
        connection_type: read_string(record, txn, field::CONNECTION_TYPE)
            .unwrap_or_else(|| "default".to_string()),
    })
}
