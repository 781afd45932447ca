//! # weave-core — shared canvas model
//!
//! Plain data types for canvas nodes and the connections between them,
//! the per-connection [`Presence`] record, and the two CRDT-backed
//! structures every room shares:
//!
//! - [`store::SharedStore`] — nodes, connections and room metadata
//! - [`document::RichText`] — collaboratively edited document bodies
//!
//! Nothing in this crate performs I/O. Mutations return encoded yrs
//! updates that the caller is responsible for shipping to peers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

pub mod document;
pub mod identity;
pub mod store;

pub use document::RichText;
pub use identity::{initials, user_color, Presence, TextCursor, UserInfo, View, USER_COLORS};
pub use store::{SharedStore, StoreError};

/// Canvas node identifier. Unique within a room for the room's lifetime.
pub type NodeId = i64;

/// Connection identifier. Opaque, uniqueness is not enforced.
pub type ConnectionId = String;

/// Default size for freshly created nodes.
pub const DEFAULT_NODE_SIZE: Size = Size {
    width: 280.0,
    height: 150.0,
};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Kind of canvas node. Serialized as its lowercase tag.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Doc,
    Objective,
    KeyResult,
    Metric,
    Problem,
    Agent,
    Integration,
    Skill,
    Webhook,
    Api,
    Mcp,
    Custom,
}

impl NodeType {
    pub const ALL: [NodeType; 12] = [
        NodeType::Doc,
        NodeType::Objective,
        NodeType::KeyResult,
        NodeType::Metric,
        NodeType::Problem,
        NodeType::Agent,
        NodeType::Integration,
        NodeType::Skill,
        NodeType::Webhook,
        NodeType::Api,
        NodeType::Mcp,
        NodeType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Doc => "doc",
            NodeType::Objective => "objective",
            NodeType::KeyResult => "keyresult",
            NodeType::Metric => "metric",
            NodeType::Problem => "problem",
            NodeType::Agent => "agent",
            NodeType::Integration => "integration",
            NodeType::Skill => "skill",
            NodeType::Webhook => "webhook",
            NodeType::Api => "api",
            NodeType::Mcp => "mcp",
            NodeType::Custom => "custom",
        }
    }

    /// Parse a type tag. Unknown tags fall back to [`NodeType::Custom`]
    /// so records written by newer peers still render.
    pub fn parse(tag: &str) -> NodeType {
        NodeType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == tag)
            .unwrap_or(NodeType::Custom)
    }

    /// Whether an edge from `self` to `target` is allowed by the canvas
    /// connection rules. Advisory only: the store accepts any edge.
    pub fn can_connect_to(&self, target: NodeType) -> bool {
        match self {
            NodeType::Problem => !matches!(target, NodeType::Objective | NodeType::Metric),
            NodeType::Objective => target == NodeType::KeyResult,
            NodeType::KeyResult => target == NodeType::Metric,
            _ => true,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node on the canvas.
///
/// Stored field-by-field in the shared store, so concurrent writes to
/// different fields of the same node both survive.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct CanvasNode {
    pub id: NodeId,
    pub name: String,
    pub node_type: NodeType,
    pub position: Point,
    pub size: Size,
    pub z_index: i64,
    pub is_locked: bool,
    pub is_collapsed: bool,
    pub content: String,
    /// Type-specific data, opaque to the sync layer.
    pub payload: Value,
}

impl CanvasNode {
    pub fn new(id: NodeId, node_type: NodeType) -> Self {
        Self {
            id,
            name: String::new(),
            node_type,
            position: Point::default(),
            size: DEFAULT_NODE_SIZE,
            z_index: 0,
            is_locked: false,
            is_collapsed: false,
            content: String::new(),
            payload: Value::Null,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Point::new(x, y);
        self
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.size = Size::new(width, height);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Partial update for a node. `None` fields are skipped, never cleared.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodePatch {
    pub name: Option<String>,
    pub node_type: Option<NodeType>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub z_index: Option<i64>,
    pub is_locked: Option<bool>,
    pub is_collapsed: Option<bool>,
    pub content: Option<String>,
    pub payload: Option<Value>,
}

impl NodePatch {
    /// Patch touching only the position fields.
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.node_type.is_none()
            && self.x.is_none()
            && self.y.is_none()
            && self.width.is_none()
            && self.height.is_none()
            && self.z_index.is_none()
            && self.is_locked.is_none()
            && self.is_collapsed.is_none()
            && self.content.is_none()
            && self.payload.is_none()
    }

    /// Apply the present fields to a local copy of a node.
    pub fn apply_to(&self, node: &mut CanvasNode) {
        if let Some(name) = &self.name {
            node.name = name.clone();
        }
        if let Some(node_type) = self.node_type {
            node.node_type = node_type;
        }
        if let Some(x) = self.x {
            node.position.x = x;
        }
        if let Some(y) = self.y {
            node.position.y = y;
        }
        if let Some(width) = self.width {
            node.size.width = width;
        }
        if let Some(height) = self.height {
            node.size.height = height;
        }
        if let Some(z) = self.z_index {
            node.z_index = z;
        }
        if let Some(locked) = self.is_locked {
            node.is_locked = locked;
        }
        if let Some(collapsed) = self.is_collapsed {
            node.is_collapsed = collapsed;
        }
        if let Some(content) = &self.content {
            node.content = content.clone();
        }
        if let Some(payload) = &self.payload {
            node.payload = payload.clone();
        }
    }
}

/// Side of a node an edge attaches to.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AnchorPosition {
    Top,
    Right,
    Bottom,
    Left,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl AnchorPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorPosition::Top => "top",
            AnchorPosition::Right => "right",
            AnchorPosition::Bottom => "bottom",
            AnchorPosition::Left => "left",
            AnchorPosition::TopLeft => "top-left",
            AnchorPosition::TopRight => "top-right",
            AnchorPosition::BottomLeft => "bottom-left",
            AnchorPosition::BottomRight => "bottom-right",
        }
    }

    pub fn parse(tag: &str) -> Option<AnchorPosition> {
        match tag {
            "top" => Some(AnchorPosition::Top),
            "right" => Some(AnchorPosition::Right),
            "bottom" => Some(AnchorPosition::Bottom),
            "left" => Some(AnchorPosition::Left),
            "top-left" => Some(AnchorPosition::TopLeft),
            "top-right" => Some(AnchorPosition::TopRight),
            "bottom-left" => Some(AnchorPosition::BottomLeft),
            "bottom-right" => Some(AnchorPosition::BottomRight),
            _ => None,
        }
    }
}

/// A directed edge between two nodes.
///
/// The endpoints may reference nodes that no longer exist; see
/// [`resolve_connections`].
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct NodeConnection {
    pub id: ConnectionId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub source_anchor: Option<AnchorPosition>,
    pub target_anchor: Option<AnchorPosition>,
    pub connection_type: String,
}

impl NodeConnection {
    pub fn new(id: impl Into<ConnectionId>, source: NodeId, target: NodeId) -> Self {
        Self {
            id: id.into(),
            source_node_id: source,
            target_node_id: target,
            source_anchor: None,
            target_anchor: None,
            connection_type: "default".to_string(),
        }
    }

    pub fn with_anchors(mut self, source: AnchorPosition, target: AnchorPosition) -> Self {
        self.source_anchor = Some(source);
        self.target_anchor = Some(target);
        self
    }
}

/// Connections whose both endpoints exist in `nodes`, in sequence order.
pub fn resolve_connections<'a>(
    nodes: &[CanvasNode],
    connections: &'a [NodeConnection],
) -> Vec<&'a NodeConnection> {
    let present: HashSet<NodeId> = nodes.iter().map(|n| n.id).collect();
    connections
        .iter()
        .filter(|c| present.contains(&c.source_node_id) && present.contains(&c.target_node_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_type_tags() {
        for t in NodeType::ALL {
            assert_eq!(NodeType::parse(t.as_str()), t);
        }
        assert_eq!(NodeType::parse("keyresult"), NodeType::KeyResult);
        assert_eq!(NodeType::parse("spreadsheet"), NodeType::Custom);
    }

    #[test]
    fn test_node_type_serde_matches_tag() {
        let encoded = serde_json::to_string(&NodeType::KeyResult).unwrap();
        assert_eq!(encoded, "\"keyresult\"");
        let decoded: NodeType = serde_json::from_str("\"mcp\"").unwrap();
        assert_eq!(decoded, NodeType::Mcp);
    }

    #[test]
    fn test_connection_rules() {
        assert!(NodeType::Problem.can_connect_to(NodeType::Agent));
        assert!(!NodeType::Problem.can_connect_to(NodeType::Objective));
        assert!(!NodeType::Problem.can_connect_to(NodeType::Metric));
        assert!(NodeType::Objective.can_connect_to(NodeType::KeyResult));
        assert!(!NodeType::Objective.can_connect_to(NodeType::Metric));
        assert!(NodeType::KeyResult.can_connect_to(NodeType::Metric));
        assert!(!NodeType::KeyResult.can_connect_to(NodeType::Doc));
        assert!(NodeType::Doc.can_connect_to(NodeType::Objective));
    }

    #[test]
    fn test_empty_patch() {
        assert!(NodePatch::default().is_empty());
        assert!(!NodePatch::position(1.0, 2.0).is_empty());
    }

    #[test]
    fn test_patch_skips_absent_fields() {
        let mut node = CanvasNode::new(1, NodeType::Doc)
            .with_name("Revenue")
            .with_position(5.0, 6.0);
        let patch = NodePatch {
            y: Some(60.0),
            payload: Some(json!({"status": "draft"})),
            ..NodePatch::default()
        };
        patch.apply_to(&mut node);

        assert_eq!(node.name, "Revenue");
        assert_eq!(node.position, Point::new(5.0, 60.0));
        assert_eq!(node.payload["status"], "draft");
    }

    #[test]
    fn test_anchor_tags() {
        assert_eq!(AnchorPosition::parse("bottom-left"), Some(AnchorPosition::BottomLeft));
        assert_eq!(AnchorPosition::TopRight.as_str(), "top-right");
        assert_eq!(AnchorPosition::parse("middle"), None);
    }

    #[test]
    fn test_resolve_connections_drops_dangling() {
        let nodes = vec![
            CanvasNode::new(1, NodeType::Objective),
            CanvasNode::new(2, NodeType::KeyResult),
        ];
        let connections = vec![
            NodeConnection::new("a", 1, 2),
            NodeConnection::new("b", 2, 99),
            NodeConnection::new("c", 98, 1),
        ];
        let resolved = resolve_connections(&nodes, &connections);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, "a");
    }
}
