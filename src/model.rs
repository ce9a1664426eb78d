//! Graph data types
//!
//! Nodes and edges as held by the [`GraphStore`](crate::store::GraphStore),
//! plus the plain-data payload used at the import/export boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Free-form attributes attached to nodes and edges
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Default edge weight
pub const DEFAULT_EDGE_WEIGHT: f64 = 1.0;

/// Default node size (used by the collision radius function)
pub const DEFAULT_NODE_SIZE: f64 = 5.0;

/// Default type tag for nodes and edges
pub const DEFAULT_TYPE: &str = "default";

/// Position of a node in layout space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    /// Depth coordinate, carried through untouched by the 2D layout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }
}

/// A node in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within a store
    pub id: String,
    pub position: Position,
    pub vx: f64,
    pub vy: f64,
    /// Pinned nodes keep their position during layout but still exert forces
    pub pinned: bool,
    /// Collapsed nodes take no part in charge repulsion
    pub collapsed: bool,
    pub size: f64,
    pub node_type: String,
    pub attributes: Attributes,
}

impl Node {
    /// Create a node at the given position with default attributes
    pub fn new(id: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            position,
            vx: 0.0,
            vy: 0.0,
            pinned: false,
            collapsed: false,
            size: DEFAULT_NODE_SIZE,
            node_type: DEFAULT_TYPE.to_string(),
            attributes: Attributes::new(),
        }
    }

    /// Merge an attribute patch into this node
    ///
    /// Fields present in the patch overwrite the node's values; extra
    /// attributes are merged key by key.
    pub fn merge(&mut self, attrs: &NodeAttrs) {
        if let Some(x) = attrs.x {
            self.position.x = x;
        }
        if let Some(y) = attrs.y {
            self.position.y = y;
        }
        if attrs.z.is_some() {
            self.position.z = attrs.z;
        }
        if let Some(size) = attrs.size {
            self.size = size;
        }
        if let Some(node_type) = &attrs.node_type {
            self.node_type.clone_from(node_type);
        }
        if let Some(pinned) = attrs.pinned {
            self.pinned = pinned;
        }
        if let Some(collapsed) = attrs.collapsed {
            self.collapsed = collapsed;
        }
        self.attributes.extend(
            attrs
                .extra
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
    }

    /// Attribute patch describing this node, used for export
    pub fn to_attrs(&self) -> NodeAttrs {
        NodeAttrs {
            x: Some(self.position.x),
            y: Some(self.position.y),
            z: self.position.z,
            size: Some(self.size),
            node_type: Some(self.node_type.clone()),
            pinned: self.pinned.then_some(true),
            collapsed: self.collapsed.then_some(true),
            extra: self.attributes.clone(),
        }
    }
}

/// An edge connecting two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub weight: f64,
    pub edge_type: String,
    pub attributes: Attributes,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            weight: DEFAULT_EDGE_WEIGHT,
            edge_type: DEFAULT_TYPE.to_string(),
            attributes: Attributes::new(),
        }
    }

    /// Apply an attribute patch to this edge
    pub fn merge(&mut self, attrs: &EdgeAttrs) {
        if let Some(weight) = attrs.weight {
            self.weight = weight;
        }
        if let Some(edge_type) = &attrs.edge_type {
            self.edge_type.clone_from(edge_type);
        }
        self.attributes.extend(
            attrs
                .extra
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
    }

    pub fn to_attrs(&self) -> EdgeAttrs {
        EdgeAttrs {
            weight: Some(self.weight),
            edge_type: Some(self.edge_type.clone()),
            extra: self.attributes.clone(),
        }
    }

    /// Whether this edge touches the given node
    pub fn is_incident_to(&self, node_id: &str) -> bool {
        self.source == node_id || self.target == node_id
    }
}

/// Node attribute patch, as accepted by `add_node` and the import payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAttrs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapsed: Option<bool>,
    /// Any other keys
    #[serde(flatten)]
    pub extra: Attributes,
}

impl NodeAttrs {
    /// Patch that only sets a position
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    pub fn with_size(mut self, size: f64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Whether the patch fixes both layout coordinates
    pub fn has_position(&self) -> bool {
        self.x.is_some() && self.y.is_some()
    }

    /// Whether applying this patch can change the graph's layout inputs
    pub fn touches_layout(&self) -> bool {
        self.x.is_some()
            || self.y.is_some()
            || self.size.is_some()
            || self.pinned.is_some()
            || self.collapsed.is_some()
    }
}

/// Edge attribute patch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeAttrs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub edge_type: Option<String>,
    #[serde(flatten)]
    pub extra: Attributes,
}

impl EdgeAttrs {
    pub fn weighted(weight: f64) -> Self {
        Self {
            weight: Some(weight),
            ..Self::default()
        }
    }
}

/// A node position reported by the layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

/// A node entry in the import/export payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    #[serde(default)]
    pub attrs: NodeAttrs,
}

/// An edge entry in the import/export payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub attrs: EdgeAttrs,
}

/// Plain-data graph payload exchanged with import/export collaborators
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphData {
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub edges: Vec<EdgeRecord>,
}

impl GraphData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node record
    pub fn with_node(mut self, id: impl Into<String>, attrs: NodeAttrs) -> Self {
        self.nodes.push(NodeRecord {
            id: id.into(),
            attrs,
        });
        self
    }

    /// Append an edge record with default attributes
    pub fn with_edge(
        mut self,
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.edges.push(EdgeRecord {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            attrs: EdgeAttrs::default(),
        });
        self
    }
}

/// Deep copy of the store at a given version
///
/// This is the unit of graph data that crosses the worker boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub version: u64,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphSnapshot {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

/// A result tagged with the store version it was computed from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

impl<T> Versioned<T> {
    pub fn new(version: u64, value: T) -> Self {
        Self { version, value }
    }

    /// Whether the result is still valid for the given store version
    pub fn is_current(&self, version: u64) -> bool {
        self.version == version
    }
}
