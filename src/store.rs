//! Authoritative in-memory graph
//!
//! The store is the only mutable source of truth for nodes and edges. Every
//! mutation bumps a monotonic version counter and records a [`StoreChange`]
//! that the engine drains to decide on cache invalidation and reheating.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::GraphError;
use crate::model::{
    Edge, EdgeAttrs, GraphSnapshot, Node, NodeAttrs, NodePosition, Position,
};

/// Spacing of the initial phyllotaxis spiral
const INITIAL_RADIUS: f64 = 10.0;

/// Change notification recorded by every mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    NodeAdded(String),
    NodeUpdated { id: String, layout: bool },
    NodeRemoved { id: String, edges: Vec<String> },
    EdgeAdded(String),
    EdgeUpdated(String),
    EdgeRemoved(String),
    Cleared,
}

impl StoreChange {
    /// Whether the change alters the graph's structure (and the layout must reheat)
    pub fn is_structural(&self) -> bool {
        match self {
            StoreChange::NodeAdded(_)
            | StoreChange::NodeRemoved { .. }
            | StoreChange::EdgeAdded(_)
            | StoreChange::EdgeRemoved(_)
            | StoreChange::Cleared => true,
            StoreChange::NodeUpdated { layout, .. } => *layout,
            StoreChange::EdgeUpdated(_) => false,
        }
    }
}

/// Position on a phyllotaxis spiral for the `index`-th placed node
fn initial_position(index: u64) -> Position {
    let angle = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
    let i = index as f64;
    let radius = INITIAL_RADIUS * (0.5 + i).sqrt();
    Position::new(radius * (i * angle).cos(), radius * (i * angle).sin())
}

/// The graph store
#[derive(Debug, Default)]
pub struct GraphStore {
    nodes: BTreeMap<String, Node>,
    edges: BTreeMap<String, Edge>,
    version: u64,
    placed: u64,
    changes: Vec<StoreChange>,
}

impl GraphStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic mutation counter
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Edges in id order
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    fn record(&mut self, change: StoreChange) {
        self.version += 1;
        self.changes.push(change);
    }

    /// Create a node, or merge attributes into an existing one
    ///
    /// New nodes without an explicit position are placed on a deterministic
    /// spiral by insertion index.
    pub fn add_node(&mut self, id: &str, attrs: NodeAttrs) -> &Node {
        if self.nodes.contains_key(id) {
            let layout = attrs.touches_layout();
            if let Some(node) = self.nodes.get_mut(id) {
                node.merge(&attrs);
            }
            self.record(StoreChange::NodeUpdated {
                id: id.to_string(),
                layout,
            });
        } else {
            let mut node = Node::new(id, initial_position(self.placed));
            self.placed += 1;
            node.merge(&attrs);
            self.nodes.insert(id.to_string(), node);
            self.record(StoreChange::NodeAdded(id.to_string()));
        }
        &self.nodes[id]
    }

    /// Merge attributes into an existing node
    pub fn update_node(&mut self, id: &str, attrs: NodeAttrs) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        let layout = attrs.touches_layout();
        node.merge(&attrs);
        self.record(StoreChange::NodeUpdated {
            id: id.to_string(),
            layout,
        });
        Ok(())
    }

    /// Remove a node and every edge incident to it
    ///
    /// Returns the removed edges, or `None` if the node did not exist.
    pub fn remove_node(&mut self, id: &str) -> Option<Vec<Edge>> {
        self.nodes.remove(id)?;

        let incident: Vec<String> = self
            .edges
            .values()
            .filter(|edge| edge.is_incident_to(id))
            .map(|edge| edge.id.clone())
            .collect();
        let removed: Vec<Edge> = incident
            .iter()
            .filter_map(|edge_id| self.edges.remove(edge_id))
            .collect();

        self.record(StoreChange::NodeRemoved {
            id: id.to_string(),
            edges: incident,
        });
        Some(removed)
    }

    /// Add an edge between two existing nodes
    ///
    /// Re-adding an existing id replaces the edge. Fails with
    /// [`GraphError::InvalidEdge`] when an endpoint is missing, in which case
    /// the store is left untouched.
    pub fn add_edge(
        &mut self,
        id: &str,
        source: &str,
        target: &str,
        attrs: EdgeAttrs,
    ) -> Result<&Edge, GraphError> {
        for endpoint in [source, target] {
            if !self.nodes.contains_key(endpoint) {
                return Err(GraphError::InvalidEdge {
                    edge_id: id.to_string(),
                    missing: endpoint.to_string(),
                });
            }
        }

        let mut edge = Edge::new(id, source, target);
        edge.merge(&attrs);
        self.edges.insert(id.to_string(), edge);
        self.record(StoreChange::EdgeAdded(id.to_string()));
        Ok(&self.edges[id])
    }

    /// Merge attributes into an existing edge
    pub fn update_edge(&mut self, id: &str, attrs: EdgeAttrs) -> Result<(), GraphError> {
        let edge = self
            .edges
            .get_mut(id)
            .ok_or_else(|| GraphError::EdgeNotFound(id.to_string()))?;
        edge.merge(&attrs);
        self.record(StoreChange::EdgeUpdated(id.to_string()));
        Ok(())
    }

    pub fn remove_edge(&mut self, id: &str) -> Option<Edge> {
        let edge = self.edges.remove(id)?;
        self.record(StoreChange::EdgeRemoved(id.to_string()));
        Some(edge)
    }

    /// Remove all nodes and edges
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
        self.placed = 0;
        self.record(StoreChange::Cleared);
    }

    /// Move a node and pin it in place
    pub fn pin_node(&mut self, id: &str, x: f64, y: f64) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        node.position.x = x;
        node.position.y = y;
        node.vx = 0.0;
        node.vy = 0.0;
        node.pinned = true;
        self.record(StoreChange::NodeUpdated {
            id: id.to_string(),
            layout: true,
        });
        Ok(())
    }

    /// Let a pinned node move freely again
    pub fn release_node(&mut self, id: &str) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        node.pinned = false;
        self.record(StoreChange::NodeUpdated {
            id: id.to_string(),
            layout: true,
        });
        Ok(())
    }

    /// Write layout output back into the store
    ///
    /// Positions are derived data, so this does not bump the version and does
    /// not invalidate analytics. Unknown ids are skipped. Returns the number of
    /// nodes updated.
    pub fn apply_positions(&mut self, positions: &[NodePosition]) -> usize {
        let mut applied = 0;
        for position in positions {
            if let Some(node) = self.nodes.get_mut(&position.id) {
                node.position.x = position.x;
                node.position.y = position.y;
                applied += 1;
            }
        }
        applied
    }

    /// Current positions in id order
    pub fn positions(&self) -> Vec<NodePosition> {
        self.nodes
            .values()
            .map(|node| NodePosition {
                id: node.id.clone(),
                x: node.position.x,
                y: node.position.y,
            })
            .collect()
    }

    /// Ids of nodes sharing an edge with `id`, in id order
    pub fn neighbors(&self, id: &str) -> Vec<&str> {
        let mut neighbors = BTreeSet::new();
        for edge in self.edges.values() {
            if edge.source == id && edge.target != id {
                neighbors.insert(edge.target.as_str());
            } else if edge.target == id && edge.source != id {
                neighbors.insert(edge.source.as_str());
            }
        }
        neighbors.into_iter().collect()
    }

    /// Number of edges incident to `id`
    pub fn incident_edge_count(&self, id: &str) -> usize {
        self.edges
            .values()
            .filter(|edge| edge.is_incident_to(id))
            .count()
    }

    /// Deep copy of the current graph
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            version: self.version,
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
        }
    }

    /// Take the change notifications recorded since the last drain
    pub fn drain_changes(&mut self) -> Vec<StoreChange> {
        std::mem::take(&mut self.changes)
    }
}
