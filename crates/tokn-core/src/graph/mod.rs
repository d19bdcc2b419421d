//! Flow graph model: typed nodes, typed ports, validated edges.
//!
//! Nodes and edges live in an arena keyed by opaque integer handles.
//! Handles are handed out in creation order, so iterating the arena yields
//! nodes in discovery order. Graphs are small (tens of nodes), so upstream
//! and downstream lookups are plain linear scans over the edge list.

pub mod edge;
pub mod node;
pub mod port;

use std::collections::BTreeMap;

use tracing::debug;

pub use edge::{Edge, EdgeId};
pub use node::{
    ModelNode, Node, NodeData, NodeId, NodeKind, NodeStatus, OptimizerAlgorithm,
    OptimizerExample, OptimizerNode, PromptNode, ToolNode,
};
pub use port::{is_allowed, is_single_valued, Connection, Port, CONNECTIONS};

#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
    next_node: u32,
    next_edge: u32,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node and return its handle. New nodes start `idle`.
    pub fn add_node(&mut self, label: impl Into<String>, data: NodeData) -> NodeId {
        let id = NodeId::new(self.next_node);
        self.next_node += 1;
        self.nodes.insert(
            id,
            Node {
                id,
                label: label.into(),
                data,
                status: Default::default(),
            },
        );
        id
    }

    /// Remove a node together with every edge that touches it.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        self.edges.retain(|_, e| !e.touches(id));
        Some(node)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// All nodes in discovery (creation) order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Replace a node's payload. The kind cannot change, since existing
    /// edges were validated against it.
    pub fn update_data(&mut self, id: NodeId, data: NodeData) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) if node.kind() == data.kind() => {
                node.data = data;
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, id: NodeId) -> Option<NodeStatus> {
        self.nodes.get(&id).map(|n| n.status)
    }

    pub fn set_status(&mut self, id: NodeId, status: NodeStatus) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) => {
                node.status = status;
                true
            }
            None => false,
        }
    }

    /// Put every node back to `idle`.
    pub fn reset_statuses(&mut self) {
        for node in self.nodes.values_mut() {
            node.status = NodeStatus::Idle;
        }
    }

    /// Create an edge if it passes validation, otherwise return `None`.
    ///
    /// Checks, in order: both endpoints exist, source differs from target,
    /// the pairing is in the compatibility table, and a single-valued target
    /// port is not already occupied. Rejections are silent; surfacing them is
    /// up to the caller.
    pub fn create_edge(
        &mut self,
        source: NodeId,
        source_port: Port,
        target: NodeId,
        target_port: Port,
    ) -> Option<EdgeId> {
        let (Some(src), Some(dst)) = (self.nodes.get(&source), self.nodes.get(&target)) else {
            debug!(%source, %target, "Edge rejected: unknown endpoint");
            return None;
        };

        if source == target {
            debug!(%source, "Edge rejected: self connection");
            return None;
        }

        if !is_allowed((src.kind(), source_port), (dst.kind(), target_port)) {
            debug!(
                source_kind = %src.kind(),
                %source_port,
                target_kind = %dst.kind(),
                %target_port,
                "Edge rejected: incompatible ports"
            );
            return None;
        }

        let occupied = self
            .edges
            .values()
            .any(|e| e.target == target && e.target_port == target_port);
        if occupied && is_single_valued(dst.kind(), target_port) {
            debug!(%target, %target_port, "Edge rejected: input already connected");
            return None;
        }

        let duplicate = self.edges.values().any(|e| {
            e.source == source
                && e.source_port == source_port
                && e.target == target
                && e.target_port == target_port
        });
        if duplicate {
            return None;
        }

        let id = EdgeId::new(self.next_edge);
        self.next_edge += 1;
        self.edges.insert(
            id,
            Edge {
                id,
                source,
                source_port,
                target,
                target_port,
            },
        );
        Some(id)
    }

    pub fn remove_edge(&mut self, id: EdgeId) -> Option<Edge> {
        self.edges.remove(&id)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edges terminating at `(node, port)`, in creation order.
    pub fn find_upstream(&self, node: NodeId, port: Port) -> Vec<&Edge> {
        self.edges
            .values()
            .filter(|e| e.target == node && e.target_port == port)
            .collect()
    }

    /// Edges leaving `(node, port)`, in creation order.
    pub fn find_downstream(&self, node: NodeId, port: Port) -> Vec<&Edge> {
        self.edges
            .values()
            .filter(|e| e.source == node && e.source_port == port)
            .collect()
    }

    /// The node feeding a single-valued input, if connected.
    pub fn upstream_node(&self, node: NodeId, port: Port) -> Option<&Node> {
        self.find_upstream(node, port)
            .first()
            .and_then(|e| self.nodes.get(&e.source))
    }

    /// The prompt feeding a model node, if any.
    pub fn prompt_for(&self, model: NodeId) -> Option<&PromptNode> {
        self.upstream_node(model, Port::Prompt)
            .and_then(|n| n.data.as_prompt())
    }

    /// Tool nodes registered on a model node, in wiring order.
    pub fn tools_for(&self, model: NodeId) -> Vec<(NodeId, &ToolNode)> {
        self.find_upstream(model, Port::Tools)
            .into_iter()
            .filter_map(|e| {
                self.nodes
                    .get(&e.source)
                    .and_then(|n| n.data.as_tool().map(|t| (n.id, t)))
            })
            .collect()
    }
}
