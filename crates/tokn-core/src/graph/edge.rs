use serde::{Deserialize, Serialize};

use super::node::NodeId;
use super::port::Port;

/// Opaque handle of an edge inside a [`FlowGraph`](super::FlowGraph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(u32);

impl EdgeId {
    pub(crate) fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// A directed, port-typed connection `(source, source_port) -> (target, target_port)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub source_port: Port,
    pub target: NodeId,
    pub target_port: Port,
}

impl Edge {
    pub fn touches(&self, node: NodeId) -> bool {
        self.source == node || self.target == node
    }
}
