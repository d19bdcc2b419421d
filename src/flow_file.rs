use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;

use tokn_core::graph::{FlowGraph, NodeData, NodeId, Port};

/// JSON description of a flow, as saved by an editor.
#[derive(Debug, Deserialize)]
pub struct FlowFile {
    pub nodes: Vec<FlowFileNode>,
    #[serde(default)]
    pub edges: Vec<FlowFileEdge>,
}

#[derive(Debug, Deserialize)]
pub struct FlowFileNode {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    pub data: NodeData,
}

#[derive(Debug, Deserialize)]
pub struct FlowFileEdge {
    pub source: String,
    pub source_port: Port,
    pub target: String,
    pub target_port: Port,
}

pub fn load(path: &Path) -> anyhow::Result<FlowGraph> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading flow file {}", path.display()))?;
    parse(&content).with_context(|| format!("loading flow {}", path.display()))
}

/// Build a graph, failing on the first edge the graph refuses.
pub fn parse(content: &str) -> anyhow::Result<FlowGraph> {
    let file: FlowFile = serde_json::from_str(content)?;
    let mut graph = FlowGraph::new();
    let mut ids: HashMap<String, NodeId> = HashMap::new();

    for node in file.nodes {
        if ids.contains_key(&node.key) {
            bail!("duplicate node key '{}'", node.key);
        }
        let label = node.label.unwrap_or_else(|| node.key.clone());
        let id = graph.add_node(label, node.data);
        ids.insert(node.key, id);
    }

    for edge in &file.edges {
        let lookup = |key: &str| {
            ids.get(key)
                .copied()
                .with_context(|| format!("edge refers to unknown node '{}'", key))
        };
        let source = lookup(&edge.source)?;
        let target = lookup(&edge.target)?;
        if graph
            .create_edge(source, edge.source_port, target, edge.target_port)
            .is_none()
        {
            bail!(
                "edge {}.{} -> {}.{} is not allowed",
                edge.source,
                edge.source_port,
                edge.target,
                edge.target_port
            );
        }
    }

    Ok(graph)
}
