//! Small graphs used across engine tests.

use serde_json::json;

use tokn_core::graph::{
    FlowGraph, ModelNode, NodeData, NodeId, Port, PromptNode, ToolNode,
};
use tokn_core::types::ProviderKind;

/// Handles of a prompt → model flow.
pub struct SimpleFlow {
    pub graph: FlowGraph,
    pub prompt: NodeId,
    pub model: NodeId,
}

/// A prompt wired into one model node of `provider`.
pub fn prompt_model(provider: ProviderKind, system: &str, user: &str) -> SimpleFlow {
    let mut graph = FlowGraph::new();
    let prompt = graph.add_node("Prompt", NodeData::Prompt(PromptNode::new(system, user)));
    let model = graph.add_node(
        "Model",
        NodeData::Model(ModelNode::new(provider, default_model(provider))),
    );
    graph
        .create_edge(prompt, Port::Prompt, model, Port::Prompt)
        .expect("prompt edge");
    SimpleFlow {
        graph,
        prompt,
        model,
    }
}

/// Register `tool` on `model` and return the tool's handle.
pub fn attach_tool(graph: &mut FlowGraph, model: NodeId, tool: ToolNode) -> NodeId {
    let label = tool.name.clone();
    let id = graph.add_node(label, NodeData::Tool(tool));
    graph
        .create_edge(id, Port::Register, model, Port::Tools)
        .expect("tool edge");
    id
}

/// A `fetch_url` tool that returns a fixed page without touching the network.
pub fn fetch_url_tool() -> ToolNode {
    ToolNode::new(
        "fetch_url",
        "Fetch the contents of a URL",
        json!({
            "type": "object",
            "properties": { "url": { "type": "string" } },
            "required": ["url"]
        }),
        "return `<html>${args.url}</html>`;",
    )
}

pub fn default_model(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::OpenAi => "gpt-4o-mini",
        ProviderKind::Anthropic => "claude-3-5-haiku-latest",
        ProviderKind::Gemini => "gemini-1.5-flash",
        ProviderKind::Cohere => "command-r-plus",
        ProviderKind::Ollama => "llama3.1",
    }
}
