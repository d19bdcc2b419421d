use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokn_core::error::ToknError;
use tokn_core::graph::{FlowGraph, NodeId, NodeKind, OptimizerAlgorithm, Port};
use tokn_core::traits::CredentialStore;
use tokn_tools::{check_schema, is_valid_tool_name};

use crate::optimizer::{OptimizerBackend, OptimizerContext};

/// One precondition violation, attributed to the node at fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub node: NodeId,
    pub message: String,
}

impl ValidationIssue {
    fn new(node: NodeId, message: impl Into<String>) -> Self {
        Self {
            node,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {}: {}", self.node, self.message)
    }
}

impl From<ValidationIssue> for ToknError {
    fn from(issue: ValidationIssue) -> Self {
        ToknError::Validation {
            node: issue.node,
            message: issue.message,
        }
    }
}

/// Model nodes that will execute: those with a prompt wired in.
pub fn executable_models(graph: &FlowGraph) -> Vec<NodeId> {
    graph
        .nodes()
        .filter(|n| n.kind() == NodeKind::Model)
        .filter(|n| !graph.find_upstream(n.id, Port::Prompt).is_empty())
        .map(|n| n.id)
        .collect()
}

/// Optimizer nodes fed by a model node's output.
pub fn wired_optimizers(graph: &FlowGraph) -> Vec<NodeId> {
    graph
        .nodes()
        .filter(|n| n.kind() == NodeKind::Optimizer)
        .filter(|n| !graph.find_upstream(n.id, Port::Input).is_empty())
        .map(|n| n.id)
        .collect()
}

/// Build the context an optimizer sees, without any run output yet.
pub(crate) fn optimizer_context(
    graph: &FlowGraph,
    node: NodeId,
    credentials: &dyn CredentialStore,
) -> Option<OptimizerContext> {
    let optimizer = graph.node(node)?.data.as_optimizer()?.clone();
    let upstream = graph.upstream_node(node, Port::Input);
    let model = upstream.and_then(|n| n.data.as_model()).cloned();
    let prompt = upstream.and_then(|n| graph.prompt_for(n.id)).and_then(|p| p.combined());
    let api_key = model.as_ref().and_then(|m| credentials.api_key(m.provider));
    Some(OptimizerContext {
        node,
        optimizer,
        model,
        prompt,
        model_output: None,
        api_key,
    })
}

/// Check every precondition of a run. Makes no network calls.
///
/// Issues are listed in node-discovery order; an empty list means the run
/// may start.
pub fn validate_graph(
    graph: &FlowGraph,
    credentials: &dyn CredentialStore,
    optimizers: &HashMap<OptimizerAlgorithm, Arc<dyn OptimizerBackend>>,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    for model_id in executable_models(graph) {
        for edge in graph.find_upstream(model_id, Port::Prompt) {
            let empty = graph
                .node(edge.source)
                .and_then(|n| n.data.as_prompt())
                .map(|p| p.combined().is_none())
                .unwrap_or(true);
            if empty {
                issues.push(ValidationIssue::new(edge.source, "prompt is empty"));
            }
        }

        let Some(model) = graph.node(model_id).and_then(|n| n.data.as_model()) else {
            continue;
        };
        if model.model_id().is_none() {
            issues.push(ValidationIssue::new(model_id, "no model selected"));
        }
        if model.provider.requires_api_key() && credentials.api_key(model.provider).is_none() {
            issues.push(ValidationIssue::new(
                model_id,
                format!("no API key configured for {}", model.provider),
            ));
        }

        let mut names = HashSet::new();
        for (tool_id, tool) in graph.tools_for(model_id) {
            if !is_valid_tool_name(&tool.name) {
                issues.push(ValidationIssue::new(
                    tool_id,
                    format!(
                        "tool name '{}' must be 1-64 letters, digits, '_' or '-'",
                        tool.name
                    ),
                ));
            } else if !names.insert(tool.name.as_str()) {
                issues.push(ValidationIssue::new(
                    tool_id,
                    format!("duplicate tool name '{}' on the same model", tool.name),
                ));
            }
            if tool.code.trim().is_empty() {
                issues.push(ValidationIssue::new(tool_id, "tool has no code"));
            }
            if let Err(e) = check_schema(&tool.parameters) {
                issues.push(ValidationIssue::new(
                    tool_id,
                    format!("invalid parameter schema: {}", e),
                ));
            }
        }
    }

    for opt_id in wired_optimizers(graph) {
        let Some(ctx) = optimizer_context(graph, opt_id, credentials) else {
            continue;
        };
        match optimizers.get(&ctx.optimizer.algorithm) {
            None => issues.push(ValidationIssue::new(
                opt_id,
                format!(
                    "no optimizer backend configured for {}",
                    ctx.optimizer.algorithm
                ),
            )),
            Some(backend) => issues.extend(
                backend
                    .validate(&ctx)
                    .into_iter()
                    .map(|m| ValidationIssue::new(opt_id, m)),
            ),
        }
    }

    issues
}
