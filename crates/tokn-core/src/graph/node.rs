use serde::{Deserialize, Serialize};

use crate::types::ProviderKind;

/// Opaque handle of a node inside a [`FlowGraph`](super::FlowGraph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// The closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Prompt,
    Model,
    Tool,
    Optimizer,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Prompt => "prompt",
            Self::Model => "model",
            Self::Tool => "tool",
            Self::Optimizer => "optimizer",
        };
        f.write_str(s)
    }
}

/// Execution status of a node. Written only by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Idle,
    Running,
    Success,
    Error,
}

/// Kind-specific payload of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeData {
    Prompt(PromptNode),
    Model(ModelNode),
    Tool(ToolNode),
    Optimizer(OptimizerNode),
}

impl NodeData {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Prompt(_) => NodeKind::Prompt,
            Self::Model(_) => NodeKind::Model,
            Self::Tool(_) => NodeKind::Tool,
            Self::Optimizer(_) => NodeKind::Optimizer,
        }
    }

    pub fn as_prompt(&self) -> Option<&PromptNode> {
        match self {
            Self::Prompt(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_model(&self) -> Option<&ModelNode> {
        match self {
            Self::Model(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_tool(&self) -> Option<&ToolNode> {
        match self {
            Self::Tool(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_optimizer(&self) -> Option<&OptimizerNode> {
        match self {
            Self::Optimizer(o) => Some(o),
            _ => None,
        }
    }
}

/// A system/user prompt pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptNode {
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub user_prompt: String,
}

impl PromptNode {
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
        }
    }

    /// Combine the two segments into the text sent to the model.
    ///
    /// A lone segment is sent verbatim; when both are present they are
    /// joined with role labels. Returns `None` when both are blank.
    pub fn combined(&self) -> Option<String> {
        let system = self.system_prompt.trim();
        let user = self.user_prompt.trim();
        match (system.is_empty(), user.is_empty()) {
            (true, true) => None,
            (false, true) => Some(system.to_string()),
            (true, false) => Some(user.to_string()),
            (false, false) => Some(format!("System: {}\n\nUser: {}", system, user)),
        }
    }
}

/// A model invocation against one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelNode {
    pub provider: ProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ModelNode {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: Some(model.into()),
            temperature: None,
            max_tokens: None,
            base_url: None,
        }
    }

    /// The selected model identifier, if a non-blank one is set.
    pub fn model_id(&self) -> Option<&str> {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
    }
}

/// A user-authored tool: schema plus JavaScript body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolNode {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
    pub code: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_output_bytes: Option<usize>,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolNode {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        code: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            code: code.into(),
            timeout_ms: None,
            max_output_bytes: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Which external optimization backend a node delegates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerAlgorithm {
    Dspy,
    Gepa,
}

impl std::fmt::Display for OptimizerAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dspy => f.write_str("dspy"),
            Self::Gepa => f.write_str("gepa"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerExample {
    pub input: String,
    pub expected_output: String,
}

/// A prompt optimizer fed by a model node's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerNode {
    pub algorithm: OptimizerAlgorithm,
    #[serde(default)]
    pub examples: Vec<OptimizerExample>,
    /// Algorithm-specific settings, forwarded untouched.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A node owned by the graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub label: String,
    pub data: NodeData,
    pub status: NodeStatus,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        self.data.kind()
    }
}
