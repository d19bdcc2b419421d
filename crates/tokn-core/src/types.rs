use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{NodeId, NodeStatus};

/// Supported LLM vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google")]
    Gemini,
    #[serde(rename = "cohere")]
    Cohere,
    #[serde(rename = "ollama")]
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        Self::OpenAi,
        Self::Anthropic,
        Self::Gemini,
        Self::Cohere,
        Self::Ollama,
    ];

    /// Stable identifier used in config files and flow descriptions.
    pub fn id(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "google",
            Self::Cohere => "cohere",
            Self::Ollama => "ollama",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }

    /// Local runtimes do not need a key.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Ollama)
    }

    /// Conventional environment variable holding this vendor's key.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::Gemini => Some("GOOGLE_API_KEY"),
            Self::Cohere => Some("COHERE_API_KEY"),
            Self::Ollama => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// A tool invocation extracted from a model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Declared shape of a successful tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Text,
    Json,
    Bytes,
}

/// Payload of a successful tool result.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolPayload {
    Text(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl ToolPayload {
    pub fn kind(&self) -> ResultKind {
        match self {
            Self::Text(_) => ResultKind::Text,
            Self::Json(_) => ResultKind::Json,
            Self::Bytes(_) => ResultKind::Bytes,
        }
    }

    /// Render for providers that take tool output as a string.
    /// Bytes are base64-encoded.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Json(v) => v.to_string(),
            Self::Bytes(b) => base64::engine::general_purpose::STANDARD.encode(b),
        }
    }

    /// Render for providers that take tool output as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Json(v) => v.clone(),
            other => serde_json::Value::String(other.to_text()),
        }
    }
}

/// Error code of a failed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolErrorKind {
    Timeout,
    Cancelled,
    InvalidArguments,
    OutputTooLarge,
    Runtime,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::InvalidArguments => "INVALID_ARGUMENTS",
            Self::OutputTooLarge => "OUTPUT_TOO_LARGE",
            Self::Runtime => "RUNTIME_ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolFailure {
    pub kind: ToolErrorKind,
    pub message: String,
}

/// The vendor-agnostic envelope returned by the tool bridge.
///
/// Engine and adapters depend only on this shape, never on how the tool ran.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedToolResult {
    Ok {
        payload: ToolPayload,
        warnings: Vec<String>,
    },
    Err(ToolFailure),
}

impl NormalizedToolResult {
    pub fn ok(payload: ToolPayload) -> Self {
        Self::Ok {
            payload,
            warnings: Vec::new(),
        }
    }

    pub fn err(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self::Err(ToolFailure {
            kind,
            message: message.into(),
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn failure(&self) -> Option<&ToolFailure> {
        match self {
            Self::Err(f) => Some(f),
            Self::Ok { .. } => None,
        }
    }

    /// Text handed back to the model as the tool's output.
    pub fn content_text(&self) -> String {
        match self {
            Self::Ok { payload, .. } => payload.to_text(),
            Self::Err(f) => format!("{}: {}", f.kind, f.message),
        }
    }

    /// The `{ok, kind, result}` / `{ok, error}` envelope as JSON.
    pub fn to_envelope(&self) -> serde_json::Value {
        match self {
            Self::Ok { payload, .. } => serde_json::json!({
                "ok": true,
                "kind": payload.kind(),
                "result": payload.to_json(),
            }),
            Self::Err(f) => serde_json::json!({
                "ok": false,
                "error": f.kind,
                "message": f.message,
            }),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed,
}

/// Event broadcast to UI subscribers while a run progresses.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted { run_id: Uuid },
    NodeStatus { node: NodeId, status: NodeStatus },
    /// Text streamed from a model, forwarded as soon as it is parsed.
    TextDelta { node: NodeId, text: String },
    ToolStart {
        node: NodeId,
        name: String,
        arguments: serde_json::Value,
    },
    ToolEnd {
        node: NodeId,
        name: String,
        result: NormalizedToolResult,
    },
    IterationComplete { node: NodeId, iteration: usize },
    IterationCapReached { node: NodeId, cap: usize },
    NodeError { node: NodeId, message: String },
    OptimizerProgress { node: NodeId, message: String },
    RunFinished { run_id: Uuid, outcome: RunOutcome },
}
