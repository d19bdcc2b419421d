//! The vendor-neutral adapter contract.
//!
//! Every provider converts a generic `(prompt, tools, settings, session)`
//! request into its own wire payload, and folds its own streamed fragments
//! back into [`ChunkEvent`]s. The engine only ever talks to this trait.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use tokn_core::error::Result;
use tokn_core::graph::{ModelNode, ToolNode};
use tokn_core::types::{NormalizedToolResult, ProviderKind, ToolCall};

use crate::streaming::{Framing, RawFragment};

/// System instruction seeded into every session that has tools available.
/// Shared by all adapters so behavior stays comparable across vendors.
pub const DEFAULT_TOOL_INSTRUCTION: &str = "You are a helpful assistant with access to tools. \
Use a tool whenever it helps answer the request, then answer the user directly \
using the tool results.";

/// Per-request model settings resolved from a model node.
#[derive(Clone, Default)]
pub struct ModelSettings {
    pub provider: Option<ProviderKind>,
    pub model: String,
    pub api_key: Option<String>,
    /// API base (scheme, host and version prefix), without the endpoint path.
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ModelSettings {
    pub fn from_node(node: &ModelNode, api_key: Option<String>) -> Self {
        Self {
            provider: Some(node.provider),
            model: node.model_id().unwrap_or_default().to_string(),
            api_key,
            base_url: node.base_url.clone(),
            temperature: node.temperature,
            max_tokens: node.max_tokens,
        }
    }

    pub(crate) fn base_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.base_url
            .as_deref()
            .map(|b| b.trim_end_matches('/'))
            .filter(|b| !b.is_empty())
            .unwrap_or(default)
    }
}

impl std::fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSettings")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// A tool definition as offered to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&ToolNode> for ToolSpec {
    fn from(tool: &ToolNode) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        }
    }
}

/// A fully described HTTP request, ready for a transport to send.
#[derive(Clone)]
pub struct PreparedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub framing: Framing,
}

const SECRET_HEADERS: &[&str] = &["authorization", "x-api-key", "x-goog-api-key"];

impl PreparedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Debug for PreparedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(k, v)| {
                let shown = if SECRET_HEADERS.contains(&k.to_ascii_lowercase().as_str()) {
                    "<redacted>"
                } else {
                    v.as_str()
                };
                (k.as_str(), shown)
            })
            .collect();
        f.debug_struct("PreparedRequest")
            .field("url", &self.url)
            .field("headers", &headers)
            .field("body", &self.body)
            .field("framing", &self.framing)
            .finish()
    }
}

/// Conversation history of one model node during one run.
///
/// The message shapes are adapter-specific; nothing outside the owning
/// adapter interprets them.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub(crate) system: Option<String>,
    pub(crate) messages: Vec<Value>,
    seeded: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    pub fn messages(&self) -> &[Value] {
        &self.messages
    }

    /// Seed the history on the first request of a session; later calls are no-ops.
    pub(crate) fn seed(&mut self, system: Option<String>, first: Value) {
        if self.seeded {
            return;
        }
        self.system = system;
        self.messages.push(first);
        self.seeded = true;
    }
}

/// A tool call whose pieces are still arriving.
#[derive(Debug, Clone, Default)]
pub(crate) struct PartialCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
    /// Set when the vendor sends arguments as a whole object.
    pub complete: Option<Value>,
}

/// Accumulator threaded across the fragments of one response.
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    pub(crate) text: String,
    pub(crate) calls: BTreeMap<usize, PartialCall>,
    pub(crate) finished: bool,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// All text seen so far in this response.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether the terminal signal has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn push_text(&mut self, delta: &str) -> Option<String> {
        if delta.is_empty() || self.finished {
            return None;
        }
        self.text.push_str(delta);
        Some(delta.to_string())
    }

    pub(crate) fn call_mut(&mut self, index: usize) -> &mut PartialCall {
        self.calls.entry(index).or_default()
    }

    /// Mark the response complete and parse the accumulated tool calls.
    /// Only the first call has an effect.
    pub(crate) fn finish(&mut self) -> Option<Vec<ToolCall>> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let calls: Vec<ToolCall> = std::mem::take(&mut self.calls)
            .into_iter()
            .filter(|(_, c)| !c.name.is_empty())
            .map(|(index, c)| ToolCall {
                id: if c.id.is_empty() {
                    format!("call_{}_{}", index, c.name)
                } else {
                    c.id
                },
                arguments: c
                    .complete
                    .unwrap_or_else(|| parse_arguments(&c.name, &c.arguments)),
                name: c.name,
            })
            .collect();
        (!calls.is_empty()).then_some(calls)
    }
}

/// Parse concatenated argument text. Blank means no arguments; text that
/// is not JSON is passed through as a string so schema validation rejects it.
pub(crate) fn parse_arguments(tool: &str, raw: &str) -> Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(tool, error = %e, "Tool call arguments are not valid JSON");
            Value::String(raw.to_string())
        }
    }
}

/// What one fragment contributed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkEvent {
    pub text_delta: Option<String>,
    /// Present only once the terminal signal has been observed.
    pub tool_calls: Option<Vec<ToolCall>>,
    /// A failure reported by the vendor inside the stream.
    pub provider_error: Option<String>,
}

impl ChunkEvent {
    pub fn text(delta: Option<String>) -> Self {
        Self {
            text_delta: delta,
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            provider_error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text_delta.is_none() && self.tool_calls.is_none() && self.provider_error.is_none()
    }
}

/// Decode a fragment's JSON payload. Malformed input is logged and dropped.
pub(crate) fn parse_fragment(provider: ProviderKind, fragment: &RawFragment) -> Option<Value> {
    match serde_json::from_str::<Value>(&fragment.data) {
        Ok(v) if v.is_object() => Some(v),
        Ok(_) => None,
        Err(e) => {
            debug!(%provider, error = %e, "Dropping unparseable stream fragment");
            None
        }
    }
}

/// Bridge between the engine and one vendor's wire protocol.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Build the next request. Seeds `session` on the first call.
    fn prepare_request(
        &self,
        prompt: &str,
        tools: &[ToolSpec],
        settings: &ModelSettings,
        session: &mut SessionState,
    ) -> Result<PreparedRequest>;

    /// Fold one fragment into the stream state. Never fails: malformed
    /// fragments yield an empty event.
    fn parse_chunk(&self, state: StreamState, fragment: &RawFragment) -> (StreamState, ChunkEvent);

    /// Called when the body ends. Emits calls that a vendor left pending
    /// because the connection closed before its terminal signal.
    fn finish_stream(&self, mut state: StreamState) -> (StreamState, ChunkEvent) {
        let tool_calls = state.finish();
        (
            state,
            ChunkEvent {
                tool_calls,
                ..Default::default()
            },
        )
    }

    /// Append the assistant's turn (text plus tool-call records).
    fn record_assistant_turn(&self, session: &mut SessionState, text: &str, calls: &[ToolCall]);

    /// Append a tool result in the vendor's required shape.
    fn continue_with_tool_result(
        &self,
        session: &mut SessionState,
        call: &ToolCall,
        result: &NormalizedToolResult,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_parses_concatenated_arguments_once() {
        let mut state = StreamState::new();
        {
            let call = state.call_mut(0);
            call.id = "call_a".into();
            call.name = "fetch_url".into();
            call.arguments.push_str("{\"url\":");
            call.arguments.push_str("\"http://x\"}");
        }
        let calls = state.finish().unwrap();
        assert_eq!(calls[0].arguments, serde_json::json!({"url": "http://x"}));
        assert!(state.finish().is_none());
        assert!(state.push_text("late").is_none());
    }

    #[test]
    fn test_blank_and_invalid_arguments() {
        assert_eq!(parse_arguments("t", "  "), serde_json::json!({}));
        assert_eq!(parse_arguments("t", "{oops"), Value::String("{oops".into()));
    }

    #[test]
    fn test_missing_id_is_synthesized() {
        let mut state = StreamState::new();
        state.call_mut(2).name = "lookup".into();
        let calls = state.finish().unwrap();
        assert_eq!(calls[0].id, "call_2_lookup");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let settings = ModelSettings {
            api_key: Some("sk-live-123".into()),
            ..Default::default()
        };
        assert!(!format!("{:?}", settings).contains("sk-live-123"));

        let req = PreparedRequest {
            url: "https://x".into(),
            headers: vec![("Authorization".into(), "Bearer sk-live-123".into())],
            body: Value::Null,
            framing: Framing::Sse,
        };
        assert!(!format!("{:?}", req).contains("sk-live-123"));
        assert_eq!(req.header("authorization"), Some("Bearer sk-live-123"));
    }
}
