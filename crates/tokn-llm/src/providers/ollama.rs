use serde_json::{json, Map, Value};
use tracing::debug;

use tokn_core::error::Result;
use tokn_core::types::{NormalizedToolResult, ProviderKind, ToolCall};

use crate::adapter::{
    parse_fragment, ChunkEvent, ModelSettings, PreparedRequest, ProviderAdapter, SessionState,
    StreamState, ToolSpec, DEFAULT_TOOL_INSTRUCTION,
};
use crate::providers::{json_content_type, require_model};
use crate::streaming::{Framing, RawFragment};

const OLLAMA_API_BASE: &str = "http://localhost:11434";

/// Instruction appended to the catalog for models without native tool calling.
pub const JSON_TOOL_INSTRUCTION: &str = "To call a tool, reply with ONLY a JSON object of the form \
{\"tool\": \"<tool name>\", \"arguments\": {...}} and nothing else. \
When no tool is needed, answer normally.";

/// Local Ollama runtime, `/api/chat` streamed as JSON lines.
///
/// No native tool calling: the catalog is described in the system prompt
/// and a tool call is recognized as a JSON object in the reply text.
#[derive(Debug, Default)]
pub struct OllamaAdapter;

impl OllamaAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// Plain-text description of the available tools.
pub fn tool_catalog(tools: &[ToolSpec]) -> String {
    let mut out = String::from("Available tools:\n");
    for t in tools {
        out.push_str(&format!("- {}: {}\n", t.name, t.description));
        out.push_str(&format!("  parameters: {}\n", t.parameters));
    }
    out
}

/// Find the first JSON object in `text` that names a tool.
pub fn extract_tool_call(text: &str) -> Option<(String, Value)> {
    text.char_indices()
        .filter(|(_, c)| *c == '{')
        .find_map(|(i, _)| {
            let mut values = serde_json::Deserializer::from_str(&text[i..]).into_iter::<Value>();
            let value = values.next()?.ok()?;
            let name = value.get("tool").and_then(Value::as_str)?.to_string();
            let arguments = match value.get("arguments") {
                Some(Value::Object(map)) => Value::Object(map.clone()),
                Some(Value::String(raw)) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                }
                _ => Value::Object(Map::new()),
            };
            Some((name, arguments))
        })
}

impl ProviderAdapter for OllamaAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn prepare_request(
        &self,
        prompt: &str,
        tools: &[ToolSpec],
        settings: &ModelSettings,
        session: &mut SessionState,
    ) -> Result<PreparedRequest> {
        let model = require_model(self.provider(), settings)?;

        let system = (!tools.is_empty()).then(|| {
            format!(
                "{}\n\n{}\n{}",
                DEFAULT_TOOL_INSTRUCTION,
                tool_catalog(tools),
                JSON_TOOL_INSTRUCTION
            )
        });
        session.seed(system, json!({ "role": "user", "content": prompt }));

        let mut messages = Vec::with_capacity(session.messages.len() + 1);
        if let Some(system) = &session.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(session.messages.iter().cloned());

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });
        let mut options = Map::new();
        if let Some(t) = settings.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(max) = settings.max_tokens {
            options.insert("num_predict".into(), json!(max));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }

        let mut headers = vec![json_content_type()];
        // Hosted Ollama endpoints may sit behind a bearer token.
        if let Some(key) = settings.api_key.as_deref().filter(|k| !k.is_empty()) {
            headers.push(("Authorization".to_string(), format!("Bearer {}", key)));
        }

        Ok(PreparedRequest {
            url: format!("{}/api/chat", settings.base_or(OLLAMA_API_BASE)),
            headers,
            body,
            framing: Framing::JsonLines,
        })
    }

    fn parse_chunk(&self, mut state: StreamState, fragment: &RawFragment) -> (StreamState, ChunkEvent) {
        let Some(line) = parse_fragment(self.provider(), fragment) else {
            return (state, ChunkEvent::default());
        };

        if let Some(err) = line.get("error").and_then(Value::as_str) {
            return (state, ChunkEvent::error(err));
        }

        let text_delta = line["message"]["content"]
            .as_str()
            .and_then(|t| state.push_text(t));

        if line["done"] != true {
            return (state, ChunkEvent::text(text_delta));
        }

        let (state, done) = self.finish_stream(state);
        (
            state,
            ChunkEvent {
                text_delta,
                tool_calls: done.tool_calls,
                provider_error: None,
            },
        )
    }

    fn finish_stream(&self, mut state: StreamState) -> (StreamState, ChunkEvent) {
        if state.finished {
            return (state, ChunkEvent::default());
        }
        if let Some((name, arguments)) = extract_tool_call(&state.text) {
            debug!(tool = %name, "Recognized tool call in model text");
            let partial = state.call_mut(0);
            partial.name = name;
            partial.complete = Some(arguments);
        }
        let tool_calls = state.finish();
        (
            state,
            ChunkEvent {
                tool_calls,
                ..Default::default()
            },
        )
    }

    fn record_assistant_turn(&self, session: &mut SessionState, text: &str, _calls: &[ToolCall]) {
        // The call is already part of the text the model produced.
        session
            .messages
            .push(json!({ "role": "assistant", "content": text }));
    }

    fn continue_with_tool_result(
        &self,
        session: &mut SessionState,
        call: &ToolCall,
        result: &NormalizedToolResult,
    ) {
        session.messages.push(json!({
            "role": "user",
            "content": format!(
                "Result of tool \"{}\":\n{}",
                call.name,
                result.content_text()
            ),
        }));
    }
}
