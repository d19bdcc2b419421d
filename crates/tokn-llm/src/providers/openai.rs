use serde_json::{json, Value};

use tokn_core::error::Result;
use tokn_core::types::{NormalizedToolResult, ProviderKind, ToolCall};

use crate::adapter::{
    parse_fragment, ChunkEvent, ModelSettings, PreparedRequest, ProviderAdapter, SessionState,
    StreamState, ToolSpec, DEFAULT_TOOL_INSTRUCTION,
};
use crate::providers::{json_content_type, require_key, require_model};
use crate::streaming::{Framing, RawFragment};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI Chat Completions, streamed as SSE `data:` lines.
#[derive(Debug, Default)]
pub struct OpenAiAdapter;

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn convert_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn prepare_request(
        &self,
        prompt: &str,
        tools: &[ToolSpec],
        settings: &ModelSettings,
        session: &mut SessionState,
    ) -> Result<PreparedRequest> {
        let api_key = require_key(self.provider(), settings)?;
        let model = require_model(self.provider(), settings)?;

        let system = (!tools.is_empty()).then(|| DEFAULT_TOOL_INSTRUCTION.to_string());
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
        if let Some(t) = settings.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = settings.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(convert_tools(tools));
        }

        Ok(PreparedRequest {
            url: format!("{}/chat/completions", settings.base_or(OPENAI_API_BASE)),
            headers: vec![
                json_content_type(),
                ("Authorization".to_string(), format!("Bearer {}", api_key)),
            ],
            body,
            framing: Framing::Sse,
        })
    }

    fn parse_chunk(&self, mut state: StreamState, fragment: &RawFragment) -> (StreamState, ChunkEvent) {
        if fragment.data.trim() == "[DONE]" {
            let tool_calls = state.finish();
            return (
                state,
                ChunkEvent {
                    tool_calls,
                    ..Default::default()
                },
            );
        }

        let Some(chunk) = parse_fragment(self.provider(), fragment) else {
            return (state, ChunkEvent::default());
        };

        if let Some(err) = chunk.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return (state, ChunkEvent::error(message));
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return (state, ChunkEvent::default());
        };
        let delta = choice.get("delta");

        let text_delta = delta
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .and_then(|t| state.push_text(t));

        // Name and argument pieces may share one chunk or be split across many.
        if let Some(calls) = delta
            .and_then(|d| d.get("tool_calls"))
            .and_then(Value::as_array)
        {
            for tc in calls {
                let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let partial = state.call_mut(index);
                if let Some(id) = tc.get("id").and_then(Value::as_str) {
                    partial.id = id.to_string();
                }
                let function = tc.get("function");
                if let Some(name) = function.and_then(|f| f.get("name")).and_then(Value::as_str) {
                    partial.name = name.to_string();
                }
                if let Some(args) = function
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                {
                    partial.arguments.push_str(args);
                }
            }
        }

        let finished = choice
            .get("finish_reason")
            .is_some_and(|r| !r.is_null());
        let tool_calls = if finished { state.finish() } else { None };

        (
            state,
            ChunkEvent {
                text_delta,
                tool_calls,
                provider_error: None,
            },
        )
    }

    fn record_assistant_turn(&self, session: &mut SessionState, text: &str, calls: &[ToolCall]) {
        let mut message = json!({
            "role": "assistant",
            "content": if text.is_empty() { Value::Null } else { json!(text) },
        });
        if !calls.is_empty() {
            message["tool_calls"] = calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.arguments.to_string(),
                        }
                    })
                })
                .collect();
        }
        session.messages.push(message);
    }

    fn continue_with_tool_result(
        &self,
        session: &mut SessionState,
        call: &ToolCall,
        result: &NormalizedToolResult,
    ) {
        session.messages.push(json!({
            "role": "tool",
            "tool_call_id": call.id,
            "content": result.content_text(),
        }));
    }
}
