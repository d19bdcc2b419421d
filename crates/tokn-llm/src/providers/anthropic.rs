use serde_json::{json, Value};

use tokn_core::error::Result;
use tokn_core::types::{NormalizedToolResult, ProviderKind, ToolCall};

use crate::adapter::{
    parse_fragment, ChunkEvent, ModelSettings, PreparedRequest, ProviderAdapter, SessionState,
    StreamState, ToolSpec, DEFAULT_TOOL_INSTRUCTION,
};
use crate::providers::{json_content_type, require_key, require_model};
use crate::streaming::{Framing, RawFragment};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Messages API. SSE with named events and a `type` discriminator.
#[derive(Debug, Default)]
pub struct AnthropicAdapter;

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// A user message made only of tool results, which later results join.
fn is_tool_result_message(message: &Value) -> bool {
    message["role"] == "user"
        && message["content"].as_array().is_some_and(|blocks| {
            !blocks.is_empty() && blocks.iter().all(|b| b["type"] == "tool_result")
        })
}

impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
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
        session.seed(
            system,
            json!({ "role": "user", "content": [{ "type": "text", "text": prompt }] }),
        );

        let mut body = json!({
            "model": model,
            "max_tokens": settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": session.messages,
            "stream": true,
        });
        if let Some(system) = &session.system {
            body["system"] = json!(system);
        }
        if let Some(t) = settings.temperature {
            body["temperature"] = json!(t);
        }
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
        }

        Ok(PreparedRequest {
            url: format!("{}/messages", settings.base_or(ANTHROPIC_API_BASE)),
            headers: vec![
                json_content_type(),
                ("x-api-key".to_string(), api_key.to_string()),
                ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
            ],
            body,
            framing: Framing::Sse,
        })
    }

    fn parse_chunk(&self, mut state: StreamState, fragment: &RawFragment) -> (StreamState, ChunkEvent) {
        let Some(event) = parse_fragment(self.provider(), fragment) else {
            return (state, ChunkEvent::default());
        };

        // The `type` field duplicates the SSE event name; prefer the payload.
        let kind = event
            .get("type")
            .and_then(Value::as_str)
            .or(fragment.event.as_deref())
            .unwrap_or("");
        let index = event.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;

        match kind {
            "content_block_start" => {
                let block = &event["content_block"];
                if block["type"] == "tool_use" {
                    let partial = state.call_mut(index);
                    partial.id = block["id"].as_str().unwrap_or_default().to_string();
                    partial.name = block["name"].as_str().unwrap_or_default().to_string();
                } else if let Some(text) = block["text"].as_str() {
                    let delta = state.push_text(text);
                    return (state, ChunkEvent::text(delta));
                }
                (state, ChunkEvent::default())
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().and_then(|t| state.push_text(t));
                        (state, ChunkEvent::text(text))
                    }
                    Some("input_json_delta") => {
                        if let Some(part) = delta["partial_json"].as_str() {
                            state.call_mut(index).arguments.push_str(part);
                        }
                        (state, ChunkEvent::default())
                    }
                    _ => (state, ChunkEvent::default()),
                }
            }
            "message_delta" if !event["delta"]["stop_reason"].is_null() => {
                let tool_calls = state.finish();
                (
                    state,
                    ChunkEvent {
                        tool_calls,
                        ..Default::default()
                    },
                )
            }
            "message_stop" => {
                let tool_calls = state.finish();
                (
                    state,
                    ChunkEvent {
                        tool_calls,
                        ..Default::default()
                    },
                )
            }
            "error" => {
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string();
                (state, ChunkEvent::error(message))
            }
            // message_start, content_block_stop, ping
            _ => (state, ChunkEvent::default()),
        }
    }

    fn record_assistant_turn(&self, session: &mut SessionState, text: &str, calls: &[ToolCall]) {
        let mut blocks = Vec::new();
        if !text.is_empty() {
            blocks.push(json!({ "type": "text", "text": text }));
        }
        for call in calls {
            let input = if call.arguments.is_object() {
                call.arguments.clone()
            } else {
                json!({})
            };
            blocks.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": input,
            }));
        }
        // The API rejects assistant turns with empty content.
        if !blocks.is_empty() {
            session
                .messages
                .push(json!({ "role": "assistant", "content": blocks }));
        }
    }

    fn continue_with_tool_result(
        &self,
        session: &mut SessionState,
        call: &ToolCall,
        result: &NormalizedToolResult,
    ) {
        let block = json!({
            "type": "tool_result",
            "tool_use_id": call.id,
            "content": result.content_text(),
            "is_error": !result.is_ok(),
        });
        match session.messages.last_mut() {
            Some(last) if is_tool_result_message(last) => {
                if let Some(blocks) = last["content"].as_array_mut() {
                    blocks.push(block);
                }
            }
            _ => session
                .messages
                .push(json!({ "role": "user", "content": [block] })),
        }
    }
}
