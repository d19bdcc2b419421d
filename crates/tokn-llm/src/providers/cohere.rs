use serde_json::{json, Value};

use tokn_core::error::Result;
use tokn_core::types::{NormalizedToolResult, ProviderKind, ToolCall};

use crate::adapter::{
    parse_fragment, ChunkEvent, ModelSettings, PreparedRequest, ProviderAdapter, SessionState,
    StreamState, ToolSpec, DEFAULT_TOOL_INSTRUCTION,
};
use crate::providers::openai::convert_tools;
use crate::providers::{json_content_type, require_key, require_model};
use crate::streaming::{Framing, RawFragment};

const COHERE_API_BASE: &str = "https://api.cohere.com/v2";

/// Cohere v2 Chat. SSE whose payloads carry a `type` discriminator.
#[derive(Debug, Default)]
pub struct CohereAdapter;

impl CohereAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl ProviderAdapter for CohereAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Cohere
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
            // v2 uses the same function-tool shape as OpenAI.
            body["tools"] = Value::Array(convert_tools(tools));
        }

        Ok(PreparedRequest {
            url: format!("{}/chat", settings.base_or(COHERE_API_BASE)),
            headers: vec![
                json_content_type(),
                ("Authorization".to_string(), format!("Bearer {}", api_key)),
            ],
            body,
            framing: Framing::Sse,
        })
    }

    fn parse_chunk(&self, mut state: StreamState, fragment: &RawFragment) -> (StreamState, ChunkEvent) {
        let Some(event) = parse_fragment(self.provider(), fragment) else {
            return (state, ChunkEvent::default());
        };

        let kind = event
            .get("type")
            .and_then(Value::as_str)
            .or(fragment.event.as_deref())
            .unwrap_or("");
        let index = event.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
        let message = &event["delta"]["message"];

        match kind {
            "content-delta" => {
                let delta = message["content"]["text"]
                    .as_str()
                    .and_then(|t| state.push_text(t));
                (state, ChunkEvent::text(delta))
            }
            "tool-call-start" => {
                let tc = &message["tool_calls"];
                let partial = state.call_mut(index);
                partial.id = tc["id"].as_str().unwrap_or_default().to_string();
                partial.name = tc["function"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    partial.arguments.push_str(args);
                }
                (state, ChunkEvent::default())
            }
            "tool-call-delta" => {
                if let Some(args) = message["tool_calls"]["function"]["arguments"].as_str() {
                    state.call_mut(index).arguments.push_str(args);
                }
                (state, ChunkEvent::default())
            }
            "message-end" => {
                if event["delta"]["finish_reason"] == "ERROR" {
                    let reason = event["delta"]["error"]
                        .as_str()
                        .unwrap_or("generation failed")
                        .to_string();
                    state.finished = true;
                    return (state, ChunkEvent::error(reason));
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
            // message-start, tool-plan-delta, tool-call-end, content-start/end
            _ => (state, ChunkEvent::default()),
        }
    }

    fn record_assistant_turn(&self, session: &mut SessionState, text: &str, calls: &[ToolCall]) {
        if calls.is_empty() {
            session
                .messages
                .push(json!({ "role": "assistant", "content": text }));
            return;
        }
        let tool_calls: Vec<Value> = calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments.to_string() },
                })
            })
            .collect();
        let mut message = json!({ "role": "assistant", "tool_calls": tool_calls });
        if !text.is_empty() {
            message["tool_plan"] = json!(text);
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
            "content": [{
                "type": "document",
                "document": { "data": result.content_text() },
            }],
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_events() {
        let adapter = CohereAdapter::new();
        let fragments = [
            r#"{"type":"message-start","id":"m1"}"#,
            r#"{"type":"tool-plan-delta","delta":{"message":{"tool_plan":"I will fetch"}}}"#,
            r#"{"type":"tool-call-start","index":0,"delta":{"message":{"tool_calls":{"id":"fetch_url_abc","type":"function","function":{"name":"fetch_url","arguments":""}}}}}"#,
            r#"{"type":"tool-call-delta","index":0,"delta":{"message":{"tool_calls":{"function":{"arguments":"{\"url\":\"http://x\"}"}}}}}"#,
            r#"{"type":"tool-call-end","index":0}"#,
            r#"{"type":"message-end","delta":{"finish_reason":"TOOL_CALL"}}"#,
        ];
        let mut state = StreamState::new();
        let mut last = ChunkEvent::default();
        for f in fragments {
            let (next, ev) = adapter.parse_chunk(state, &RawFragment::data(f));
            state = next;
            last = ev;
        }
        let calls = last.tool_calls.unwrap();
        assert_eq!(calls[0].id, "fetch_url_abc");
        assert_eq!(calls[0].arguments["url"], "http://x");
    }

    #[test]
    fn test_content_delta() {
        let adapter = CohereAdapter::new();
        let (state, ev) = adapter.parse_chunk(
            StreamState::new(),
            &RawFragment::data(
                r#"{"type":"content-delta","index":0,"delta":{"message":{"content":{"text":"4"}}}}"#,
            ),
        );
        assert_eq!(ev.text_delta.as_deref(), Some("4"));
        assert_eq!(state.text(), "4");
    }

    #[test]
    fn test_assistant_turn_uses_tool_plan() {
        let adapter = CohereAdapter::new();
        let mut session = SessionState::new();
        let call = ToolCall {
            id: "c1".into(),
            name: "t".into(),
            arguments: json!({"a": 1}),
        };
        adapter.record_assistant_turn(&mut session, "planning", &[call]);
        let msg = &session.messages()[0];
        assert_eq!(msg["tool_plan"], "planning");
        assert_eq!(msg["tool_calls"][0]["function"]["arguments"], "{\"a\":1}");
    }
}
