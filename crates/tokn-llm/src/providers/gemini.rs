use serde_json::{json, Map, Value};

use tokn_core::error::Result;
use tokn_core::types::{NormalizedToolResult, ProviderKind, ToolCall, ToolPayload};

use crate::adapter::{
    parse_fragment, ChunkEvent, ModelSettings, PreparedRequest, ProviderAdapter, SessionState,
    StreamState, ToolSpec, DEFAULT_TOOL_INSTRUCTION,
};
use crate::providers::{json_content_type, require_key, require_model};
use crate::streaming::{Framing, RawFragment};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// JSON-Schema keywords the Gemini function-declaration schema rejects.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["additionalProperties", "$schema"];

/// Google Gemini `streamGenerateContent` over SSE.
///
/// Function calls arrive as whole objects rather than argument fragments,
/// and carry no id, so ids are synthesized from position and name.
#[derive(Debug, Default)]
pub struct GeminiAdapter;

impl GeminiAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// Strip keys Gemini refuses, recursively.
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), sanitize_schema(v)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn function_declaration(tool: &ToolSpec) -> Value {
    let mut decl = json!({
        "name": tool.name,
        "description": tool.description,
    });
    // An object schema without properties is rejected; omit it instead.
    let empty_object = tool.parameters["type"] == "object"
        && tool.parameters["properties"]
            .as_object()
            .map_or(true, Map::is_empty);
    if !empty_object {
        decl["parameters"] = sanitize_schema(&tool.parameters);
    }
    decl
}

fn is_function_response_message(message: &Value) -> bool {
    message["role"] == "user"
        && message["parts"].as_array().is_some_and(|parts| {
            !parts.is_empty() && parts.iter().all(|p| p.get("functionResponse").is_some())
        })
}

impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Gemini
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
        session.seed(system, json!({ "role": "user", "parts": [{ "text": prompt }] }));

        let mut body = json!({ "contents": session.messages });
        if let Some(system) = &session.system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        if !tools.is_empty() {
            let decls: Vec<Value> = tools.iter().map(function_declaration).collect();
            body["tools"] = json!([{ "functionDeclarations": decls }]);
        }
        let mut generation = Map::new();
        if let Some(t) = settings.temperature {
            generation.insert("temperature".into(), json!(t));
        }
        if let Some(max) = settings.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(max));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        Ok(PreparedRequest {
            url: format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                settings.base_or(GEMINI_API_BASE),
                model
            ),
            headers: vec![
                json_content_type(),
                ("x-goog-api-key".to_string(), api_key.to_string()),
            ],
            body,
            framing: Framing::Sse,
        })
    }

    fn parse_chunk(&self, mut state: StreamState, fragment: &RawFragment) -> (StreamState, ChunkEvent) {
        let Some(chunk) = parse_fragment(self.provider(), fragment) else {
            return (state, ChunkEvent::default());
        };

        if let Some(err) = chunk.get("error") {
            let message = err["message"].as_str().unwrap_or("unknown error").to_string();
            return (state, ChunkEvent::error(message));
        }

        let Some(candidate) = chunk
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return (state, ChunkEvent::default());
        };

        let mut text = String::new();
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(t) = part.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                } else if let Some(call) = part.get("functionCall") {
                    let Some(name) = call["name"].as_str() else {
                        continue;
                    };
                    let index = state.calls.len();
                    let partial = state.call_mut(index);
                    partial.name = name.to_string();
                    partial.complete = Some(match call.get("args") {
                        Some(args) if !args.is_null() => args.clone(),
                        _ => json!({}),
                    });
                }
            }
        }
        let text_delta = state.push_text(&text);

        let finished = candidate
            .get("finishReason")
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
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(json!({ "text": text }));
        }
        for call in calls {
            parts.push(json!({
                "functionCall": { "name": call.name, "args": call.arguments }
            }));
        }
        if !parts.is_empty() {
            session
                .messages
                .push(json!({ "role": "model", "parts": parts }));
        }
    }

    fn continue_with_tool_result(
        &self,
        session: &mut SessionState,
        call: &ToolCall,
        result: &NormalizedToolResult,
    ) {
        let response = match result {
            NormalizedToolResult::Ok {
                payload: ToolPayload::Json(v),
                ..
            } if v.is_object() => v.clone(),
            NormalizedToolResult::Ok { payload, .. } => json!({ "result": payload.to_json() }),
            NormalizedToolResult::Err(f) => json!({ "error": format!("{}: {}", f.kind, f.message) }),
        };
        let part = json!({
            "functionResponse": { "name": call.name, "response": response }
        });
        match session.messages.last_mut() {
            Some(last) if is_function_response_message(last) => {
                if let Some(parts) = last["parts"].as_array_mut() {
                    parts.push(part);
                }
            }
            _ => session
                .messages
                .push(json!({ "role": "user", "parts": [part] })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_nested_keys() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "filter": {"type": "object", "additionalProperties": false, "properties": {"a": {"type": "string"}}}
            }
        });
        let clean = sanitize_schema(&schema);
        assert!(clean.get("$schema").is_none());
        assert!(clean.get("additionalProperties").is_none());
        assert!(clean["properties"]["filter"].get("additionalProperties").is_none());
        assert_eq!(clean["properties"]["filter"]["properties"]["a"]["type"], "string");
    }

    #[test]
    fn test_prepare_request_shape() {
        let adapter = GeminiAdapter::new();
        let settings = ModelSettings {
            provider: Some(ProviderKind::Gemini),
            model: "gemini-1.5-flash".into(),
            api_key: Some("g-key".into()),
            temperature: Some(0.2),
            ..Default::default()
        };
        let tools = vec![
            ToolSpec {
                name: "ping".into(),
                description: "no args".into(),
                parameters: json!({"type": "object", "properties": {}}),
            },
            ToolSpec {
                name: "fetch_url".into(),
                description: String::new(),
                parameters: json!({"type": "object", "properties": {"url": {"type": "string"}}}),
            },
        ];
        let mut session = SessionState::new();
        let req = adapter
            .prepare_request("hi", &tools, &settings, &mut session)
            .unwrap();
        assert!(req.url.ends_with("/models/gemini-1.5-flash:streamGenerateContent?alt=sse"));
        assert!(!req.url.contains("g-key"));
        let decls = &req.body["tools"][0]["functionDeclarations"];
        assert!(decls[0].get("parameters").is_none());
        assert_eq!(decls[1]["parameters"]["properties"]["url"]["type"], "string");
        assert_eq!(req.body["generationConfig"]["temperature"], json!(0.2f32));
    }

    #[test]
    fn test_whole_object_calls_and_finish() {
        let adapter = GeminiAdapter::new();
        let (state, first) = adapter.parse_chunk(
            StreamState::new(),
            &RawFragment::data(
                r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"fetch_url","args":{"url":"http://x"}}}]}}]}"#,
            ),
        );
        assert!(first.is_empty());
        let (_, last) = adapter.parse_chunk(
            state,
            &RawFragment::data(r#"{"candidates":[{"content":{"parts":[{"text":""}]},"finishReason":"STOP"}]}"#),
        );
        let calls = last.tool_calls.unwrap();
        assert_eq!(calls[0].id, "call_0_fetch_url");
        assert_eq!(calls[0].arguments, json!({"url": "http://x"}));
    }

    #[test]
    fn test_function_responses_are_merged() {
        let adapter = GeminiAdapter::new();
        let mut session = SessionState::new();
        let call = ToolCall {
            id: "c".into(),
            name: "t".into(),
            arguments: json!({}),
        };
        let ok = NormalizedToolResult::ok(ToolPayload::Text("done".into()));
        adapter.continue_with_tool_result(&mut session, &call, &ok);
        adapter.continue_with_tool_result(&mut session, &call, &ok);
        assert_eq!(session.messages().len(), 1);
        assert_eq!(
            session.messages()[0]["parts"][1]["functionResponse"]["response"]["result"],
            "done"
        );
    }
}
