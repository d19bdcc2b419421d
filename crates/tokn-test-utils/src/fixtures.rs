//! Vendor-accurate stream fixtures.
//!
//! Each function renders what the vendor would put on the wire for a plain
//! text reply or for a single tool call, already split into fragments.
//! Tool-call arguments are split in two so adapters must concatenate them.

use serde_json::{json, Value};

use tokn_core::types::ProviderKind;
use tokn_llm::RawFragment;

fn data(value: Value) -> RawFragment {
    RawFragment::data(value.to_string())
}

fn named(event: &str, value: Value) -> RawFragment {
    RawFragment::named(event, value.to_string())
}

fn halves(s: &str) -> (String, String) {
    let mut mid = s.len() / 2;
    while !s.is_char_boundary(mid) {
        mid -= 1;
    }
    (s[..mid].to_string(), s[mid..].to_string())
}

/// A reply that streams `text` and ends without tool calls.
pub fn text_response(provider: ProviderKind, text: &str) -> Vec<RawFragment> {
    match provider {
        ProviderKind::OpenAi => vec![
            data(json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}}]})),
            data(json!({"choices": [{"index": 0, "delta": {"content": text}}]})),
            data(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]})),
            RawFragment::data("[DONE]"),
        ],
        ProviderKind::Anthropic => vec![
            named("message_start", json!({"type": "message_start", "message": {"id": "msg_1"}})),
            named(
                "content_block_start",
                json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            ),
            named(
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}}),
            ),
            named("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
            named(
                "message_delta",
                json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}}),
            ),
            named("message_stop", json!({"type": "message_stop"})),
        ],
        ProviderKind::Gemini => vec![
            data(json!({"candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]})),
            data(json!({"candidates": [{"content": {"role": "model", "parts": [{"text": ""}]}, "finishReason": "STOP"}]})),
        ],
        ProviderKind::Cohere => vec![
            data(json!({"type": "message-start", "id": "m1"})),
            data(json!({"type": "content-delta", "index": 0, "delta": {"message": {"content": {"text": text}}}})),
            data(json!({"type": "message-end", "delta": {"finish_reason": "COMPLETE"}})),
        ],
        ProviderKind::Ollama => vec![
            data(json!({"message": {"role": "assistant", "content": text}, "done": false})),
            data(json!({"message": {"role": "assistant", "content": ""}, "done": true})),
        ],
    }
}

/// A reply consisting of exactly one tool call.
pub fn tool_call_response(
    provider: ProviderKind,
    id: &str,
    name: &str,
    arguments: &Value,
) -> Vec<RawFragment> {
    let args = arguments.to_string();
    let (head, tail) = halves(&args);
    match provider {
        ProviderKind::OpenAi => vec![
            data(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": id, "type": "function", "function": {"name": name, "arguments": ""}}
            ]}}]})),
            data(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": head}}
            ]}}]})),
            data(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": tail}}
            ]}}]})),
            data(json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]})),
            RawFragment::data("[DONE]"),
        ],
        ProviderKind::Anthropic => vec![
            named("message_start", json!({"type": "message_start", "message": {"id": "msg_1"}})),
            named(
                "content_block_start",
                json!({"type": "content_block_start", "index": 0,
                       "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}}),
            ),
            named(
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0,
                       "delta": {"type": "input_json_delta", "partial_json": head}}),
            ),
            named(
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0,
                       "delta": {"type": "input_json_delta", "partial_json": tail}}),
            ),
            named("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
            named(
                "message_delta",
                json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}}),
            ),
            named("message_stop", json!({"type": "message_stop"})),
        ],
        ProviderKind::Gemini => vec![data(json!({"candidates": [{
            "content": {"role": "model", "parts": [{"functionCall": {"name": name, "args": arguments}}]},
            "finishReason": "STOP"
        }]}))],
        ProviderKind::Cohere => vec![
            data(json!({"type": "message-start", "id": "m1"})),
            data(json!({"type": "tool-call-start", "index": 0, "delta": {"message": {"tool_calls": {
                "id": id, "type": "function", "function": {"name": name, "arguments": ""}
            }}}})),
            data(json!({"type": "tool-call-delta", "index": 0, "delta": {"message": {"tool_calls": {
                "function": {"arguments": head}
            }}}})),
            data(json!({"type": "tool-call-delta", "index": 0, "delta": {"message": {"tool_calls": {
                "function": {"arguments": tail}
            }}}})),
            data(json!({"type": "tool-call-end", "index": 0})),
            data(json!({"type": "message-end", "delta": {"finish_reason": "TOOL_CALL"}})),
        ],
        ProviderKind::Ollama => {
            let call = json!({"tool": name, "arguments": arguments}).to_string();
            let (first, second) = halves(&call);
            vec![
                data(json!({"message": {"role": "assistant", "content": first}, "done": false})),
                data(json!({"message": {"role": "assistant", "content": second}, "done": false})),
                data(json!({"message": {"role": "assistant", "content": ""}, "done": true})),
            ]
        }
    }
}

/// A reply whose stream carries a vendor-reported error.
pub fn error_response(provider: ProviderKind, message: &str) -> Vec<RawFragment> {
    match provider {
        ProviderKind::Anthropic => vec![named(
            "error",
            json!({"type": "error", "error": {"type": "api_error", "message": message}}),
        )],
        ProviderKind::Ollama => vec![data(json!({"error": message}))],
        ProviderKind::Cohere => vec![data(json!({
            "type": "message-end", "delta": {"finish_reason": "ERROR", "error": message}
        }))],
        ProviderKind::OpenAi | ProviderKind::Gemini => {
            vec![data(json!({"error": {"message": message}}))]
        }
    }
}
