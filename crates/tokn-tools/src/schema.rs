use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Names every supported vendor accepts for a function tool.
static TOOL_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").ok());

pub fn is_valid_tool_name(name: &str) -> bool {
    TOOL_NAME.as_ref().is_some_and(|re| re.is_match(name))
}

/// Check tool arguments against the tool's parameter schema.
///
/// Returns one message per violation; an empty list means the call may run.
pub fn validate_arguments(schema: &Value, args: &Value) -> Vec<String> {
    if !args.is_object() {
        return vec![format!("arguments must be a JSON object, got {}", type_name(args))];
    }

    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => return vec![format!("invalid parameter schema: {}", e)],
    };

    validator.iter_errors(args).map(|e| e.to_string()).collect()
}

/// Check that a parameter schema compiles.
pub fn check_schema(schema: &Value) -> Result<(), String> {
    jsonschema::validator_for(schema)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
