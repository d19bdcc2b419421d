pub mod bridge;
pub mod sandbox;
pub mod schema;

pub use bridge::{ExecLimits, ToolBridge};
pub use schema::{check_schema, is_valid_tool_name, validate_arguments};
