use thiserror::Error;

use crate::graph::NodeId;

#[derive(Debug, Error)]
pub enum ToknError {
    // Validation errors (reported per node, before any network call)
    #[error("Validation failed for node {node}: {message}")]
    Validation { node: NodeId, message: String },

    // Provider errors
    #[error("Provider request failed: {0}")]
    ProviderRequest(String),

    #[error("Provider stream error: {0}")]
    ProviderStream(String),

    #[error("Provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("No API key configured for provider: {0}")]
    MissingApiKey(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool input validation failed: {tool}: {message}")]
    ToolValidation { tool: String, message: String },

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool TIMEOUT after {timeout_ms}ms: {tool}")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    // Optimizer errors
    #[error("Optimizer failed for node {node}: {message}")]
    Optimizer { node: NodeId, message: String },

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ToknError {
    /// Cancellation is terminal but is not reported as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, ToknError>;
