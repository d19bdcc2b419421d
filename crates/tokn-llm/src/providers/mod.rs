pub mod anthropic;
pub mod cohere;
pub mod gemini;
pub mod ollama;
pub mod openai;

use tokn_core::error::{Result, ToknError};
use tokn_core::types::ProviderKind;

use crate::adapter::ModelSettings;

/// The key a vendor requires, or a `MissingApiKey` naming only the provider.
pub(crate) fn require_key(provider: ProviderKind, settings: &ModelSettings) -> Result<&str> {
    settings
        .api_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ToknError::MissingApiKey(provider.to_string()))
}

pub(crate) fn require_model(provider: ProviderKind, settings: &ModelSettings) -> Result<&str> {
    let model = settings.model.trim();
    if model.is_empty() {
        return Err(ToknError::ProviderRequest(format!(
            "{}: no model selected",
            provider
        )));
    }
    Ok(model)
}

pub(crate) fn json_content_type() -> (String, String) {
    ("Content-Type".to_string(), "application/json".to_string())
}
