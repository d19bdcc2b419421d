pub mod adapter;
pub mod providers;
pub mod streaming;
pub mod transport;

use tokn_core::types::ProviderKind;

pub use adapter::{
    ChunkEvent, ModelSettings, PreparedRequest, ProviderAdapter, SessionState, StreamState,
    ToolSpec, DEFAULT_TOOL_INSTRUCTION,
};
pub use providers::anthropic::AnthropicAdapter;
pub use providers::cohere::CohereAdapter;
pub use providers::gemini::GeminiAdapter;
pub use providers::ollama::OllamaAdapter;
pub use providers::openai::OpenAiAdapter;
pub use streaming::{Framing, RawFragment};
pub use transport::{FragmentBoxStream, HttpTransport, LlmTransport};

/// Create the adapter for a provider.
pub fn create_adapter(provider: ProviderKind) -> Box<dyn ProviderAdapter> {
    match provider {
        ProviderKind::OpenAi => Box::new(OpenAiAdapter::new()),
        ProviderKind::Anthropic => Box::new(AnthropicAdapter::new()),
        ProviderKind::Gemini => Box::new(GeminiAdapter::new()),
        ProviderKind::Cohere => Box::new(CohereAdapter::new()),
        ProviderKind::Ollama => Box::new(OllamaAdapter::new()),
    }
}
