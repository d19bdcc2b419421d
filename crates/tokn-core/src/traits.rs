use std::collections::HashMap;

use crate::types::ProviderKind;

/// Resolves a vendor API key.
///
/// Implementations must never log the returned value.
pub trait CredentialStore: Send + Sync + 'static {
    fn api_key(&self, provider: ProviderKind) -> Option<String>;
}

/// Fixed in-memory keys.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    keys: HashMap<ProviderKind, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, provider: ProviderKind, key: impl Into<String>) -> Self {
        self.keys.insert(provider, key.into());
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn api_key(&self, provider: ProviderKind) -> Option<String> {
        self.keys.get(&provider).filter(|k| !k.is_empty()).cloned()
    }
}
