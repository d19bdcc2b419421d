use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ToknError};
use crate::traits::CredentialStore;
use crate::types::ProviderKind;

/// Top-level tokn configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tools: ToolBridgeConfig,
    /// Per-vendor settings keyed by provider id (`openai`, `google`, ...).
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub optimizer: Option<OptimizerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on request/response rounds per model node.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_max_iterations() -> usize { 10 }

/// Limits applied to every tool invocation unless the tool overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolBridgeConfig {
    #[serde(default = "default_tool_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Heap ceiling of the script runtime.
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: usize,
    /// Per-request timeout for `fetch` calls made by tool code.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

impl Default for ToolBridgeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_tool_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
            memory_limit_bytes: default_memory_limit_bytes(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

fn default_tool_timeout_ms() -> u64 { 30_000 }
fn default_max_output_bytes() -> usize { 5_000_000 }
fn default_memory_limit_bytes() -> usize { 64 * 1024 * 1024 }
fn default_fetch_timeout_ms() -> u64 { 20_000 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Location of the prompt-optimization service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default = "default_optimizer_timeout")]
    pub timeout_secs: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            timeout_secs: default_optimizer_timeout(),
        }
    }
}

fn default_backend_url() -> String { "http://localhost:5000/api".to_string() }
fn default_optimizer_timeout() -> u64 { 1800 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ToknError::ConfigNotFound(path.display().to_string()))?;

        Self::from_toml(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| ToknError::Config(e.to_string()))?;

        for id in config.providers.keys() {
            if ProviderKind::from_id(id).is_none() {
                return Err(ToknError::UnsupportedProvider(id.clone()));
            }
        }
        if config.engine.max_iterations == 0 {
            return Err(ToknError::Config("engine.max_iterations must be at least 1".into()));
        }
        Ok(config)
    }

    pub fn provider(&self, provider: ProviderKind) -> Option<&ProviderConfig> {
        self.providers.get(provider.id())
    }

    /// Base URL override for a provider, if configured.
    pub fn base_url(&self, provider: ProviderKind) -> Option<String> {
        self.provider(provider).and_then(|p| p.base_url.clone())
    }

    /// A copy safe to print: every API key replaced by a marker.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for p in copy.providers.values_mut() {
            if p.api_key.is_some() {
                p.api_key = Some("<redacted>".to_string());
            }
        }
        copy
    }
}

/// Credential store backed by the config file, falling back to the
/// vendor's conventional environment variable.
#[derive(Debug, Clone)]
pub struct ConfigCredentialStore {
    keys: HashMap<ProviderKind, String>,
}

impl ConfigCredentialStore {
    pub fn new(config: &AppConfig) -> Self {
        let keys = ProviderKind::ALL
            .into_iter()
            .filter_map(|p| {
                config
                    .provider(p)
                    .and_then(|c| c.api_key.clone())
                    .filter(|k| !k.is_empty() && !k.starts_with("${"))
                    .map(|k| (p, k))
            })
            .collect();
        Self { keys }
    }
}

impl CredentialStore for ConfigCredentialStore {
    fn api_key(&self, provider: ProviderKind) -> Option<String> {
        if let Some(key) = self.keys.get(&provider) {
            return Some(key.clone());
        }
        provider
            .api_key_env()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.engine.max_iterations, 10);
        assert_eq!(config.tools.timeout_ms, 30_000);
        assert_eq!(config.tools.max_output_bytes, 5_000_000);
        assert!(config.optimizer.is_none());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = AppConfig::from_toml("[providers.azure]\napi_key = \"x\"\n").unwrap_err();
        assert!(matches!(err, ToknError::UnsupportedProvider(id) if id == "azure"));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        assert!(AppConfig::from_toml("[engine]\nmax_iterations = 0\n").is_err());
    }

    #[test]
    fn test_unexpanded_key_is_ignored() {
        let config = AppConfig::from_toml(
            "[providers.cohere]\napi_key = \"${TOKN_SURELY_UNSET_VAR}\"\n",
        )
        .unwrap();
        let store = ConfigCredentialStore::new(&config);
        assert!(!store.keys.contains_key(&ProviderKind::Cohere));
    }

    #[test]
    fn test_redacted_hides_keys() {
        let config =
            AppConfig::from_toml("[providers.openai]\napi_key = \"sk-secret\"\n").unwrap();
        let shown = toml::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("<redacted>"));
    }
}
