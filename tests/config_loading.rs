use std::io::Write;

use tokn_core::config::{AppConfig, ConfigCredentialStore};
use tokn_core::error::ToknError;
use tokn_core::traits::CredentialStore;
use tokn_core::types::ProviderKind;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_iterations = 6

[tools]
timeout_ms = 5000
max_output_bytes = 65536
memory_limit_bytes = 33554432
fetch_timeout_ms = 4000

[providers.openai]
api_key = "sk-test-key"

[providers.google]
api_key = "gm-test-key"

[providers.ollama]
base_url = "http://gpu-box:11434"

[optimizer]
backend_url = "http://optimizer:5000/api"
timeout_secs = 600
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_iterations, 6);
    assert_eq!(config.tools.timeout_ms, 5000);
    assert_eq!(config.tools.max_output_bytes, 65536);
    assert_eq!(config.tools.memory_limit_bytes, 33554432);
    assert_eq!(config.tools.fetch_timeout_ms, 4000);
    assert_eq!(
        config.base_url(ProviderKind::Ollama).as_deref(),
        Some("http://gpu-box:11434")
    );

    let optimizer = config.optimizer.as_ref().expect("optimizer present");
    assert_eq!(optimizer.backend_url, "http://optimizer:5000/api");
    assert_eq!(optimizer.timeout_secs, 600);

    let creds = ConfigCredentialStore::new(&config);
    assert_eq!(creds.api_key(ProviderKind::OpenAi).as_deref(), Some("sk-test-key"));
    assert_eq!(creds.api_key(ProviderKind::Gemini).as_deref(), Some("gm-test-key"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("TOKN_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[providers.anthropic]
api_key = "${TOKN_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let creds = ConfigCredentialStore::new(&config);
    assert_eq!(
        creds.api_key(ProviderKind::Anthropic).as_deref(),
        Some("expanded-key-value")
    );

    std::env::remove_var("TOKN_TEST_API_KEY");
}

#[test]
fn test_empty_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_iterations, 10);
    assert_eq!(config.tools.timeout_ms, 30_000);
    assert_eq!(config.tools.max_output_bytes, 5_000_000);
    assert!(config.optimizer.is_none());
    assert!(config.providers.is_empty());
}

#[test]
fn test_unknown_provider_is_rejected() {
    let result = AppConfig::from_toml("[providers.azure]\napi_key = \"x\"\n");
    assert!(matches!(result, Err(ToknError::UnsupportedProvider(id)) if id == "azure"));
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let result = AppConfig::load(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ToknError::ConfigNotFound(_))));
}

#[test]
fn test_redacted_config_hides_keys() {
    let config = AppConfig::from_toml("[providers.cohere]\napi_key = \"co-secret\"\n")
        .expect("parse config");
    let printed = toml::to_string_pretty(&config.redacted()).expect("serialize");
    assert!(!printed.contains("co-secret"));
    assert!(printed.contains("<redacted>"));
}
