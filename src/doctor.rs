use std::path::Path;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use tokn_core::config::{AppConfig, ConfigCredentialStore};
use tokn_core::traits::CredentialStore;
use tokn_core::types::ProviderKind;
use tokn_engine::HttpOptimizerBackend;
use tokn_tools::{ExecLimits, ToolBridge};

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

impl CheckResult {
    fn new(label: impl Into<String>, ok: bool, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok,
            detail: detail.into(),
        }
    }
}

pub async fn run_doctor(config: &AppConfig, config_path: &Path) {
    let mut checks = Vec::new();

    checks.push(check_config_file(config_path));
    let credentials = ConfigCredentialStore::new(config);
    for provider in ProviderKind::ALL {
        checks.push(check_provider(config, &credentials, provider));
    }
    checks.push(check_sandbox(config).await);
    checks.push(check_optimizer(config).await);

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn check_config_file(path: &Path) -> CheckResult {
    if path.exists() {
        CheckResult::new("Config", true, path.display().to_string())
    } else {
        CheckResult::new(
            "Config",
            false,
            format!("{} not found, using defaults and environment", path.display()),
        )
    }
}

fn check_provider(
    config: &AppConfig,
    credentials: &dyn CredentialStore,
    provider: ProviderKind,
) -> CheckResult {
    let label = format!("Provider {}", provider);
    let base = config
        .base_url(provider)
        .map(|b| format!(" ({})", b))
        .unwrap_or_default();

    if !provider.requires_api_key() {
        return CheckResult::new(label, true, format!("no key needed{}", base));
    }
    match credentials.api_key(provider) {
        Some(_) => CheckResult::new(label, true, format!("key configured{}", base)),
        None => {
            let hint = provider
                .api_key_env()
                .map(|v| format!(", set {} or providers.{}.api_key", v, provider.id()))
                .unwrap_or_default();
            CheckResult::new(label, false, format!("no API key{}", hint))
        }
    }
}

async fn check_sandbox(config: &AppConfig) -> CheckResult {
    let bridge = ToolBridge::new(config.tools.clone());
    let limits = ExecLimits {
        timeout: Duration::from_secs(5),
        max_output_bytes: 1024,
    };
    let result = bridge
        .execute(
            "return { sum: args.a + args.b };",
            &json!({"a": 1, "b": 2}),
            limits,
            &CancellationToken::new(),
        )
        .await;
    match result.failure() {
        None => CheckResult::new("Tool sandbox", true, result.content_text()),
        Some(f) => CheckResult::new("Tool sandbox", false, format!("{}: {}", f.kind, f.message)),
    }
}

async fn check_optimizer(config: &AppConfig) -> CheckResult {
    let Some(cfg) = &config.optimizer else {
        return CheckResult::new("Optimizer", true, "not configured");
    };
    match HttpOptimizerBackend::new(cfg).health().await {
        Ok(body) => CheckResult::new(
            "Optimizer",
            true,
            format!("{} is up ({})", cfg.backend_url, body),
        ),
        Err(e) => CheckResult::new(
            "Optimizer",
            false,
            format!("{} unreachable: {}", cfg.backend_url, e),
        ),
    }
}
