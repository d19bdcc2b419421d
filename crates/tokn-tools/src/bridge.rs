use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tokn_core::config::ToolBridgeConfig;
use tokn_core::graph::ToolNode;
use tokn_core::types::{NormalizedToolResult, ToolErrorKind, ToolPayload};

use crate::sandbox::{run_script, SandboxError, SandboxLimits};
use crate::schema::validate_arguments;

/// Limits for a single invocation.
#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// Runs user tool code in isolated, time- and size-bounded workers.
///
/// Every call resolves to a [`NormalizedToolResult`]; timeouts and
/// cancellation are reported as error results, never as panics or `Err`.
pub struct ToolBridge {
    config: ToolBridgeConfig,
    workers_launched: AtomicUsize,
}

impl ToolBridge {
    pub fn new(config: ToolBridgeConfig) -> Self {
        Self {
            config,
            workers_launched: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &ToolBridgeConfig {
        &self.config
    }

    /// How many workers have been started over this bridge's lifetime.
    pub fn workers_launched(&self) -> usize {
        self.workers_launched.load(Ordering::SeqCst)
    }

    /// Limits for a tool, applying its own overrides over the bridge defaults.
    pub fn limits_for(&self, tool: &ToolNode) -> ExecLimits {
        ExecLimits {
            timeout: Duration::from_millis(tool.timeout_ms.unwrap_or(self.config.timeout_ms)),
            max_output_bytes: tool.max_output_bytes.unwrap_or(self.config.max_output_bytes),
        }
    }

    /// Validate `args` against the tool's schema, then run it.
    ///
    /// A schema violation returns `INVALID_ARGUMENTS` without starting a worker.
    pub async fn invoke(
        &self,
        tool: &ToolNode,
        args: &Value,
        cancel: &CancellationToken,
    ) -> NormalizedToolResult {
        let errors = validate_arguments(&tool.parameters, args);
        if !errors.is_empty() {
            debug!(tool = %tool.name, ?errors, "Tool arguments rejected");
            return NormalizedToolResult::err(ToolErrorKind::InvalidArguments, errors.join("; "));
        }
        self.execute(&tool.code, args, self.limits_for(tool), cancel)
            .await
    }

    /// Run `code` with `args` in a fresh worker.
    pub async fn execute(
        &self,
        code: &str,
        args: &Value,
        limits: ExecLimits,
        cancel: &CancellationToken,
    ) -> NormalizedToolResult {
        if cancel.is_cancelled() {
            return NormalizedToolResult::err(ToolErrorKind::Cancelled, "cancelled before start");
        }

        let interrupt = Arc::new(AtomicBool::new(false));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let sandbox = SandboxLimits {
            memory_limit_bytes: self.config.memory_limit_bytes,
            fetch_timeout: Duration::from_millis(self.config.fetch_timeout_ms),
            deadline: Instant::now() + limits.timeout,
        };
        let code = code.to_string();
        let args = args.clone();
        let flag = interrupt.clone();

        let spawned = std::thread::Builder::new()
            .name("tokn-tool".to_string())
            .spawn(move || {
                let result = run_script(&code, &args, sandbox, flag);
                // The receiver is gone if the bridge already gave up.
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            return NormalizedToolResult::err(
                ToolErrorKind::Runtime,
                format!("failed to start worker: {}", e),
            );
        }
        self.workers_launched.fetch_add(1, Ordering::SeqCst);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                interrupt.store(true, Ordering::Relaxed);
                return NormalizedToolResult::err(ToolErrorKind::Cancelled, "tool call cancelled");
            }
            _ = tokio::time::sleep(limits.timeout) => {
                interrupt.store(true, Ordering::Relaxed);
                return NormalizedToolResult::err(
                    ToolErrorKind::Timeout,
                    format!("TIMEOUT after {}ms", limits.timeout.as_millis()),
                );
            }
            res = rx => res,
        };

        match outcome {
            Ok(Ok(payload)) => bound_output(payload, limits.max_output_bytes),
            Ok(Err(SandboxError::Script(message))) => {
                NormalizedToolResult::err(ToolErrorKind::Runtime, message)
            }
            Ok(Err(SandboxError::Setup(message))) => NormalizedToolResult::err(
                ToolErrorKind::Runtime,
                format!("sandbox setup failed: {}", message),
            ),
            Ok(Err(SandboxError::Interrupted)) => {
                NormalizedToolResult::err(ToolErrorKind::Cancelled, "tool call interrupted")
            }
            Err(_) => NormalizedToolResult::err(ToolErrorKind::Runtime, "worker exited without a result"),
        }
    }
}

/// Enforce the output ceiling. Text is truncated with a warning; other
/// payloads cannot be cut meaningfully and fail instead.
fn bound_output(payload: ToolPayload, max_bytes: usize) -> NormalizedToolResult {
    match payload {
        ToolPayload::Text(mut text) if text.len() > max_bytes => {
            let original = text.len();
            let mut cut = max_bytes;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            let warning = format!("output truncated from {} to {} bytes", original, cut);
            warn!(original, kept = cut, "Tool output truncated");
            NormalizedToolResult::Ok {
                payload: ToolPayload::Text(text),
                warnings: vec![warning],
            }
        }
        ToolPayload::Json(value) => {
            let size = value.to_string().len();
            if size > max_bytes {
                return NormalizedToolResult::err(
                    ToolErrorKind::OutputTooLarge,
                    format!("JSON output is {} bytes, limit is {}", size, max_bytes),
                );
            }
            NormalizedToolResult::ok(ToolPayload::Json(value))
        }
        ToolPayload::Bytes(bytes) if bytes.len() > max_bytes => NormalizedToolResult::err(
            ToolErrorKind::OutputTooLarge,
            format!("binary output is {} bytes, limit is {}", bytes.len(), max_bytes),
        ),
        other => NormalizedToolResult::ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_truncated_on_char_boundary() {
        let result = bound_output(ToolPayload::Text("héllo".into()), 2);
        match result {
            NormalizedToolResult::Ok { payload, warnings } => {
                assert_eq!(payload, ToolPayload::Text("h".into()));
                assert_eq!(warnings.len(), 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_json_fails() {
        let result = bound_output(ToolPayload::Json(serde_json::json!({"k": "0123456789"})), 5);
        assert_eq!(result.failure().map(|f| f.kind), Some(ToolErrorKind::OutputTooLarge));
    }

    #[test]
    fn test_small_payload_untouched() {
        let result = bound_output(ToolPayload::Bytes(vec![1, 2]), 5);
        assert_eq!(result, NormalizedToolResult::ok(ToolPayload::Bytes(vec![1, 2])));
    }
}
