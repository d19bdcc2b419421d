//! Prompt-optimizer node kinds.
//!
//! The engine treats optimizers as black boxes: it validates them through
//! [`OptimizerBackend::validate`] and, once the upstream model node has
//! succeeded, hands them a context, a progress callback and the run's
//! cancellation token.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tokn_core::config::OptimizerConfig;
use tokn_core::error::{Result, ToknError};
use tokn_core::graph::{ModelNode, NodeId, OptimizerAlgorithm, OptimizerNode};

/// Everything an optimizer may read about its place in the graph.
#[derive(Clone)]
pub struct OptimizerContext {
    pub node: NodeId,
    pub optimizer: OptimizerNode,
    /// The model node feeding this optimizer.
    pub model: Option<ModelNode>,
    /// Combined prompt feeding that model.
    pub prompt: Option<String>,
    /// Output of the upstream model's run; empty during validation.
    pub model_output: Option<String>,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for OptimizerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizerContext")
            .field("node", &self.node)
            .field("optimizer", &self.optimizer)
            .field("model", &self.model)
            .field("prompt", &self.prompt)
            .field("model_output", &self.model_output)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerOutcome {
    pub optimized_prompt: String,
    pub score: Option<f64>,
    pub metrics: Value,
}

/// Progress sink handed to a running optimizer.
pub type Progress<'a> = &'a (dyn Fn(&str) + Send + Sync);

pub trait OptimizerBackend: Send + Sync {
    /// Preconditions, one message per violation.
    fn validate(&self, ctx: &OptimizerContext) -> Vec<String>;

    fn execute<'a>(
        &'a self,
        ctx: &'a OptimizerContext,
        progress: Progress<'a>,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<OptimizerOutcome>>;
}

/// Client for the prompt-optimization service (`/optimize/dspy`, `/optimize/gepa`).
pub struct HttpOptimizerBackend {
    http: Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptimizeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    optimized_prompt: Option<String>,
    #[serde(default)]
    metrics: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    logs: Vec<String>,
}

impl HttpOptimizerBackend {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// `GET {base}/health`.
    pub async fn health(&self) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ToknError::ProviderRequest(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| ToknError::ProviderRequest(e.to_string()))
    }
}

/// Endpoint path and JSON body for an optimization request.
pub fn build_request(ctx: &OptimizerContext) -> Result<(&'static str, Value)> {
    let fail = |message: &str| ToknError::Optimizer {
        node: ctx.node,
        message: message.to_string(),
    };
    let model = ctx.model.as_ref().ok_or_else(|| fail("no upstream model node"))?;
    let model_id = model.model_id().ok_or_else(|| fail("upstream model has no model selected"))?;
    let prompt = ctx.prompt.as_deref().ok_or_else(|| fail("upstream model has no prompt"))?;
    let api_key = ctx.api_key.clone().unwrap_or_default();

    let examples: Vec<Value> = ctx
        .optimizer
        .examples
        .iter()
        .map(|e| json!({ "input": e.input, "expected_output": e.expected_output }))
        .collect();
    let config = if ctx.optimizer.config.is_null() {
        json!({})
    } else {
        ctx.optimizer.config.clone()
    };

    let mut target = json!({
        "provider": model.provider.id(),
        "model": model_id,
        "apiKey": api_key,
    });
    if let Some(base) = &model.base_url {
        target["apiBase"] = json!(base);
    }

    Ok(match ctx.optimizer.algorithm {
        OptimizerAlgorithm::Dspy => {
            let mut body = target;
            body["prompt"] = json!(prompt);
            body["examples"] = json!(examples);
            body["config"] = config;
            ("/optimize/dspy", body)
        }
        OptimizerAlgorithm::Gepa => (
            "/optimize/gepa",
            json!({
                "prompt": prompt,
                "examples": examples,
                "providers": [target],
                "config": config,
            }),
        ),
    })
}

/// First score the service reported, in order of preference.
pub fn extract_score(metrics: &Value) -> Option<f64> {
    ["final_score", "validation_score", "score"]
        .iter()
        .find_map(|k| metrics.get(*k).and_then(Value::as_f64))
}

/// Parse a service reply. The service's own progress log comes back alongside.
fn interpret(node: NodeId, status: u16, body: &str) -> Result<(OptimizerOutcome, Vec<String>)> {
    let parsed: OptimizeResponse = serde_json::from_str(body).map_err(|e| ToknError::Optimizer {
        node,
        message: format!("HTTP {}: unreadable response: {}", status, e),
    })?;
    if !parsed.success {
        let code = parsed.code.unwrap_or_else(|| "OPTIMIZATION_FAILED".to_string());
        let error = parsed.error.unwrap_or_else(|| "optimization failed".to_string());
        return Err(ToknError::Optimizer {
            node,
            message: format!("{}: {}", code, error),
        });
    }
    let metrics = parsed.metrics.unwrap_or(Value::Null);
    let outcome = OptimizerOutcome {
        optimized_prompt: parsed.optimized_prompt.unwrap_or_default(),
        score: extract_score(&metrics),
        metrics,
    };
    Ok((outcome, parsed.logs))
}

impl OptimizerBackend for HttpOptimizerBackend {
    fn validate(&self, ctx: &OptimizerContext) -> Vec<String> {
        let mut errors = Vec::new();
        if ctx.optimizer.examples.is_empty() {
            errors.push("at least one training example is required".to_string());
        }
        match &ctx.model {
            None => errors.push("optimizer input must come from a model node".to_string()),
            Some(model) => {
                if model.model_id().is_none() {
                    errors.push("upstream model has no model selected".to_string());
                }
                if model.provider.requires_api_key() && ctx.api_key.is_none() {
                    errors.push(format!("no API key configured for {}", model.provider));
                }
            }
        }
        if ctx.prompt.is_none() {
            errors.push("upstream model has no prompt".to_string());
        }
        errors
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a OptimizerContext,
        progress: Progress<'a>,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<OptimizerOutcome>> {
        Box::pin(async move {
            let (path, body) = build_request(ctx)?;
            let url = format!("{}{}", self.base_url, path);
            info!(node_id = %ctx.node, algorithm = %ctx.optimizer.algorithm, "Submitting optimization");
            progress(&format!("Submitting to {} optimizer", ctx.optimizer.algorithm));

            let send = self.http.post(&url).json(&body).timeout(self.timeout).send();
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ToknError::Cancelled),
                r = send => r.map_err(|e| ToknError::Optimizer {
                    node: ctx.node,
                    message: e.to_string(),
                })?,
            };

            let status = response.status().as_u16();
            let text = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ToknError::Cancelled),
                t = response.text() => t.map_err(|e| ToknError::Optimizer {
                    node: ctx.node,
                    message: e.to_string(),
                })?,
            };
            debug!(node_id = %ctx.node, status, "Optimizer responded");

            let (outcome, logs) = interpret(ctx.node, status, &text)?;
            for line in &logs {
                debug!(node_id = %ctx.node, "{}", line);
                progress(line);
            }
            progress("Optimization finished");
            Ok(outcome)
        })
    }
}
