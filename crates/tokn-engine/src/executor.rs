use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use tokn_core::config::AppConfig;
use tokn_core::error::{Result, ToknError};
use tokn_core::event::EventBus;
use tokn_core::graph::{FlowGraph, NodeId, NodeStatus, OptimizerAlgorithm, Port, ToolNode};
use tokn_core::traits::CredentialStore;
use tokn_core::types::{ProviderKind, RunEvent, RunOutcome};
use tokn_llm::{create_adapter, LlmTransport, ModelSettings, ProviderAdapter};
use tokn_tools::ToolBridge;

use crate::optimizer::{HttpOptimizerBackend, OptimizerBackend};
use crate::tool_loop::{run_model_node, ModelRun};
use crate::validate::{executable_models, optimizer_context, validate_graph, ValidationIssue};

/// Result of executing a single node.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node: NodeId,
    pub status: NodeStatus,
    /// Streamed text for a model node, the optimized prompt for an optimizer.
    pub output: String,
    pub error: Option<String>,
    pub iterations: usize,
    pub tool_invocations: usize,
    /// Score reported by an optimizer, when it gave one.
    pub score: Option<f64>,
    pub elapsed_ms: u64,
}

impl NodeResult {
    fn new(node: NodeId, status: NodeStatus, started: Instant) -> Self {
        Self {
            node,
            status,
            output: String::new(),
            error: None,
            iterations: 0,
            tool_invocations: 0,
            score: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Result of executing a whole flow.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    /// Per-node results in execution order.
    pub node_results: Vec<NodeResult>,
    /// Non-empty only when the run was rejected before execution.
    pub validation_errors: Vec<ValidationIssue>,
    pub total_elapsed_ms: u64,
}

impl RunReport {
    pub fn result(&self, node: NodeId) -> Option<&NodeResult> {
        self.node_results.iter().find(|r| r.node == node)
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

enum Step {
    Continue,
    Cancelled,
}

/// Executes a flow graph.
///
/// Model nodes with a wired prompt run one at a time in discovery order.
/// A failing node is marked and the run moves on; cancellation stops the
/// run at once and puts the in-flight node back to idle. Optimizers fed by
/// a model's output run right after that model succeeds.
pub struct FlowExecutor {
    config: AppConfig,
    transport: Arc<dyn LlmTransport>,
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
    bridge: Arc<ToolBridge>,
    credentials: Arc<dyn CredentialStore>,
    optimizers: HashMap<OptimizerAlgorithm, Arc<dyn OptimizerBackend>>,
    event_bus: Arc<EventBus>,
}

impl FlowExecutor {
    pub fn new(
        config: AppConfig,
        transport: Arc<dyn LlmTransport>,
        credentials: Arc<dyn CredentialStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>> = ProviderKind::ALL
            .into_iter()
            .map(|p| (p, Arc::<dyn ProviderAdapter>::from(create_adapter(p))))
            .collect();
        let bridge = Arc::new(ToolBridge::new(config.tools.clone()));
        Self {
            config,
            transport,
            adapters,
            bridge,
            credentials,
            optimizers: HashMap::new(),
            event_bus,
        }
    }

    /// Replace the adapter used for `adapter.provider()`.
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    pub fn with_optimizer(
        mut self,
        algorithm: OptimizerAlgorithm,
        backend: Arc<dyn OptimizerBackend>,
    ) -> Self {
        self.optimizers.insert(algorithm, backend);
        self
    }

    /// Register the HTTP optimization service for both algorithms, if configured.
    pub fn with_configured_optimizers(self) -> Self {
        let Some(cfg) = self.config.optimizer.clone() else {
            return self;
        };
        let backend: Arc<dyn OptimizerBackend> = Arc::new(HttpOptimizerBackend::new(&cfg));
        self.with_optimizer(OptimizerAlgorithm::Dspy, backend.clone())
            .with_optimizer(OptimizerAlgorithm::Gepa, backend)
    }

    pub fn bridge(&self) -> &Arc<ToolBridge> {
        &self.bridge
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Check every run precondition without touching the network.
    pub fn validate(&self, graph: &FlowGraph) -> Vec<ValidationIssue> {
        validate_graph(graph, self.credentials.as_ref(), &self.optimizers)
    }

    fn set_status(&self, graph: &mut FlowGraph, node: NodeId, status: NodeStatus) {
        graph.set_status(node, status);
        self.event_bus.publish(RunEvent::NodeStatus { node, status });
    }

    /// Validate, then execute every eligible node of `graph`.
    pub async fn run(&self, graph: &mut FlowGraph, cancel: CancellationToken) -> RunReport {
        let start = Instant::now();
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        graph.reset_statuses();
        self.event_bus.publish(RunEvent::RunStarted { run_id });
        info!(%run_id, nodes = graph.node_count(), "Flow run started");

        let issues = self.validate(graph);
        if !issues.is_empty() {
            for issue in &issues {
                warn!(node_id = %issue.node, error = %issue.message, "Validation failed");
                self.set_status(graph, issue.node, NodeStatus::Error);
                self.event_bus.publish(RunEvent::NodeError {
                    node: issue.node,
                    message: issue.message.clone(),
                });
            }
            return self.finish(run_id, started_at, RunOutcome::Failed, Vec::new(), issues, start);
        }

        let mut results = Vec::new();
        let mut failed = false;
        let mut outcome = RunOutcome::Completed;

        for model_id in executable_models(graph) {
            if cancel.is_cancelled() {
                outcome = RunOutcome::Cancelled;
                break;
            }

            let result = self.execute_model(graph, model_id, &cancel).await;
            let succeeded = result.status == NodeStatus::Success;
            let cancelled = result.status == NodeStatus::Idle;
            failed |= result.status == NodeStatus::Error;
            let output = result.output.clone();
            results.push(result);
            if cancelled {
                outcome = RunOutcome::Cancelled;
                break;
            }
            if !succeeded {
                continue;
            }

            match self
                .run_optimizers(graph, model_id, output, &cancel, &mut results, &mut failed)
                .await
            {
                Step::Continue => {}
                Step::Cancelled => {
                    outcome = RunOutcome::Cancelled;
                    break;
                }
            }
        }

        if outcome == RunOutcome::Completed && failed {
            outcome = RunOutcome::Failed;
        }
        self.finish(run_id, started_at, outcome, results, Vec::new(), start)
    }

    fn finish(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        outcome: RunOutcome,
        node_results: Vec<NodeResult>,
        validation_errors: Vec<ValidationIssue>,
        start: Instant,
    ) -> RunReport {
        let total_elapsed_ms = start.elapsed().as_millis() as u64;
        info!(%run_id, ?outcome, total_elapsed_ms, "Flow run finished");
        self.event_bus
            .publish(RunEvent::RunFinished { run_id, outcome });
        RunReport {
            run_id,
            started_at,
            outcome,
            node_results,
            validation_errors,
            total_elapsed_ms,
        }
    }

    async fn execute_model(
        &self,
        graph: &mut FlowGraph,
        node: NodeId,
        cancel: &CancellationToken,
    ) -> NodeResult {
        let started = Instant::now();
        self.set_status(graph, node, NodeStatus::Running);

        let outcome = match self.model_inputs(graph, node) {
            Ok(inputs) => {
                let run = ModelRun {
                    node,
                    prompt: inputs.prompt,
                    tools: inputs.tools,
                    settings: inputs.settings,
                    adapter: inputs.adapter.as_ref(),
                    transport: self.transport.as_ref(),
                    bridge: &self.bridge,
                    event_bus: &self.event_bus,
                    max_iterations: self.config.engine.max_iterations,
                };
                run_model_node(run, cancel).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(done) => {
                info!(
                    node_id = %node,
                    iterations = done.iterations,
                    tools = done.tool_invocations,
                    capped = done.capped,
                    "Model node succeeded"
                );
                self.set_status(graph, node, NodeStatus::Success);
                let mut result = NodeResult::new(node, NodeStatus::Success, started);
                result.output = done.output;
                result.iterations = done.iterations;
                result.tool_invocations = done.tool_invocations;
                result
            }
            Err(ToknError::Cancelled) => {
                info!(node_id = %node, "Model node cancelled");
                self.set_status(graph, node, NodeStatus::Idle);
                NodeResult::new(node, NodeStatus::Idle, started)
            }
            Err(e) => {
                let message = e.to_string();
                error!(node_id = %node, error = %message, "Model node failed");
                self.fail(graph, node, &message);
                let mut result = NodeResult::new(node, NodeStatus::Error, started);
                result.error = Some(message);
                result
            }
        }
    }

    fn fail(&self, graph: &mut FlowGraph, node: NodeId, message: &str) {
        self.set_status(graph, node, NodeStatus::Error);
        self.event_bus.publish(RunEvent::NodeError {
            node,
            message: message.to_string(),
        });
    }

    /// Snapshot what a model node needs so the graph can change while it runs.
    fn model_inputs(&self, graph: &FlowGraph, node: NodeId) -> Result<ModelInputs> {
        let invalid = |message: &str| ToknError::Validation {
            node,
            message: message.to_string(),
        };
        let model = graph
            .node(node)
            .and_then(|n| n.data.as_model())
            .ok_or_else(|| invalid("not a model node"))?;
        let prompt = graph
            .prompt_for(node)
            .and_then(|p| p.combined())
            .ok_or_else(|| invalid("prompt is empty"))?;
        let tools = graph
            .tools_for(node)
            .into_iter()
            .map(|(_, t)| t.clone())
            .collect();
        let adapter = self
            .adapters
            .get(&model.provider)
            .cloned()
            .ok_or_else(|| ToknError::UnsupportedProvider(model.provider.to_string()))?;

        let mut settings =
            ModelSettings::from_node(model, self.credentials.api_key(model.provider));
        if settings.base_url.is_none() {
            settings.base_url = self.config.base_url(model.provider);
        }

        Ok(ModelInputs {
            prompt,
            tools,
            settings,
            adapter,
        })
    }

    /// Run the optimizers fed by a model node that just succeeded.
    async fn run_optimizers(
        &self,
        graph: &mut FlowGraph,
        model: NodeId,
        model_output: String,
        cancel: &CancellationToken,
        results: &mut Vec<NodeResult>,
        failed: &mut bool,
    ) -> Step {
        let targets: Vec<NodeId> = graph
            .find_downstream(model, Port::Output)
            .into_iter()
            .map(|e| e.target)
            .collect();

        for node in targets {
            if cancel.is_cancelled() {
                return Step::Cancelled;
            }
            let started = Instant::now();
            let Some(mut ctx) = optimizer_context(graph, node, self.credentials.as_ref()) else {
                continue;
            };
            ctx.model_output = Some(model_output.clone());
            let Some(backend) = self.optimizers.get(&ctx.optimizer.algorithm).cloned() else {
                continue;
            };

            self.set_status(graph, node, NodeStatus::Running);
            let events = self.event_bus.clone();
            let progress = move |message: &str| {
                events.publish(RunEvent::OptimizerProgress {
                    node,
                    message: message.to_string(),
                });
            };

            match backend.execute(&ctx, &progress, cancel.clone()).await {
                Ok(outcome) => {
                    info!(node_id = %node, score = ?outcome.score, "Optimizer node succeeded");
                    self.set_status(graph, node, NodeStatus::Success);
                    let mut result = NodeResult::new(node, NodeStatus::Success, started);
                    result.output = outcome.optimized_prompt;
                    result.score = outcome.score;
                    results.push(result);
                }
                Err(ToknError::Cancelled) => {
                    self.set_status(graph, node, NodeStatus::Idle);
                    results.push(NodeResult::new(node, NodeStatus::Idle, started));
                    return Step::Cancelled;
                }
                Err(e) => {
                    let message = e.to_string();
                    error!(node_id = %node, error = %message, "Optimizer node failed");
                    self.fail(graph, node, &message);
                    let mut result = NodeResult::new(node, NodeStatus::Error, started);
                    result.error = Some(message);
                    results.push(result);
                    *failed = true;
                }
            }
        }
        Step::Continue
    }
}

struct ModelInputs {
    prompt: String,
    tools: Vec<ToolNode>,
    settings: ModelSettings,
    adapter: Arc<dyn ProviderAdapter>,
}
