use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tokn_core::error::{Result, ToknError};
use tokn_core::event::EventBus;
use tokn_core::graph::{NodeId, ToolNode};
use tokn_core::types::{NormalizedToolResult, RunEvent, ToolCall, ToolErrorKind, ToolFailure};
use tokn_llm::{LlmTransport, ModelSettings, ProviderAdapter, SessionState, StreamState, ToolSpec};
use tokn_tools::ToolBridge;

/// Inputs for one model node's run.
pub(crate) struct ModelRun<'a> {
    pub node: NodeId,
    pub prompt: String,
    pub tools: Vec<ToolNode>,
    pub settings: ModelSettings,
    pub adapter: &'a dyn ProviderAdapter,
    pub transport: &'a dyn LlmTransport,
    pub bridge: &'a ToolBridge,
    pub event_bus: &'a EventBus,
    pub max_iterations: usize,
}

/// What a finished model node produced.
#[derive(Debug, Clone, Default)]
pub struct ModelOutcome {
    /// All text streamed across iterations.
    pub output: String,
    pub iterations: usize,
    pub tool_invocations: usize,
    /// True when the loop stopped at the iteration cap with tool calls pending.
    pub capped: bool,
}

/// Stream one model node to completion, running the tools it asks for.
///
/// Each iteration sends the conversation so far, folds the response through
/// the adapter and, if tool calls came back, executes them in order and
/// feeds the results into the next iteration. Text deltas are published as
/// they are parsed. The first failing tool call fails the node.
pub(crate) async fn run_model_node(
    run: ModelRun<'_>,
    cancel: &CancellationToken,
) -> Result<ModelOutcome> {
    let specs: Vec<ToolSpec> = run.tools.iter().map(ToolSpec::from).collect();
    let mut session = SessionState::new();
    let mut outcome = ModelOutcome::default();

    for iteration in 1..=run.max_iterations {
        if cancel.is_cancelled() {
            return Err(ToknError::Cancelled);
        }
        debug!(node_id = %run.node, provider = %run.adapter.provider(), iteration, "Starting model iteration");

        let request =
            run.adapter
                .prepare_request(&run.prompt, &specs, &run.settings, &mut session)?;
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ToknError::Cancelled),
            result = run.transport.open(request) => result?,
        };

        let mut state = StreamState::new();
        let mut text = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ToknError::Cancelled),
                next = stream.next() => next,
            };
            let Some(fragment) = next else { break };
            let fragment = fragment?;

            let (next_state, event) = run.adapter.parse_chunk(state, &fragment);
            state = next_state;
            if let Some(message) = event.provider_error {
                return Err(ToknError::ProviderStream(format!(
                    "{}: {}",
                    run.adapter.provider(),
                    message
                )));
            }
            if let Some(delta) = event.text_delta {
                run.event_bus.publish(RunEvent::TextDelta {
                    node: run.node,
                    text: delta.clone(),
                });
                text.push_str(&delta);
            }
            if let Some(found) = event.tool_calls {
                calls.extend(found);
            }
        }

        // Streams that end without a terminal signal still flush their calls.
        let (_, tail) = run.adapter.finish_stream(state);
        if let Some(found) = tail.tool_calls {
            calls.extend(found);
        }

        outcome.output.push_str(&text);
        outcome.iterations = iteration;
        run.adapter
            .record_assistant_turn(&mut session, &text, &calls);
        run.event_bus.publish(RunEvent::IterationComplete {
            node: run.node,
            iteration,
        });

        if calls.is_empty() {
            return Ok(outcome);
        }
        // Ollama calls are pulled out of free text, so a reply that merely
        // looks like a call is not treated as a request for a missing tool.
        if specs.is_empty() {
            warn!(node_id = %run.node, count = calls.len(), "Model requested tools but none are registered");
            return Ok(outcome);
        }
        if iteration == run.max_iterations {
            warn!(node_id = %run.node, cap = run.max_iterations, "Iteration cap reached with tool calls pending");
            run.event_bus.publish(RunEvent::IterationCapReached {
                node: run.node,
                cap: run.max_iterations,
            });
            outcome.capped = true;
            return Ok(outcome);
        }

        for call in &calls {
            let tool = run
                .tools
                .iter()
                .find(|t| t.name == call.name)
                .ok_or_else(|| ToknError::ToolNotFound(call.name.clone()))?;

            run.event_bus.publish(RunEvent::ToolStart {
                node: run.node,
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
            let result = run.bridge.invoke(tool, &call.arguments, cancel).await;
            outcome.tool_invocations += 1;
            run.event_bus.publish(RunEvent::ToolEnd {
                node: run.node,
                name: call.name.clone(),
                result: result.clone(),
            });

            if let Some(failure) = result.failure() {
                return Err(tool_error(run.bridge, tool, failure));
            }
            if let NormalizedToolResult::Ok { warnings, .. } = &result {
                for w in warnings {
                    warn!(tool = %call.name, warning = %w, "Tool result warning");
                }
            }
            info!(node_id = %run.node, tool = %call.name, "Tool call completed");
            run.adapter
                .continue_with_tool_result(&mut session, call, &result);
        }
    }

    Ok(outcome)
}

fn tool_error(bridge: &ToolBridge, tool: &ToolNode, failure: &ToolFailure) -> ToknError {
    match failure.kind {
        ToolErrorKind::Cancelled => ToknError::Cancelled,
        ToolErrorKind::Timeout => ToknError::ToolTimeout {
            tool: tool.name.clone(),
            timeout_ms: bridge.limits_for(tool).timeout.as_millis() as u64,
        },
        ToolErrorKind::InvalidArguments => ToknError::ToolValidation {
            tool: tool.name.clone(),
            message: failure.message.clone(),
        },
        kind => ToknError::ToolExecution {
            tool: tool.name.clone(),
            message: format!("{}: {}", kind, failure.message),
        },
    }
}
