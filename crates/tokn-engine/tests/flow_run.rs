use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;

use tokn_core::config::AppConfig;
use tokn_core::event::EventBus;
use tokn_core::graph::{ModelNode, NodeData, NodeStatus, Port, PromptNode, ToolNode};
use tokn_core::types::{ProviderKind, RunEvent, RunOutcome, ToolErrorKind};
use tokn_engine::FlowExecutor;
use tokn_llm::LlmTransport;
use tokn_test_utils::flows::{attach_tool, fetch_url_tool, prompt_model};
use tokn_test_utils::{config_from, fixtures, ScriptedTransport, StaticCredentials};

fn all_keys() -> StaticCredentials {
    ProviderKind::ALL
        .into_iter()
        .fold(StaticCredentials::new(), |c, p| c.with_key(p, "test-key"))
}

fn executor(config: AppConfig, transport: &Arc<ScriptedTransport>) -> FlowExecutor {
    let transport: Arc<dyn LlmTransport> = transport.clone();
    FlowExecutor::new(
        config,
        transport,
        Arc::new(all_keys()),
        Arc::new(EventBus::default()),
    )
}

fn drain(rx: &mut Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_plain_answer_needs_no_tools() {
    let transport = Arc::new(
        ScriptedTransport::new().push(fixtures::text_response(ProviderKind::OpenAi, "4")),
    );
    let executor = executor(AppConfig::default(), &transport);
    let mut flow = prompt_model(ProviderKind::OpenAi, "Add 1", "2+2?");

    let report = executor.run(&mut flow.graph, CancellationToken::new()).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    let result = report.result(flow.model).expect("model result");
    assert_eq!(result.output, "4");
    assert_eq!(result.iterations, 1);
    assert_eq!(flow.graph.status(flow.model), Some(NodeStatus::Success));
    assert_eq!(executor.bridge().workers_launched(), 0);
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn test_tool_round_trip_for_every_provider() {
    for provider in ProviderKind::ALL {
        let transport = Arc::new(
            ScriptedTransport::new()
                .push(fixtures::tool_call_response(
                    provider,
                    "call_1",
                    "fetch_url",
                    &json!({"url": "https://example.com"}),
                ))
                .push(fixtures::text_response(provider, "It is an example page.")),
        );
        let executor = executor(AppConfig::default(), &transport);
        let mut rx = executor.event_bus().subscribe();
        let mut flow = prompt_model(provider, "", "Summarize https://example.com");
        attach_tool(&mut flow.graph, flow.model, fetch_url_tool());

        let report = executor.run(&mut flow.graph, CancellationToken::new()).await;

        assert_eq!(report.outcome, RunOutcome::Completed, "{provider}");
        let result = report.result(flow.model).expect("model result");
        assert_eq!(result.tool_invocations, 1, "{provider}");
        assert_eq!(result.iterations, 2, "{provider}");
        assert!(result.output.ends_with("It is an example page."), "{provider}");
        assert_eq!(executor.bridge().workers_launched(), 1, "{provider}");

        let requests = transport.requests();
        assert_eq!(requests.len(), 2, "{provider}");
        assert!(
            requests[1].body.to_string().contains("<html>https://example.com</html>"),
            "{provider}: tool result missing from follow-up request"
        );

        let ends: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::ToolEnd { name, result, .. } => Some((name, result)),
                _ => None,
            })
            .collect();
        assert_eq!(ends.len(), 1, "{provider}");
        assert_eq!(ends[0].0, "fetch_url");
        assert_eq!(ends[0].1.content_text(), "<html>https://example.com</html>");
    }
}

#[tokio::test]
async fn test_tool_timeout_fails_node() {
    let transport = Arc::new(ScriptedTransport::new().push(fixtures::tool_call_response(
        ProviderKind::OpenAi,
        "call_1",
        "spin",
        &json!({}),
    )));
    let executor = executor(AppConfig::default(), &transport);
    let mut flow = prompt_model(ProviderKind::OpenAi, "", "Spin");
    attach_tool(
        &mut flow.graph,
        flow.model,
        ToolNode::new("spin", "Never returns", json!({"type": "object"}), "while (true) {}")
            .with_timeout_ms(200),
    );

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        executor.run(&mut flow.graph, CancellationToken::new()),
    )
    .await
    .expect("run finished");

    assert_eq!(report.outcome, RunOutcome::Failed);
    let result = report.result(flow.model).expect("model result");
    assert_eq!(result.status, NodeStatus::Error);
    assert!(result.error.as_deref().unwrap_or_default().contains("TIMEOUT"));
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn test_unregistered_tool_name_fails_node() {
    let transport = Arc::new(ScriptedTransport::new().push(fixtures::tool_call_response(
        ProviderKind::Anthropic,
        "call_1",
        "nope",
        &json!({}),
    )));
    let executor = executor(AppConfig::default(), &transport);
    let mut flow = prompt_model(ProviderKind::Anthropic, "", "Use a tool");
    attach_tool(&mut flow.graph, flow.model, fetch_url_tool());

    let report = executor.run(&mut flow.graph, CancellationToken::new()).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    let result = report.result(flow.model).expect("model result");
    assert_eq!(result.status, NodeStatus::Error);
    assert_eq!(result.error.as_deref(), Some("Tool not found: nope"));
    assert_eq!(flow.graph.status(flow.model), Some(NodeStatus::Error));
    assert_eq!(executor.bridge().workers_launched(), 0);
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test]
async fn test_cancel_during_tool_call_leaves_node_idle() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .push(fixtures::tool_call_response(
                ProviderKind::OpenAi,
                "call_1",
                "spin",
                &json!({}),
            ))
            .push(fixtures::text_response(ProviderKind::OpenAi, "never sent")),
    );
    let executor = executor(AppConfig::default(), &transport);
    let mut flow = prompt_model(ProviderKind::OpenAi, "", "Spin");
    attach_tool(
        &mut flow.graph,
        flow.model,
        ToolNode::new(
            "spin",
            "Never returns",
            json!({"type": "object"}),
            "await Promise.resolve(0); while (true) {}",
        ),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut all = executor.event_bus().subscribe();
    let mut watch = executor.event_bus().subscribe();
    let watcher = async move {
        while let Ok(event) = watch.recv().await {
            if matches!(event, RunEvent::ToolStart { .. }) {
                tokio::time::sleep(Duration::from_millis(100)).await;
                trigger.cancel();
                break;
            }
        }
    };

    let started = Instant::now();
    let (report, _) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(executor.run(&mut flow.graph, cancel), watcher) },
    )
    .await
    .expect("cancellation ends the run");

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(flow.graph.status(flow.model), Some(NodeStatus::Idle));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(transport.request_count(), 1);
    assert_eq!(executor.bridge().workers_launched(), 1);
    let ends: Vec<_> = drain(&mut all)
        .into_iter()
        .filter_map(|e| match e {
            RunEvent::ToolEnd { result, .. } => result.failure().map(|f| f.kind),
            _ => None,
        })
        .collect();
    assert_eq!(ends, vec![ToolErrorKind::Cancelled]);

    // The interrupted worker unwinds on its own thread; the bridge stays usable.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let after = executor
        .bridge()
        .invoke(
            &fetch_url_tool(),
            &json!({"url": "https://example.com"}),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(after.content_text(), "<html>https://example.com</html>");
}

#[tokio::test]
async fn test_iteration_cap_bounds_requests() {
    for provider in ProviderKind::ALL {
        let transport = Arc::new(
            ScriptedTransport::new()
                .push(fixtures::tool_call_response(
                    provider,
                    "call_1",
                    "fetch_url",
                    &json!({"url": "https://example.com/again"}),
                ))
                .repeating(),
        );
        let executor = executor(config_from("[engine]\nmax_iterations = 3\n"), &transport);
        let mut rx = executor.event_bus().subscribe();
        let mut flow = prompt_model(provider, "", "Keep fetching");
        attach_tool(&mut flow.graph, flow.model, fetch_url_tool());

        let report = executor.run(&mut flow.graph, CancellationToken::new()).await;

        assert_eq!(transport.request_count(), 3, "{provider}");
        let result = report.result(flow.model).expect("model result");
        assert_eq!(result.iterations, 3, "{provider}");
        assert_eq!(result.tool_invocations, 2, "{provider}");
        assert_eq!(result.status, NodeStatus::Success, "{provider}");
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, RunEvent::IterationCapReached { cap: 3, .. })));
    }
}

#[tokio::test]
async fn test_default_cap_is_ten() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .push(fixtures::tool_call_response(
                ProviderKind::Anthropic,
                "toolu_1",
                "fetch_url",
                &json!({"url": "https://example.com"}),
            ))
            .repeating(),
    );
    let executor = executor(AppConfig::default(), &transport);
    let mut flow = prompt_model(ProviderKind::Anthropic, "", "Loop");
    attach_tool(&mut flow.graph, flow.model, fetch_url_tool());

    executor.run(&mut flow.graph, CancellationToken::new()).await;

    assert_eq!(transport.request_count(), 10);
}

#[tokio::test]
async fn test_cancel_mid_stream_stops_deltas() {
    let first_part: Vec<_> = fixtures::text_response(ProviderKind::OpenAi, "Hel")
        .into_iter()
        .take(2)
        .collect();
    let transport = Arc::new(
        ScriptedTransport::new()
            .push_hanging(first_part)
            .push(fixtures::text_response(ProviderKind::OpenAi, "never sent")),
    );
    let executor = executor(AppConfig::default(), &transport);
    let mut flow = prompt_model(ProviderKind::OpenAi, "", "Say hello");
    let second_prompt = flow
        .graph
        .add_node("p2", NodeData::Prompt(PromptNode::new("", "Second")));
    let second_model = flow.graph.add_node(
        "m2",
        NodeData::Model(ModelNode::new(ProviderKind::OpenAi, "gpt-4o-mini")),
    );
    flow.graph
        .create_edge(second_prompt, Port::Prompt, second_model, Port::Prompt)
        .expect("edge");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut all = executor.event_bus().subscribe();
    let mut watch = executor.event_bus().subscribe();
    let watcher = async move {
        while let Ok(event) = watch.recv().await {
            if matches!(event, RunEvent::TextDelta { .. }) {
                trigger.cancel();
                break;
            }
        }
    };

    let (report, _) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(executor.run(&mut flow.graph, cancel), watcher) },
    )
    .await
    .expect("cancellation ends the run");

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(flow.graph.status(flow.model), Some(NodeStatus::Idle));
    assert_eq!(flow.graph.status(second_model), Some(NodeStatus::Idle));
    assert_eq!(transport.request_count(), 1);

    let events = drain(&mut all);
    let deltas: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TextDelta { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Hel"]);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::RunFinished {
            outcome: RunOutcome::Cancelled,
            ..
        }
    )));
}

#[tokio::test]
async fn test_invalid_arguments_launch_no_worker() {
    let transport = Arc::new(ScriptedTransport::new().push(fixtures::tool_call_response(
        ProviderKind::Cohere,
        "call_1",
        "fetch_url",
        &json!({}),
    )));
    let executor = executor(AppConfig::default(), &transport);
    let mut flow = prompt_model(ProviderKind::Cohere, "", "Fetch something");
    attach_tool(&mut flow.graph, flow.model, fetch_url_tool());

    let report = executor.run(&mut flow.graph, CancellationToken::new()).await;

    assert_eq!(executor.bridge().workers_launched(), 0);
    let result = report.result(flow.model).expect("model result");
    assert_eq!(result.status, NodeStatus::Error);
    let error = result.error.as_deref().unwrap_or_default();
    assert!(error.contains("fetch_url"));
    assert!(error.contains("url"));
}

#[tokio::test]
async fn test_validation_failure_sends_nothing() {
    let transport = Arc::new(
        ScriptedTransport::new().push(fixtures::text_response(ProviderKind::OpenAi, "4")),
    );
    let transport_dyn: Arc<dyn LlmTransport> = transport.clone();
    let executor = FlowExecutor::new(
        AppConfig::default(),
        transport_dyn,
        Arc::new(StaticCredentials::new()),
        Arc::new(EventBus::default()),
    );
    let mut flow = prompt_model(ProviderKind::OpenAi, "", "2+2?");
    attach_tool(
        &mut flow.graph,
        flow.model,
        ToolNode::new("bad name", "", json!({"type": "object"}), "return 1;"),
    );

    let report = executor.run(&mut flow.graph, CancellationToken::new()).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.validation_errors.len(), 2);
    assert!(report.node_results.is_empty());
    assert_eq!(transport.request_count(), 0);
    assert_eq!(flow.graph.status(flow.model), Some(NodeStatus::Error));
}

#[tokio::test]
async fn test_failed_node_does_not_stop_others() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .push(fixtures::error_response(ProviderKind::OpenAi, "model overloaded"))
            .push(fixtures::text_response(ProviderKind::OpenAi, "fine")),
    );
    let executor = executor(AppConfig::default(), &transport);
    let mut flow = prompt_model(ProviderKind::OpenAi, "", "First");
    let p2 = flow
        .graph
        .add_node("p2", NodeData::Prompt(PromptNode::new("", "Second")));
    let m2 = flow.graph.add_node(
        "m2",
        NodeData::Model(ModelNode::new(ProviderKind::OpenAi, "gpt-4o-mini")),
    );
    flow.graph
        .create_edge(p2, Port::Prompt, m2, Port::Prompt)
        .expect("edge");

    let report = executor.run(&mut flow.graph, CancellationToken::new()).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    let first = report.result(flow.model).expect("first result");
    assert_eq!(first.status, NodeStatus::Error);
    assert!(first.error.as_deref().unwrap_or_default().contains("model overloaded"));
    let second = report.result(m2).expect("second result");
    assert_eq!(second.status, NodeStatus::Success);
    assert_eq!(second.output, "fine");
}

#[tokio::test]
async fn test_transport_failure_marks_node_error() {
    let transport = Arc::new(ScriptedTransport::new().push_error("HTTP 401: invalid key"));
    let executor = executor(AppConfig::default(), &transport);
    let mut flow = prompt_model(ProviderKind::Gemini, "", "Hi");

    let report = executor.run(&mut flow.graph, CancellationToken::new()).await;

    assert_eq!(flow.graph.status(flow.model), Some(NodeStatus::Error));
    let error = report.result(flow.model).and_then(|r| r.error.clone());
    assert!(error.unwrap_or_default().contains("401"));
}

#[tokio::test]
async fn test_model_without_prompt_is_skipped() {
    let transport = Arc::new(ScriptedTransport::new());
    let executor = executor(AppConfig::default(), &transport);
    let mut graph = tokn_core::graph::FlowGraph::new();
    let lonely = graph.add_node(
        "m",
        NodeData::Model(ModelNode::new(ProviderKind::OpenAi, "gpt-4o-mini")),
    );

    let report = executor.run(&mut graph, CancellationToken::new()).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.node_results.is_empty());
    assert_eq!(graph.status(lonely), Some(NodeStatus::Idle));
    assert_eq!(transport.request_count(), 0);
}
