mod doctor;
mod flow_file;

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tokn_core::config::{AppConfig, ConfigCredentialStore};
use tokn_core::event::EventBus;
use tokn_core::graph::{FlowGraph, NodeId, NodeKind, NodeStatus};
use tokn_core::types::{RunEvent, RunOutcome};
use tokn_engine::FlowExecutor;
use tokn_llm::HttpTransport;

#[derive(Parser)]
#[command(name = "tokn", version, about = "Run LLM flow graphs with streaming and sandboxed tools")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tokn.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow and stream its output
    Run {
        /// Flow description (JSON)
        flow: PathBuf,
    },
    /// Check a flow without running it
    Validate {
        /// Flow description (JSON)
        flow: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Run environment health checks
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tokn=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "tokn", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run { flow } => run_flow(config, &flow).await,
        Commands::Validate { flow } => validate_flow(config, &flow),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config.redacted())?);
            Ok(())
        }
        Commands::Doctor => {
            doctor::run_doctor(&config, &cli.config).await;
            Ok(())
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        warn!(path = %path.display(), "No config file found, using defaults and environment keys");
        Ok(AppConfig::default())
    }
}

fn build_executor(config: AppConfig) -> FlowExecutor {
    let credentials = Arc::new(ConfigCredentialStore::new(&config));
    FlowExecutor::new(
        config,
        Arc::new(HttpTransport::new()),
        credentials,
        Arc::new(EventBus::default()),
    )
    .with_configured_optimizers()
}

fn labels(graph: &FlowGraph) -> HashMap<NodeId, String> {
    graph.nodes().map(|n| (n.id, n.label.clone())).collect()
}

fn validate_flow(config: AppConfig, flow: &Path) -> anyhow::Result<()> {
    let graph = flow_file::load(flow)?;
    let executor = build_executor(config);
    let names = labels(&graph);

    let issues = executor.validate(&graph);
    if issues.is_empty() {
        println!("Flow is valid ({} nodes)", graph.node_count());
        return Ok(());
    }
    for issue in &issues {
        let label = names.get(&issue.node).map(String::as_str).unwrap_or("?");
        eprintln!("  [!!] {}: {}", label, issue.message);
    }
    anyhow::bail!("{} validation error(s)", issues.len())
}

async fn run_flow(config: AppConfig, flow: &Path) -> anyhow::Result<()> {
    let mut graph = flow_file::load(flow)?;
    let executor = build_executor(config);
    let names = labels(&graph);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling...");
            trigger.cancel();
        }
    });

    let mut rx = executor.event_bus().subscribe();
    let printer_names = names.clone();
    let print_handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if print_event(&event, &printer_names) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let report = executor.run(&mut graph, cancel).await;
    print_handle.await.ok();

    println!();
    eprintln!(
        "Run {} started {} ({} ms)",
        report.run_id,
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        report.total_elapsed_ms
    );
    for result in &report.node_results {
        let label = names.get(&result.node).map(String::as_str).unwrap_or("?");
        match (&result.status, &result.error) {
            (NodeStatus::Error, Some(e)) => eprintln!("  [!!] {}: {}", label, e),
            (status, _) => eprintln!(
                "  [{:?}] {} ({} ms, {} iterations, {} tool calls)",
                status, label, result.elapsed_ms, result.iterations, result.tool_invocations
            ),
        }
        let is_optimizer = graph.node(result.node).map(|n| n.kind()) == Some(NodeKind::Optimizer);
        if is_optimizer && !result.output.is_empty() {
            eprintln!("      optimized prompt: {}", result.output);
        }
    }

    match report.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Cancelled => {
            eprintln!("Run cancelled");
            Ok(())
        }
        RunOutcome::Failed => anyhow::bail!("flow run failed"),
    }
}

/// Print one event. Returns true once the run has finished.
fn print_event(event: &RunEvent, names: &HashMap<NodeId, String>) -> bool {
    let label = |node: &NodeId| names.get(node).map(String::as_str).unwrap_or("?").to_string();
    match event {
        RunEvent::TextDelta { text, .. } => {
            print!("{}", text);
            io::stdout().flush().ok();
        }
        RunEvent::NodeStatus {
            node,
            status: NodeStatus::Running,
        } => {
            eprintln!("\n[{}]", label(node));
        }
        RunEvent::ToolStart { name, arguments, .. } => {
            eprintln!("\n[tool: {}] {}", name, truncate(&arguments.to_string(), 200));
        }
        RunEvent::ToolEnd { name, result, .. } => {
            let status = if result.is_ok() { "ok" } else { "ERROR" };
            eprintln!("[{}: {}] {}", name, status, truncate(&result.content_text(), 200));
        }
        RunEvent::IterationCapReached { node, cap } => {
            eprintln!("\n[{}] stopped after {} iterations", label(node), cap);
        }
        RunEvent::NodeError { node, message } => {
            eprintln!("\n[{}: ERROR] {}", label(node), message);
        }
        RunEvent::OptimizerProgress { node, message } => {
            eprintln!("[{}] {}", label(node), message);
        }
        RunEvent::RunFinished { .. } => return true,
        _ => {}
    }
    false
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}
