use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowgate_core::config::AppConfig;
use flowgate_core::event::{EventBus, EventEnvelope};
use flowgate_core::plan::PlanContext;
use flowgate_core::types::{ApprovalDecision, ExecutionStatus, PendingApprovalEntry};

use flowgate_bridge::{
    AgentInvocationAdapter, BridgeContext, BridgeHooks, BridgeManager, McpToolAdapter,
    McpTransportFactory, SessionRegistry,
};
use flowgate_engine::{
    AdapterRegistry, ApprovalBroker, ExecutionManager, Executor, ExecutorOptions, GateOptions,
};
use flowgate_gateway::{GatewayServer, ObserverHub};
use flowgate_store::{ApprovalStore, CheckpointStore, ExecutionStore, ExportFormat, ExportOptions, ToolStreamLog};

#[derive(Parser)]
#[command(name = "flowgate", version, about = "Workflow orchestration runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowgate.toml", env = "FLOWGATE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a plan document without running it
    Validate {
        /// Plan file (JSON)
        plan: PathBuf,
    },
    /// Run a plan to completion
    Run {
        /// Plan file (JSON)
        plan: PathBuf,
        /// Execution inputs as a JSON object
        #[arg(long)]
        inputs: Option<String>,
        /// Check every node with its adapter instead of executing
        #[arg(long)]
        dry_run: bool,
        /// Approve every approval request without prompting
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Resume an execution from its last checkpoint
    Resume {
        execution_id: String,
        /// Plan file the execution was started from
        plan: PathBuf,
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Start the HTTP/WebSocket gateway
    Serve,
    /// Inspect and decide approvals recorded in the data directory
    Approvals {
        #[command(subcommand)]
        action: ApprovalAction,
    },
    /// Export tool-stream chunks for one correlation id
    Export {
        correlation_id: String,
        #[arg(long, default_value = "ndjson")]
        format: ExportFormat,
        /// Gzip the output
        #[arg(long)]
        gzip: bool,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ApprovalAction {
    /// List pending approvals
    List,
    /// Record a decision for a pending approval
    Decide {
        id: String,
        #[arg(long, conflicts_with = "reject", required_unless_present = "reject")]
        approve: bool,
        #[arg(long)]
        reject: bool,
        #[arg(long)]
        comment: Option<String>,
    },
}

/// Everything a command needs, built once from config.
struct Runtime {
    event_bus: Arc<EventBus>,
    broker: Arc<ApprovalBroker>,
    manager: ExecutionManager,
    tool_stream: Arc<ToolStreamLog>,
    bridges: Arc<BridgeManager>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FLOWGATE_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("flowgate=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowgate", &mut io::stdout());
        return Ok(());
    }

    // Validation needs no config or data directory.
    if let Commands::Validate { plan } = &cli.command {
        let plan = load_plan(plan)?;
        let reachable = plan.reachable_from(plan.entry()).len();
        println!(
            "Plan {} v{} is valid: {} nodes, {} reachable from '{}'",
            plan.plan.id,
            plan.plan.version,
            plan.node_map.len(),
            reachable,
            plan.entry()
        );
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            plan,
            inputs,
            dry_run,
            yes,
        } => {
            let plan = load_plan(&plan)?;
            let runtime = build_runtime(&config)?;
            if dry_run {
                return run_dry(&runtime, &plan).await;
            }
            let inputs = match inputs {
                Some(raw) => serde_json::from_str::<Value>(&raw).context("--inputs must be valid JSON")?,
                None => Value::Object(Default::default()),
            };
            let record = runtime.manager.submit(Arc::new(plan), inputs)?;
            follow(&runtime, &record.id, yes).await
        }
        Commands::Resume {
            execution_id,
            plan,
            yes,
        } => {
            let plan = load_plan(&plan)?;
            let runtime = build_runtime(&config)?;
            let record = runtime.manager.resume(&execution_id, Arc::new(plan))?;
            follow(&runtime, &record.id, yes).await
        }
        Commands::Serve => {
            let runtime = build_runtime(&config)?;
            let hub = Arc::new(ObserverHub::from_config(&config.events));
            info!(bind = %config.gateway.bind, "Starting gateway");
            let server = GatewayServer::new(
                config.gateway.clone(),
                runtime.event_bus.clone(),
                hub,
                runtime.manager.clone(),
                runtime.broker.clone(),
                Some(runtime.tool_stream.clone()),
            );
            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
            runtime.manager.cancel_all()?;
            runtime.bridges.close_all().await;
            runtime.tool_stream.flush_rotations().await;
            Ok(())
        }
        Commands::Approvals { action } => handle_approvals(&config, action),
        Commands::Export {
            correlation_id,
            format,
            gzip,
            output,
        } => {
            let log = ToolStreamLog::open(
                &config.tool_stream_dir(),
                config.tool_stream.max_file_bytes,
                config.tool_stream.compress_archives,
            )?;
            let opts = ExportOptions {
                format,
                compress: gzip,
            };
            match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    let file = log.export_to(Some(&correlation_id), opts, file).await?;
                    eprintln!("Wrote {} bytes to {}", file.metadata()?.len(), path.display());
                }
                None => {
                    let mut stdout = log.export_to(Some(&correlation_id), opts, io::stdout()).await?;
                    stdout.flush()?;
                }
            }
            Ok(())
        }
        Commands::Validate { .. } | Commands::Completions { .. } => Ok(()),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".flowgate").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    info!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn load_plan(path: &Path) -> anyhow::Result<PlanContext> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    let raw: Value = serde_json::from_str(&text)
        .with_context(|| format!("Plan {} is not valid JSON", path.display()))?;
    Ok(PlanContext::parse(&raw)?)
}

fn build_runtime(config: &AppConfig) -> anyhow::Result<Runtime> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

    let event_bus = Arc::new(EventBus::new(config.events.bus_capacity));
    let approvals = Arc::new(ApprovalStore::open(&config.approvals_path())?);
    let broker = Arc::new(ApprovalBroker::new(approvals, event_bus.clone()));
    let tool_stream = Arc::new(ToolStreamLog::open(
        &config.tool_stream_dir(),
        config.tool_stream.max_file_bytes,
        config.tool_stream.compress_archives,
    )?);

    // Bridge sessions connect lazily on first use.
    let bridge_ctx = BridgeContext {
        registry: Arc::new(SessionRegistry::open(&config.bridge_sessions_path())?),
        tool_stream: Some(tool_stream.clone()),
        event_bus: event_bus.clone(),
    };
    let factory = Arc::new(McpTransportFactory::from_config(&config.bridge));
    let bridges = Arc::new(
        BridgeManager::new(config.bridge.clone(), factory, bridge_ctx)
            .with_hooks(BridgeHooks::from_config(&config.bridge)),
    );

    let mut registry = AdapterRegistry::with_builtins();
    registry.register(McpToolAdapter::new(bridges.clone()));
    registry.register(AgentInvocationAdapter::new(bridges.clone()));
    info!(adapters = ?registry.list(), servers = ?bridges.server_names(), "Adapters registered");

    let checkpoints = if config.runtime.checkpoint {
        Some(Arc::new(CheckpointStore::open(&config.checkpoint_db_path())?))
    } else {
        None
    };
    let executor = Arc::new(Executor::new(
        Arc::new(registry),
        broker.clone(),
        event_bus.clone(),
        checkpoints,
        ExecutorOptions {
            approvals: config.approvals.clone(),
            checkpoint: config.runtime.checkpoint,
        },
    ));
    let store = Arc::new(ExecutionStore::open(&config.executions_dir())?);
    let manager = ExecutionManager::new(
        executor,
        Some(store),
        event_bus.clone(),
        GateOptions {
            max_running: config.runtime.max_concurrent_executions,
            default_policy: config.runtime.default_concurrency,
        },
    );

    Ok(Runtime {
        event_bus,
        broker,
        manager,
        tool_stream,
        bridges,
    })
}

async fn run_dry(runtime: &Runtime, plan: &PlanContext) -> anyhow::Result<()> {
    let reports = runtime.manager.executor().dry_run(plan).await;
    let mut failures = 0;
    for report in &reports {
        match &report.error {
            None => println!("  ok    {} ({})", report.node_id, report.node_type),
            Some(e) => {
                failures += 1;
                println!("  FAIL  {} ({}): {}", report.node_id, report.node_type, e);
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} of {} nodes failed the dry run", failures, reports.len());
    }
    println!("Dry run passed for {} nodes", reports.len());
    Ok(())
}

/// Print progress for `execution_id`, answer approvals, and wait for the end.
async fn follow(runtime: &Runtime, execution_id: &str, auto_approve: bool) -> anyhow::Result<()> {
    let mut rx = runtime.event_bus.subscribe();
    let broker = runtime.broker.clone();
    let id = execution_id.to_string();
    // A request can show up both in the pending list and on the bus.
    let mut answered = Answered::default();

    // Pick up approvals requested before we subscribed.
    for entry in broker.list_pending()? {
        if entry.execution_id.as_deref() == Some(execution_id) && answered.claim(&entry) {
            answer_approval(&broker, entry, auto_approve).await;
        }
    }

    let printer = tokio::spawn(async move {
        loop {
            let envelope = match rx.recv().await {
                Ok(envelope) => envelope,
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Progress output fell behind");
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            if envelope.execution_id.as_deref() != Some(id.as_str()) {
                continue;
            }
            print_event(&envelope);
            if envelope.event == "approval:requested" {
                if let Ok(entry) = serde_json::from_value::<PendingApprovalEntry>(envelope.payload) {
                    if answered.claim(&entry) {
                        answer_approval(&broker, entry, auto_approve).await;
                    }
                }
            }
        }
    });

    let record = runtime.manager.wait(execution_id).await?;
    printer.abort();
    runtime.bridges.close_all().await;
    runtime.tool_stream.flush_rotations().await;

    println!("{}", serde_json::to_string_pretty(&record)?);
    match record.status {
        ExecutionStatus::Success => Ok(()),
        status => anyhow::bail!(
            "Execution {} {}: {}",
            record.id,
            status,
            record.error.unwrap_or_default()
        ),
    }
}

/// Approval ids already put to the operator during one `follow`.
#[derive(Default)]
struct Answered(HashSet<String>);

impl Answered {
    /// True the first time `entry` is seen.
    fn claim(&mut self, entry: &PendingApprovalEntry) -> bool {
        self.0.insert(entry.id.clone())
    }
}

fn print_event(envelope: &EventEnvelope) {
    let p = &envelope.payload;
    match envelope.event.as_str() {
        "execution:node" => {
            let error = p["error"].as_str().map(|e| format!(": {}", e)).unwrap_or_default();
            eprintln!(
                "[{}] {} ({}) attempt {}{}",
                p["status"].as_str().unwrap_or("?"),
                p["nodeId"].as_str().unwrap_or("?"),
                p["nodeType"].as_str().unwrap_or("?"),
                p["attempt"],
                error
            );
        }
        "log:line" => eprintln!("{}", p["message"].as_str().unwrap_or_default()),
        "execution:started" | "execution:queued" => {
            eprintln!("[{}] {}", envelope.event, p["id"].as_str().unwrap_or("?"));
        }
        _ => {}
    }
}

async fn answer_approval(broker: &Arc<ApprovalBroker>, entry: PendingApprovalEntry, auto_approve: bool) {
    let approved = if auto_approve {
        true
    } else {
        eprintln!(
            "\n[APPROVAL] node '{}' ({}, risk {}). Approve? [y/N]",
            entry.node_id, entry.node_type, entry.risk_level
        );
        tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).ok();
            matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
        })
        .await
        .unwrap_or(false)
    };

    let decision = if approved {
        ApprovalDecision::approved("cli")
    } else {
        ApprovalDecision::rejected("cli", "rejected at the terminal")
    };
    if let Err(e) = broker.decide(&entry.id, decision).await {
        warn!(approval_id = %entry.id, error = %e, "Failed to record decision");
    }
}

fn handle_approvals(config: &AppConfig, action: ApprovalAction) -> anyhow::Result<()> {
    let store = ApprovalStore::open(&config.approvals_path())?;
    match action {
        ApprovalAction::List => {
            let pending = store.list_pending()?;
            if pending.is_empty() {
                println!("No pending approvals.");
            }
            for entry in pending {
                println!(
                    "{}  {}/{}  node={} ({})  risk={}  requested {}",
                    entry.id,
                    entry.plan_id,
                    entry.plan_version,
                    entry.node_id,
                    entry.node_type,
                    entry.risk_level,
                    entry.requested_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        ApprovalAction::Decide {
            id,
            approve,
            reject: _,
            comment,
        } => {
            let mut decision = if approve {
                ApprovalDecision::approved("cli")
            } else {
                ApprovalDecision::rejected("cli", "rejected from the command line")
            };
            if let Some(comment) = comment {
                decision = decision.with_comment(comment);
            }
            let completed = store.append_completed(&id, decision)?;
            println!("{} {}", completed.request.id, serde_json::to_string(&completed.status)?);
        }
    }
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
