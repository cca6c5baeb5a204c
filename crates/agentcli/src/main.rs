// crates/agentcli/src/main.rs

use agentcore::services::{KnowledgeRetriever, LlmClient, StaticToolRegistry};
use agentcore::store::{DirectoryGraphSource, FileContextStore};
use agentcore::{ExecutionId, ReviewDecision, RunEvent, RunStatus};
use agentnodes::clients::{HttpToolClient, KeywordRetriever, OpenAiCompatClient};
use agentnodes::Services;
use agentruntime::{AgentRuntime, GraphLoader, NodeRegistry, RuntimeConfig};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentflow")]
#[command(about = "Conversational agent graph runner", long_about = None)]
struct Cli {
    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph file loads and every node is configured correctly
    Validate {
        /// Path to graph JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Run an agent for one user message
    Run {
        #[command(flatten)]
        env: RunEnv,

        /// Agent id; the graph is `<graphs>/<agent>.json`
        #[arg(short, long)]
        agent: String,

        /// The user message
        #[arg(short, long)]
        message: String,

        /// Continue an earlier conversation
        #[arg(short, long)]
        conversation: Option<String>,
    },

    /// Approve or reject a run waiting for review
    Resume {
        #[command(flatten)]
        env: RunEnv,

        execution_id: ExecutionId,

        /// Reject instead of approve, with this reason
        #[arg(long)]
        reject: Option<String>,

        #[arg(long)]
        comment: Option<String>,
    },

    /// Cancel a run waiting for review
    Cancel {
        #[command(flatten)]
        env: RunEnv,

        execution_id: ExecutionId,
    },

    /// Show the stored state of a run
    Status {
        #[command(flatten)]
        env: RunEnv,

        execution_id: ExecutionId,
    },
}

#[derive(Args)]
struct RunEnv {
    /// Directory of agent graph files
    #[arg(long, default_value = "graphs")]
    graphs: PathBuf,

    /// Directory run snapshots are persisted to
    #[arg(long, default_value = ".agentflow/runs")]
    store: PathBuf,

    /// Runtime configuration JSON file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured parallelism
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Use the echo model and no network services
    #[arg(long)]
    offline: bool,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "AGENTFLOW_LLM_URL", default_value = "https://api.openai.com/v1")]
    llm_url: String,

    #[arg(long, env = "AGENTFLOW_LLM_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    /// Knowledge base JSON file: `[{"content": .., "source": ..}]`
    #[arg(long)]
    knowledge: Option<PathBuf>,

    /// HTTP tool as `name=url`; repeatable
    #[arg(long = "tool", value_parser = parse_tool)]
    tools: Vec<(String, String)>,

    /// Limit on tool calls that don't set their own timeout
    #[arg(long, default_value_t = 30_000)]
    tool_timeout_ms: u64,
}

fn parse_tool(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, url)) if !name.is_empty() && !url.is_empty() => {
            Ok((name.to_string(), url.to_string()))
        }
        _ => Err(format!("expected name=url, got {}", raw)),
    }
}

impl RunEnv {
    fn config(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
            }
            None => RuntimeConfig::default(),
        };
        if let Some(max) = self.max_parallel {
            config = config.with_max_parallel_nodes(max);
        }
        Ok(config)
    }

    fn services(&self) -> Result<Services> {
        let mut services = Services::offline();

        if !self.offline {
            let mut client = OpenAiCompatClient::new(&self.llm_url, &self.model);
            if let Ok(key) = std::env::var("AGENTFLOW_API_KEY") {
                client = client.with_api_key(key);
            }
            services.llm = Arc::new(client) as Arc<dyn LlmClient>;
        }

        if let Some(path) = &self.knowledge {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let retriever = KeywordRetriever::from_json(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            tracing::info!(chunks = retriever.len(), "Loaded knowledge base");
            services.retriever = Arc::new(retriever) as Arc<dyn KnowledgeRetriever>;
        }

        let mut tools = StaticToolRegistry::new();
        for (name, url) in &self.tools {
            tools.register(Arc::new(HttpToolClient::new(name, url)));
        }
        services.tools = Arc::new(tools);
        services.tool_timeout = Duration::from_millis(self.tool_timeout_ms);

        Ok(services)
    }

    fn runtime(&self) -> Result<AgentRuntime> {
        let registry = registry(&self.services()?);
        let store = FileContextStore::open(&self.store)
            .with_context(|| format!("opening store {}", self.store.display()))?;
        Ok(AgentRuntime::new(
            Arc::new(registry),
            Arc::new(DirectoryGraphSource::new(&self.graphs)),
            Arc::new(store),
            self.config()?,
        ))
    }
}

fn registry(services: &Services) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    agentnodes::register_all(&mut registry, services);
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { file } => validate_graph(&file),
        Commands::Nodes => {
            list_nodes();
            Ok(())
        }
        Commands::Run {
            env,
            agent,
            message,
            conversation,
        } => run_agent(&env, &agent, &message, conversation).await,
        Commands::Resume {
            env,
            execution_id,
            reject,
            comment,
        } => {
            let decision = match reject {
                Some(reason) => ReviewDecision::reject(reason),
                None => ReviewDecision::Approve { comment },
            };
            resume(&env, execution_id, decision).await
        }
        Commands::Cancel { env, execution_id } => cancel(&env, execution_id).await,
        Commands::Status { env, execution_id } => status(&env, execution_id).await,
    }
}

fn validate_graph(file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let graph = GraphLoader::load(&raw)?;
    let registry = registry(&Services::offline());

    let mut problems = Vec::new();
    for node in graph.nodes() {
        if let Err(e) = registry.create_executor(node) {
            problems.push(format!("{}: {}", node.id, e));
        }
    }
    if !problems.is_empty() {
        bail!("graph {} has invalid nodes:\n  {}", graph.id(), problems.join("\n  "));
    }

    let entries: Vec<&str> = graph
        .entries()
        .iter()
        .map(|&idx| graph.node(idx).id.as_str())
        .collect();
    println!("✅ Graph is valid:");
    println!("   Id: {}", graph.id());
    println!("   Name: {}", graph.name());
    println!("   Nodes: {}", graph.len());
    println!("   Edges: {}", graph.edge_count());
    println!("   Entry: {}", entries.join(", "));
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = registry(&Services::offline());
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

async fn run_agent(
    env: &RunEnv,
    agent: &str,
    message: &str,
    conversation: Option<String>,
) -> Result<()> {
    let runtime = env.runtime()?;
    let (sink, mut rx) = runtime.stream_channel();
    let execution_id = runtime.start_run(agent, message, conversation, sink).await?;
    eprintln!("▶️  Run {} started", execution_id);

    print_events(&mut rx).await?;
    report(&runtime, execution_id).await
}

async fn resume(env: &RunEnv, execution_id: ExecutionId, decision: ReviewDecision) -> Result<()> {
    let runtime = env.runtime()?;
    let (sink, mut rx) = runtime.stream_channel();
    runtime
        .resume_run_with_sink(execution_id, decision, Some(sink))
        .await?;

    print_events(&mut rx).await?;
    report(&runtime, execution_id).await
}

async fn cancel(env: &RunEnv, execution_id: ExecutionId) -> Result<()> {
    let runtime = env.runtime()?;
    runtime.cancel_run(execution_id).await?;
    report(&runtime, execution_id).await
}

async fn status(env: &RunEnv, execution_id: ExecutionId) -> Result<()> {
    let runtime = env.runtime()?;
    let state = runtime.status(execution_id).await?;

    println!("Execution: {}", state.execution_id);
    println!("Agent: {}", state.agent_id);
    println!("Status: {:?}", state.status);
    if let Some(review) = &state.pending_review {
        println!("Waiting on: {} ({})", review.node_id, review.prompt);
    }
    if let Some(error) = &state.error {
        println!("Error: {}", error);
    }
    Ok(())
}

/// Print events as JSON lines until the run finishes or suspends.
async fn print_events(rx: &mut Receiver<RunEvent>) -> Result<()> {
    while let Some(event) = rx.recv().await {
        println!("{}", serde_json::to_string(&event)?);
        if event.is_terminal() || matches!(event, RunEvent::RunSuspended { .. }) {
            break;
        }
    }
    Ok(())
}

async fn report(runtime: &AgentRuntime, execution_id: ExecutionId) -> Result<()> {
    match runtime.wait(execution_id).await? {
        RunStatus::Completed => eprintln!("✨ Run {} completed", execution_id),
        RunStatus::SuspendedForReview => {
            eprintln!("⏸️  Run {} is waiting for review", execution_id);
            eprintln!("   agentflow resume {}", execution_id);
            eprintln!("   agentflow resume {} --reject <reason>", execution_id);
        }
        RunStatus::Cancelled => eprintln!("🛑 Run {} cancelled", execution_id),
        RunStatus::Failed => {
            let state = runtime.status(execution_id).await?;
            return Err(anyhow!(
                "run {} failed: {}",
                execution_id,
                state.error.unwrap_or_default()
            ));
        }
        RunStatus::Running => bail!("run {} is still running", execution_id),
    }
    Ok(())
}
