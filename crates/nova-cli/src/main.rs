//! Nova CLI - multi-agent build pipeline tooling
//!
//! Usage:
//!   nova init                         Write default configuration
//!   nova decompose <title> -d <text>  Show how a task would be decomposed
//!   nova check --agent <A> <file>     Run hard limits and offline gates on a response
//!   nova pending                      Show the pending plan approval
//!   nova approve [--reject | --modify] Answer the pending plan approval

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use nova_core::{Agent, NovaConfig, Task};
use nova_orchestrator::{respond_to_pending, ApprovalResult, ApprovalTransport, FileTransport};
use nova_planning::{analyze_complexity, should_decompose, TaskDecomposer};
use nova_validation::{all_gates_passed, gates_summary, quality_score, GateRunner, HardLimits};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "nova")]
#[command(author, version, about = "Multi-agent build pipeline")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Repository root holding `.nova/`
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default `.nova/config.toml`
    Init,

    /// Show how a task would be decomposed
    Decompose {
        /// Task title
        title: String,

        /// Task description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Agent owning the task
        #[arg(short, long, default_value = "MARS")]
        agent: Agent,

        /// Task identifier used as the subtask id prefix
        #[arg(long, default_value = "task")]
        id: String,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run hard limits and offline gates against a response file
    Check {
        /// Agent that produced the response
        #[arg(short, long)]
        agent: Agent,

        /// File holding the response text
        file: PathBuf,

        /// Hard-limit document (defaults to the configured path)
        #[arg(long)]
        limits: Option<PathBuf>,

        /// Task title, used by the semantic keyword check
        #[arg(long, default_value = "")]
        title: String,
    },

    /// Show the pending plan approval
    Pending,

    /// Answer the pending plan approval (approves by default)
    #[command(group(ArgGroup::new("verdict").args(["reject", "modify"])))]
    Approve {
        /// Reject the plan with a reason
        #[arg(long, value_name = "REASON")]
        reject: Option<String>,

        /// Replace the plan with the contents of a file
        #[arg(long, value_name = "FILE")]
        modify: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG overrides the verbosity flag
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init => cmd_init(cli.root),
        Commands::Decompose {
            title,
            description,
            agent,
            id,
            json,
        } => cmd_decompose(id, title, description, agent, json),
        Commands::Check {
            agent,
            file,
            limits,
            title,
        } => cmd_check(cli.root, agent, file, limits, title).await,
        Commands::Pending => cmd_pending(cli.root).await,
        Commands::Approve { reject, modify } => cmd_approve(cli.root, reject, modify).await,
    }
}

fn cmd_init(root: PathBuf) -> Result<()> {
    info!("Initializing Nova in {:?}", root);

    let config_path = NovaConfig::write_default(&root).context("Failed to write config")?;
    println!("Wrote {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Add agent hard limits to .nova/hard-limits.json");
    println!("  2. Set [approval] enabled = true to review plans before execution");
    println!("  3. Preview a decomposition: nova decompose \"<title>\" -d \"<description>\"");
    Ok(())
}

fn cmd_decompose(id: String, title: String, description: String, agent: Agent, json: bool) -> Result<()> {
    let complexity = analyze_complexity(&title, &description);
    let decompose = should_decompose(&title, &description);
    let plan = TaskDecomposer::decompose_task(&id, &title, &description, agent);
    plan.validate().context("Generated plan is inconsistent")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!(
        "Complexity: ~{} lines, {} file(s), {} integration point(s), {} risk",
        complexity.estimated_lines,
        complexity.estimated_files,
        complexity.integration_points,
        complexity.risk
    );
    if !decompose {
        println!("Small enough to run directly; decomposition shown for reference.");
    }
    println!();
    print!("{}", plan.summary());

    println!();
    println!("Execution waves:");
    for (i, wave) in plan.execution_waves().iter().enumerate() {
        println!("  {}. {}", i + 1, wave.join(", "));
    }
    Ok(())
}

async fn cmd_check(
    root: PathBuf,
    agent: Agent,
    file: PathBuf,
    limits: Option<PathBuf>,
    title: String,
) -> Result<()> {
    let config = NovaConfig::load_or_default(&root).context("Failed to load config")?;
    let limits_path = limits.unwrap_or_else(|| config.gates.hard_limits_path.clone());
    let hard_limits = HardLimits::load(&limits_path)
        .with_context(|| format!("Failed to load hard limits from {}", limits_path.display()))?;

    let response = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let title = if title.is_empty() {
        file.file_stem()
            .map(|s| s.to_string_lossy().replace(['-', '_'], " "))
            .unwrap_or_default()
    } else {
        title
    };
    let task = Task::new("check", title, "", agent);

    let runner = GateRunner::new(config.gates.clone(), hard_limits);
    let results = runner.run_gates(&task, &response).await;

    for result in &results {
        let mark = if result.passed { "PASS" } else { "FAIL" };
        println!("[{}] {}: {}", mark, result.gate, result.message);
    }
    println!();
    println!("{} (quality {:.2})", gates_summary(&results), quality_score(&results));

    if !all_gates_passed(&results) {
        bail!("Response for {} failed validation", agent);
    }
    Ok(())
}

async fn cmd_pending(root: PathBuf) -> Result<()> {
    let config = NovaConfig::load_or_default(&root).context("Failed to load config")?;
    let transport = FileTransport::from_config(&config.approval);

    match transport.read_request().await? {
        Some(request) => {
            println!("Approval: {}", request.id);
            println!("Task:     {}", request.task_id);
            println!("Created:  {}", request.timestamp.to_rfc3339());
            println!();
            println!("{}", request.plan);
        }
        None => println!("No pending approval"),
    }
    Ok(())
}

async fn cmd_approve(root: PathBuf, reject: Option<String>, modify: Option<PathBuf>) -> Result<()> {
    let config = NovaConfig::load_or_default(&root).context("Failed to load config")?;
    let transport = FileTransport::from_config(&config.approval);

    let result = match (reject, modify) {
        (Some(reason), _) => ApprovalResult::Rejected { reason },
        (None, Some(path)) => ApprovalResult::Modified {
            plan: tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?,
        },
        (None, None) => ApprovalResult::Approved,
    };

    let request = respond_to_pending(&transport, &result)
        .await
        .context("Failed to answer approval")?;
    info!("Answered approval {} for task {}", request.id, request.task_id);
    println!("{:?} -> {}", result, request.id);
    Ok(())
}
