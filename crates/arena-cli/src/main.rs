//! `arena`: drive a multi-agent consensus run from the command line.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use arena_coordination::state::{DEFAULT_MODELS, DEFAULT_RUNS_ROOT, TASK_PLACEHOLDER};
use arena_coordination::{
    append_comment, default_repo_from_remote, init_state, latest_run_dir, next_run_dir,
    reopen_run, run_number_from_dir, run_status, AgentCoordinator, CloudAgentsClient,
    EngineSettings, GhCliSource, PendingComment, PhaseEngine, RunConfig, StateStore, VerifyMode,
    WaitSettings,
};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const API_KEY_VAR: &str = "ARENA_API_KEY";
const LOG_FILE: &str = "orchestrator.log";

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-agent consensus arena", long_about = None)]
struct Cli {
    /// Root directory holding numbered runs
    #[arg(long, global = true, default_value = DEFAULT_RUNS_ROOT)]
    root: PathBuf,

    /// Run directory (defaults to the latest numbered run under --root)
    #[arg(long, global = true)]
    arena_dir: Option<PathBuf>,

    /// TOML file with engine settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new run
    Init(InitArgs),
    /// Step until the run completes
    Run,
    /// Execute exactly one phase
    Step,
    /// Print the run status as JSON
    Status,
    /// Reopen a completed run for another round
    Reopen,
    /// Queue an operator comment for delivery on the next step
    AddComment(CommentArgs),
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Task given to every agent
    #[arg(long, default_value = TASK_PLACEHOLDER)]
    task: String,

    /// `owner/repo` or GitHub URL (defaults to the origin remote)
    #[arg(long)]
    repo: Option<String>,

    #[arg(long, default_value = "main")]
    base_branch: String,

    #[arg(long, default_value_t = 3)]
    max_rounds: u32,

    /// Comma-separated commands the winner runs before the run completes
    #[arg(long, value_delimiter = ',')]
    verify_commands: Vec<String>,

    /// advisory | gating
    #[arg(long, default_value = "advisory")]
    verify_mode: VerifyMode,

    /// Comma-separated model nicknames, one agent each
    #[arg(long, value_delimiter = ',')]
    models: Vec<String>,
}

#[derive(Args, Debug)]
struct CommentArgs {
    message: String,

    /// Comma-separated aliases (default: every agent)
    #[arg(long, value_delimiter = ',')]
    targets: Vec<String>,

    /// Send verbatim, without the operator preamble
    #[arg(long, default_value_t = false)]
    raw: bool,
}

fn init_tracing(verbose: bool, log_path: Option<&Path>) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

/// Explicit `--arena-dir`, else the latest numbered run.
fn resolve_run_dir(cli: &Cli) -> Result<PathBuf> {
    if let Some(dir) = &cli.arena_dir {
        return Ok(dir.clone());
    }
    latest_run_dir(&cli.root)?.with_context(|| {
        format!(
            "no runs found under {}; create one with `arena init`",
            cli.root.display()
        )
    })
}

fn load_settings(cli: &Cli) -> Result<EngineSettings> {
    let settings = match &cli.config {
        Some(path) => EngineSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => EngineSettings::from_env()?,
    };
    Ok(settings)
}

fn build_engine(run_dir: &Path, settings: EngineSettings) -> Result<PhaseEngine> {
    let api_key = std::env::var(API_KEY_VAR)
        .with_context(|| format!("{API_KEY_VAR} is not set; export your agent API key"))?;
    let client = CloudAgentsClient::new(api_key, &settings)?;
    let coordinator = AgentCoordinator::new(Arc::new(client), WaitSettings::from(&settings));
    let artifacts = Arc::new(GhCliSource::new(settings.fetch_timeout()));
    Ok(PhaseEngine::new(
        StateStore::new(run_dir),
        coordinator,
        artifacts,
        settings,
    ))
}

async fn cmd_init(cli: &Cli, args: &InitArgs) -> Result<()> {
    let run_dir = match &cli.arena_dir {
        Some(dir) => dir.clone(),
        None => next_run_dir(&cli.root)?,
    };
    let store = StateStore::new(&run_dir);
    if store.exists() {
        bail!("{} already holds a run", run_dir.display());
    }

    let repo = match &args.repo {
        Some(repo) => repo.clone(),
        None => default_repo_from_remote()
            .await
            .context("--repo not given and no GitHub origin remote found")?,
    };

    let mut config = RunConfig::new(args.task.clone(), repo);
    config.base_branch = args.base_branch.clone();
    config.max_rounds = args.max_rounds;
    config.verify_commands = args
        .verify_commands
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    config.verify_mode = args.verify_mode;
    config.run_number = run_number_from_dir(&run_dir);

    let state = init_state(config, &args.models)?;
    store.save(&state)?;

    info!(
        dir = %run_dir.display(),
        agents = state.agent_count(),
        "Run initialized"
    );
    println!("Initialized {}", store.state_path().display());
    if state.config.has_placeholder_task() {
        println!(
            "Edit the task in {} before running (default models: {}).",
            store.state_path().display(),
            DEFAULT_MODELS.join(", ")
        );
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Init(args) => cmd_init(&cli, args).await,
        Command::Run => {
            let run_dir = resolve_run_dir(&cli)?;
            let engine = build_engine(&run_dir, load_settings(&cli)?)?;
            let outcome = engine.run().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Step => {
            let run_dir = resolve_run_dir(&cli)?;
            let engine = build_engine(&run_dir, load_settings(&cli)?)?;
            let outcome = engine.step().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Status => {
            let run_dir = resolve_run_dir(&cli)?;
            let status = run_status(&StateStore::new(&run_dir))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Reopen => {
            let run_dir = resolve_run_dir(&cli)?;
            let state = reopen_run(&StateStore::new(&run_dir))?;
            println!("Reopened {} at round {}", run_dir.display(), state.round);
            Ok(())
        }
        Command::AddComment(args) => {
            let run_dir = resolve_run_dir(&cli)?;
            let comment = PendingComment {
                message: args.message.clone(),
                wrapped: !args.raw,
                targets: (!args.targets.is_empty()).then(|| args.targets.clone()),
            };
            let queued = append_comment(&run_dir, comment)?;
            println!("{queued} comment(s) queued for the next step");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_path = match &cli.command {
        Command::Run | Command::Step => resolve_run_dir(&cli).ok().map(|d| d.join(LOG_FILE)),
        _ => None,
    };
    init_tracing(cli.verbose, log_path.as_deref())?;

    run(cli).await
}
