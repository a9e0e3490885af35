use anyhow::{anyhow, Context, Result};
use clap::Parser;
use sift_fanout::config::{Config, API_KEY_ENV};
use sift_fanout::fanout::{plan_run, Pipeline, Scheduler};
use sift_fanout::llm::OpenRouterClient;
use sift_fanout::snapshot::load_snapshot;
use sift_fanout::store::{Checkpoint, RunLock, VerdictStore};
use sift_fanout::tools::{BlockList, RateLimiter, ToolProvider, ToolSettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sift-fanout",
    about = "Evaluate candidate edits across several models with resumable checkpoints",
    version
)]
struct Cli {
    /// Input snapshot (YAML or JSON) of edits to evaluate
    #[arg(long)]
    snapshot: PathBuf,

    /// Model ids to run (defaults to the configured list)
    #[arg(long, num_args = 1..)]
    models: Vec<String>,

    /// Only evaluate the first N edits
    #[arg(long)]
    limit: Option<usize>,

    /// Print the planned work and exit without contacting any backend
    #[arg(long)]
    dry_run: bool,

    /// Config file (defaults to ./sift-fanout.toml, then the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Wall-clock limit per work item, in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long)]
    verdict_dir: Option<PathBuf>,

    /// Checkpoint file
    #[arg(long)]
    state: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG still wins when set)
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if !cli.models.is_empty() {
        config.models = cli.models.clone();
    }
    if let Some(secs) = cli.timeout_secs {
        config.item_timeout_secs = secs;
    }
    if let Some(dir) = &cli.verdict_dir {
        config.verdict_dir = dir.clone();
    }
    if let Some(state) = &cli.state {
        config.state_path = state.clone();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli);
    if config.models.is_empty() {
        return Err(anyhow!("No models configured"));
    }

    let edits = load_snapshot(&cli.snapshot, cli.limit)?;
    println!(
        "Loaded {} edits from {}",
        edits.len(),
        cli.snapshot.display()
    );

    if cli.dry_run {
        let checkpoint = Checkpoint::peek(&config.state_path)?;
        let plan = plan_run(&edits, &config.models, &checkpoint);
        println!(
            "Dry run: {} edits x {} models = {} work items",
            plan.edits, plan.models, plan.total
        );
        for edit in &edits {
            println!("  {} {}", edit.title(), edit.property().unwrap_or("?"));
        }
        println!("Models:");
        for model in &config.models {
            println!("  {model}");
        }
        println!(
            "{} already checkpointed, {} to run",
            plan.already_done,
            plan.total - plan.already_done
        );
        return Ok(());
    }

    let _lock = RunLock::acquire(&config.state_path)?;
    let checkpoint = Checkpoint::load(&config.state_path)?;

    let api_key = Config::api_key().ok_or_else(|| {
        anyhow!(
            "No OpenRouter API key found. Set {} or store one in the system keychain.",
            API_KEY_ENV
        )
    })?;
    let system_prompt = config.load_prompt()?;
    let blocklist = BlockList::load(&config.blocked_domains_path)?;
    tracing::info!(domains = blocklist.len(), "Loaded blocked domains");

    let client = Arc::new(
        OpenRouterClient::new(
            api_key,
            &config.api_base_url,
            Duration::from_secs(config.request_timeout_secs),
            Duration::from_secs(config.cost_timeout_secs),
        )
        .context("Failed to set up model backend")?,
    );
    let tools = ToolProvider::new(
        ToolSettings::from_config(&config),
        blocklist,
        Arc::new(RateLimiter::new(config.tool_min_interval())),
    )?;

    let item_timeout = config.item_timeout();
    let store = VerdictStore::new(config.verdict_dir.clone());
    let models = config.models.clone();
    let pipeline = Pipeline::new(
        client.clone(),
        client,
        Arc::new(tools),
        system_prompt,
        config,
    );

    let mut scheduler = Scheduler::new(Arc::new(pipeline), checkpoint, store, item_timeout);
    tracing::info!(run_id = scheduler.run_id(), items = edits.len() * models.len(), "Starting run");
    let summary = match scheduler.run(&edits, &models).await {
        Ok(summary) => summary,
        Err(aborted) => {
            println!();
            println!("{}", aborted.summary);
            return Err(aborted.into());
        }
    };

    println!();
    println!("{summary}");
    if summary.retryable() > 0 {
        println!(
            "{} items failed and were not checkpointed; re-run the same command to retry them.",
            summary.retryable()
        );
    }
    Ok(())
}
