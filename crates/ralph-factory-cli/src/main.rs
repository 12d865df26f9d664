//! # ralph-factory-cli
//!
//! Binary entry point for the Factory orchestrator.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Config loading/merging (`factory.yml` + flag overrides)
//! - Process-group leadership and signal handling on Unix
//! - The headless `factory run` entry point

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ralph_factory_adapters::SubprocessAdapter;
use ralph_factory_core::{
    FactoryConfig, Orchestrator, OrchestratorConfig, Provider, RunSummary, WorktreeConfig,
    html_to_text,
};
use tracing::{error, info, warn};

// Unix-specific process management for process group leadership
#[cfg(unix)]
mod process_management {
    use nix::unistd::{Pid, getpgrp, setpgid, tcgetpgrp};
    use std::io::{IsTerminal, stdin, stdout};
    use tracing::debug;

    /// Sets up process group leadership.
    ///
    /// The orchestrator runs as a process group leader. All spawned CLI
    /// processes (Claude, Gemini, Codex, Cursor) belong to this group. On
    /// termination, the entire process group receives the signal,
    /// preventing orphaned provider subprocesses.
    pub fn setup_process_group() {
        let pid = Pid::this();
        let pgrp = getpgrp();
        if pgrp == pid {
            debug!("already process group leader: PID {}", pid);
            return;
        }

        if is_foreground_tty_group(pgrp) {
            debug!("skipping setpgid: keeping foreground process group {}", pgrp);
            return;
        }

        if let Err(e) = setpgid(pid, pid) {
            if e != nix::errno::Errno::EPERM {
                debug!("could not set process group ({}), continuing anyway", e);
            }
        }
        debug!("process group initialized: PID {}", pid);
    }

    fn is_foreground_tty_group(current_pgrp: Pid) -> bool {
        if stdin().is_terminal()
            && let Ok(fg) = tcgetpgrp(stdin())
        {
            return fg == current_pgrp;
        }
        if stdout().is_terminal()
            && let Ok(fg) = tcgetpgrp(stdout())
        {
            return fg == current_pgrp;
        }
        false
    }
}

#[cfg(not(unix))]
mod process_management {
    /// No-op on non-Unix platforms.
    pub fn setup_process_group() {}
}

/// Color output mode for terminal display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorMode {
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Parser, Debug)]
#[command(name = "ralph-factory", version, about = "Autonomous multi-provider coding-agent orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path.
    #[arg(short, long, default_value = "factory.yml", global = true)]
    config: PathBuf,

    /// Verbose output (debug-level logging).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Color output mode (auto, always, never).
    #[arg(long, value_enum, default_value_t = ColorMode::Auto, global = true)]
    color: ColorMode,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestration loop against one or more PRD files.
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// PRD JSON file(s) to consume. At least one is required.
    #[arg(required = true)]
    prd: Vec<PathBuf>,

    /// Root of the main repository (the trunk). Defaults to the current directory.
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Maximum concurrent workers.
    #[arg(long)]
    max_workers: Option<usize>,

    /// Retries allowed per task before it is dropped (left pending).
    #[arg(long)]
    retry_limit: Option<u32>,

    /// Concurrency capacity for claude:opus.
    #[arg(long)]
    opus_slots: Option<u32>,

    /// Concurrency capacity for claude:sonnet.
    #[arg(long)]
    sonnet_slots: Option<u32>,

    /// Concurrency capacity for claude:haiku.
    #[arg(long)]
    haiku_slots: Option<u32>,

    /// Concurrency capacity for gemini:pro.
    #[arg(long)]
    gemini_pro_slots: Option<u32>,

    /// Concurrency capacity for gemini:flash.
    #[arg(long)]
    gemini_flash_slots: Option<u32>,

    /// Concurrency capacity for codex:default.
    #[arg(long)]
    codex_slots: Option<u32>,

    /// Concurrency capacity for cursor:default.
    #[arg(long)]
    cursor_slots: Option<u32>,

    /// Seconds between planner refill evaluations.
    #[arg(long)]
    planner_interval: Option<u64>,

    /// Model the planner invokes with (one of the configured slot models).
    #[arg(long)]
    planner_model: Option<String>,

    /// Whether the complexity router picks the provider/tier automatically.
    #[arg(long)]
    auto_route: Option<bool>,

    /// Escalate tier on retry instead of resubmitting at the same tier.
    #[arg(long)]
    escalate_on_retry: Option<bool>,

    /// Remove worker worktrees on shutdown.
    #[arg(long)]
    cleanup: Option<bool>,

    /// Reference spec URL(s); may be repeated. Fetched once at startup and
    /// handed to the planner as ground truth for `specSatisfied`.
    #[arg(long = "spec-url")]
    spec_urls: Vec<String>,

    /// Skip provider invocations and validation entirely; exercises
    /// scheduling and merge plumbing against an empty diff.
    #[arg(long)]
    dry_run: bool,

    /// Skip the validation gate after each worker run.
    #[arg(long)]
    skip_validation: bool,
}

fn merge_config(file: FactoryConfig, args: &RunArgs) -> FactoryConfig {
    let mut config = file;
    if let Some(v) = args.max_workers {
        config.max_workers = v;
    }
    if let Some(v) = args.retry_limit {
        config.retry_limit = v;
    }
    if let Some(v) = args.planner_interval {
        config.planner_interval_secs = v;
    }
    if args.planner_model.is_some() {
        config.planner_model = args.planner_model.clone();
    }
    if let Some(v) = args.auto_route {
        config.auto_route = v;
    }
    if let Some(v) = args.escalate_on_retry {
        config.escalate_on_retry = v;
    }
    if let Some(v) = args.cleanup {
        config.cleanup = v;
    }
    if !args.spec_urls.is_empty() {
        config.spec_urls = args.spec_urls.clone();
    }
    if args.dry_run {
        config.dry_run = true;
    }
    if args.skip_validation {
        config.skip_validation = true;
    }

    for (provider, model, slots) in [
        ("claude", "opus", args.opus_slots),
        ("claude", "sonnet", args.sonnet_slots),
        ("claude", "haiku", args.haiku_slots),
        ("gemini", "pro", args.gemini_pro_slots),
        ("gemini", "flash", args.gemini_flash_slots),
        ("codex", "default", args.codex_slots),
        ("cursor", "default", args.cursor_slots),
    ] {
        if let Some(capacity) = slots {
            match config.slots.iter_mut().find(|s| s.provider == provider && s.model == model) {
                Some(existing) => existing.capacity = capacity,
                None => config.slots.push(ralph_factory_core::SlotCapacity {
                    provider: provider.to_string(),
                    model: model.to_string(),
                    capacity,
                }),
            }
        }
    }

    config
}

/// Fetches each configured reference-spec URL, converts it to readable
/// text, and concatenates the results. Network failures are logged and
/// skipped rather than aborting the run: a missing reference spec just
/// means the planner never reports `specSatisfied`.
fn fetch_spec_content(urls: &[String]) -> Option<String> {
    if urls.is_empty() {
        return None;
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .ok()?;

    let mut sections = Vec::new();
    for url in urls {
        match client.get(url).send().and_then(|r| r.error_for_status()).and_then(|r| r.text()) {
            Ok(body) => {
                let text = html_to_text(&body, 15_000);
                if !text.trim().is_empty() {
                    sections.push(text);
                }
            }
            Err(e) => {
                warn!(url = %url, error = %e, "failed to fetch reference spec; continuing without it");
            }
        }
    }

    if sections.is_empty() { None } else { Some(sections.join("\n\n---\n\n")) }
}

/// Waits for SIGINT (and SIGTERM on Unix), then flips the shutdown flag the
/// orchestrator checks between loop iterations.
#[cfg(unix)]
async fn wait_for_shutdown_signal(shutdown: Arc<std::sync::atomic::AtomicBool>) {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("received SIGINT, requesting clean shutdown");
        }
        _ = async {
            match &mut sigterm {
                Some(s) => { s.recv().await; }
                None => std::future::pending::<()>().await,
            }
        } => {
            warn!("received SIGTERM, requesting clean shutdown");
        }
    }
    shutdown.store(true, Ordering::SeqCst);
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal(shutdown: Arc<std::sync::atomic::AtomicBool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("received Ctrl-C, requesting clean shutdown");
    }
    shutdown.store(true, Ordering::SeqCst);
}

fn exit_code(summary: &RunSummary, interrupted: bool) -> i32 {
    if summary.converged {
        0
    } else if interrupted {
        130
    } else {
        1
    }
}

fn print_summary(summary: &RunSummary) {
    println!("Factory run finished:");
    println!("  Tasks completed:   {}", summary.tasks_completed);
    println!("  Successful merges: {}", summary.merges_succeeded);
    println!("  Merge conflicts:   {}", summary.conflicts);
    println!("  Workers used:      {}", summary.workers_used);
    if !summary.slots_in_backoff.is_empty() {
        println!("  Slots in backoff:  {}", summary.slots_in_backoff.join(", "));
    }
    println!("  Converged:         {}", summary.converged);

    info!(
        tasks_completed = summary.tasks_completed,
        merges_succeeded = summary.merges_succeeded,
        conflicts = summary.conflicts,
        workers_used = summary.workers_used,
        converged = summary.converged,
        "run summary"
    );
}

async fn run_factory(args: RunArgs, config: FactoryConfig) -> Result<(RunSummary, bool)> {
    process_management::setup_process_group();

    let spec_content = fetch_spec_content(&config.spec_urls);

    let worker_ids: Vec<String> =
        (1..=config.max_workers.max(1)).map(|n| format!("w{n}")).collect();
    let worktree_config = WorktreeConfig::with_dir(config.worktree_dir.clone());

    let slot_capacities: Vec<(Provider, &str, u32)> = config
        .slots
        .iter()
        .filter_map(|s| {
            let provider: Provider = s.provider.parse().ok()?;
            Some((provider, s.model.as_str(), s.capacity))
        })
        .collect();

    let planner_provider: Provider = config
        .planner_provider
        .as_deref()
        .unwrap_or("claude")
        .parse()
        .unwrap_or(Provider::Claude);
    let planner_model = config.planner_model.clone().unwrap_or_else(|| "sonnet".to_string());

    let orchestrator_config = OrchestratorConfig {
        max_total_workers: config.max_workers,
        retry_limit: config.retry_limit,
        escalate_on_retry: config.escalate_on_retry,
        cleanup: config.cleanup,
        planner_refill_threshold: 2,
        planner_interval: Duration::from_secs(config.planner_interval_secs),
        planner_provider,
        planner_model,
        dry_run: config.dry_run,
        skip_validation: config.skip_validation,
        invoke_timeout: Duration::from_secs(600),
    };

    let adapter: Arc<dyn ralph_factory_core::ProviderAdapter> = Arc::new(SubprocessAdapter);
    let validation: Arc<dyn ralph_factory_core::ValidationGate> = Arc::new(ralph_factory_core::NoValidation);

    let mut orchestrator = Orchestrator::init(
        &args.prd,
        args.repo.clone(),
        &worker_ids,
        &worktree_config,
        &slot_capacities,
        spec_content,
        adapter,
        validation,
        orchestrator_config,
    )
    .context("failed to initialize orchestrator")?;

    let shutdown = orchestrator.shutdown_flag();
    tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));

    let summary = orchestrator.run().await;
    let interrupted = shutdown.load(Ordering::SeqCst);
    Ok((summary, interrupted))
}

fn init_logging(verbose: bool, color: ColorMode) {
    let filter = if verbose { "debug" } else { "info" };
    use std::io::IsTerminal;
    let ansi = match color {
        ColorMode::Auto => std::io::stdout().is_terminal(),
        ColorMode::Always => true,
        ColorMode::Never => false,
    };
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.color);

    let Some(Commands::Run(args)) = cli.command else {
        eprintln!("usage: ralph-factory run <PRD...> [FLAGS]");
        std::process::exit(1);
    };

    let file_config = if cli.config.exists() {
        FactoryConfig::load(&cli.config).with_context(|| format!("failed to load config {}", cli.config.display()))?
    } else {
        FactoryConfig::default()
    };
    let config = merge_config(file_config, &args);

    match run_factory(args, config).await {
        Ok((summary, interrupted)) => {
            print_summary(&summary);
            std::process::exit(exit_code(&summary, interrupted));
        }
        Err(e) => {
            error!(error = %e, "factory run failed");
            std::process::exit(1);
        }
    }
}
