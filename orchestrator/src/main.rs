//! Multi-provider consensus orchestrator.
//!
//! Claims issues from the host, asks several LLM providers about each stage
//! of the work and only moves forward when their reconciled answer is
//! confident enough. State lives in `.orchestrator/state.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use orchestrator::core::work_item::{WorkKind, work_key};
use orchestrator::exit_codes;
use orchestrator::intake::{SweepOptions, SweepReport, sweep};
use orchestrator::io::config::{
    DEFAULT_CONFIG_PATH, OrchestratorConfig, load_config, read_config, write_atomic,
};
use orchestrator::io::registry::WorkRegistry;
use orchestrator::logging;
use orchestrator::pipeline::{Pipeline, ProcessOutcome, StopSignal};
use orchestrator::status::StatusReport;

const WATCH_TICK: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Multi-provider consensus pipeline from issue to pull request"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Claim and process labelled open issues.
    Start {
        /// Repeat the sweep every SECS seconds until stopped.
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
        /// Process at most N items per sweep.
        #[arg(long, value_name = "N")]
        max_items: Option<usize>,
    },
    /// Print counts per state and the open items.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Drive one item through the pipeline.
    Process {
        id: String,
        #[arg(long, default_value = "issue")]
        kind: WorkKind,
    },
    /// Check the config file and print every problem.
    ValidateConfig,
    /// Write the state snapshot to stdout or a file.
    ExportState {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Replace the state with an exported snapshot.
    ImportState { path: PathBuf },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::ERROR);
    }
}

fn run() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Start { watch, max_items } => cmd_start(&cli.config, watch, max_items),
        Command::Status { json } => cmd_status(&cli.config, json),
        Command::Process { id, kind } => cmd_process(&cli.config, kind, &id),
        Command::ValidateConfig => cmd_validate_config(&cli.config),
        Command::ExportState { output } => cmd_export_state(&cli.config, output.as_deref()),
        Command::ImportState { path } => cmd_import_state(&cli.config, &path),
    }
}

/// Build the production pipeline with Ctrl-C wired to its stop signal.
fn open_pipeline(config: OrchestratorConfig) -> Result<Pipeline> {
    let pipeline = Pipeline::from_config(config)?;
    let flag = pipeline.stop_signal().flag();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("install Ctrl-C handler")?;
    Ok(pipeline)
}

fn cmd_start(config_path: &Path, watch: Option<u64>, max_items: Option<usize>) -> Result<()> {
    let config = load_config(config_path)?;
    let mut pipeline = open_pipeline(config)?;
    let options = SweepOptions { max_items };
    loop {
        let report = sweep(&mut pipeline, options)?;
        print_sweep(&report);
        let Some(secs) = watch else {
            break;
        };
        if report.stopped || !wait(pipeline.stop_signal(), Duration::from_secs(secs)) {
            break;
        }
    }
    let metrics = pipeline.metrics();
    println!(
        "processed={} completed={} rejected={} escalated={} failed={}",
        metrics.processed, metrics.completed, metrics.rejected, metrics.escalated, metrics.failed
    );
    Ok(())
}

/// Sleep up to `period`; `false` if a stop arrived meanwhile.
fn wait(stop: &StopSignal, period: Duration) -> bool {
    let until = Instant::now() + period;
    while Instant::now() < until {
        if stop.is_raised() {
            return false;
        }
        thread::sleep(WATCH_TICK.min(until.saturating_duration_since(Instant::now())));
    }
    !stop.is_raised()
}

fn print_sweep(report: &SweepReport) {
    for key in &report.claimed {
        println!("claimed {key}");
    }
    for (key, state) in &report.processed {
        println!("{key} {state}");
    }
    if report.stopped {
        println!("stopped");
    }
}

fn cmd_status(config_path: &Path, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = WorkRegistry::open(&config.state_path)?;
    let report = StatusReport::from_registry(&registry);
    if json {
        let payload = serde_json::to_string_pretty(&report).context("serialize status")?;
        println!("{payload}");
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

fn cmd_process(config_path: &Path, kind: WorkKind, id: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let mut pipeline = open_pipeline(config)?;
    let key = work_key(kind, id);
    match pipeline.process(kind, id)? {
        ProcessOutcome::Finished(state) => println!("{key} {state}"),
        ProcessOutcome::Stopped(state) => println!("{key} {state} (stopped)"),
    }
    let ledger = pipeline.dispatcher().ledger();
    info!(calls = ledger.calls(), spent_usd = ledger.spent_usd(), "provider spend");
    Ok(())
}

fn cmd_validate_config(config_path: &Path) -> Result<()> {
    let mut config = read_config(config_path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    let problems = config.problems();
    if problems.is_empty() {
        println!("config=ok");
        return Ok(());
    }
    for problem in &problems {
        println!("problem: {problem}");
    }
    bail!("{} has {} problem(s)", config_path.display(), problems.len())
}

fn cmd_export_state(config_path: &Path, output: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = WorkRegistry::open(&config.state_path)?;
    let snapshot = registry.export_state()?;
    match output {
        Some(path) => {
            write_atomic(path, &snapshot)?;
            println!("exported={} path={}", registry.len(), path.display());
        }
        None => print!("{snapshot}"),
    }
    Ok(())
}

fn cmd_import_state(config_path: &Path, path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut registry = WorkRegistry::open(&config.state_path)?;
    let count = registry
        .import_state(&contents)
        .with_context(|| format!("import {}", path.display()))?;
    println!("imported={count}");
    Ok(())
}
