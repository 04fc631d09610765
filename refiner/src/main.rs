//! Fuzz target refinement orchestrator.
//!
//! Drives an agent through bounded investigate-then-conclude sessions over a
//! target project and collects the refined fuzz target and build script.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use refiner::batch::{default_jobs, run_batch};
use refiner::core::budget::CancelToken;
use refiner::core::conclusion::parse_conclusion;
use refiner::core::types::{ExtractionResult, FailureReason};
use refiner::exit_codes;
use refiner::io::config::{DEFAULT_CONFIG_FILE, RefinerConfig, load_config, write_config};
use refiner::io::work_item::load_item;
use refiner::refine::{build_assembler, generate_run_id, refine_item, refine_path};
use refiner::rounds::RefineOutcome;

#[derive(Parser)]
#[command(
    name = "refiner",
    version,
    about = "Agent-driven fuzz target refinement"
)]
struct Cli {
    /// Path to the refiner config.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Print the initial prompt for a work item.
    Render { item: PathBuf },
    /// Parse a saved agent response and print the extraction as JSON.
    Extract {
        /// Response file, or `-` for stdin.
        response: PathBuf,
        /// Build script the session started from.
        #[arg(long)]
        build_script: Option<PathBuf>,
    },
    /// Refine one work item.
    Run {
        item: PathBuf,
        #[arg(long, default_value = "out")]
        out_dir: PathBuf,
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Refine several work items concurrently.
    Batch {
        #[arg(required = true)]
        items: Vec<PathBuf>,
        #[arg(long, default_value = "out")]
        out_dir: PathBuf,
        /// Worker threads (defaults to available parallelism).
        #[arg(short, long)]
        jobs: Option<usize>,
    },
}

fn main() {
    refiner::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Render { item } => cmd_render(&cli.config, &item),
        Command::Extract {
            response,
            build_script,
        } => cmd_extract(&response, build_script.as_deref()),
        Command::Run {
            item,
            out_dir,
            run_id,
        } => cmd_run(&cli.config, &item, &out_dir, run_id),
        Command::Batch {
            items,
            out_dir,
            jobs,
        } => cmd_batch(&cli.config, &items, &out_dir, jobs),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        println!("{} already exists", config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(config_path, &RefinerConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_render(config_path: &Path, item_path: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let item = load_item(item_path)?;
    let prompt = build_assembler(&cfg)?.initial(&item.vars)?;
    println!("{prompt}");
    Ok(exit_codes::OK)
}

fn cmd_extract(response_path: &Path, build_script: Option<&Path>) -> Result<i32> {
    let response = if response_path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read response from stdin")?;
        buf
    } else {
        fs::read_to_string(response_path)
            .with_context(|| format!("read {}", response_path.display()))?
    };
    let original = match build_script {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        None => String::new(),
    };

    let (extraction, code) = match parse_conclusion(&response) {
        Ok(conclusion) => (conclusion.into_extraction(&original), exit_codes::OK),
        Err(err) => {
            eprintln!("{err}");
            (
                ExtractionResult::invalid(FailureReason::MalformedConclusion.as_str()),
                exit_codes::FAILED,
            )
        }
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&extraction).context("serialize extraction")?
    );
    Ok(code)
}

fn install_cancel_handler() -> Result<CancelToken> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, cancelling sessions");
        handler_token.cancel();
    })
    .context("install Ctrl-C handler")?;
    Ok(cancel)
}

fn cmd_run(
    config_path: &Path,
    item_path: &Path,
    out_dir: &Path,
    run_id: Option<String>,
) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let item = load_item(item_path)?;
    let run_id = run_id.unwrap_or_else(|| generate_run_id(&item.id));
    let cancel = install_cancel_handler()?;

    let outcome = refine_item(item, &cfg, out_dir, &run_id, &cancel, |round| {
        let status = match round.session.failure_reason() {
            Some(reason) => reason.as_str().to_string(),
            None => "done".to_string(),
        };
        println!(
            "round {}: {status} ({} steps, dry run {:?})",
            round.round,
            round.session.steps(),
            round.dry_run.outcome
        );
    })?;
    println!("summary: {}", out_dir.join(&run_id).join("summary.json").display());
    Ok(outcome_code(&outcome))
}

fn cmd_batch(
    config_path: &Path,
    items: &[PathBuf],
    out_dir: &Path,
    jobs: Option<usize>,
) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let cancel = install_cancel_handler()?;
    let jobs = jobs.unwrap_or_else(|| default_jobs(items.len()));

    let entries = run_batch(items, jobs, |path| refine_path(path, &cfg, out_dir, &cancel));

    let mut code = exit_codes::OK;
    for entry in &entries {
        let (line, item_code) = match &entry.result {
            Ok(outcome) if outcome.succeeded() => ("ok".to_string(), exit_codes::OK),
            Ok(outcome) => (
                outcome
                    .failure_reason()
                    .map_or("rounds_exhausted", FailureReason::as_str)
                    .to_string(),
                outcome_code(outcome),
            ),
            Err(err) => (format!("error: {err:#}"), exit_codes::INVALID),
        };
        println!("{}\t{line}", entry.item.display());
        code = worst(code, item_code);
    }
    Ok(code)
}

fn outcome_code(outcome: &RefineOutcome) -> i32 {
    match outcome.failure_reason() {
        _ if outcome.succeeded() => exit_codes::OK,
        Some(FailureReason::Cancelled) => exit_codes::CANCELLED,
        Some(FailureReason::ConfigError) => exit_codes::INVALID,
        _ => exit_codes::FAILED,
    }
}

/// Cancellation outranks invalid input, which outranks a failed run.
fn worst(a: i32, b: i32) -> i32 {
    let rank = |code: i32| match code {
        exit_codes::CANCELLED => 3,
        exit_codes::INVALID => 2,
        exit_codes::FAILED => 1,
        _ => 0,
    };
    if rank(b) > rank(a) { b } else { a }
}
