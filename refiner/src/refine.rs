//! Wiring for `refiner run` and `refiner batch`: config and work item in,
//! concrete collaborators out.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use tracing::{info, instrument};

use crate::core::budget::CancelToken;
use crate::error::ConfigError;
use crate::io::agent::CommandAgent;
use crate::io::broker::SandboxBroker;
use crate::io::config::RefinerConfig;
use crate::io::dry_run::{CommandDryRunner, DryRunner, NoDryRun};
use crate::io::prompt::PromptAssembler;
use crate::io::work_item::{LoadedItem, load_item, validate_id};
use crate::rounds::{RefineOutcome, RefinementRound, RoundsRequest, run_rounds};
use crate::session::SessionConfig;

/// Build the prompt assembler, loading the operator template if configured.
pub fn build_assembler(cfg: &RefinerConfig) -> Result<PromptAssembler> {
    let assembler = PromptAssembler::new();
    let Some(path) = &cfg.prompt_template else {
        return Ok(assembler);
    };
    let source =
        fs::read_to_string(path).with_context(|| format!("read prompt template {}", path.display()))?;
    assembler
        .with_initial_template(source)
        .with_context(|| format!("load prompt template {}", path.display()))
}

/// `<item_id>-<UTC timestamp>-<random suffix>`, unique across concurrent runs.
pub fn generate_run_id(item_id: &str) -> String {
    format!(
        "{item_id}-{}-{:08x}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        rand::thread_rng().r#gen::<u32>()
    )
}

/// Create `<out_dir>/<run_id>`, refusing one that already exists.
fn reserve_run_dir(out_dir: &Path, run_id: &str) -> Result<PathBuf> {
    fs::create_dir_all(out_dir).with_context(|| format!("create {}", out_dir.display()))?;
    let run_dir = out_dir.join(run_id);
    match fs::create_dir(&run_dir) {
        Ok(()) => Ok(run_dir),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(ConfigError::Invalid(
            format!("run directory {} already exists", run_dir.display()),
        )
        .into()),
        Err(err) => Err(err).with_context(|| format!("create {}", run_dir.display())),
    }
}

fn dry_runner(cfg: &RefinerConfig) -> Box<dyn DryRunner> {
    if cfg.dry_run.command.is_empty() {
        Box::new(NoDryRun)
    } else {
        Box::new(CommandDryRunner::new(
            cfg.dry_run.command.clone(),
            Duration::from_secs(cfg.dry_run.timeout_secs),
            cfg.dry_run.output_limit_bytes,
        ))
    }
}

/// Refine one loaded work item with process-backed collaborators.
///
/// Artifacts land in `<out_dir>/<run_id>/`, which must not exist yet. The item
/// gets its own scratch directory, removed when the run ends.
#[instrument(skip_all, fields(item_id = %item.id, run_id = %run_id))]
pub fn refine_item<F: FnMut(&RefinementRound)>(
    item: LoadedItem,
    cfg: &RefinerConfig,
    out_dir: &Path,
    run_id: &str,
    cancel: &CancelToken,
    on_round: F,
) -> Result<RefineOutcome> {
    validate_id(run_id)?;
    let project_dir = item.vars.project_dir();
    if !project_dir.is_dir() {
        return Err(ConfigError::Invalid(format!(
            "PROJECT_DIR {} is not a directory",
            project_dir.display()
        ))
        .into());
    }
    let assembler = build_assembler(cfg)?;
    let scratch = tempfile::Builder::new()
        .prefix("refiner-")
        .tempdir()
        .context("create scratch directory")?;
    let broker = SandboxBroker::new(
        cfg.tool.shell.clone(),
        cfg.command_policy()?,
        cfg.tool.output_limit_bytes,
        &project_dir,
        scratch.path(),
    );
    let agent = CommandAgent::new(
        cfg.inference.command.clone(),
        cfg.inference.output_limit_bytes,
    );
    let dry_runner = dry_runner(cfg);
    let session_config = SessionConfig::from_config(cfg);
    let run_dir = reserve_run_dir(out_dir, run_id)?;

    info!(scratch = %scratch.path().display(), run_dir = %run_dir.display(), "refining item");
    run_rounds(
        RoundsRequest {
            run_id,
            item_id: &item.id,
            vars: item.vars,
            max_rounds: cfg.max_rounds,
            session: &session_config,
            cancel,
            scratch: scratch.path(),
            run_dir: Some(&run_dir),
        },
        &assembler,
        &agent,
        &broker,
        dry_runner.as_ref(),
        on_round,
    )
}

/// Load `item_path` and refine it under a generated run id.
pub fn refine_path(
    item_path: &Path,
    cfg: &RefinerConfig,
    out_dir: &Path,
    cancel: &CancelToken,
) -> Result<RefineOutcome> {
    let item = load_item(item_path)?;
    let run_id = generate_run_id(&item.id);
    refine_item(item, cfg, out_dir, &run_id, cancel, |_| {})
}
