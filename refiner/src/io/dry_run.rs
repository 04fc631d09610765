//! Dry-run adapter: builds the proposed artifacts with the project's build system.
//!
//! The refiner never interprets build output beyond pass/fail. The log is
//! kept so a failed build can be fed back to the next round.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::types::{DryRunFailure, DryRunOutcome};
use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone)]
pub struct DryRunRequest<'a> {
    pub project_dir: &'a Path,
    pub language: &'a str,
    pub fuzz_target: &'a str,
    pub build_script: &'a str,
    /// Where the artifacts are staged for the build command.
    pub scratch: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunReport {
    pub outcome: DryRunOutcome,
    pub log: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl DryRunReport {
    pub fn skipped() -> Self {
        Self {
            outcome: DryRunOutcome::Skipped,
            log: String::new(),
            exit_code: None,
            timed_out: false,
        }
    }

    /// Diagnostic for the extraction, present only for failed builds.
    pub fn failure(&self) -> Option<DryRunFailure> {
        (self.outcome == DryRunOutcome::Fail).then(|| DryRunFailure {
            exit_code: self.exit_code,
            timed_out: self.timed_out,
            log: self.log.clone(),
        })
    }
}

pub trait DryRunner {
    /// `Err` is reserved for failures of the refiner itself (e.g. staging I/O);
    /// build failures are reported as [`DryRunOutcome::Fail`].
    fn run(&self, request: &DryRunRequest<'_>) -> Result<DryRunReport>;
}

/// Used when no dry-run command is configured.
pub struct NoDryRun;

impl DryRunner for NoDryRun {
    fn run(&self, _request: &DryRunRequest<'_>) -> Result<DryRunReport> {
        Ok(DryRunReport::skipped())
    }
}

/// Runs a configured build command against staged artifacts.
///
/// The command runs in the project directory with `REFINER_FUZZ_TARGET`,
/// `REFINER_BUILD_SCRIPT` and `REFINER_PROJECT_DIR` pointing at the inputs.
pub struct CommandDryRunner {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandDryRunner {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }
}

impl DryRunner for CommandDryRunner {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn run(&self, request: &DryRunRequest<'_>) -> Result<DryRunReport> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(DryRunReport::skipped());
        };
        let staged = stage_artifacts(request)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(request.project_dir)
            .env("REFINER_FUZZ_TARGET", &staged.fuzz_target)
            .env("REFINER_BUILD_SCRIPT", &staged.build_script)
            .env("REFINER_PROJECT_DIR", request.project_dir);

        info!(program = %program, "starting dry run");
        let output =
            match run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes) {
                Ok(output) => output,
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "dry run could not start");
                    return Ok(DryRunReport {
                        outcome: DryRunOutcome::Fail,
                        log: format!("dry run could not start: {err:#}"),
                        exit_code: None,
                        timed_out: false,
                    });
                }
            };

        let mut log = String::new();
        log.push_str("=== stdout ===\n");
        log.push_str(&output.stdout_lossy());
        log.push_str("\n=== stderr ===\n");
        log.push_str(&output.stderr_lossy());
        if output.timed_out {
            log.push_str("\n[dry run timed out]\n");
        }

        let outcome = if !output.timed_out && output.status.success() {
            DryRunOutcome::Pass
        } else {
            warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "dry run failed");
            DryRunOutcome::Fail
        };
        Ok(DryRunReport {
            outcome,
            log,
            exit_code: output.status.code(),
            timed_out: output.timed_out,
        })
    }
}

struct StagedArtifacts {
    fuzz_target: PathBuf,
    build_script: PathBuf,
}

fn stage_artifacts(request: &DryRunRequest<'_>) -> Result<StagedArtifacts> {
    let dir = request.scratch.join("dry-run");
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let fuzz_target = dir.join(format!(
        "fuzz_target.{}",
        crate::io::artifacts::source_extension(request.language)
    ));
    fs::write(&fuzz_target, request.fuzz_target)
        .with_context(|| format!("write {}", fuzz_target.display()))?;
    let build_script = dir.join("build.sh");
    fs::write(&build_script, request.build_script)
        .with_context(|| format!("write {}", build_script.display()))?;
    Ok(StagedArtifacts {
        fuzz_target,
        build_script,
    })
}
