//! Round artifacts under `<out_dir>/<run_id>/round-<n>/`.
//!
//! Every session leaves `session.json` (the full transcript) and `meta.json`.
//! A session that reached `done` also leaves `fuzz_target.<ext>`, plus
//! `build.sh` when the build script changed. `dry_run.log` is written when a
//! dry run actually ran.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{DryRunOutcome, ExtractionResult, FailureReason, SessionStatus};
use crate::session::Session;

/// File extension for a fuzz target written in `language`.
pub fn source_extension(language: &str) -> &'static str {
    match language.trim().to_ascii_lowercase().as_str() {
        "c" => "c",
        "c++" | "cpp" | "cxx" | "cc" => "cc",
        "rust" => "rs",
        "go" | "golang" => "go",
        "python" | "py" => "py",
        "java" | "jvm" => "java",
        "swift" => "swift",
        "javascript" | "js" => "js",
        _ => "txt",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundMeta {
    pub run_id: String,
    pub item_id: String,
    pub round: u32,
    pub session_id: String,
    pub status: SessionStatus,
    pub steps: u32,
    pub dry_run: DryRunOutcome,
    pub build_script_changed: bool,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RoundPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub session_path: PathBuf,
    pub fuzz_target_path: PathBuf,
    pub build_script_path: PathBuf,
    pub dry_run_log_path: PathBuf,
}

impl RoundPaths {
    pub fn new(run_dir: &Path, round: u32, language: &str) -> Self {
        let dir = run_dir.join(format!("round-{round}"));
        Self {
            meta_path: dir.join("meta.json"),
            session_path: dir.join("session.json"),
            fuzz_target_path: dir.join(format!("fuzz_target.{}", source_extension(language))),
            build_script_path: dir.join("build.sh"),
            dry_run_log_path: dir.join("dry_run.log"),
            dir,
        }
    }
}

pub struct RoundWriteRequest<'a> {
    pub run_dir: &'a Path,
    pub meta: &'a RoundMeta,
    pub session: &'a Session,
    pub dry_run_log: Option<&'a str>,
}

pub fn write_round(request: &RoundWriteRequest<'_>) -> Result<RoundPaths> {
    let session = request.session;
    let paths = RoundPaths::new(
        request.run_dir,
        request.meta.round,
        session.vars().language(),
    );
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create round dir {}", paths.dir.display()))?;

    // Write in deterministic order to keep logs stable.
    write_json(&paths.meta_path, request.meta)?;
    write_json(&paths.session_path, session)?;
    if session.status() == SessionStatus::Done
        && let Some(extraction) = session.extraction().filter(|e| e.valid)
    {
        write_text(&paths.fuzz_target_path, &with_newline(&extraction.fuzz_target))?;
        if extraction.build_script_changed {
            write_text(
                &paths.build_script_path,
                &with_newline(&extraction.build_script),
            )?;
        }
    }
    if let Some(log) = request.dry_run_log {
        write_text(&paths.dry_run_log_path, log)?;
    }
    debug!(dir = %paths.dir.display(), "wrote round artifacts");
    Ok(paths)
}

/// Final record of a run, written to `<run_dir>/summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub item_id: String,
    pub succeeded: bool,
    pub rounds: u32,
    pub reason: Option<FailureReason>,
    pub message: Option<String>,
    /// Last valid extraction of the run, even when the run failed.
    pub last_good: Option<ExtractionResult>,
    pub last_good_round: Option<u32>,
}

pub fn write_summary(run_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    fs::create_dir_all(run_dir).with_context(|| format!("create {}", run_dir.display()))?;
    let path = run_dir.join("summary.json");
    write_json(&path, summary)?;
    Ok(path)
}

fn with_newline(text: &str) -> String {
    let mut out = text.to_string();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
