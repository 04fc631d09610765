//! Refiner configuration stored in `refiner.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::backoff::RetryPolicy;
use crate::core::policy::{CommandPolicy, DEFAULT_ALLOW, DEFAULT_DENY};
use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "refiner.toml";

/// Refiner configuration (TOML).
///
/// Edited by humans; missing fields default to values that work for a
/// typical OSS-Fuzz style project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RefinerConfig {
    /// Normal agent turns per session before the forced final prompt.
    pub max_steps: u32,

    /// Refinement rounds per work item.
    pub max_rounds: u32,

    /// Corrective resends after a malformed final answer.
    pub conclusion_retries: u32,

    /// Wall-clock budget for one session in seconds.
    pub session_timeout_secs: u64,

    /// Operator template replacing the built-in initial prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<PathBuf>,

    pub tool: ToolConfig,
    pub inference: InferenceConfig,
    pub dry_run: DryRunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolConfig {
    /// Shell prefix; the command text is appended as the last argument.
    pub shell: Vec<String>,
    pub timeout_secs: u64,
    /// Per-stream limit on captured stdout/stderr.
    pub output_limit_bytes: usize,
    /// Allowed program names. Empty allows any program.
    pub allow: Vec<String>,
    /// Regexes rejected anywhere in the command text.
    pub deny_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    /// Command that reads the prompt on stdin and writes the response to stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DryRunConfig {
    /// Build command run against the proposed artifacts. Empty disables the dry run.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            shell: vec!["bash".to_string(), "-c".to_string()],
            timeout_secs: 60,
            output_limit_bytes: 16 * 1024,
            allow: DEFAULT_ALLOW.iter().map(|s| s.to_string()).collect(),
            deny_patterns: DEFAULT_DENY.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm".to_string()],
            timeout_secs: 10 * 60,
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for DryRunConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_rounds: 3,
            conclusion_retries: 1,
            session_timeout_secs: 30 * 60,
            prompt_template: None,
            tool: ToolConfig::default(),
            inference: InferenceConfig::default(),
            dry_run: DryRunConfig::default(),
        }
    }
}

impl RefinerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.max_steps == 0 {
            return invalid("max_steps must be > 0");
        }
        if self.max_rounds == 0 {
            return invalid("max_rounds must be > 0");
        }
        if self.session_timeout_secs == 0 {
            return invalid("session_timeout_secs must be > 0");
        }
        if self.tool.timeout_secs == 0 {
            return invalid("tool.timeout_secs must be > 0");
        }
        if self.tool.timeout_secs >= self.session_timeout_secs {
            return invalid("tool.timeout_secs must be shorter than session_timeout_secs");
        }
        if self.tool.output_limit_bytes == 0 {
            return invalid("tool.output_limit_bytes must be > 0");
        }
        if is_blank(&self.tool.shell) {
            return invalid("tool.shell must be a non-empty array");
        }
        if is_blank(&self.inference.command) {
            return invalid("inference.command must be a non-empty array");
        }
        if self.inference.timeout_secs == 0 {
            return invalid("inference.timeout_secs must be > 0");
        }
        if self.inference.max_attempts == 0 {
            return invalid("inference.max_attempts must be > 0");
        }
        if self.inference.backoff_base_ms > self.inference.backoff_max_ms {
            return invalid("inference.backoff_base_ms must not exceed inference.backoff_max_ms");
        }
        if !self.dry_run.command.is_empty() && is_blank(&self.dry_run.command) {
            return invalid("dry_run.command must start with a program");
        }
        if self.dry_run.timeout_secs == 0 || self.dry_run.output_limit_bytes == 0 {
            return invalid("dry_run.timeout_secs and dry_run.output_limit_bytes must be > 0");
        }
        // Compiles the deny patterns.
        self.command_policy()?;
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn command_policy(&self) -> Result<CommandPolicy, ConfigError> {
        CommandPolicy::new(&self.tool.allow, &self.tool.deny_patterns)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.inference.max_attempts,
            base_delay: Duration::from_millis(self.inference.backoff_base_ms),
            max_delay: Duration::from_millis(self.inference.backoff_max_ms),
        }
    }
}

fn is_blank(command: &[String]) -> bool {
    command.first().is_none_or(|program| program.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RefinerConfig::default()`. Relative
/// `prompt_template` paths resolve against the config file's directory.
pub fn load_config(path: &Path) -> Result<RefinerConfig> {
    if !path.exists() {
        let cfg = RefinerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: RefinerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    if let Some(template) = cfg.prompt_template.take() {
        cfg.prompt_template = Some(match path.parent() {
            Some(parent) if template.is_relative() => parent.join(template),
            _ => template,
        });
    }
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RefinerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RefinerConfig::default());
        assert_eq!(cfg.max_steps, 10);
        assert_eq!(cfg.conclusion_retries, 1);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("refiner.toml");
        let mut cfg = RefinerConfig::default();
        cfg.dry_run.command = vec!["bash".to_string(), "build.sh".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("refiner.toml");
        fs::write(
            &path,
            "max_steps = 4\nprompt_template = \"prompt.md\"\n[inference]\ncommand = [\"claude\", \"-p\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_steps, 4);
        assert_eq!(cfg.inference.command, ["claude", "-p"]);
        assert_eq!(cfg.inference.max_attempts, 3);
        assert_eq!(cfg.tool, ToolConfig::default());
        assert_eq!(cfg.prompt_template, Some(temp.path().join("prompt.md")));
    }

    #[test]
    fn tool_timeout_must_be_shorter_than_session() {
        let mut cfg = RefinerConfig::default();
        cfg.tool.timeout_secs = cfg.session_timeout_secs;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_deny_pattern_fails_validation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("refiner.toml");
        fs::write(&path, "[tool]\ndeny_patterns = [\"(\"]\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some(), "{err:#}");
    }
}
