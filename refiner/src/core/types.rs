//! Shared deterministic types for the refinement core.
//!
//! These types define stable contracts between the session controller, the
//! tool broker and the conclusion parser. They serialize into the session
//! audit log, so field names are part of the on-disk format.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Who produced a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    Tool,
    System,
}

/// A single investigation command issued by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub command: String,
    pub workdir: PathBuf,
    pub timeout_ms: u64,
}

impl ToolCommand {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Why a tool command did not complete cleanly. Always reported as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolError {
    /// Killed after exceeding its timeout.
    Timeout,
    /// Exited with a non-zero status.
    NonZeroExit,
    /// Output exceeded the broker's limit and was truncated.
    OutputTooLarge,
    /// Rejected by the command policy before spawning.
    PolicyDenied { reason: String },
    /// The shell could not be spawned or waited on.
    SpawnFailed { message: String },
}

impl ToolError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolError::Timeout => "timeout",
            ToolError::NonZeroExit => "non_zero_exit",
            ToolError::OutputTooLarge => "output_too_large",
            ToolError::PolicyDenied { .. } => "policy_denied",
            ToolError::SpawnFailed { .. } => "spawn_failed",
        }
    }
}

/// Captured outcome of a tool command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub truncated: bool,
    pub error: Option<ToolError>,
}

impl ToolResult {
    /// A result for a command that never ran (or could not be observed).
    pub fn failed(error: ToolError) -> Self {
        let stderr = match &error {
            ToolError::PolicyDenied { reason } => format!("command rejected: {reason}"),
            ToolError::SpawnFailed { message } => format!("command failed to start: {message}"),
            _ => String::new(),
        };
        Self {
            stderr,
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }
}

/// One entry of the append-only session transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_command: Option<ToolCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_command: None,
            tool_result: None,
        }
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            content: content.into(),
            tool_command: None,
            tool_result: None,
        }
    }

    pub fn agent_with_command(content: impl Into<String>, command: ToolCommand) -> Self {
        Self {
            tool_command: Some(command),
            ..Self::agent(content)
        }
    }

    /// Tool turn carrying the command it answers, so rendering never needs to
    /// look back across turns.
    pub fn tool(command: ToolCommand, result: ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: command.command.clone(),
            tool_command: Some(command),
            tool_result: Some(result),
        }
    }
}

/// Session lifecycle state. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Init,
    Gathering,
    Concluding,
    Done,
    Failed { reason: FailureReason },
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Done | SessionStatus::Failed { .. })
    }
}

/// Machine-readable reason a session or run ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    StepLimitExceeded,
    MalformedConclusion,
    InferenceError,
    Cancelled,
    ConfigError,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::StepLimitExceeded => "step_limit_exceeded",
            FailureReason::MalformedConclusion => "malformed_conclusion",
            FailureReason::InferenceError => "inference_error",
            FailureReason::Cancelled => "cancelled",
            FailureReason::ConfigError => "config_error",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of delegating a build of the proposed artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DryRunOutcome {
    /// Build succeeded.
    Pass,
    /// Build failed, timed out, or could not be started.
    Fail,
    /// No dry run was configured or the session did not conclude.
    Skipped,
}

/// Diagnostic attached to an extraction whose artifacts failed to build.
///
/// Never affects extraction validity; it is feedback for the next round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunFailure {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub log: String,
}

/// The single structured result of a completed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub conclusion: String,
    pub fuzz_target: String,
    /// Build script to use downstream. Equals the session's original script
    /// when the agent left it unchanged.
    pub build_script: String,
    pub build_script_changed: bool,
    pub valid: bool,
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run_failure: Option<DryRunFailure>,
}

impl ExtractionResult {
    /// Result recorded for a session that never produced a usable conclusion.
    /// Carries no artifact text, so there is no partial success to act on.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            conclusion: String::new(),
            fuzz_target: String::new(),
            build_script: String::new(),
            build_script_changed: false,
            valid: false,
            failure_reason: Some(reason.into()),
            dry_run_failure: None,
        }
    }
}
