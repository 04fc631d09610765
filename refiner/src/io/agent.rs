//! Inference backend abstraction.
//!
//! The [`Agent`] trait decouples the session controller from the model
//! backend. [`CommandAgent`] pipes the prompt to a configured CLI on stdin and
//! reads the response from stdout. Tests use scripted agents that return
//! predetermined responses without spawning processes.

use std::process::Command;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::RetryPolicy;
use crate::core::budget::{Interrupt, SessionBudget};
use crate::error::InferenceError;
use crate::io::process::run_command_with_timeout;

/// Parameters for one inference call.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub prompt: String,
    pub timeout: Duration,
}

/// Abstraction over inference backends.
pub trait Agent {
    fn complete(&self, request: &InferenceRequest) -> Result<String, InferenceError>;
}

/// Agent that spawns a CLI command per call.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandAgent {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
        }
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), prompt_bytes = request.prompt.len()))]
    fn complete(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| InferenceError::Permanent("no inference command configured".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| InferenceError::Permanent(format!("run {program}: {err:#}")))?;

        if output.timed_out {
            warn!("inference command timed out");
            return Err(InferenceError::Transient(format!(
                "{program} timed out after {:?}",
                request.timeout
            )));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(exit_code = ?output.status.code(), "inference command failed");
            return Err(InferenceError::Transient(format!(
                "{program} exited with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        if output.stdout_truncated > 0 {
            warn!(
                truncated = output.stdout_truncated,
                "inference response truncated"
            );
            // A cut-off answer would be parsed as the agent's final message.
            return Err(InferenceError::Permanent(format!(
                "{program} response exceeded {} bytes ({} bytes dropped)",
                self.output_limit_bytes, output.stdout_truncated
            )));
        }
        let response = String::from_utf8(output.stdout)
            .map_err(|_| InferenceError::Permanent(format!("{program} returned invalid UTF-8")))?;
        if response.trim().is_empty() {
            return Err(InferenceError::Permanent(format!(
                "{program} returned an empty response"
            )));
        }
        debug!(response_bytes = response.len(), "inference completed");
        Ok(response)
    }
}

/// Why [`complete_with_retry`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    Inference(InferenceError),
    Interrupted(Interrupt),
}

/// Call the agent, retrying transient failures with exponential backoff.
///
/// Each call's timeout is clamped to the remaining session budget. A
/// transient failure on the last attempt is reported as permanent.
#[instrument(skip_all, fields(max_attempts = policy.max_attempts))]
pub fn complete_with_retry<A: Agent + ?Sized>(
    agent: &A,
    prompt: &str,
    timeout: Duration,
    policy: &RetryPolicy,
    budget: &SessionBudget,
) -> Result<String, CallError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut rng = rand::thread_rng();
    let mut attempt = 1;
    loop {
        budget.check().map_err(CallError::Interrupted)?;
        let request = InferenceRequest {
            prompt: prompt.to_string(),
            timeout: budget.clamp(timeout),
        };
        match agent.complete(&request) {
            Ok(response) => {
                budget.check().map_err(CallError::Interrupted)?;
                return Ok(response);
            }
            Err(InferenceError::Transient(message)) if attempt < max_attempts => {
                let delay = policy.delay_for(attempt, rng.gen_range(0.5..=1.0));
                info!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %message,
                    "retrying inference after transient failure"
                );
                budget.sleep(delay).map_err(CallError::Interrupted)?;
                attempt += 1;
            }
            Err(InferenceError::Transient(message)) => {
                warn!(attempt, %message, "inference retries exhausted");
                return Err(CallError::Inference(InferenceError::Permanent(format!(
                    "gave up after {attempt} attempts: {message}"
                ))));
            }
            Err(err) => {
                warn!(attempt, err = %err, "inference failed permanently");
                return Err(CallError::Inference(err));
            }
        }
    }
}
