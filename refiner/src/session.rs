//! Session controller: one bounded investigate-then-conclude conversation.
//!
//! ```text
//! INIT -> GATHERING -> CONCLUDING -> DONE
//!            |             |
//!            +-------------+--> FAILED(reason)
//! ```
//!
//! Each agent response is one agent turn and advances the step counter by
//! one. After `max_steps` normal turns the agent gets exactly one forced
//! final prompt; a response without conclusion markers there ends the session
//! with `step_limit_exceeded`. Conclusion markers win over tool requests in
//! the same response. The transcript is append-only and is kept, together
//! with the terminal status, for the audit log.

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::RetryPolicy;
use crate::core::budget::{CancelToken, SessionBudget};
use crate::core::conclusion::{has_closed_block, has_conclusion_markers, parse_conclusion};
use crate::core::tool_request::find_tool_request;
use crate::core::types::{
    DryRunFailure, ExtractionResult, FailureReason, SessionStatus, ToolCommand, Turn,
};
use crate::io::agent::{Agent, CallError, complete_with_retry};
use crate::io::broker::ToolBroker;
use crate::io::config::RefinerConfig;
use crate::io::prompt::{PromptAssembler, PromptVars};

/// Limits for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_steps: u32,
    pub conclusion_retries: u32,
    pub session_timeout: Duration,
    pub tool_timeout: Duration,
    pub inference_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&RefinerConfig::default())
    }
}

impl SessionConfig {
    pub fn from_config(cfg: &RefinerConfig) -> Self {
        Self {
            max_steps: cfg.max_steps,
            conclusion_retries: cfg.conclusion_retries,
            session_timeout: cfg.session_timeout(),
            tool_timeout: Duration::from_secs(cfg.tool.timeout_secs),
            inference_timeout: Duration::from_secs(cfg.inference.timeout_secs),
            retry: cfg.retry_policy(),
        }
    }
}

/// Rejected status change.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("session {id}: invalid transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub id: String,
    pub from: SessionStatus,
    pub to: SessionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    id: String,
    vars: PromptVars,
    status: SessionStatus,
    steps: u32,
    transcript: Vec<Turn>,
    extraction: Option<ExtractionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_message: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, vars: PromptVars) -> Self {
        Self {
            id: id.into(),
            vars,
            status: SessionStatus::Init,
            steps: 0,
            transcript: Vec::new(),
            extraction: None,
            failure_message: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn vars(&self) -> &PromptVars {
        &self.vars
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Agent turns taken so far.
    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    pub fn extraction(&self) -> Option<&ExtractionResult> {
        self.extraction.as_ref()
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self.status {
            SessionStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn failure_message(&self) -> Option<&str> {
        self.failure_message.as_deref()
    }

    /// Move to `to`. Terminal statuses never change, and only the forward
    /// edges of the lifecycle are accepted.
    pub fn transition(&mut self, to: SessionStatus) -> Result<(), TransitionError> {
        use SessionStatus::{Concluding, Done, Failed, Gathering, Init};
        let allowed = match (self.status, to) {
            (from, _) if from.is_terminal() => false,
            (_, Failed { .. }) => true,
            (Init, Gathering) | (Gathering, Concluding) | (Concluding, Done) => true,
            _ => false,
        };
        if !allowed {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        debug!(session_id = %self.id, from = ?self.status, to = ?to, "session transition");
        self.status = to;
        Ok(())
    }

    /// Attach a failed build to the extraction. Validity is unchanged.
    pub fn attach_dry_run_failure(&mut self, failure: DryRunFailure) {
        if let Some(extraction) = self.extraction.as_mut().filter(|e| e.valid) {
            extraction.dry_run_failure = Some(failure);
        }
    }

    fn push(&mut self, turn: Turn) {
        self.transcript.push(turn);
    }

    fn push_agent(&mut self, turn: Turn) {
        self.steps += 1;
        self.transcript.push(turn);
    }

    fn fail(&mut self, reason: FailureReason, message: impl Into<String>) -> Result<(), TransitionError> {
        let message = message.into();
        self.transition(SessionStatus::Failed { reason })?;
        warn!(session_id = %self.id, reason = reason.as_str(), %message, steps = self.steps, "session failed");
        self.extraction = Some(ExtractionResult::invalid(reason.as_str()));
        self.failure_message = Some(message);
        Ok(())
    }
}

enum AgentReply {
    Response(String),
    Stopped,
}

/// Run one session to a terminal status.
///
/// `Err` is reserved for failures of the refiner itself; every session
/// outcome, including cancellation and inference failure, is an `Ok` session
/// with a terminal status.
#[instrument(skip_all, fields(session_id = %id.as_ref(), max_steps = config.max_steps))]
pub fn run_session<A, B>(
    id: impl AsRef<str>,
    vars: PromptVars,
    assembler: &PromptAssembler,
    agent: &A,
    broker: &B,
    config: &SessionConfig,
    cancel: &CancelToken,
) -> Result<Session>
where
    A: Agent + ?Sized,
    B: ToolBroker + ?Sized,
{
    let mut session = Session::new(id.as_ref(), vars);
    let budget = SessionBudget::new(config.session_timeout, cancel.clone());

    let initial = match assembler.initial(session.vars()) {
        Ok(prompt) => prompt,
        Err(err) => {
            session.fail(FailureReason::ConfigError, format!("{err:#}"))?;
            return Ok(session);
        }
    };
    session.push(Turn::system(initial));
    session.transition(SessionStatus::Gathering)?;
    info!("session started");

    let response = loop {
        let forced = session.steps >= config.max_steps;
        if forced {
            info!(steps = session.steps, "step budget spent, forcing conclusion");
            session.push(Turn::system(assembler.force_conclusion()));
        }

        let AgentReply::Response(response) = ask_agent(&mut session, assembler, agent, config, &budget)?
        else {
            return Ok(session);
        };

        let request = find_tool_request(&response);
        // A bare opening marker next to a command is prose; the command runs.
        let concluding = has_closed_block(&response)
            || ((forced || request.is_none()) && has_conclusion_markers(&response));
        if concluding {
            session.push_agent(Turn::agent(response.clone()));
            session.transition(SessionStatus::Concluding)?;
            break response;
        }
        if forced {
            session.push_agent(Turn::agent(response));
            session.fail(
                FailureReason::StepLimitExceeded,
                format!("no conclusion after {} agent turns", session.steps),
            )?;
            return Ok(session);
        }

        let Some(request) = request else {
            session.push_agent(Turn::agent(response));
            debug!(steps = session.steps, "response had no action");
            session.push(Turn::system(assembler.no_action()));
            continue;
        };

        let command = ToolCommand::new(
            request.command,
            session.vars().project_dir(),
            budget.clamp(config.tool_timeout),
        );
        session.push_agent(Turn::agent_with_command(response, command.clone()));
        if let Err(interrupt) = budget.check() {
            session.fail(FailureReason::Cancelled, interrupt.to_string())?;
            return Ok(session);
        }
        let result = broker.execute(&command);
        if let Err(interrupt) = budget.check() {
            // A result that arrives after cancellation is dropped.
            session.fail(FailureReason::Cancelled, interrupt.to_string())?;
            return Ok(session);
        }
        debug!(steps = session.steps, error = ?result.error.as_ref().map(|e| e.as_str()), "tool result");
        session.push(Turn::tool(command, result));
        if request.ignored > 0 {
            session.push(Turn::system(assembler.ignored_commands(request.ignored)));
        }
    };

    conclude(&mut session, response, assembler, agent, config, &budget)?;
    Ok(session)
}

fn conclude<A: Agent + ?Sized>(
    session: &mut Session,
    mut response: String,
    assembler: &PromptAssembler,
    agent: &A,
    config: &SessionConfig,
    budget: &SessionBudget,
) -> Result<()> {
    let mut retries = 0;
    loop {
        match parse_conclusion(&response) {
            Ok(conclusion) => {
                let extraction = conclusion.into_extraction(session.vars().build_text());
                info!(
                    steps = session.steps,
                    build_script_changed = extraction.build_script_changed,
                    "session concluded"
                );
                session.extraction = Some(extraction);
                session.transition(SessionStatus::Done)?;
                return Ok(());
            }
            Err(err) if retries >= config.conclusion_retries => {
                session.fail(FailureReason::MalformedConclusion, err.to_string())?;
                return Ok(());
            }
            Err(err) => {
                retries += 1;
                info!(retry = retries, problem = %err, "requesting corrected conclusion");
                session.push(Turn::system(assembler.correction(&err)?));
                let AgentReply::Response(next) = ask_agent(session, assembler, agent, config, budget)?
                else {
                    return Ok(());
                };
                session.push_agent(Turn::agent(next.clone()));
                response = next;
            }
        }
    }
}

/// Send the rendered transcript. On interruption or inference failure the
/// session is failed and [`AgentReply::Stopped`] is returned.
fn ask_agent<A: Agent + ?Sized>(
    session: &mut Session,
    assembler: &PromptAssembler,
    agent: &A,
    config: &SessionConfig,
    budget: &SessionBudget,
) -> Result<AgentReply> {
    let prompt = assembler.render_transcript(session.transcript())?;
    match complete_with_retry(agent, &prompt, config.inference_timeout, &config.retry, budget) {
        Ok(response) => Ok(AgentReply::Response(response)),
        Err(CallError::Interrupted(interrupt)) => {
            session.fail(FailureReason::Cancelled, interrupt.to_string())?;
            Ok(AgentReply::Stopped)
        }
        Err(CallError::Inference(err)) => {
            session.fail(FailureReason::InferenceError, err.to_string())?;
            Ok(AgentReply::Stopped)
        }
    }
}
