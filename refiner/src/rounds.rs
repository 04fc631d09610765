//! Iteration policy: repeated sessions over the same work item.
//!
//! Round n+1 starts from what round n produced. A concluded session whose
//! artifacts fail the dry run hands its fuzz target, merged build script and
//! build log to the next round. A session that ran out of steps (or produced
//! one malformed answer) is simply retried with the same inputs.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::budget::CancelToken;
use crate::core::types::{DryRunOutcome, ExtractionResult, FailureReason, SessionStatus};
use crate::io::agent::Agent;
use crate::io::artifacts::{RoundMeta, RoundWriteRequest, RunSummary, write_round, write_summary};
use crate::io::broker::ToolBroker;
use crate::io::dry_run::{DryRunReport, DryRunRequest, DryRunner};
use crate::io::prompt::{PromptAssembler, PromptVars};
use crate::session::{Session, SessionConfig, run_session};

/// Consecutive malformed conclusions that end the run.
pub const MALFORMED_LIMIT: u32 = 2;

/// Build log bytes carried into the next round's suggestions.
const FEEDBACK_LOG_BYTES: usize = 4_000;

/// One session plus what the previous round's dry run reported.
#[derive(Debug, Clone)]
pub struct RefinementRound {
    /// 1-based.
    pub round: u32,
    pub prior_dry_run: DryRunOutcome,
    pub session: Session,
    pub dry_run: DryRunReport,
}

/// Why `run_rounds` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundsStop {
    /// The dry run passed, or the session concluded with no dry run configured.
    Succeeded,
    /// `max_rounds` ran without success.
    RoundsExhausted,
    /// A failure that another round would not fix.
    Fatal {
        reason: FailureReason,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct RefineOutcome {
    pub run_id: String,
    pub item_id: String,
    pub rounds: Vec<RefinementRound>,
    pub stop: RoundsStop,
    /// Last valid extraction, even when the run as a whole failed.
    pub last_good: Option<ExtractionResult>,
    pub last_good_round: Option<u32>,
}

impl RefineOutcome {
    pub fn succeeded(&self) -> bool {
        self.stop == RoundsStop::Succeeded
    }

    /// Machine-readable reason for a failed run.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.stop {
            RoundsStop::Succeeded => None,
            RoundsStop::Fatal { reason, .. } => Some(*reason),
            RoundsStop::RoundsExhausted => self
                .rounds
                .last()
                .and_then(|round| round.session.failure_reason()),
        }
    }

    pub fn summary(&self) -> RunSummary {
        let message = match &self.stop {
            RoundsStop::Succeeded => None,
            RoundsStop::RoundsExhausted => Some(format!(
                "no successful round after {} round(s)",
                self.rounds.len()
            )),
            RoundsStop::Fatal { message, .. } => Some(message.clone()),
        };
        RunSummary {
            run_id: self.run_id.clone(),
            item_id: self.item_id.clone(),
            succeeded: self.succeeded(),
            rounds: self.rounds.len() as u32,
            reason: self.failure_reason(),
            message,
            last_good: self.last_good.clone(),
            last_good_round: self.last_good_round,
        }
    }
}

pub struct RoundsRequest<'a> {
    pub run_id: &'a str,
    pub item_id: &'a str,
    pub vars: PromptVars,
    pub max_rounds: u32,
    pub session: &'a SessionConfig,
    pub cancel: &'a CancelToken,
    /// Per-item scratch area (dry-run staging).
    pub scratch: &'a Path,
    /// Artifact root for this run; `None` skips writing artifacts.
    pub run_dir: Option<&'a Path>,
}

/// Run refinement rounds until success, a fatal failure, or `max_rounds`.
///
/// `Err` is reserved for failures of the refiner itself (artifact I/O, a dry
/// runner that could not stage files); session outcomes are data.
#[instrument(skip_all, fields(run_id = %request.run_id, item_id = %request.item_id, max_rounds = request.max_rounds))]
pub fn run_rounds<A, B, D, F>(
    request: RoundsRequest<'_>,
    assembler: &PromptAssembler,
    agent: &A,
    broker: &B,
    dry_runner: &D,
    mut on_round: F,
) -> Result<RefineOutcome>
where
    A: Agent + ?Sized,
    B: ToolBroker + ?Sized,
    D: DryRunner + ?Sized,
    F: FnMut(&RefinementRound),
{
    let mut vars = request.vars;
    let mut prior_dry_run = DryRunOutcome::Skipped;
    let mut consecutive_malformed = 0u32;
    let mut outcome = RefineOutcome {
        run_id: request.run_id.to_string(),
        item_id: request.item_id.to_string(),
        rounds: Vec::new(),
        stop: RoundsStop::RoundsExhausted,
        last_good: None,
        last_good_round: None,
    };

    for round in 1..=request.max_rounds {
        let started_at = Utc::now();
        let start = Instant::now();
        let session_id = format!("{}-round-{round}", request.item_id);
        let mut session = run_session(
            &session_id,
            vars.clone(),
            assembler,
            agent,
            broker,
            request.session,
            request.cancel,
        )?;

        let mut dry_run = DryRunReport::skipped();
        if let Some(extraction) = session.extraction().filter(|e| e.valid).cloned() {
            let project_dir = session.vars().project_dir();
            dry_run = dry_runner
                .run(&DryRunRequest {
                    project_dir: &project_dir,
                    language: session.vars().language(),
                    fuzz_target: &extraction.fuzz_target,
                    build_script: &extraction.build_script,
                    scratch: request.scratch,
                })
                .with_context(|| format!("dry run for round {round}"))?;
            if let Some(failure) = dry_run.failure() {
                session.attach_dry_run_failure(failure);
            }
            outcome.last_good = session.extraction().cloned();
            outcome.last_good_round = Some(round);
        }
        info!(
            round,
            status = ?session.status(),
            steps = session.steps(),
            dry_run = ?dry_run.outcome,
            "round finished"
        );

        if let Some(run_dir) = request.run_dir {
            let ended_at = Utc::now();
            let meta = RoundMeta {
                run_id: request.run_id.to_string(),
                item_id: request.item_id.to_string(),
                round,
                session_id: session_id.clone(),
                status: session.status(),
                steps: session.steps(),
                dry_run: dry_run.outcome,
                build_script_changed: session
                    .extraction()
                    .is_some_and(|e| e.build_script_changed),
                started_at: started_at.to_rfc3339(),
                ended_at: ended_at.to_rfc3339(),
                duration_ms: start.elapsed().as_millis() as u64,
            };
            let log = (dry_run.outcome != DryRunOutcome::Skipped).then_some(dry_run.log.as_str());
            write_round(&RoundWriteRequest {
                run_dir,
                meta: &meta,
                session: &session,
                dry_run_log: log,
            })?;
        }

        let record = RefinementRound {
            round,
            prior_dry_run,
            session,
            dry_run,
        };
        on_round(&record);
        prior_dry_run = record.dry_run.outcome;

        let next = match record.session.status() {
            SessionStatus::Done => {
                consecutive_malformed = 0;
                match record.dry_run.outcome {
                    DryRunOutcome::Pass | DryRunOutcome::Skipped => {
                        outcome.stop = RoundsStop::Succeeded;
                        None
                    }
                    DryRunOutcome::Fail => record
                        .session
                        .extraction()
                        .map(|extraction| carry_forward(&vars, extraction, &record.dry_run)),
                }
            }
            SessionStatus::Failed { reason } => match reason {
                FailureReason::StepLimitExceeded => {
                    consecutive_malformed = 0;
                    Some(vars.clone())
                }
                FailureReason::MalformedConclusion => {
                    consecutive_malformed += 1;
                    if consecutive_malformed >= MALFORMED_LIMIT {
                        outcome.stop = RoundsStop::Fatal {
                            reason,
                            message: format!(
                                "malformed conclusion in {consecutive_malformed} consecutive rounds"
                            ),
                        };
                        None
                    } else {
                        Some(vars.clone())
                    }
                }
                FailureReason::InferenceError
                | FailureReason::Cancelled
                | FailureReason::ConfigError => {
                    outcome.stop = RoundsStop::Fatal {
                        reason,
                        message: record
                            .session
                            .failure_message()
                            .unwrap_or(reason.as_str())
                            .to_string(),
                    };
                    None
                }
            },
            status => {
                warn!(?status, "session returned without a terminal status");
                outcome.stop = RoundsStop::Fatal {
                    reason: FailureReason::ConfigError,
                    message: format!("session ended in non-terminal status {status:?}"),
                };
                None
            }
        };
        outcome.rounds.push(record);
        match next {
            Some(next_vars) => vars = next_vars,
            None => break,
        }
    }

    if outcome.stop == RoundsStop::RoundsExhausted {
        warn!(rounds = outcome.rounds.len(), "rounds exhausted without success");
    }
    if let Some(run_dir) = request.run_dir {
        write_summary(run_dir, &outcome.summary())?;
    }
    Ok(outcome)
}

/// Inputs for the round after a failed dry run.
fn carry_forward(vars: &PromptVars, extraction: &ExtractionResult, report: &DryRunReport) -> PromptVars {
    vars.clone()
        .with_artifacts(&extraction.fuzz_target, &extraction.build_script)
        .with_suggestion(&dry_run_feedback(report))
}

fn dry_run_feedback(report: &DryRunReport) -> String {
    let status = if report.timed_out {
        "timed out".to_string()
    } else {
        match report.exit_code {
            Some(code) => format!("exited with status {code}"),
            None => "could not run".to_string(),
        }
    };
    format!(
        "The previous refinement of this fuzz target failed to build ({status}). Fix the errors below while keeping the coverage improvements.\n\n```\n{}\n```",
        log_tail(report.log.trim(), FEEDBACK_LOG_BYTES)
    )
}

/// Last `max` bytes of `text`, cut at a char boundary.
fn log_tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::backoff::RetryPolicy;
    use crate::error::InferenceError;
    use crate::test_support::{ScriptedAgent, ScriptedBroker, ScriptedDryRunner, sample_vars};

    fn session_config() -> SessionConfig {
        SessionConfig {
            max_steps: 2,
            conclusion_retries: 0,
            session_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(5),
            inference_timeout: Duration::from_secs(5),
            retry: RetryPolicy::immediate(1),
        }
    }

    fn answer(target: &str) -> String {
        format!("<conclusion>refined</conclusion><fuzz target>{target}</fuzz target>")
    }

    fn run(
        agent: &ScriptedAgent,
        dry_runner: &ScriptedDryRunner,
        max_rounds: u32,
        run_dir: Option<&Path>,
    ) -> RefineOutcome {
        let scratch = tempfile::tempdir().expect("scratch");
        let config = session_config();
        let cancel = CancelToken::new();
        run_rounds(
            RoundsRequest {
                run_id: "run-1",
                item_id: "libpng",
                vars: sample_vars(),
                max_rounds,
                session: &config,
                cancel: &cancel,
                scratch: scratch.path(),
                run_dir,
            },
            &PromptAssembler::new(),
            agent,
            &ScriptedBroker::default(),
            dry_runner,
            |_| {},
        )
        .expect("rounds")
    }

    #[test]
    fn stops_when_dry_run_passes() {
        let agent = ScriptedAgent::new([answer("T1")]);
        let dry_runner = ScriptedDryRunner::new([DryRunOutcome::Pass]);
        let outcome = run(&agent, &dry_runner, 3, None);
        assert!(outcome.succeeded());
        assert_eq!(outcome.rounds.len(), 1);
        assert_eq!(outcome.last_good.as_ref().map(|e| e.fuzz_target.as_str()), Some("T1"));
    }

    #[test]
    fn failed_dry_run_feeds_next_round() {
        let agent = ScriptedAgent::new([answer("T1"), answer("T2")]);
        let dry_runner = ScriptedDryRunner::new([DryRunOutcome::Fail, DryRunOutcome::Pass]);
        let outcome = run(&agent, &dry_runner, 3, None);
        assert!(outcome.succeeded());
        assert_eq!(outcome.rounds.len(), 2);
        assert_eq!(dry_runner.targets(), ["T1", "T2"]);

        let second = &outcome.rounds[1];
        assert_eq!(second.prior_dry_run, DryRunOutcome::Fail);
        assert_eq!(second.session.vars().fuzz_target(), "T1");
        assert!(second.session.vars().suggestions().contains("undeclared identifier"));
        // Round one keeps its extraction valid with the build failure attached.
        let first = outcome.rounds[0].session.extraction().expect("extraction");
        assert!(first.valid);
        assert!(first.dry_run_failure.is_some());
    }

    #[test]
    fn step_limit_retries_with_same_inputs() {
        let agent = ScriptedAgent::new([
            "<bash>ls</bash>".to_string(),
            "<bash>ls</bash>".to_string(),
            "still looking".to_string(),
            answer("T1"),
        ]);
        let dry_runner = ScriptedDryRunner::default();
        let outcome = run(&agent, &dry_runner, 3, None);
        assert!(outcome.succeeded());
        assert_eq!(outcome.rounds.len(), 2);
        assert_eq!(
            outcome.rounds[0].session.failure_reason(),
            Some(FailureReason::StepLimitExceeded)
        );
        assert_eq!(
            outcome.rounds[1].session.vars(),
            outcome.rounds[0].session.vars()
        );
    }

    #[test]
    fn two_malformed_rounds_are_fatal() {
        let agent = ScriptedAgent::new(["<conclusion>a</conclusion>", "<conclusion>b</conclusion>"]);
        let dry_runner = ScriptedDryRunner::default();
        let outcome = run(&agent, &dry_runner, 5, None);
        assert_eq!(outcome.rounds.len(), 2);
        assert_eq!(
            outcome.failure_reason(),
            Some(FailureReason::MalformedConclusion)
        );
        assert!(matches!(outcome.stop, RoundsStop::Fatal { .. }));
        assert!(outcome.last_good.is_none());
    }

    #[test]
    fn inference_failure_is_fatal_and_keeps_last_good() {
        let agent = ScriptedAgent::from_results([
            Ok(answer("T1")),
            Err(InferenceError::Permanent("quota exhausted".into())),
        ]);
        let dry_runner = ScriptedDryRunner::new([DryRunOutcome::Fail]);
        let outcome = run(&agent, &dry_runner, 3, None);
        assert_eq!(outcome.failure_reason(), Some(FailureReason::InferenceError));
        assert_eq!(outcome.last_good_round, Some(1));
        assert_eq!(outcome.last_good.as_ref().map(|e| e.fuzz_target.as_str()), Some("T1"));
        let summary = outcome.summary();
        assert!(!summary.succeeded);
        assert!(summary.message.is_some_and(|m| m.contains("quota exhausted")));
    }

    #[test]
    fn rounds_exhausted_when_builds_keep_failing() {
        let agent = ScriptedAgent::new([answer("T1"), answer("T2")]);
        let dry_runner = ScriptedDryRunner::new([DryRunOutcome::Fail, DryRunOutcome::Fail]);
        let outcome = run(&agent, &dry_runner, 2, None);
        assert_eq!(outcome.stop, RoundsStop::RoundsExhausted);
        assert_eq!(outcome.failure_reason(), None);
        assert_eq!(outcome.last_good_round, Some(2));
    }

    #[test]
    fn writes_round_artifacts_and_summary() {
        let out = tempfile::tempdir().expect("out");
        let run_dir = out.path().join("run-1");
        let agent = ScriptedAgent::new([
            "<conclusion>x</conclusion><fuzz target>T1</fuzz target><build script>make fuzz</build script>",
        ]);
        let dry_runner = ScriptedDryRunner::new([DryRunOutcome::Pass]);
        let outcome = run(&agent, &dry_runner, 1, Some(&run_dir));
        assert!(outcome.succeeded());

        let round_dir = run_dir.join("round-1");
        assert_eq!(
            std::fs::read_to_string(round_dir.join("fuzz_target.c")).expect("target"),
            "T1\n"
        );
        assert_eq!(
            std::fs::read_to_string(round_dir.join("build.sh")).expect("build"),
            "make fuzz\n"
        );
        assert!(round_dir.join("session.json").is_file());
        assert!(round_dir.join("meta.json").is_file());
        assert!(round_dir.join("dry_run.log").is_file());
        assert!(run_dir.join("summary.json").is_file());
    }

    #[test]
    fn log_tail_respects_char_boundaries() {
        assert_eq!(log_tail("abc", 10), "abc");
        assert_eq!(log_tail("héllo", 4), "llo");
    }
}
