//! End-to-end session and round tests over scripted collaborators.

use std::fs;
use std::time::Duration;

use refiner::core::backoff::RetryPolicy;
use refiner::core::budget::CancelToken;
use refiner::core::types::{DryRunOutcome, FailureReason, SessionStatus};
use refiner::io::prompt::PromptAssembler;
use refiner::rounds::{RoundsRequest, RoundsStop, run_rounds};
use refiner::session::{SessionConfig, run_session};
use refiner::test_support::{ScriptedAgent, ScriptedBroker, ScriptedDryRunner, vars_with};

fn config(max_steps: u32) -> SessionConfig {
    SessionConfig {
        max_steps,
        conclusion_retries: 1,
        session_timeout: Duration::from_secs(60),
        tool_timeout: Duration::from_secs(5),
        inference_timeout: Duration::from_secs(5),
        retry: RetryPolicy::immediate(1),
    }
}

#[test]
fn investigate_then_conclude_keeps_original_build_script() {
    let agent = ScriptedAgent::new([
        "Let me look at the headers first.\n<bash>grep -rn png_read_info include/</bash>",
        "<conclusion>Read the header before the chunks.</conclusion>\n<fuzz target>A'</fuzz target>",
    ]);
    let broker = ScriptedBroker::default();

    let session = run_session(
        "libpng-1",
        vars_with("A", "B"),
        &PromptAssembler::new(),
        &agent,
        &broker,
        &config(5),
        &CancelToken::new(),
    )
    .expect("session");

    assert_eq!(session.status(), SessionStatus::Done);
    assert_eq!(session.steps(), 2);
    assert_eq!(broker.commands(), ["grep -rn png_read_info include/"]);
    let extraction = session.extraction().expect("extraction");
    assert!(extraction.valid);
    assert_eq!(extraction.fuzz_target, "A'");
    assert_eq!(extraction.build_script, "B");
    assert!(!extraction.build_script_changed);

    // The second prompt carries the tool output back to the agent.
    let prompts = agent.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("grep -rn png_read_info include/"));
}

#[test]
fn agent_that_never_concludes_hits_the_step_limit() {
    let agent = ScriptedAgent::new(std::iter::repeat_n("<bash>ls</bash>", 6));
    let broker = ScriptedBroker::default();

    let session = run_session(
        "libpng-2",
        vars_with("A", "B"),
        &PromptAssembler::new(),
        &agent,
        &broker,
        &config(5),
        &CancelToken::new(),
    )
    .expect("session");

    assert_eq!(
        session.status(),
        SessionStatus::Failed {
            reason: FailureReason::StepLimitExceeded
        }
    );
    assert_eq!(session.steps(), 6);
    // The forced turn's request is not executed.
    assert_eq!(broker.executed().len(), 5);
    let extraction = session.extraction().expect("extraction");
    assert!(!extraction.valid);
    assert_eq!(
        extraction.failure_reason.as_deref(),
        Some("step_limit_exceeded")
    );
}

#[test]
fn failed_dry_run_feeds_the_next_round() {
    let temp = tempfile::tempdir().expect("tempdir");
    let run_dir = temp.path().join("libpng-run");
    let agent = ScriptedAgent::new([
        "<conclusion>first try</conclusion>\n<fuzz target>A1</fuzz target>\n<build script>B1</build script>",
        "<conclusion>declare the helper</conclusion>\n<fuzz target>A2</fuzz target>",
    ]);
    let broker = ScriptedBroker::default();
    let dry_runner = ScriptedDryRunner::new([DryRunOutcome::Fail, DryRunOutcome::Pass]);
    let session_config = config(3);
    let mut seen = Vec::new();

    let outcome = run_rounds(
        RoundsRequest {
            run_id: "libpng-run",
            item_id: "libpng",
            vars: vars_with("A", "B"),
            max_rounds: 3,
            session: &session_config,
            cancel: &CancelToken::new(),
            scratch: temp.path(),
            run_dir: Some(&run_dir),
        },
        &PromptAssembler::new(),
        &agent,
        &broker,
        &dry_runner,
        |round| seen.push((round.round, round.prior_dry_run)),
    )
    .expect("rounds");

    assert_eq!(outcome.stop, RoundsStop::Succeeded);
    assert_eq!(
        seen,
        [(1, DryRunOutcome::Skipped), (2, DryRunOutcome::Fail)]
    );
    assert_eq!(dry_runner.targets(), ["A1", "A2"]);

    // Round two starts from round one's artifacts and sees the build log.
    let second_prompt = &agent.prompts()[1];
    assert!(second_prompt.contains("A1"));
    assert!(second_prompt.contains("B1"));
    assert!(second_prompt.contains("undeclared identifier"));

    let last_good = outcome.last_good.as_ref().expect("last good");
    assert_eq!(last_good.fuzz_target, "A2");
    assert_eq!(last_good.build_script, "B1");
    assert_eq!(outcome.last_good_round, Some(2));

    assert!(run_dir.join("round-1/build.sh").exists());
    assert!(!run_dir.join("round-2/build.sh").exists());
    assert_eq!(
        fs::read_to_string(run_dir.join("round-2/fuzz_target.c")).expect("fuzz target"),
        "A2\n"
    );
    let summary: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(run_dir.join("summary.json")).expect("summary"),
    )
    .expect("summary json");
    assert_eq!(summary["succeeded"], true);
    assert_eq!(summary["rounds"], 2);
}
