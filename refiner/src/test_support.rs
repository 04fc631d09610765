//! Scripted collaborators for session and round tests.
//!
//! None of these spawn processes; each replays a fixed script and records
//! what it was asked to do.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::thread;
use std::time::Duration;

use anyhow::Result;

use crate::core::budget::CancelToken;
use crate::core::types::{DryRunOutcome, ToolCommand, ToolResult};
use crate::error::InferenceError;
use crate::io::agent::{Agent, InferenceRequest};
use crate::io::broker::ToolBroker;
use crate::io::dry_run::{DryRunReport, DryRunRequest, DryRunner};
use crate::io::prompt::PromptVars;

pub const SAMPLE_FUZZ_TARGET: &str = "#include <png.h>\n\nint LLVMFuzzerTestOneInput(const uint8_t *data, size_t size) {\n  return 0;\n}";
pub const SAMPLE_BUILD_SCRIPT: &str = "./configure && make -j$(nproc)";

/// Valid prompt variables for a libpng fuzz target.
pub fn sample_vars() -> PromptVars {
    vars_with(SAMPLE_FUZZ_TARGET, SAMPLE_BUILD_SCRIPT)
}

/// Sample variables with explicit starting artifacts.
pub fn vars_with(fuzz_target: &str, build_text: &str) -> PromptVars {
    let values: BTreeMap<String, String> = [
        ("LANGUAGE", "C"),
        ("FUNCTION_SIGNATURE", "void png_read_info(png_structp png_ptr, png_infop info_ptr)"),
        ("PROJECT", "libpng"),
        ("PROJECT_DIR", "/src/libpng"),
        ("FUZZ_TARGET", fuzz_target),
        ("BUILD_TEXT", build_text),
        ("INSIGHTS", ""),
        ("SUGGESTIONS", ""),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    PromptVars::from_map(values).expect("sample vars are valid")
}

/// Agent that replays scripted responses and captures every prompt.
#[derive(Default)]
pub struct ScriptedAgent {
    replies: RefCell<VecDeque<Result<String, InferenceError>>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_results(responses.into_iter().map(|r| Ok(r.into())))
    }

    pub fn from_results<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<String, InferenceError>>,
    {
        Self {
            replies: RefCell::new(replies.into_iter().collect()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl Agent for ScriptedAgent {
    fn complete(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(InferenceError::Permanent("script exhausted".to_string())))
    }
}

/// Broker that replays scripted results; succeeds with `ok` once the script runs out.
#[derive(Default)]
pub struct ScriptedBroker {
    results: RefCell<VecDeque<ToolResult>>,
    commands: RefCell<Vec<ToolCommand>>,
    cancel_on_execute: Option<CancelToken>,
    delay: Option<Duration>,
}

impl ScriptedBroker {
    pub fn new<I: IntoIterator<Item = ToolResult>>(results: I) -> Self {
        Self {
            results: RefCell::new(results.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Trip `cancel` while a command is running.
    pub fn cancel_on_execute(mut self, cancel: CancelToken) -> Self {
        self.cancel_on_execute = Some(cancel);
        self
    }

    /// Block for `delay` on every command, like a slow tool.
    pub fn delay_on_execute(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Command texts in execution order.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .borrow()
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn executed(&self) -> Vec<ToolCommand> {
        self.commands.borrow().clone()
    }
}

impl ToolBroker for ScriptedBroker {
    fn execute(&self, command: &ToolCommand) -> ToolResult {
        self.commands.borrow_mut().push(command.clone());
        if let Some(cancel) = &self.cancel_on_execute {
            cancel.cancel();
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.results.borrow_mut().pop_front().unwrap_or_else(|| ToolResult {
            stdout: "ok".to_string(),
            exit_code: Some(0),
            ..ToolResult::default()
        })
    }
}

/// Dry runner that replays outcomes; passes once the script runs out.
#[derive(Default)]
pub struct ScriptedDryRunner {
    reports: RefCell<VecDeque<DryRunReport>>,
    targets: RefCell<Vec<String>>,
}

impl ScriptedDryRunner {
    pub fn new<I: IntoIterator<Item = DryRunOutcome>>(outcomes: I) -> Self {
        let reports = outcomes
            .into_iter()
            .map(|outcome| DryRunReport {
                outcome,
                log: match outcome {
                    DryRunOutcome::Fail => "error: use of undeclared identifier 'png_fuzz'".to_string(),
                    _ => String::new(),
                },
                exit_code: match outcome {
                    DryRunOutcome::Pass => Some(0),
                    DryRunOutcome::Fail => Some(1),
                    DryRunOutcome::Skipped => None,
                },
                timed_out: false,
            })
            .collect();
        Self {
            reports: RefCell::new(reports),
            targets: RefCell::new(Vec::new()),
        }
    }

    /// Fuzz targets handed to the dry runner, in order.
    pub fn targets(&self) -> Vec<String> {
        self.targets.borrow().clone()
    }
}

impl DryRunner for ScriptedDryRunner {
    fn run(&self, request: &DryRunRequest<'_>) -> Result<DryRunReport> {
        self.targets
            .borrow_mut()
            .push(request.fuzz_target.to_string());
        Ok(self.reports.borrow_mut().pop_front().unwrap_or(DryRunReport {
            outcome: DryRunOutcome::Pass,
            log: String::new(),
            exit_code: Some(0),
            timed_out: false,
        }))
    }
}
