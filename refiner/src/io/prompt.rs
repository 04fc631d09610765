//! Prompt assembly: the initial prompt, transcript continuations and the
//! fixed controller messages.
//!
//! Templates are minijinja with strict undefined behaviour, so a template that
//! names a variable outside the placeholder set fails instead of rendering an
//! empty string.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior, context};
use serde::Serialize;
use tracing::debug;

use crate::core::conclusion::ConclusionError;
use crate::core::types::{Role, Turn};
use crate::error::ConfigError;

const INITIAL_TEMPLATE: &str = include_str!("prompts/initial.md");
const TRANSCRIPT_TEMPLATE: &str = include_str!("prompts/transcript.md");
const FORCE_CONCLUSION_TEMPLATE: &str = include_str!("prompts/force_conclusion.md");
const CORRECTION_TEMPLATE: &str = include_str!("prompts/correction.md");
const NO_ACTION_TEMPLATE: &str = include_str!("prompts/no_action.md");

/// The fixed set of template placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Placeholder {
    Language,
    FunctionSignature,
    Project,
    ProjectDir,
    FuzzTarget,
    BuildText,
    Insights,
    Suggestions,
}

impl Placeholder {
    pub const ALL: [Placeholder; 8] = [
        Placeholder::Language,
        Placeholder::FunctionSignature,
        Placeholder::Project,
        Placeholder::ProjectDir,
        Placeholder::FuzzTarget,
        Placeholder::BuildText,
        Placeholder::Insights,
        Placeholder::Suggestions,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Placeholder::Language => "LANGUAGE",
            Placeholder::FunctionSignature => "FUNCTION_SIGNATURE",
            Placeholder::Project => "PROJECT",
            Placeholder::ProjectDir => "PROJECT_DIR",
            Placeholder::FuzzTarget => "FUZZ_TARGET",
            Placeholder::BuildText => "BUILD_TEXT",
            Placeholder::Insights => "INSIGHTS",
            Placeholder::Suggestions => "SUGGESTIONS",
        }
    }

    /// Required placeholders must be present and non-empty; optional ones
    /// must be present but may be empty.
    pub fn is_required(self) -> bool {
        !matches!(
            self,
            Placeholder::BuildText | Placeholder::Insights | Placeholder::Suggestions
        )
    }

    /// Case-insensitive lookup, tolerating `{LANGUAGE}` style braces.
    pub fn parse(key: &str) -> Option<Self> {
        let key = key.trim().trim_start_matches('{').trim_end_matches('}');
        Self::ALL
            .into_iter()
            .find(|placeholder| placeholder.key().eq_ignore_ascii_case(key))
    }
}

/// Validated placeholder values for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PromptVars {
    language: String,
    function_signature: String,
    project: String,
    project_dir: String,
    fuzz_target: String,
    build_text: String,
    insights: String,
    suggestions: String,
}

impl PromptVars {
    /// Build from a key/value map. Every placeholder must be present exactly
    /// once (keys match case-insensitively), unknown keys are rejected, and
    /// required placeholders must be non-empty.
    pub fn from_map(values: BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut known: BTreeMap<Placeholder, String> = BTreeMap::new();
        let mut unknown = Vec::new();
        for (key, value) in values {
            match Placeholder::parse(&key) {
                Some(placeholder) if known.contains_key(&placeholder) => {
                    return Err(ConfigError::Invalid(format!(
                        "placeholder {} is given more than once (as `{key}`)",
                        placeholder.key()
                    )));
                }
                Some(placeholder) => {
                    known.insert(placeholder, value);
                }
                None => unknown.push(key),
            }
        }
        if !unknown.is_empty() {
            return Err(ConfigError::UnknownPlaceholders(unknown));
        }

        let missing: Vec<String> = Placeholder::ALL
            .into_iter()
            .filter(|placeholder| !known.contains_key(placeholder))
            .map(|placeholder| placeholder.key().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingPlaceholders(missing));
        }
        if let Some(empty) = Placeholder::ALL.into_iter().find(|placeholder| {
            placeholder.is_required()
                && known
                    .get(placeholder)
                    .is_none_or(|value| value.trim().is_empty())
        }) {
            return Err(ConfigError::EmptyPlaceholder(empty.key().to_string()));
        }

        let mut take = |placeholder: Placeholder| known.remove(&placeholder).unwrap_or_default();
        Ok(Self {
            language: take(Placeholder::Language),
            function_signature: take(Placeholder::FunctionSignature),
            project: take(Placeholder::Project),
            project_dir: take(Placeholder::ProjectDir),
            fuzz_target: take(Placeholder::FuzzTarget),
            build_text: take(Placeholder::BuildText),
            insights: take(Placeholder::Insights),
            suggestions: take(Placeholder::Suggestions),
        })
    }

    pub fn get(&self, placeholder: Placeholder) -> &str {
        match placeholder {
            Placeholder::Language => &self.language,
            Placeholder::FunctionSignature => &self.function_signature,
            Placeholder::Project => &self.project,
            Placeholder::ProjectDir => &self.project_dir,
            Placeholder::FuzzTarget => &self.fuzz_target,
            Placeholder::BuildText => &self.build_text,
            Placeholder::Insights => &self.insights,
            Placeholder::Suggestions => &self.suggestions,
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn project_dir(&self) -> PathBuf {
        PathBuf::from(&self.project_dir)
    }

    pub fn fuzz_target(&self) -> &str {
        &self.fuzz_target
    }

    pub fn build_text(&self) -> &str {
        &self.build_text
    }

    pub fn suggestions(&self) -> &str {
        &self.suggestions
    }

    /// Carry refined artifacts into the next round.
    pub fn with_artifacts(mut self, fuzz_target: &str, build_text: &str) -> Self {
        if !fuzz_target.trim().is_empty() {
            self.fuzz_target = fuzz_target.to_string();
        }
        self.build_text = build_text.to_string();
        self
    }

    /// Append feedback for the next round to `SUGGESTIONS`.
    pub fn with_suggestion(mut self, feedback: &str) -> Self {
        let feedback = feedback.trim();
        if feedback.is_empty() {
            return self;
        }
        if !self.suggestions.trim().is_empty() {
            self.suggestions.push_str("\n\n");
        }
        self.suggestions.push_str(feedback);
        self
    }

    /// Placeholder values with non-empty text, used to validate operator templates.
    fn probe() -> Self {
        Self {
            language: "C".to_string(),
            function_signature: "int f(void)".to_string(),
            project: "probe".to_string(),
            project_dir: "/probe".to_string(),
            fuzz_target: "int main(void) { return 0; }".to_string(),
            build_text: "make".to_string(),
            insights: "none".to_string(),
            suggestions: "none".to_string(),
        }
    }
}

/// Transcript turn flattened for the template.
#[derive(Debug, Serialize)]
struct TurnView<'a> {
    role: &'static str,
    content: &'a str,
    command: &'a str,
    returncode: String,
    error: Option<&'static str>,
    stdout: &'a str,
    stderr: &'a str,
}

impl<'a> TurnView<'a> {
    fn from_turn(turn: &'a Turn) -> Self {
        let role = match turn.role {
            Role::Agent => "agent",
            Role::Tool => "tool",
            Role::System => "system",
        };
        let result = turn.tool_result.as_ref();
        Self {
            role,
            content: turn.content.trim_end(),
            command: turn
                .tool_command
                .as_ref()
                .map_or(turn.content.as_str(), |cmd| cmd.command.as_str()),
            returncode: result
                .and_then(|r| r.exit_code)
                .map_or_else(|| "none".to_string(), |code| code.to_string()),
            error: result.and_then(|r| r.error.as_ref()).map(|e| e.as_str()),
            stdout: result.map_or("", |r| r.stdout.trim_end()),
            stderr: result.map_or("", |r| r.stderr.trim_end()),
        }
    }
}

/// Renders every prompt the session controller sends.
pub struct PromptAssembler {
    env: Environment<'static>,
    initial_override: Option<String>,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptAssembler {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_template("initial", INITIAL_TEMPLATE)
            .expect("initial template should be valid");
        env.add_template("transcript", TRANSCRIPT_TEMPLATE)
            .expect("transcript template should be valid");
        env.add_template("correction", CORRECTION_TEMPLATE)
            .expect("correction template should be valid");
        Self {
            env,
            initial_override: None,
        }
    }

    /// Replace the built-in initial prompt with an operator template.
    ///
    /// The template is rendered once against probe values so syntax errors and
    /// variables outside the placeholder set surface before any session starts.
    pub fn with_initial_template(mut self, source: impl Into<String>) -> Result<Self, ConfigError> {
        let source = source.into();
        if source.trim().is_empty() {
            return Err(ConfigError::Template("template is empty".to_string()));
        }
        self.env
            .render_str(&source, PromptVars::probe())
            .map_err(|err| ConfigError::Template(format!("{err:#}")))?;
        self.initial_override = Some(source);
        Ok(self)
    }

    /// First prompt of a session.
    pub fn initial(&self, vars: &PromptVars) -> Result<String> {
        let rendered = match &self.initial_override {
            Some(source) => self.env.render_str(source, vars),
            None => self.env.get_template("initial")?.render(vars),
        }
        .context("render initial prompt")?;
        debug!(bytes = rendered.len(), "rendered initial prompt");
        Ok(rendered)
    }

    /// Continuation prompt: every turn, in order, one block each.
    pub fn render_transcript(&self, transcript: &[Turn]) -> Result<String> {
        let turns: Vec<TurnView<'_>> = transcript.iter().map(TurnView::from_turn).collect();
        let rendered = self
            .env
            .get_template("transcript")?
            .render(context! { turns => turns })
            .context("render transcript")?;
        debug!(
            turns = transcript.len(),
            bytes = rendered.len(),
            "rendered transcript"
        );
        Ok(rendered)
    }

    /// Final prompt once the step budget is spent.
    pub fn force_conclusion(&self) -> String {
        FORCE_CONCLUSION_TEMPLATE.trim_end().to_string()
    }

    /// Corrective prompt naming what was wrong with the final answer.
    pub fn correction(&self, err: &ConclusionError) -> Result<String> {
        self.env
            .get_template("correction")?
            .render(context! { problem => err.to_string(), tag => err.tag().to_string() })
            .context("render correction prompt")
    }

    /// Reminder for a response with neither a command nor a final answer.
    pub fn no_action(&self) -> String {
        NO_ACTION_TEMPLATE.trim_end().to_string()
    }

    /// Note appended when a response asked for more than one command.
    pub fn ignored_commands(&self, ignored: usize) -> String {
        format!(
            "Only the first command in your reply was executed; {ignored} further command(s) were ignored. Issue one command per reply."
        )
    }
}
