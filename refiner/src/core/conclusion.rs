//! Extraction and validation of the agent's final structured answer.
//!
//! The final message carries up to three tag-delimited blocks:
//!
//! ```text
//! <conclusion> ... </conclusion>
//! <fuzz target> ... </fuzz target>
//! <build script> ... </build script>
//! ```
//!
//! Agents often draft a block and then restate it, so every tag resolves to its
//! **last** occurrence; earlier ones are ignored. Extraction is all-or-nothing:
//! a missing, empty, or unclosed fuzz target fails the whole extraction.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::core::types::ExtractionResult;

/// The tag-delimited blocks of the output contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Conclusion,
    FuzzTarget,
    BuildScript,
}

impl Tag {
    pub const ALL: [Tag; 3] = [Tag::Conclusion, Tag::FuzzTarget, Tag::BuildScript];

    pub fn name(self) -> &'static str {
        match self {
            Tag::Conclusion => "conclusion",
            Tag::FuzzTarget => "fuzz target",
            Tag::BuildScript => "build script",
        }
    }

    fn open_re(self) -> &'static Regex {
        match self {
            Tag::Conclusion => &CONCLUSION_OPEN,
            Tag::FuzzTarget => &FUZZ_TARGET_OPEN,
            Tag::BuildScript => &BUILD_SCRIPT_OPEN,
        }
    }

    fn close_re(self) -> &'static Regex {
        match self {
            Tag::Conclusion => &CONCLUSION_CLOSE,
            Tag::FuzzTarget => &FUZZ_TARGET_CLOSE,
            Tag::BuildScript => &BUILD_SCRIPT_CLOSE,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.name())
    }
}

// Tag names tolerate case, `_`/`-` separators and inner whitespace.
static CONCLUSION_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*conclusion\s*>").unwrap());
static CONCLUSION_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*/\s*conclusion\s*>").unwrap());
static FUZZ_TARGET_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*fuzz[\s_-]*target\s*>").unwrap());
static FUZZ_TARGET_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*/\s*fuzz[\s_-]*target\s*>").unwrap());
static BUILD_SCRIPT_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*build[\s_-]*script\s*>").unwrap());
static BUILD_SCRIPT_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*/\s*build[\s_-]*script\s*>").unwrap());

/// Why a final message could not be turned into an extraction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConclusionError {
    #[error("missing {0} block")]
    Missing(Tag),

    #[error("{0} block is empty")]
    Empty(Tag),

    #[error("{0} block is not closed")]
    Unclosed(Tag),
}

impl ConclusionError {
    pub fn tag(&self) -> Tag {
        match self {
            ConclusionError::Missing(tag)
            | ConclusionError::Empty(tag)
            | ConclusionError::Unclosed(tag) => *tag,
        }
    }
}

/// Raw blocks pulled out of the final message, before merging with the
/// session's original build script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conclusion {
    pub conclusion: String,
    pub fuzz_target: String,
    /// `None` when the block is absent or empty ("unchanged").
    pub build_script: Option<String>,
}

impl Conclusion {
    /// Merge with the build script the session started from.
    pub fn into_extraction(self, original_build_script: &str) -> ExtractionResult {
        let (build_script, build_script_changed) =
            merge_build_script(self.build_script.as_deref(), original_build_script);
        ExtractionResult {
            conclusion: self.conclusion,
            fuzz_target: self.fuzz_target,
            build_script,
            build_script_changed,
            valid: true,
            failure_reason: None,
            dry_run_failure: None,
        }
    }
}

/// True when the message contains the opening marker of any contract block.
///
/// The session controller uses this to leave the gathering phase; validity
/// is decided separately by [`parse_conclusion`].
pub fn has_conclusion_markers(text: &str) -> bool {
    Tag::ALL.iter().any(|tag| tag.open_re().is_match(text))
}

/// True when some contract block is both opened and closed.
///
/// A bare opening marker can be prose ("before I write the <fuzz target>");
/// a closed block is an answer.
pub fn has_closed_block(text: &str) -> bool {
    Tag::ALL.iter().any(|tag| {
        tag.open_re()
            .find(text)
            .is_some_and(|open| tag.close_re().is_match(&text[open.end()..]))
    })
}

/// Extract the contract blocks from a final agent message.
pub fn parse_conclusion(text: &str) -> Result<Conclusion, ConclusionError> {
    let fuzz_target = last_block(text, Tag::FuzzTarget)?
        .ok_or(ConclusionError::Missing(Tag::FuzzTarget))?;
    if fuzz_target.is_empty() {
        return Err(ConclusionError::Empty(Tag::FuzzTarget));
    }

    let conclusion =
        last_block(text, Tag::Conclusion)?.ok_or(ConclusionError::Missing(Tag::Conclusion))?;

    let build_script = last_block(text, Tag::BuildScript)?.filter(|body| !body.is_empty());

    Ok(Conclusion {
        conclusion,
        fuzz_target,
        build_script,
    })
}

/// Resolve the build script to carry downstream.
///
/// Returns the script and whether it differs from `original`. An absent,
/// empty, or identical proposal keeps `original` verbatim, so applying
/// "unchanged" any number of times yields the same script.
pub fn merge_build_script(proposed: Option<&str>, original: &str) -> (String, bool) {
    match proposed.map(str::trim).filter(|body| !body.is_empty()) {
        Some(body) if body != original.trim() => (body.to_string(), true),
        _ => (original.to_string(), false),
    }
}

/// Body of the last occurrence of `tag`, trimmed and unfenced.
fn last_block(text: &str, tag: Tag) -> Result<Option<String>, ConclusionError> {
    let Some(open) = tag.open_re().find_iter(text).last() else {
        return Ok(None);
    };
    let rest = &text[open.end()..];
    let close = tag
        .close_re()
        .find(rest)
        .ok_or(ConclusionError::Unclosed(tag))?;
    let body = strip_code_fence(rest[..close.start()].trim());
    Ok(Some(body.to_string()))
}

/// Remove a markdown fence wrapping the whole body (```` ```cpp ... ``` ````).
fn strip_code_fence(body: &str) -> &str {
    if !body.starts_with("```") || !body.ends_with("```") || body.len() < 6 {
        return body;
    }
    let inner = &body[..body.len() - 3];
    match inner.find('\n') {
        Some(first_newline) => inner[first_newline + 1..].trim(),
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_trimmed_blocks() {
        let text = "Thinking done.\n<conclusion>\n  Covers the parser path.  \n</conclusion>\n\
                    <fuzz target>\n#include <stdint.h>\nint LLVMFuzzerTestOneInput() { return 0; }\n</fuzz target>\n";
        let parsed = parse_conclusion(text).expect("parse");
        assert_eq!(parsed.conclusion, "Covers the parser path.");
        assert_eq!(
            parsed.fuzz_target,
            "#include <stdint.h>\nint LLVMFuzzerTestOneInput() { return 0; }"
        );
        assert_eq!(parsed.build_script, None);
    }

    #[test]
    fn last_occurrence_wins() {
        let text = "<conclusion>draft</conclusion><fuzz target>first</fuzz target>\n\
                    on reflection:\n\
                    <conclusion>final</conclusion><fuzz target>second</fuzz target>";
        let parsed = parse_conclusion(text).expect("parse");
        assert_eq!(parsed.conclusion, "final");
        assert_eq!(parsed.fuzz_target, "second");
    }

    #[test]
    fn missing_fuzz_target_fails_whole_extraction() {
        let err = parse_conclusion("<conclusion>done</conclusion><build script>make</build script>")
            .unwrap_err();
        assert_eq!(err, ConclusionError::Missing(Tag::FuzzTarget));
    }

    #[test]
    fn empty_fuzz_target_fails() {
        let err = parse_conclusion("<conclusion>x</conclusion><fuzz target>  \n </fuzz target>")
            .unwrap_err();
        assert_eq!(err, ConclusionError::Empty(Tag::FuzzTarget));
    }

    #[test]
    fn last_draft_empty_is_not_rescued_by_earlier_block() {
        let text = "<conclusion>x</conclusion><fuzz target>real</fuzz target>\
                    <fuzz target></fuzz target>";
        assert_eq!(
            parse_conclusion(text).unwrap_err(),
            ConclusionError::Empty(Tag::FuzzTarget)
        );
    }

    #[test]
    fn unclosed_last_block_is_malformed() {
        let text = "<conclusion>x</conclusion><fuzz target>ok</fuzz target><fuzz target>half";
        assert_eq!(
            parse_conclusion(text).unwrap_err(),
            ConclusionError::Unclosed(Tag::FuzzTarget)
        );
    }

    #[test]
    fn missing_conclusion_block_is_reported() {
        let err = parse_conclusion("<fuzz target>code</fuzz target>").unwrap_err();
        assert_eq!(err, ConclusionError::Missing(Tag::Conclusion));
        assert_eq!(err.to_string(), "missing <conclusion> block");
    }

    #[test]
    fn tag_spelling_is_flexible() {
        let text = "<CONCLUSION>ok</CONCLUSION><fuzz_target>code</ fuzz_target >\
                    <Build-Script>./build.sh</Build-Script>";
        let parsed = parse_conclusion(text).expect("parse");
        assert_eq!(parsed.fuzz_target, "code");
        assert_eq!(parsed.build_script.as_deref(), Some("./build.sh"));
    }

    #[test]
    fn code_fences_are_stripped() {
        let text = "<conclusion>ok</conclusion>\n<fuzz target>\n```cpp\nint x;\n```\n</fuzz target>";
        let parsed = parse_conclusion(text).expect("parse");
        assert_eq!(parsed.fuzz_target, "int x;");
    }

    #[test]
    fn empty_build_script_means_unchanged() {
        let text = "<conclusion>ok</conclusion><fuzz target>t</fuzz target><build script> </build script>";
        let parsed = parse_conclusion(text).expect("parse");
        assert_eq!(parsed.build_script, None);
        let extraction = parsed.into_extraction("make all");
        assert_eq!(extraction.build_script, "make all");
        assert!(!extraction.build_script_changed);
        assert!(extraction.valid);
    }

    #[test]
    fn merge_unchanged_is_idempotent() {
        let original = "#!/bin/bash\n$CC $CFLAGS fuzzer.c -o $OUT/fuzzer\n";
        let (once, changed_once) = merge_build_script(None, original);
        let (twice, changed_twice) = merge_build_script(None, &once);
        assert_eq!(once, original);
        assert_eq!(twice, original);
        assert!(!changed_once && !changed_twice);
    }

    #[test]
    fn identical_build_script_counts_as_unchanged() {
        let original = "make -j$(nproc)\n";
        let (script, changed) = merge_build_script(Some("  make -j$(nproc)  "), original);
        assert_eq!(script, original);
        assert!(!changed);

        let (script, changed) = merge_build_script(Some("make fuzz"), original);
        assert_eq!(script, "make fuzz");
        assert!(changed);
    }

    #[test]
    fn markers_detect_any_contract_tag() {
        assert!(has_conclusion_markers("so <conclusion> here"));
        assert!(has_conclusion_markers("<fuzz target>"));
        assert!(!has_conclusion_markers("<bash>ls</bash>"));
        assert!(has_closed_block("<Fuzz_Target>x</fuzz target>"));
        assert!(!has_closed_block("before I write the <fuzz target>, <bash>ls</bash>"));
        assert!(!has_closed_block("</conclusion> then <conclusion>"));
    }
}
