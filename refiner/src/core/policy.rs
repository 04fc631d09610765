//! Allow/deny policy for agent-issued investigation commands.
//!
//! Commands are scanned (quote-aware, shell-like, not a full shell parser) into
//! pipeline segments and output redirections. Every segment's program must be
//! on the allow list, no deny pattern may match, command substitution is
//! rejected, and output may only be redirected to `/dev/null` or into the
//! session scratch directory.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use regex::Regex;

use crate::error::ConfigError;

/// Programs permitted by default: read-only inspection tools.
///
/// `sed`, `awk` and `xxd` are left out: each can write files or run programs
/// through its script or positional arguments.
pub const DEFAULT_ALLOW: &[&str] = &[
    "basename", "cat", "cd", "cut", "diff", "dirname", "du", "echo", "file", "find", "grep",
    "head", "ls", "nl", "nm", "objdump", "printf", "pwd", "readelf", "realpath", "rg", "sort",
    "stat", "strings", "tail", "tr", "tree", "true", "uniq", "wc", "which",
];

/// Patterns rejected by default even when the program is allowed.
pub const DEFAULT_DENY: &[&str] = &[
    // in-place edits, for operators who allow sed
    r"\bsed\b[^|;&]*\s(-[a-zA-Z]*i\b|--in-place)",
    // find actions that delete, write or run other programs
    r"\bfind\b[^|;&]*\s-(delete|execdir|exec|okdir|ok|fprint0|fprintf|fprint|fls)\b",
    // awk escapes, for operators who allow awk
    r"\bawk\b.*\bsystem\s*\(",
    // sort writing its output file or spawning a compressor
    r"\bsort\b[^|;&]*\s(-[a-zA-Z]*o|--output|--compress-program)",
    // tree writing its listing to a file
    r"\btree\b[^|;&]*\s(-[a-zA-Z]*o|--output)",
    // rg preprocessors run arbitrary programs
    r"\brg\b[^|;&]*\s--pre",
    // uniq with an output file operand
    r"(?:^|[|;&(\n])\s*(?:\w+=\S*\s+)*(?:\S*/)?uniq(\s+-\S+)*\s+[^-\s|;&<>]\S*\s+[^-\s|;&<>]",
    // file compiling a magic database
    r"(?:^|[|;&(\n])\s*(?:\w+=\S*\s+)*(?:\S*/)?file\s([^|;&]*\s)?-[a-zA-Z]*C",
];

/// Where the command runs and where it may write.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub workdir: &'a Path,
    pub scratch: &'a Path,
}

/// Compiled command policy.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allow: BTreeSet<String>,
    deny: Vec<Regex>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            allow: DEFAULT_ALLOW.iter().map(|s| s.to_string()).collect(),
            deny: DEFAULT_DENY
                .iter()
                .map(|pattern| Regex::new(pattern).unwrap())
                .collect(),
        }
    }
}

impl CommandPolicy {
    /// Build a policy from configured program names and deny regexes.
    ///
    /// An empty allow list permits any program (deny patterns still apply).
    pub fn new(allow: &[String], deny_patterns: &[String]) -> Result<Self, ConfigError> {
        let deny = deny_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| {
                    ConfigError::Invalid(format!("tool.deny_patterns `{pattern}`: {err}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            allow: allow.iter().map(|s| s.trim().to_string()).collect(),
            deny,
        })
    }

    /// Check a command. `Err` carries a reason the agent can read.
    pub fn check(&self, command: &str, ctx: PolicyContext<'_>) -> Result<(), String> {
        if command.trim().is_empty() {
            return Err("empty command".to_string());
        }
        if let Some(pattern) = self.deny.iter().find(|re| re.is_match(command)) {
            return Err(format!("command matches denied pattern `{}`", pattern.as_str()));
        }

        let scan = scan_command(command)?;
        if !self.allow.is_empty() {
            for program in &scan.programs {
                if !self.allow.contains(program) {
                    return Err(format!("program `{program}` is not allowed"));
                }
            }
        }
        for target in &scan.redirects {
            check_redirect_target(target, ctx)?;
        }
        Ok(())
    }
}

fn check_redirect_target(target: &str, ctx: PolicyContext<'_>) -> Result<(), String> {
    if target == "/dev/null" {
        return Ok(());
    }
    let path = Path::new(target);
    let resolved = if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&ctx.workdir.join(path))
    };
    if resolved.starts_with(normalize_path(ctx.scratch)) {
        return Ok(());
    }
    Err(format!(
        "output may only be redirected into the scratch directory {} (got `{target}`)",
        ctx.scratch.display()
    ))
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Scan {
    programs: Vec<String>,
    redirects: Vec<String>,
}

#[derive(Default)]
struct SegmentBuilder {
    words: Vec<String>,
    word: String,
    in_word: bool,
}

impl SegmentBuilder {
    fn end_word(&mut self) {
        if self.in_word {
            self.words.push(std::mem::take(&mut self.word));
            self.in_word = false;
        }
    }

    fn push_char(&mut self, c: char) {
        self.word.push(c);
        self.in_word = true;
    }

    fn end_segment(&mut self, scan: &mut Scan) {
        self.end_word();
        let program = self
            .words
            .iter()
            .find(|word| !is_env_assignment(word))
            .map(|word| word.rsplit('/').next().unwrap_or(word).to_string());
        if let Some(program) = program {
            scan.programs.push(program);
        }
        self.words.clear();
    }
}

fn is_env_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            let mut chars = name.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

fn scan_command(command: &str) -> Result<Scan, String> {
    let chars: Vec<char> = command.chars().collect();
    let mut scan = Scan::default();
    let mut segment = SegmentBuilder::default();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_single {
            if c == '\'' {
                in_single = false;
            } else {
                segment.push_char(c);
            }
            i += 1;
            continue;
        }
        if c == '\\' {
            if let Some(&next) = chars.get(i + 1) {
                segment.push_char(next);
            }
            i += 2;
            continue;
        }
        if c == '`' || (c == '$' && chars.get(i + 1) == Some(&'(')) {
            return Err("command substitution is not allowed".to_string());
        }
        if in_double {
            if c == '"' {
                in_double = false;
            } else {
                segment.push_char(c);
            }
            i += 1;
            continue;
        }

        match c {
            '\'' => {
                in_single = true;
                segment.in_word = true;
                i += 1;
            }
            '"' => {
                in_double = true;
                segment.in_word = true;
                i += 1;
            }
            '&' => {
                let next = chars.get(i + 1);
                let joins = next == Some(&'&') || next == Some(&'>') || (i > 0 && chars[i - 1] == '|');
                if !joins {
                    return Err("background jobs (`&`) are not allowed".to_string());
                }
                segment.end_segment(&mut scan);
                i += if next == Some(&'&') { 2 } else { 1 };
            }
            '|' | ';' | '\n' | '(' | ')' => {
                segment.end_segment(&mut scan);
                i += 1;
            }
            '>' | '<' => {
                // `2>` style fd prefixes belong to the redirect, not the word list.
                if segment.in_word && segment.word.chars().all(|d| d.is_ascii_digit()) {
                    segment.word.clear();
                    segment.in_word = false;
                } else {
                    segment.end_word();
                }
                let is_output = c == '>';
                i += 1;
                if chars.get(i) == Some(&'(') {
                    return Err("process substitution is not allowed".to_string());
                }
                if chars.get(i) == Some(&c) {
                    i += 1;
                }
                if chars.get(i) == Some(&'&') {
                    // fd duplication such as `2>&1`
                    i += 1;
                    while chars
                        .get(i)
                        .is_some_and(|d| d.is_ascii_digit() || *d == '-')
                    {
                        i += 1;
                    }
                    continue;
                }
                while chars.get(i).is_some_and(|d| *d == ' ' || *d == '\t') {
                    i += 1;
                }
                let mut target = String::new();
                while let Some(&d) = chars.get(i) {
                    if d.is_whitespace() || "|;&()<>".contains(d) {
                        break;
                    }
                    if d != '\'' && d != '"' {
                        target.push(d);
                    }
                    i += 1;
                }
                if is_output {
                    if target.is_empty() {
                        return Err("output redirection without a target".to_string());
                    }
                    scan.redirects.push(target);
                }
            }
            c if c.is_whitespace() => {
                segment.end_word();
                i += 1;
            }
            _ => {
                segment.push_char(c);
                i += 1;
            }
        }
    }
    if in_single || in_double {
        return Err("unterminated quote".to_string());
    }
    segment.end_segment(&mut scan);
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PolicyContext<'static> {
        PolicyContext {
            workdir: Path::new("/src/project"),
            scratch: Path::new("/tmp/refiner-scratch"),
        }
    }

    fn check(command: &str) -> Result<(), String> {
        CommandPolicy::default().check(command, ctx())
    }

    #[test]
    fn allows_read_only_pipelines() {
        assert_eq!(check("grep -rn 'png_read' src | head -n 20"), Ok(()));
        assert_eq!(check("cd fuzz && ls -la; cat build.sh"), Ok(()));
        assert_eq!(check("find . -name '*.h' 2>/dev/null | wc -l"), Ok(()));
        assert_eq!(check("grep -c x a.c 2>&1"), Ok(()));
        assert_eq!(check("LC_ALL=C sort names.txt"), Ok(()));
    }

    #[test]
    fn rejects_programs_outside_allow_list() {
        let err = check("rm -rf build").unwrap_err();
        assert!(err.contains("`rm` is not allowed"), "{err}");
        let err = check("ls && /usr/bin/python3 x.py").unwrap_err();
        assert!(err.contains("`python3`"), "{err}");
    }

    #[test]
    fn rejects_denied_patterns() {
        assert!(check("sed -i 's/a/b/' file.c").is_err());
        assert!(check("find . -name '*.o' -delete").is_err());
        assert!(check("awk 'BEGIN { system(\"id\") }'").is_err());
        assert_eq!(check("find . -name '*.c' -print"), Ok(()));
        assert_eq!(check("sort -n -k2 sizes.txt | uniq -c"), Ok(()));
        assert_eq!(check("rg --no-heading -n png_read src"), Ok(()));
        assert_eq!(check("grep -rn uniq src include"), Ok(()));
        assert_eq!(check("grep -n x file.c -C 2"), Ok(()));
        assert_eq!(check("sort names.txt | uniq -c > /tmp/refiner-scratch/counts"), Ok(()));
    }

    #[test]
    fn rejects_write_and_exec_modes_of_allowed_programs() {
        let cases = [
            "sort -o a.c a.c",
            "sort --output=a.c a.c",
            "sort -uo out.txt names.txt",
            "sort --compress-program=sh big.txt",
            "sed -n 'w created.c' a.c",
            "sed 's/a/b/w out.c' a.c",
            "sed '1e id' a.c",
            "awk '{ print > \"out.c\" }' a.c",
            "awk 'BEGIN { \"id\" | getline x }'",
            "rg --pre ./hook.sh png src",
            "rg --pre-glob '*.gz' --pre zcat x",
            "tree -o listing.txt",
            "find . -name '*.c' -fprint0 out.txt",
            "find . -fprint out.txt",
            "uniq names.txt out.txt",
            "file -C -m magic",
            "xxd blob.bin out.txt",
        ];
        for command in cases {
            assert!(check(command).is_err(), "allowed: {command}");
        }
    }

    #[test]
    fn rejects_background_jobs() {
        let err = check("tail -f a.c &").unwrap_err();
        assert!(err.contains("background"), "{err}");
        assert!(check("cat a.c & ls").is_err());
        assert_eq!(check("ls && cat a.c"), Ok(()));
        assert_eq!(check("grep -rn x . |& head"), Ok(()));
        assert_eq!(check("grep -rn x . &>/dev/null"), Ok(()));
        assert_eq!(check("grep 'a & b' a.c"), Ok(()));
    }

    #[test]
    fn rejects_substitution() {
        assert!(check("cat $(ls)").is_err());
        assert!(check("echo `id`").is_err());
        assert!(check("diff <(ls a) <(ls b)").is_err());
        assert_eq!(check("grep '$(literal)' f"), Ok(()));
    }

    #[test]
    fn redirects_only_into_scratch() {
        assert!(check("cat a.c > b.c").is_err());
        assert!(check("echo x >> /etc/passwd").is_err());
        assert!(check("echo x > /tmp/refiner-scratch/../escape").is_err());
        assert_eq!(check("cat a.c > /tmp/refiner-scratch/a.c"), Ok(()));
    }

    #[test]
    fn quoted_separators_do_not_split_segments() {
        assert_eq!(check("grep 'a|rm' file.c"), Ok(()));
        assert_eq!(check("grep \"x; rm\" file.c"), Ok(()));
    }

    #[test]
    fn empty_allow_list_permits_any_program() {
        let policy = CommandPolicy::new(&[], &[]).expect("policy");
        assert_eq!(policy.check("make -n", ctx()), Ok(()));
    }

    #[test]
    fn invalid_deny_pattern_is_config_error() {
        let err = CommandPolicy::new(&[], &["(".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn normalize_resolves_parent_components() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }
}
