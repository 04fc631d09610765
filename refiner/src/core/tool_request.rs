//! Recognition of tool-command requests in agent responses.
//!
//! The agent asks for a command by wrapping it in `<bash>...</bash>`. One
//! command is executed per agent turn; additional requests in the same
//! response are ignored and the agent is told so via the tool result.

use std::sync::LazyLock;

use regex::Regex;

static BASH_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<\s*bash\s*>(.*?)<\s*/\s*bash\s*>").unwrap());

/// A tool request found in an agent response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRequest {
    /// The command to execute (trimmed, non-empty).
    pub command: String,
    /// Number of additional well-formed requests that were ignored.
    pub ignored: usize,
}

/// Find the first syntactically valid tool request.
///
/// Blocks whose body is empty after trimming are not valid requests.
pub fn find_tool_request(response: &str) -> Option<ToolRequest> {
    let mut commands = BASH_BLOCK
        .captures_iter(response)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|command| !command.is_empty());

    let command = commands.next()?.to_string();
    Some(ToolRequest {
        command,
        ignored: commands.count(),
    })
}
