//! Tool-call broker: runs agent-issued investigation commands in a sandbox.
//!
//! The broker never returns an error to the controller. Every outcome,
//! including policy rejection and spawn failure, is reported as data in a
//! [`ToolResult`] so the agent can read it on the next turn.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, instrument, warn};

use crate::core::policy::{CommandPolicy, PolicyContext, normalize_path};
use crate::core::types::{ToolCommand, ToolError, ToolResult};
use crate::io::process::run_command_with_timeout;

/// Executes one tool command and reports the outcome.
pub trait ToolBroker {
    fn execute(&self, command: &ToolCommand) -> ToolResult;
}

/// Broker that runs commands through a shell, confined to the project
/// directory (read) and a per-session scratch directory (write).
#[derive(Debug, Clone)]
pub struct SandboxBroker {
    shell: Vec<String>,
    policy: CommandPolicy,
    output_limit_bytes: usize,
    project_dir: PathBuf,
    scratch: PathBuf,
}

impl SandboxBroker {
    pub fn new(
        shell: Vec<String>,
        policy: CommandPolicy,
        output_limit_bytes: usize,
        project_dir: impl Into<PathBuf>,
        scratch: impl Into<PathBuf>,
    ) -> Self {
        Self {
            shell,
            policy,
            output_limit_bytes,
            project_dir: project_dir.into(),
            scratch: scratch.into(),
        }
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    fn resolve_workdir(&self, workdir: &Path) -> Result<PathBuf, String> {
        let resolved = if workdir.is_absolute() {
            normalize_path(workdir)
        } else {
            normalize_path(&self.project_dir.join(workdir))
        };
        let roots = [normalize_path(&self.project_dir), normalize_path(&self.scratch)];
        if roots.iter().any(|root| resolved.starts_with(root)) {
            Ok(resolved)
        } else {
            Err(format!(
                "working directory {} is outside the sandbox",
                workdir.display()
            ))
        }
    }

    fn shell_command(&self, command: &str, workdir: &Path) -> Result<Command, String> {
        let (program, args) = self
            .shell
            .split_first()
            .ok_or_else(|| "no shell configured".to_string())?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(command)
            .current_dir(workdir)
            .env("TMPDIR", &self.scratch)
            .env("HOME", &self.scratch);
        Ok(cmd)
    }
}

impl ToolBroker for SandboxBroker {
    #[instrument(skip_all, fields(timeout_ms = command.timeout_ms))]
    fn execute(&self, command: &ToolCommand) -> ToolResult {
        let workdir = match self.resolve_workdir(&command.workdir) {
            Ok(dir) => dir,
            Err(reason) => {
                warn!(%reason, "tool command rejected");
                return ToolResult::failed(ToolError::PolicyDenied { reason });
            }
        };
        let ctx = PolicyContext {
            workdir: &workdir,
            scratch: &self.scratch,
        };
        if let Err(reason) = self.policy.check(&command.command, ctx) {
            warn!(%reason, "tool command rejected");
            return ToolResult::failed(ToolError::PolicyDenied { reason });
        }

        let cmd = match self.shell_command(&command.command, &workdir) {
            Ok(cmd) => cmd,
            Err(message) => return ToolResult::failed(ToolError::SpawnFailed { message }),
        };
        info!(command = %command.command, workdir = %workdir.display(), "running tool command");
        let output = match run_command_with_timeout(
            cmd,
            None,
            command.timeout(),
            self.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "tool command failed to run");
                return ToolResult::failed(ToolError::SpawnFailed {
                    message: format!("{err:#}"),
                });
            }
        };

        let exit_code = output.status.code();
        let truncated = output.truncated();
        let error = if output.timed_out {
            Some(ToolError::Timeout)
        } else if !output.status.success() {
            Some(ToolError::NonZeroExit)
        } else if truncated {
            Some(ToolError::OutputTooLarge)
        } else {
            None
        };
        debug!(?exit_code, truncated, error = ?error.as_ref().map(ToolError::as_str), "tool command finished");

        ToolResult {
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            exit_code,
            truncated,
            error,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::time::Duration;

    use super::*;

    fn broker(project: &Path, scratch: &Path, allow: &[&str], limit: usize) -> SandboxBroker {
        let allow: Vec<String> = allow.iter().map(|s| s.to_string()).collect();
        SandboxBroker::new(
            vec!["sh".to_string(), "-c".to_string()],
            CommandPolicy::new(&allow, &[]).expect("policy"),
            limit,
            project,
            scratch,
        )
    }

    fn command(text: &str, workdir: &Path, timeout: Duration) -> ToolCommand {
        ToolCommand::new(text, workdir, timeout)
    }

    #[test]
    fn runs_read_only_command_in_project() {
        let project = tempfile::tempdir().expect("project");
        let scratch = tempfile::tempdir().expect("scratch");
        fs::write(project.path().join("png.c"), "int png_read(void);\n").expect("write");
        let broker = broker(project.path(), scratch.path(), &["grep"], 1024);

        let result = broker.execute(&command(
            "grep -n png_read png.c",
            project.path(),
            Duration::from_secs(5),
        ));
        assert!(result.succeeded(), "{result:?}");
        assert_eq!(result.stdout.trim(), "1:int png_read(void);");
        assert!(!result.truncated);
    }

    #[test]
    fn timeout_is_reported_and_next_command_runs() {
        let project = tempfile::tempdir().expect("project");
        let scratch = tempfile::tempdir().expect("scratch");
        let broker = broker(project.path(), scratch.path(), &["sleep", "echo"], 1024);

        let slow = broker.execute(&command(
            "sleep 5",
            project.path(),
            Duration::from_millis(200),
        ));
        assert_eq!(slow.error, Some(ToolError::Timeout));

        let next = broker.execute(&command(
            "echo still here",
            project.path(),
            Duration::from_secs(5),
        ));
        assert!(next.succeeded(), "{next:?}");
        assert_eq!(next.stdout.trim(), "still here");
    }

    #[test]
    fn non_zero_exit_is_data() {
        let project = tempfile::tempdir().expect("project");
        let scratch = tempfile::tempdir().expect("scratch");
        let broker = broker(project.path(), scratch.path(), &["ls"], 1024);

        let result = broker.execute(&command(
            "ls does-not-exist",
            project.path(),
            Duration::from_secs(5),
        ));
        assert_eq!(result.error, Some(ToolError::NonZeroExit));
        assert_ne!(result.exit_code, Some(0));
        assert!(!result.stderr.is_empty());
    }

    #[test]
    fn large_output_is_truncated() {
        let project = tempfile::tempdir().expect("project");
        let scratch = tempfile::tempdir().expect("scratch");
        let broker = broker(project.path(), scratch.path(), &["printf"], 8);

        let result = broker.execute(&command(
            "printf '0123456789abcdef'",
            project.path(),
            Duration::from_secs(5),
        ));
        assert!(result.truncated);
        assert_eq!(result.error, Some(ToolError::OutputTooLarge));
        assert!(result.stdout.starts_with("01234567"));
        assert_eq!(result.exit_code, Some(0));
    }

    #[test]
    fn policy_and_workdir_violations_are_denied() {
        let project = tempfile::tempdir().expect("project");
        let scratch = tempfile::tempdir().expect("scratch");
        let broker = broker(project.path(), scratch.path(), &["ls"], 1024);

        let denied = broker.execute(&command("rm -rf .", project.path(), Duration::from_secs(5)));
        assert!(matches!(denied.error, Some(ToolError::PolicyDenied { .. })));
        assert_eq!(denied.exit_code, None);

        let outside = broker.execute(&command("ls", Path::new("/"), Duration::from_secs(5)));
        assert!(matches!(outside.error, Some(ToolError::PolicyDenied { .. })));
    }

    #[test]
    fn default_policy_keeps_project_files_untouched() {
        let project = tempfile::tempdir().expect("project");
        let scratch = tempfile::tempdir().expect("scratch");
        fs::write(project.path().join("a.c"), "b\na\n").expect("write");
        let broker = SandboxBroker::new(
            vec!["sh".to_string(), "-c".to_string()],
            CommandPolicy::default(),
            1024,
            project.path(),
            scratch.path(),
        );

        for text in ["sort -o a.c a.c", "sed -n 'w created.c' a.c"] {
            let result = broker.execute(&command(text, project.path(), Duration::from_secs(5)));
            assert!(
                matches!(result.error, Some(ToolError::PolicyDenied { .. })),
                "{text}: {result:?}"
            );
        }
        assert_eq!(
            fs::read_to_string(project.path().join("a.c")).expect("read"),
            "b\na\n"
        );
        assert!(!project.path().join("created.c").exists());
    }

    #[test]
    fn background_job_is_denied() {
        let project = tempfile::tempdir().expect("project");
        let scratch = tempfile::tempdir().expect("scratch");
        fs::write(project.path().join("a.c"), "int x;\n").expect("write");
        let broker = broker(project.path(), scratch.path(), &[], 1024);

        let start = std::time::Instant::now();
        let result = broker.execute(&command(
            "tail -f a.c &",
            project.path(),
            Duration::from_secs(1),
        ));
        assert!(matches!(result.error, Some(ToolError::PolicyDenied { .. })));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn missing_shell_is_spawn_failure() {
        let project = tempfile::tempdir().expect("project");
        let scratch = tempfile::tempdir().expect("scratch");
        let broker = SandboxBroker::new(
            vec!["/nonexistent/shell".to_string()],
            CommandPolicy::default(),
            1024,
            project.path(),
            scratch.path(),
        );
        let result = broker.execute(&command("ls", project.path(), Duration::from_secs(5)));
        assert!(matches!(result.error, Some(ToolError::SpawnFailed { .. })));
    }

    #[test]
    fn home_points_at_scratch() {
        let project = tempfile::tempdir().expect("project");
        let scratch = tempfile::tempdir().expect("scratch");
        let broker = broker(project.path(), scratch.path(), &[], 1024);

        let result = broker.execute(&command(
            "echo \"$HOME\"",
            project.path(),
            Duration::from_secs(5),
        ));
        assert_eq!(result.stdout.trim(), scratch.path().display().to_string());
    }
}
