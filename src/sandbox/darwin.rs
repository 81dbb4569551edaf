//! The `darwin-automation` driver: host-level execution on macOS for
//! desktop automation directives (Shortcuts, AppleScript, osascript).
//!
//! No OS-level isolation beyond macOS TCC; same minimal-env and
//! process-group semantics as the host driver, with /bin/zsh as the
//! default shell and SSH_AUTH_SOCK allowed through for git over SSH.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use super::{
    Driver, ExecContext, HealthResult, LogSink, LogStream, RunRequest, RunResult, SandboxError,
    cwd, runutil,
};

#[derive(Debug)]
pub struct DarwinAutomationDriver;

impl DarwinAutomationDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DarwinAutomationDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for DarwinAutomationDriver {
    fn name(&self) -> &'static str {
        "darwin-automation"
    }

    /// TCC permission state is not probed here: not every directive needs
    /// it, and denial surfaces as a command failure with a clear message.
    async fn health_check(&self) -> HealthResult {
        HealthResult::healthy("darwin-automation")
    }

    async fn run(&self, ctx: &ExecContext, req: RunRequest) -> Result<RunResult, SandboxError> {
        if req.command.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }

        let shell = if req.shell.is_empty() {
            "/bin/zsh"
        } else {
            req.shell.as_str()
        };
        let workdir = cwd::resolve_workspace_cwd(&req.facility_path, &req.cwd)?;

        let mut env = runutil::minimal_darwin_env();
        for (k, v) in &req.env {
            env.insert(k.clone(), v.clone());
        }

        let mut cmd = Command::new(shell);
        cmd.arg("-c")
            .arg(&req.command)
            .current_dir(&workdir)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take().expect("stdout piped above");
        let stderr = child.stderr.take().expect("stderr piped above");

        let sink = Arc::clone(&req.log_sink);
        let cancel = ctx.cancel.clone();
        let stdout_task = tokio::spawn(async move {
            let mut stdout = stdout;
            sink.consume(&cancel, LogStream::Stdout, &mut stdout).await
        });
        let sink = Arc::clone(&req.log_sink);
        let cancel = ctx.cancel.clone();
        let stderr_task = tokio::spawn(async move {
            let mut stderr = stderr;
            sink.consume(&cancel, LogStream::Stderr, &mut stderr).await
        });

        let outcome = runutil::wait_child(&mut child, ctx).await?;

        let consume_out = stdout_task.await.unwrap_or(Ok(()));
        let consume_err = stderr_task.await.unwrap_or(Ok(()));

        let (status, exit_code) = outcome.into_status();
        let result = RunResult {
            exit_code,
            status,
            stdout_truncated: req.log_sink.stdout_truncated(),
            stderr_truncated: req.log_sink.stderr_truncated(),
            warnings: Vec::new(),
        };

        consume_out?;
        consume_err?;
        Ok(result)
    }
}
