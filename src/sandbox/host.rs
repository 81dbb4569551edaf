//! The `host` driver: no isolation, trusted first-party work only.
//!
//! The command still runs with a minimal environment, inside the facility
//! workspace, in its own process group, and (on Linux) under cgroup v2
//! limits when the directive carries any. If limits were requested but
//! cannot be applied, the child is killed and the directive errors rather
//! than running unconstrained.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use super::{
    Driver, ExecContext, HealthResult, LogSink, LogStream, RunRequest, RunResult, SandboxError,
    cwd, runutil,
};

#[derive(Debug)]
pub struct HostDriver;

impl HostDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for HostDriver {
    fn name(&self) -> &'static str {
        "host"
    }

    /// Always healthy: the host driver has no external dependencies.
    async fn health_check(&self) -> HealthResult {
        HealthResult::healthy("host")
    }

    async fn run(&self, ctx: &ExecContext, req: RunRequest) -> Result<RunResult, SandboxError> {
        if req.command.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }

        let shell = if req.shell.is_empty() {
            "/bin/sh"
        } else {
            req.shell.as_str()
        };
        let workdir = cwd::resolve_workspace_cwd(&req.facility_path, &req.cwd)?;

        let mut env = runutil::minimal_host_env();
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

        #[cfg(target_os = "linux")]
        install_landlock(&mut cmd, &req);

        let mut child = cmd.spawn()?;

        // Fail-closed: limits explicitly requested but not applicable mean
        // the directive must not run.
        #[cfg(target_os = "linux")]
        let _cgroup = {
            let pid = child.id().unwrap_or_default();
            match super::cgroup::apply_limits(&req.directive_id, pid, &req.limits) {
                Ok(cg) => cg,
                Err(e) => {
                    runutil::kill_process_group(&child);
                    let _ = child.wait().await;
                    return Err(SandboxError::Cgroup(e));
                }
            }
        };

        let stdout = child.stdout.take().expect("stdout piped above");
        let stderr = child.stderr.take().expect("stderr piped above");

        // Drain both pipes concurrently with the wait, so buffered output
        // from fast-completing commands is never lost.
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

/// Landlock is defense-in-depth for the trusted profile served by this
/// driver: applied in the child between fork and exec, skipped when the
/// kernel lacks support or the directive carries no filesystem policy.
#[cfg(target_os = "linux")]
fn install_landlock(cmd: &mut Command, req: &RunRequest) {
    use super::landlock;

    let Some(fs_cap) = &req.fs_capability else {
        return;
    };
    if !landlock::available() {
        tracing::debug!(
            directive_id = %req.directive_id,
            "landlock unsupported by kernel, skipping"
        );
        return;
    }

    let ruleset = landlock::Ruleset::from_fs_capability(fs_cap, &req.facility_path);
    unsafe {
        cmd.pre_exec(move || ruleset.apply());
    }
}
