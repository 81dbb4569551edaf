use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::BwrapConfig;
use crate::egressproxy::{ProxyInstance, start_for_directive};
use crate::sandbox::{
    Driver, ExecContext, HealthResult, LogSink, LogStream, RunRequest, RunResult, SandboxError,
    audit_to_log_sink, cwd, prepare, runutil,
};

use super::cmdbuilder::{BwrapCmdConfig, build_args};
use super::wrapper::{WrapperConfig, generate_wrapper};

/// Bubblewrap driver for the `untrusted` profile: user-namespace sandbox
/// with a read-only root, no network namespace, and all egress forced
/// through the per-directive proxy via an in-sandbox socat bridge.
#[derive(Debug)]
pub struct BwrapDriver {
    cfg: BwrapConfig,
}

impl BwrapDriver {
    pub fn new(cfg: BwrapConfig) -> Self {
        Self { cfg }
    }

    fn proxy_socket_dir(&self, req: &RunRequest) -> PathBuf {
        if !self.cfg.proxy_socket_dir.is_empty() {
            return PathBuf::from(&self.cfg.proxy_socket_dir);
        }
        req.facility_path
            .parent()
            .unwrap_or(&req.facility_path)
            .join(".proxy-sockets")
    }

    async fn run_sandboxed(
        &self,
        ctx: &ExecContext,
        req: &RunRequest,
        proxy: &ProxyInstance,
    ) -> Result<RunResult, SandboxError> {
        let socket_path = proxy
            .socket_path()
            .expect("UDS proxy has a socket path")
            .to_path_buf();

        let mut wrapper_cfg = WrapperConfig {
            socat_path: self.cfg.socat_path.clone(),
            user_command: req.command.clone(),
            shell: req.shell.clone(),
            env: req.env.clone(),
            cwd: cwd::resolve_sandbox_cwd(&req.cwd)?,
            ..Default::default()
        };
        if !req.repo_url.is_empty() {
            let (args, env) =
                prepare::git_clone_args(&req.repo_url).map_err(SandboxError::Prepare)?;
            wrapper_cfg.repo_url = req.repo_url.clone();
            wrapper_cfg.git_clone_args = args;
            wrapper_cfg.git_clone_env = env;
        }
        let wrapper_script = generate_wrapper(&wrapper_cfg)?;

        let wrapper_file = tempfile::Builder::new()
            .prefix("nexus-wrapper-")
            .suffix(".sh")
            .tempfile()?;
        std::fs::write(wrapper_file.path(), &wrapper_script)?;

        let args = build_args(&BwrapCmdConfig {
            bwrap_path: &self.cfg.bwrap_path,
            rootfs_path: &self.cfg.rootfs_path,
            facility_path: &req.facility_path,
            proxy_socket_path: &socket_path,
            wrapper_script_path: wrapper_file.path(),
            cwd: &req.cwd,
            host_has_lib64: host_has_lib64(),
        })?;

        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..])
            .env_clear()
            .envs(runutil::minimal_spawn_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd.spawn()?;

        // Fail-closed on requested-but-unappliable limits.
        let _cgroup = {
            let pid = child.id().unwrap_or_default();
            match crate::sandbox::cgroup::apply_limits(&req.directive_id, pid, &req.limits) {
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

#[async_trait]
impl Driver for BwrapDriver {
    fn name(&self) -> &'static str {
        "bwrap"
    }

    /// Probe bwrap end to end: a throwaway sandbox must be able to create
    /// namespaces and run /bin/echo. A configured rootfs must carry bin/sh
    /// or the wrapper script cannot start.
    async fn health_check(&self) -> HealthResult {
        let bwrap_path = if self.cfg.bwrap_path.is_empty() {
            "bwrap"
        } else {
            self.cfg.bwrap_path.as_str()
        };

        let mut probe = Command::new(bwrap_path);
        probe
            .args([
                "--ro-bind", "/", "/",
                "--proc", "/proc",
                "--dev", "/dev",
                "--tmpfs", "/tmp",
                "--unshare-net",
                "--unshare-pid",
                "--new-session",
                "--die-with-parent",
                "--cap-drop", "ALL",
                "--", "/bin/echo", "ok",
            ])
            .stdin(Stdio::null());

        let output = match tokio::time::timeout(Duration::from_secs(5), probe.output()).await {
            Err(_) => return HealthResult::unhealthy("bwrap", "namespace test timed out"),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return HealthResult::unhealthy("bwrap", "bwrap not found in PATH");
            }
            Ok(Err(e)) => {
                return HealthResult::unhealthy("bwrap", format!("namespace test failed: {e}"));
            }
            Ok(Ok(out)) => out,
        };
        if !output.status.success() {
            return HealthResult::unhealthy(
                "bwrap",
                format!(
                    "namespace test failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            );
        }

        if !self.cfg.rootfs_path.is_empty() {
            let sh = std::path::Path::new(&self.cfg.rootfs_path).join("bin/sh");
            if !sh.exists() {
                return HealthResult::unhealthy(
                    "bwrap",
                    format!("rootfs missing bin/sh at {}", self.cfg.rootfs_path),
                );
            }
        }

        let mut health = HealthResult::healthy("bwrap");
        health
            .details
            .insert("bwrap_path".to_string(), bwrap_path.to_string());
        health
    }

    async fn run(&self, ctx: &ExecContext, req: RunRequest) -> Result<RunResult, SandboxError> {
        if req.command.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }
        if req.facility_path.as_os_str().is_empty() {
            return Err(SandboxError::InvalidRequest(
                "facility path is required for bwrap driver".into(),
            ));
        }

        let audit_sink = audit_to_log_sink(Arc::clone(&req.log_sink), ctx.cancel.clone());
        let proxy = start_for_directive(
            &self.proxy_socket_dir(&req),
            &req.directive_id,
            req.net_capability.as_ref(),
            audit_sink,
        )?;

        let result = self.run_sandboxed(ctx, &req, &proxy).await;
        proxy.stop().await;
        result
    }
}

fn host_has_lib64() -> bool {
    std::fs::symlink_metadata("/lib64")
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_name() {
        let drv = BwrapDriver::new(BwrapConfig::default());
        assert_eq!(drv.name(), "bwrap");
    }

    #[tokio::test]
    async fn missing_binary_is_unhealthy() {
        let drv = BwrapDriver::new(BwrapConfig {
            bwrap_path: "/nonexistent/bwrap-binary".into(),
            ..Default::default()
        });
        let health = drv.health_check().await;
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        use crate::sandbox::DiscardSink;
        let dir = tempfile::tempdir().unwrap();
        let drv = BwrapDriver::new(BwrapConfig::default());
        let req = RunRequest {
            directive_id: "d-bw".into(),
            command: String::new(),
            shell: String::new(),
            cwd: String::new(),
            env: Default::default(),
            facility_path: dir.path().to_path_buf(),
            max_output_bytes: 1024,
            chunk_bytes: 1024,
            log_sink: Arc::new(DiscardSink),
            net_capability: None,
            fs_capability: None,
            repo_url: String::new(),
            limits: Default::default(),
        };
        let err = drv.run(&ExecContext::unbounded(), req).await.unwrap_err();
        assert!(matches!(err, SandboxError::EmptyCommand));
    }
}
