use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ContainerConfig;
use crate::egressproxy::{ProxyInstance, start_for_directive_tcp};
use crate::sandbox::{
    Driver, ExecContext, HealthResult, LogSink, LogStream, RunRequest, RunResult, SandboxError,
    audit_to_log_sink, prepare, runutil,
};

use super::cmdbuilder::{ContainerCmdConfig, build_args};

#[derive(Debug)]
pub struct ContainerDriver {
    cfg: ContainerConfig,
}

impl ContainerDriver {
    pub fn new(cfg: ContainerConfig) -> Self {
        Self { cfg }
    }

    fn runtime(&self) -> &str {
        if self.cfg.runtime.is_empty() {
            "podman"
        } else {
            &self.cfg.runtime
        }
    }

    fn image(&self) -> &str {
        if self.cfg.image.is_empty() {
            "ubuntu:24.04"
        } else {
            &self.cfg.image
        }
    }

    async fn run_container(
        &self,
        ctx: &ExecContext,
        req: &RunRequest,
        proxy: Option<&ProxyInstance>,
    ) -> Result<RunResult, SandboxError> {
        let (clone_args, clone_env) = if req.repo_url.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            prepare::git_clone_args(&req.repo_url).map_err(SandboxError::Prepare)?
        };

        let args = build_args(&ContainerCmdConfig {
            runtime: self.runtime(),
            image: self.image(),
            facility_path: &req.facility_path,
            command: &req.command,
            shell: &req.shell,
            cwd: &req.cwd,
            env: &req.env,
            proxy_mode: &self.cfg.proxy_mode,
            proxy_url: proxy.and_then(|p| p.proxy_url()).unwrap_or(""),
            repo_url: &req.repo_url,
            git_clone_args: &clone_args,
            git_clone_env: &clone_env,
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
impl Driver for ContainerDriver {
    fn name(&self) -> &'static str {
        "container"
    }

    /// Verify the runtime binary exists and the image is available
    /// locally. Pulling on demand would make the first directive pay an
    /// unbounded network cost, so a missing image is unhealthy.
    async fn health_check(&self) -> HealthResult {
        let runtime = self.runtime();
        let image = self.image();

        let mut probe = Command::new(runtime);
        probe
            .args(["image", "exists", image])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match tokio::time::timeout(Duration::from_secs(10), probe.status()).await {
            Err(_) => HealthResult::unhealthy("container", "image check timed out"),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                HealthResult::unhealthy("container", format!("{runtime} not found in PATH"))
            }
            Ok(Err(e)) => HealthResult::unhealthy("container", format!("image check failed: {e}")),
            Ok(Ok(status)) if !status.success() => {
                HealthResult::unhealthy("container", format!("image {image} not available locally"))
            }
            Ok(Ok(_)) => {
                let mut health = HealthResult::healthy("container");
                health.details.insert("runtime".into(), runtime.to_string());
                health.details.insert("image".into(), image.to_string());
                health
            }
        }
    }

    async fn run(&self, ctx: &ExecContext, req: RunRequest) -> Result<RunResult, SandboxError> {
        if req.command.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }
        if req.facility_path.as_os_str().is_empty() {
            return Err(SandboxError::InvalidRequest(
                "facility path is required for container driver".into(),
            ));
        }

        let proxy = if self.cfg.proxy_mode == "env" {
            let audit_sink = audit_to_log_sink(Arc::clone(&req.log_sink), ctx.cancel.clone());
            Some(
                start_for_directive_tcp(&req.directive_id, req.net_capability.as_ref(), audit_sink)
                    .await?,
            )
        } else {
            None
        };

        let result = self.run_container(ctx, &req, proxy.as_ref()).await;
        if let Some(proxy) = &proxy {
            proxy.stop().await;
        }
        result
    }
}
