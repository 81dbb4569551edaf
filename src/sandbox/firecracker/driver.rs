use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::io::InspectReader;

use crate::config::FirecrackerConfig;
use crate::egressproxy::{ProxyInstance, VsockBridge, start_for_directive};
use crate::protocol::RunStatus;
use crate::sandbox::{
    Driver, ExecContext, HealthResult, LogSink, LogStream, RunRequest, RunResult, SandboxError,
    audit_to_log_sink, cwd, prepare, runutil,
};

use super::blockdev::{create_image_from_dir, extract_image_to_dir};
use super::serial::ExitCodeCapture;
use super::vmconfig::{VmConfigInput, build_vm_config};
use super::wrapper::{FcWrapperConfig, generate_wrapper};

/// Firecracker microVM driver.
///
/// Per run: build a cmd ext4 image carrying the wrapper script, snapshot
/// the facility into a workspace ext4 image, boot a VM with no network
/// devices (vsock only), parse the nonce-tagged exit marker off the serial
/// console, and fold workspace changes back into the facility.
#[derive(Debug)]
pub struct FirecrackerDriver {
    cfg: FirecrackerConfig,
}

impl FirecrackerDriver {
    pub fn new(cfg: FirecrackerConfig) -> Self {
        Self { cfg }
    }

    fn firecracker_path(&self) -> &str {
        if self.cfg.firecracker_path.is_empty() {
            "firecracker"
        } else {
            &self.cfg.firecracker_path
        }
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

    async fn run_vm(
        &self,
        ctx: &ExecContext,
        req: &RunRequest,
        proxy: &ProxyInstance,
        tmp_dir: &std::path::Path,
    ) -> Result<RunResult, SandboxError> {
        // Vsock bridge: guest port 9080 lands on <vsock_uds>_9080.
        let vsock_path = tmp_dir.join("vsock.sock");
        let vsock_listen_path = tmp_dir.join("vsock.sock_9080");
        let proxy_socket = proxy
            .socket_path()
            .expect("UDS proxy has a socket path")
            .to_path_buf();
        let bridge = VsockBridge::start(&vsock_listen_path, &proxy_socket)?;

        let result = self.run_vm_bridged(ctx, req, tmp_dir, &vsock_path).await;
        bridge.stop().await;
        result
    }

    async fn run_vm_bridged(
        &self,
        ctx: &ExecContext,
        req: &RunRequest,
        tmp_dir: &std::path::Path,
        vsock_path: &PathBuf,
    ) -> Result<RunResult, SandboxError> {
        // 1. Wrapper script with a fresh anti-spoofing nonce.
        let nonce = super::generate_nonce()?;
        let exit_marker = format!("NEXUS_EXIT_{nonce}=");

        let mut wrapper_cfg = FcWrapperConfig {
            user_command: req.command.clone(),
            shell: req.shell.clone(),
            env: req.env.clone(),
            cwd: cwd::resolve_sandbox_cwd(&req.cwd)?,
            exit_marker: exit_marker.clone(),
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

        // 2. Command image: just the wrapper at /run.sh.
        let cmd_dir = tmp_dir.join("cmd");
        std::fs::create_dir_all(&cmd_dir)?;
        let run_sh = cmd_dir.join("run.sh");
        std::fs::write(&run_sh, &wrapper_script)?;
        set_executable(&run_sh)?;
        let cmd_image = tmp_dir.join("cmd.ext4");
        create_image_from_dir(&cmd_dir, &cmd_image, 1).await?;

        // 3. Workspace image from the facility directory.
        let ws_image = tmp_dir.join("workspace.ext4");
        let ws_size = if self.cfg.workspace_size_mib == 0 {
            2048
        } else {
            self.cfg.workspace_size_mib
        };
        create_image_from_dir(&req.facility_path, &ws_image, ws_size).await?;

        // 4. VM config.
        let vm_cfg = build_vm_config(&VmConfigInput {
            kernel_path: &self.cfg.kernel_path,
            rootfs_path: &self.cfg.rootfs_image_path,
            cmd_image_path: &cmd_image,
            workspace_image_path: &ws_image,
            vcpus: self.cfg.vcpus.max(1),
            mem_size_mib: self.cfg.mem_size_mib.max(1),
            vsock_uds_path: Some(vsock_path),
        });
        let cfg_path = tmp_dir.join("vm-config.json");
        std::fs::write(
            &cfg_path,
            serde_json::to_vec_pretty(&vm_cfg).map_err(|e| SandboxError::Stage(e.to_string()))?,
        )?;

        // 5. Boot.
        let mut cmd = Command::new(self.firecracker_path());
        cmd.arg("--no-api")
            .arg("--config-file")
            .arg(&cfg_path)
            .env_clear()
            .envs(runutil::minimal_spawn_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take().expect("stdout piped above");
        let stderr = child.stderr.take().expect("stderr piped above");

        // 6. Serial console: stream to the log sink while scanning for the
        // exit marker.
        let capture = Arc::new(Mutex::new(ExitCodeCapture::new(exit_marker)));
        let feed = Arc::clone(&capture);
        let sink = Arc::clone(&req.log_sink);
        let cancel = ctx.cancel.clone();
        let stdout_task = tokio::spawn(async move {
            let mut tee = InspectReader::new(stdout, move |chunk| {
                if let Ok(mut c) = feed.lock() {
                    c.feed(chunk);
                }
            });
            sink.consume(&cancel, LogStream::Stdout, &mut tee).await
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

        // 7. Exit code: the nonce-tagged marker wins over the VM process
        // status (the VM exits 0 even when the command failed).
        let captured = {
            let mut c = capture.lock().expect("capture mutex poisoned");
            c.flush();
            c.exit_code()
        };

        // Without a marker, fall back to the VM process status (a clean VM
        // exit reports 0).
        let (mut status, vm_exit_code) = outcome.into_status();
        let exit_code = captured.unwrap_or(vm_exit_code);
        if exit_code != 0 && status == RunStatus::Succeeded {
            status = RunStatus::Failed;
        }
        let exit_code = if status == RunStatus::TimedOut {
            124
        } else {
            exit_code
        };

        let mut result = RunResult {
            exit_code,
            status,
            stdout_truncated: req.log_sink.stdout_truncated(),
            stderr_truncated: req.log_sink.stderr_truncated(),
            warnings: Vec::new(),
        };

        // 8. Fold workspace changes back; skipped for canceled/timed_out
        // terminal states. Extraction failure is a warning, not a failure.
        if matches!(result.status, RunStatus::Succeeded | RunStatus::Failed) {
            if let Err(e) = extract_image_to_dir(&ws_image, &req.facility_path).await {
                let msg = format!("workspace extraction error: {e}");
                tracing::warn!(directive_id = %req.directive_id, "{msg}");
                result.warnings.push(msg);
            }
        }

        consume_out?;
        consume_err?;
        Ok(result)
    }
}

#[async_trait]
impl Driver for FirecrackerDriver {
    fn name(&self) -> &'static str {
        "firecracker"
    }

    /// KVM access, the firecracker binary, the kernel and rootfs images,
    /// and mke2fs must all be present.
    async fn health_check(&self) -> HealthResult {
        if let Err(e) = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/kvm")
        {
            return HealthResult::unhealthy("firecracker", format!("/dev/kvm not accessible: {e}"));
        }

        let mut version = Command::new(self.firecracker_path());
        version
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match tokio::time::timeout(Duration::from_secs(5), version.status()).await {
            Err(_) => return HealthResult::unhealthy("firecracker", "version probe timed out"),
            Ok(Err(_)) => {
                return HealthResult::unhealthy("firecracker", "firecracker binary not found in PATH");
            }
            Ok(Ok(_)) => {}
        }

        if self.cfg.kernel_path.is_empty() {
            return HealthResult::unhealthy("firecracker", "kernel_path not configured");
        }
        if !std::path::Path::new(&self.cfg.kernel_path).exists() {
            return HealthResult::unhealthy(
                "firecracker",
                format!("kernel not found: {}", self.cfg.kernel_path),
            );
        }
        if self.cfg.rootfs_image_path.is_empty() {
            return HealthResult::unhealthy("firecracker", "rootfs_image_path not configured");
        }
        if !std::path::Path::new(&self.cfg.rootfs_image_path).exists() {
            return HealthResult::unhealthy(
                "firecracker",
                format!("rootfs image not found: {}", self.cfg.rootfs_image_path),
            );
        }

        let mut health = HealthResult::healthy("firecracker");
        let mke2fs = Command::new("mke2fs")
            .arg("-V")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if mke2fs.is_err() {
            health.details.insert(
                "warning".into(),
                "mke2fs not found (needed for workspace ext4 images)".into(),
            );
        }
        health
    }

    async fn run(&self, ctx: &ExecContext, req: RunRequest) -> Result<RunResult, SandboxError> {
        if req.command.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }
        if req.facility_path.as_os_str().is_empty() {
            return Err(SandboxError::InvalidRequest(
                "facility path is required for firecracker driver".into(),
            ));
        }

        // Ephemeral staging area; removed on drop on every exit path.
        let tmp_dir = tempfile::Builder::new()
            .prefix(&format!("nexus-fc-{}-", req.directive_id))
            .tempdir()?;

        let audit_sink = audit_to_log_sink(Arc::clone(&req.log_sink), ctx.cancel.clone());
        let proxy = start_for_directive(
            &self.proxy_socket_dir(&req),
            &req.directive_id,
            req.net_capability.as_ref(),
            audit_sink,
        )?;

        let result = self.run_vm(ctx, &req, &proxy, tmp_dir.path()).await;
        proxy.stop().await;
        result
    }
}

fn set_executable(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_name() {
        let drv = FirecrackerDriver::new(FirecrackerConfig::default());
        assert_eq!(drv.name(), "firecracker");
    }

    #[tokio::test]
    async fn unhealthy_without_kvm_or_assets() {
        // On machines without /dev/kvm this fails at the first check; with
        // KVM it fails on the unset kernel/rootfs paths. Either way it
        // must not report healthy with an empty config.
        let drv = FirecrackerDriver::new(FirecrackerConfig {
            firecracker_path: "/nonexistent/firecracker".into(),
            ..Default::default()
        });
        let health = drv.health_check().await;
        assert!(!health.healthy);
    }
}
