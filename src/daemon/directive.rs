use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio_util::sync::CancellationToken;

use crate::logstream::{Uploader, overflow_manifest};
use crate::protocol::{
    DirectiveLease, DirectiveSpec, FinishedRequest, LooseMap, RunStatus, StartedRequest,
    now_rfc3339,
};
use crate::retry::post_with_retry;
use crate::sandbox::{
    ExecContext, LogSink, LogStream, RunRequest, RunResult, WaitOutcome, prepare, wait_child,
};
use crate::version;

use super::heartbeat::TokenHolder;
use super::helpers::{
    MIN_DISK_BYTES, build_directive_env, check_disk_space, git_host_env, is_valid_facility_id,
};
use super::service::Service;
use super::wal::WalEntry;

/// Pre-assignment driver health checks get their own budget so they never
/// eat into the directive's execution timeout.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

const DIFF_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_DIFF_BYTES: u64 = 1 << 20;

enum PrepareError {
    Failed(String),
    Canceled,
    TimedOut,
}

impl Service {
    /// The per-claim lifecycle: preconditions, driver selection and health
    /// check, started, heartbeat, prepare, run, diff, finished-with-WAL-
    /// fallback.
    pub(super) async fn handle_directive(
        self: Arc<Self>,
        cancel: CancellationToken,
        lease: DirectiveLease,
    ) -> Result<()> {
        let cancel = &cancel;
        let directive_start = std::time::Instant::now();
        let spec = lease.spec;
        let directive_id = lease.directive_id;
        let token = Arc::new(TokenHolder::new(lease.directive_token));
        let facility_id = spec.facility.id.clone();

        // Preconditions: enough disk, a facility id safe for the
        // filesystem.
        match check_disk_space(&self.cfg.work_dir) {
            Err(e) => {
                tracing::warn!(directive_id = %directive_id, error = %e, "disk space check failed");
            }
            Ok(avail) if avail < MIN_DISK_BYTES => {
                tracing::error!(
                    directive_id = %directive_id,
                    available_bytes = avail,
                    min_bytes = MIN_DISK_BYTES,
                    "insufficient disk space, rejecting directive"
                );
                return self
                    .reject_directive(
                        cancel,
                        &directive_id,
                        &token,
                        &spec,
                        directive_start,
                        "insufficient disk space",
                    )
                    .await;
            }
            Ok(_) => {}
        }

        if !is_valid_facility_id(&facility_id) {
            tracing::error!(
                directive_id = %directive_id,
                facility_id = %facility_id,
                "invalid facility ID, rejecting directive"
            );
            return self
                .reject_directive(
                    cancel,
                    &directive_id,
                    &token,
                    &spec,
                    directive_start,
                    "invalid facility ID",
                )
                .await;
        }
        let facility_path = self.cfg.work_dir.join(&facility_id);
        std::fs::create_dir_all(&facility_path)?;

        // Execution scope: a timeout when configured, otherwise just
        // cancellable so heartbeat-requested cancels still work.
        let exec_cancel = cancel.child_token();
        let deadline = (spec.timeout_seconds > 0)
            .then(|| tokio::time::Instant::now() + Duration::from_secs(spec.timeout_seconds));
        let exec_ctx = ExecContext::new(exec_cancel.clone(), deadline);

        let profile = if spec.sandbox_profile.is_empty() {
            "host".to_string()
        } else {
            spec.sandbox_profile.clone()
        };
        self.tape_event(
            "directive_claimed",
            &directive_id,
            &facility_id,
            &profile,
            "",
            Some(serde_json::json!({
                "timeout_seconds": spec.timeout_seconds,
                "repo_url": prepare::redact_repo_url(&spec.facility.repo_url),
            })),
        );

        let driver = match self.factory.get(&profile) {
            Ok(d) => d,
            Err(e) => {
                self.tape_event(
                    "driver_select_failed",
                    &directive_id,
                    &facility_id,
                    &profile,
                    "",
                    Some(serde_json::json!({"error": e.to_string()})),
                );
                return Err(anyhow!(e)).context(format!("select driver for profile {profile:?}"));
            }
        };
        let driver_name = driver.name();
        self.tape_event("driver_selected", &directive_id, &facility_id, &profile, driver_name, None);

        // Pre-assignment health check.
        let health = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, driver.health_check()).await;
        let healthy = matches!(&health, Ok(h) if h.healthy);
        if !healthy {
            let details = match &health {
                Ok(h) => serde_json::to_value(&h.details).unwrap_or_default(),
                Err(_) => serde_json::Value::String("health check timed out".into()),
            };
            self.tape_event(
                "driver_unhealthy",
                &directive_id,
                &facility_id,
                &profile,
                driver_name,
                Some(serde_json::json!({"health_details": details})),
            );
            tracing::error!(
                directive_id = %directive_id,
                driver = driver_name,
                health_details = %details,
                "driver unhealthy, rejecting directive"
            );
            return self
                .reject_directive(
                    cancel,
                    &directive_id,
                    &token,
                    &spec,
                    directive_start,
                    "driver_unhealthy",
                )
                .await;
        }

        // Started must land before any log chunk; the server is still in
        // `leased` until then.
        let mut eff = LooseMap::new();
        eff.insert("driver".into(), driver_name.into());
        eff.insert("profile".into(), profile.clone().into());
        eff.insert(
            "net".into(),
            serde_json::to_value(&spec.capabilities.net).unwrap_or_default(),
        );
        eff.insert(
            "fs".into(),
            serde_json::to_value(&spec.capabilities.fs).unwrap_or_default(),
        );
        let started_req = StartedRequest {
            effective_capabilities_summary: eff,
            sandbox_version: format!("nexusd-{driver_name}"),
            nexusd_version: version::VERSION.to_string(),
            started_at: now_rfc3339(),
        };
        let started_post = post_with_retry(cancel, "started", || {
            let cli = Arc::clone(&self.cli);
            let directive_id = directive_id.clone();
            let token = token.get();
            let req = started_req.clone();
            async move { cli.started(&directive_id, &token, &req).await }
        })
        .await;
        if let Err(e) = started_post {
            self.tape_event(
                "started_post_failed",
                &directive_id,
                &facility_id,
                &profile,
                driver_name,
                Some(serde_json::json!({"error": e.to_string()})),
            );
            return Err(anyhow!(e)).context("post started");
        }
        self.tape_event(
            "started_posted",
            &directive_id,
            &facility_id,
            &profile,
            driver_name,
            Some(serde_json::json!({"sandbox_version": started_req.sandbox_version})),
        );

        // Log uploader; the server enforces the cap authoritatively, this
        // is the best-effort client side.
        let max_output_bytes = if spec.limits.max_output_bytes > 0 {
            spec.limits.max_output_bytes
        } else {
            self.cfg.log.max_output_bytes
        };
        let uploader_token = Arc::clone(&token);
        let uploader = Arc::new(Uploader::new(
            Arc::clone(&self.cli),
            directive_id.clone(),
            Arc::new(move || uploader_token.get()),
            self.cfg.log.chunk_bytes,
            max_output_bytes,
        ));
        if self.cfg.log_overflow.enabled {
            uploader
                .enable_overflow(
                    facility_path
                        .join(&self.cfg.log_overflow.dir)
                        .join(&directive_id),
                    self.cfg.log_overflow.max_bytes_per_stream,
                )
                .await;
        }

        // Heartbeat, running concurrently with prepare and execution.
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let hb_cancel = exec_cancel.child_token();
        let hb_handle = tokio::spawn({
            let this = Arc::clone(&self);
            let hb_cancel = hb_cancel.clone();
            let directive_id = directive_id.clone();
            let facility_id = facility_id.clone();
            let profile = profile.clone();
            let driver_name = driver_name.to_string();
            let token = Arc::clone(&token);
            let cancel_requested = Arc::clone(&cancel_requested);
            let exec_cancel = exec_cancel.clone();
            async move {
                this.run_directive_heartbeat_loop(
                    hb_cancel,
                    directive_id,
                    facility_id,
                    profile,
                    driver_name,
                    token,
                    cancel_requested,
                    exec_cancel,
                )
                .await
            }
        });

        // Host-executing drivers clone on the host filesystem; isolated
        // drivers run prepare inside the sandbox via the wrapper.
        if matches!(driver_name, "host" | "darwin-automation") {
            if let Err(prep_err) = self
                .prepare_facility(
                    &exec_ctx,
                    cancel,
                    &directive_id,
                    &facility_path,
                    &spec,
                    &uploader,
                    driver_name,
                    &profile,
                )
                .await
            {
                let (status, exit_code, message) = match prep_err {
                    PrepareError::Failed(m) => (RunStatus::Failed, 1, m),
                    PrepareError::TimedOut => (RunStatus::TimedOut, 124, "timed out".into()),
                    PrepareError::Canceled => (RunStatus::Canceled, 137, "canceled".into()),
                };
                self.tape_event(
                    "prepare_failed",
                    &directive_id,
                    &facility_id,
                    &profile,
                    driver_name,
                    Some(serde_json::json!({"error": message.clone()})),
                );
                uploader
                    .upload_bytes(
                        cancel,
                        LogStream::Stderr,
                        format!("[prepare] failed: {message}\n").as_bytes(),
                    )
                    .await;

                hb_cancel.cancel();
                let _ = hb_handle.await;

                let finish_req = self
                    .build_finished(
                        status,
                        Some(exit_code),
                        uploader.stdout_truncated(),
                        uploader.stderr_truncated(),
                        String::new(),
                        &uploader,
                        &spec,
                        &directive_id,
                    )
                    .await;
                self.post_finished_or_wal(
                    cancel,
                    &directive_id,
                    &facility_id,
                    &profile,
                    driver_name,
                    &token,
                    finish_req,
                )
                .await
                .with_context(|| format!("prepare failed ({message})"))?;

                self.metrics
                    .directives_total
                    .with_label_values(&[status.as_str()])
                    .inc();
                self.metrics
                    .directive_duration
                    .with_label_values(&[driver_name, &profile])
                    .observe(directive_start.elapsed().as_secs_f64());
                return Ok(());
            }
        }

        let req = RunRequest {
            directive_id: directive_id.clone(),
            command: spec.command.clone(),
            shell: spec.shell.clone(),
            cwd: spec.cwd.clone(),
            env: build_directive_env(&self.cfg, &directive_id, &spec),
            facility_path: facility_path.clone(),
            max_output_bytes,
            chunk_bytes: self.cfg.log.chunk_bytes,
            log_sink: Arc::clone(&uploader) as Arc<dyn LogSink>,
            net_capability: spec.capabilities.net.clone(),
            fs_capability: spec.capabilities.fs.clone(),
            repo_url: spec.facility.repo_url.clone(),
            limits: spec.limits,
        };

        self.tape_event(
            "run_started",
            &directive_id,
            &facility_id,
            &profile,
            driver_name,
            Some(serde_json::json!({"cwd": spec.cwd})),
        );

        let res = match driver.run(&exec_ctx, req).await {
            Ok(res) => {
                for warning in &res.warnings {
                    tracing::warn!(directive_id = %directive_id, warning = %warning, "driver warning");
                }
                res
            }
            Err(e) => {
                tracing::error!(
                    directive_id = %directive_id,
                    driver = driver_name,
                    error = %e,
                    "driver run failed"
                );
                self.tape_event(
                    "driver_error",
                    &directive_id,
                    &facility_id,
                    &profile,
                    driver_name,
                    Some(serde_json::json!({"error": e.to_string()})),
                );
                RunResult {
                    exit_code: 1,
                    status: RunStatus::Failed,
                    stdout_truncated: uploader.stdout_truncated(),
                    stderr_truncated: uploader.stderr_truncated(),
                    warnings: Vec::new(),
                }
            }
        };
        let mut tape_detail = serde_json::json!({
            "status": res.status.as_str(),
            "exit_code": res.exit_code,
        });
        if !res.warnings.is_empty() {
            tape_detail["warnings"] = serde_json::to_value(&res.warnings).unwrap_or_default();
        }
        self.tape_event(
            "run_finished",
            &directive_id,
            &facility_id,
            &profile,
            driver_name,
            Some(tape_detail),
        );

        hb_cancel.cancel();
        let _ = hb_handle.await;

        // Status reconciliation: a server-requested cancel overrides any
        // non-success terminal state.
        let mut status = res.status;
        if cancel_requested.load(Ordering::SeqCst) && status != RunStatus::Succeeded {
            status = RunStatus::Canceled;
        }

        // Diff collection uses the parent scope: the exec context may
        // already be canceled or expired.
        let diff_base64 = self.collect_diff(&facility_path, &spec).await;

        tracing::info!(
            directive_id = %directive_id,
            status = status.as_str(),
            exit_code = res.exit_code,
            stdout_truncated = res.stdout_truncated,
            stderr_truncated = res.stderr_truncated,
            "directive finished"
        );

        let finish_req = self
            .build_finished(
                status,
                Some(res.exit_code),
                res.stdout_truncated,
                res.stderr_truncated,
                diff_base64,
                &uploader,
                &spec,
                &directive_id,
            )
            .await;
        self.post_finished_or_wal(
            cancel,
            &directive_id,
            &facility_id,
            &profile,
            driver_name,
            &token,
            finish_req,
        )
        .await?;

        self.metrics
            .directives_total
            .with_label_values(&[status.as_str()])
            .inc();
        self.metrics
            .directive_duration
            .with_label_values(&[driver_name, &profile])
            .observe(directive_start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Report a directive as started+finished(failed) without executing
    /// it: insufficient disk, invalid facility, unhealthy driver.
    async fn reject_directive(
        &self,
        cancel: &CancellationToken,
        directive_id: &str,
        token: &Arc<TokenHolder>,
        spec: &DirectiveSpec,
        directive_start: std::time::Instant,
        reason: &str,
    ) -> Result<()> {
        let started_req = StartedRequest {
            sandbox_version: "nexusd".to_string(),
            nexusd_version: version::VERSION.to_string(),
            started_at: now_rfc3339(),
            ..Default::default()
        };
        post_with_retry(cancel, "started", || {
            let cli = Arc::clone(&self.cli);
            let directive_id = directive_id.to_string();
            let token = token.get();
            let req = started_req.clone();
            async move { cli.started(&directive_id, &token, &req).await }
        })
        .await
        .map_err(|e| anyhow!(e).context(format!("reject {reason}: started post failed")))?;

        let finish_req = FinishedRequest {
            exit_code: Some(1),
            status: RunStatus::Failed,
            finished_at: now_rfc3339(),
            ..Default::default()
        };
        let post = post_with_retry(cancel, "finished", || {
            let cli = Arc::clone(&self.cli);
            let directive_id = directive_id.to_string();
            let token = token.get();
            let req = finish_req.clone();
            async move { cli.finished(&directive_id, &token, &req).await }
        })
        .await;
        if post.is_err() {
            let entry = WalEntry {
                timestamp: now_rfc3339(),
                directive_id: directive_id.to_string(),
                token: token.get(),
                request: finish_req,
            };
            if let Err(wal_err) = self.wal.append(&entry) {
                tracing::error!(directive_id = %directive_id, error = %wal_err, "WAL append failed");
            }
        }

        self.metrics
            .directives_total
            .with_label_values(&[RunStatus::Failed.as_str()])
            .inc();
        self.metrics
            .directive_duration
            .with_label_values(&["", &spec.sandbox_profile])
            .observe(directive_start.elapsed().as_secs_f64());
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_finished(
        &self,
        status: RunStatus,
        exit_code: Option<i32>,
        stdout_truncated: bool,
        stderr_truncated: bool,
        diff_base64: String,
        uploader: &Uploader,
        spec: &DirectiveSpec,
        directive_id: &str,
    ) -> FinishedRequest {
        let mut artifacts = LooseMap::new();
        let info = uploader.overflow_info().await;
        if let Some(manifest) = overflow_manifest(
            &spec.facility.mount,
            &self.cfg.log_overflow.dir,
            directive_id,
            &info,
            stdout_truncated,
            stderr_truncated,
        ) {
            artifacts.insert(
                "log_overflow".into(),
                serde_json::to_value(manifest).unwrap_or_default(),
            );
        }

        FinishedRequest {
            exit_code,
            status,
            stdout_truncated,
            stderr_truncated,
            diff_base64,
            artifacts_manifest: artifacts,
            finished_at: now_rfc3339(),
            ..Default::default()
        }
    }

    /// Post `finished`; on failure after retries the payload goes to the
    /// WAL for replay on the next startup. Exactly one of the two happens.
    #[allow(clippy::too_many_arguments)]
    async fn post_finished_or_wal(
        &self,
        cancel: &CancellationToken,
        directive_id: &str,
        facility_id: &str,
        profile: &str,
        driver_name: &str,
        token: &Arc<TokenHolder>,
        finish_req: FinishedRequest,
    ) -> Result<()> {
        let post = post_with_retry(cancel, "finished", || {
            let cli = Arc::clone(&self.cli);
            let directive_id = directive_id.to_string();
            let token = token.get();
            let req = finish_req.clone();
            async move { cli.finished(&directive_id, &token, &req).await }
        })
        .await;

        match post {
            Ok(()) => {
                self.tape_event(
                    "finished_posted",
                    directive_id,
                    facility_id,
                    profile,
                    driver_name,
                    Some(serde_json::json!({
                        "status": finish_req.status.as_str(),
                        "exit_code": finish_req.exit_code,
                    })),
                );
                Ok(())
            }
            Err(post_err) => {
                self.tape_event(
                    "finished_post_failed",
                    directive_id,
                    facility_id,
                    profile,
                    driver_name,
                    Some(serde_json::json!({"error": post_err.to_string()})),
                );
                let entry = WalEntry {
                    timestamp: now_rfc3339(),
                    directive_id: directive_id.to_string(),
                    token: token.get(),
                    request: finish_req,
                };
                if let Err(wal_err) = self.wal.append(&entry) {
                    tracing::error!(
                        directive_id = %directive_id,
                        error = %wal_err,
                        "WAL append failed"
                    );
                }
                Err(anyhow!("post finished: {post_err}"))
            }
        }
    }

    /// Clone the facility repo when the workspace is empty, under an
    /// exclusive inter-process lock, streaming clone output through the
    /// uploader (the sequence continues into execution).
    #[allow(clippy::too_many_arguments)]
    async fn prepare_facility(
        &self,
        exec_ctx: &ExecContext,
        cancel: &CancellationToken,
        directive_id: &str,
        facility_path: &std::path::Path,
        spec: &DirectiveSpec,
        uploader: &Arc<Uploader>,
        driver_name: &str,
        profile: &str,
    ) -> Result<(), PrepareError> {
        let repo_url = &spec.facility.repo_url;
        if repo_url.is_empty() {
            return Ok(());
        }

        if !prepare::is_allowed_repo_scheme(repo_url) {
            self.tape_event(
                "prepare_clone_rejected",
                directive_id,
                &spec.facility.id,
                profile,
                driver_name,
                Some(serde_json::json!({
                    "error": "repo_url uses disallowed scheme",
                    "repo_url": prepare::redact_repo_url(repo_url),
                })),
            );
            return Err(PrepareError::Failed(
                "repo_url uses disallowed scheme (only https, http, ssh, git, or scp-like ssh are allowed)"
                    .into(),
            ));
        }

        // Exclusive inter-process lock against concurrent clones of the
        // same facility.
        let lock_path = facility_path.with_extension("lock");
        let lock = {
            let lock_path = lock_path.clone();
            tokio::task::spawn_blocking(move || acquire_flock(&lock_path))
                .await
                .map_err(|e| PrepareError::Failed(format!("acquire lock: {e}")))?
                .map_err(|e| PrepareError::Failed(format!("acquire lock: {e}")))?
        };

        let result = self
            .clone_into_facility(
                exec_ctx,
                cancel,
                directive_id,
                facility_path,
                spec,
                uploader,
                driver_name,
                profile,
            )
            .await;

        drop(lock);
        let _ = std::fs::remove_file(&lock_path);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn clone_into_facility(
        &self,
        exec_ctx: &ExecContext,
        cancel: &CancellationToken,
        directive_id: &str,
        facility_path: &std::path::Path,
        spec: &DirectiveSpec,
        uploader: &Arc<Uploader>,
        driver_name: &str,
        profile: &str,
    ) -> Result<(), PrepareError> {
        let repo_url = &spec.facility.repo_url;
        let redacted = prepare::redact_repo_url(repo_url);

        let entries = std::fs::read_dir(facility_path)
            .map_err(|e| PrepareError::Failed(e.to_string()))?
            .count();
        if entries != 0 {
            self.tape_event(
                "prepare_clone_skipped",
                directive_id,
                &spec.facility.id,
                profile,
                driver_name,
                Some(serde_json::json!({
                    "reason": "workspace_not_empty",
                    "entries": entries,
                    "repo_url": redacted,
                })),
            );
            return Ok(());
        }

        self.tape_event(
            "prepare_clone_started",
            directive_id,
            &spec.facility.id,
            profile,
            driver_name,
            Some(serde_json::json!({"repo_url": redacted})),
        );
        uploader
            .upload_bytes(
                cancel,
                LogStream::Stderr,
                format!("[prepare] facility empty; cloning {redacted}\n").as_bytes(),
            )
            .await;

        let (args, git_env) =
            prepare::git_clone_args(repo_url).map_err(PrepareError::Failed)?;

        let mut cmd = tokio::process::Command::new(&args[0]);
        cmd.args(&args[1..])
            .current_dir(facility_path)
            .env_clear()
            .envs(git_host_env())
            .envs(git_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| PrepareError::Failed(format!("start git clone: {e}")))?;

        let stdout = child.stdout.take().expect("stdout piped above");
        let stderr = child.stderr.take().expect("stderr piped above");

        let sink = Arc::clone(uploader);
        let consume_cancel = cancel.clone();
        let stdout_task = tokio::spawn(async move {
            let mut stdout = stdout;
            sink.consume(&consume_cancel, LogStream::Stdout, &mut stdout)
                .await
        });
        let sink = Arc::clone(uploader);
        let consume_cancel = cancel.clone();
        let stderr_task = tokio::spawn(async move {
            let mut stderr = stderr;
            sink.consume(&consume_cancel, LogStream::Stderr, &mut stderr)
                .await
        });

        let outcome = wait_child(&mut child, exec_ctx)
            .await
            .map_err(|e| PrepareError::Failed(format!("wait git clone: {e}")))?;

        let consume_out = stdout_task.await.unwrap_or(Ok(()));
        let consume_err = stderr_task.await.unwrap_or(Ok(()));
        if let Err(e) = consume_out.and(consume_err) {
            return Err(PrepareError::Failed(format!("stream clone output: {e}")));
        }

        match outcome {
            WaitOutcome::Exited(st) if st.success() => {
                self.tape_event(
                    "prepare_clone_succeeded",
                    directive_id,
                    &spec.facility.id,
                    profile,
                    driver_name,
                    Some(serde_json::json!({"repo_url": redacted})),
                );
                Ok(())
            }
            WaitOutcome::Exited(st) => {
                let msg = format!("git clone exited with {st}");
                self.tape_event(
                    "prepare_clone_failed",
                    directive_id,
                    &spec.facility.id,
                    profile,
                    driver_name,
                    Some(serde_json::json!({"repo_url": redacted, "error": msg})),
                );
                Err(PrepareError::Failed(msg))
            }
            WaitOutcome::Canceled(_) => Err(PrepareError::Canceled),
            WaitOutcome::TimedOut(_) => Err(PrepareError::TimedOut),
        }
    }

    /// `git diff HEAD` against the facility when it is a repo-backed
    /// workspace; base64 of the diff, or empty when absent, empty, or over
    /// the size limit.
    async fn collect_diff(&self, facility_path: &std::path::Path, spec: &DirectiveSpec) -> String {
        if spec.facility.repo_url.is_empty() {
            return String::new();
        }
        if !facility_path.join(".git").exists() {
            return String::new();
        }

        let output = tokio::time::timeout(DIFF_TIMEOUT, async {
            tokio::process::Command::new("git")
                .args(["diff", "HEAD"])
                .current_dir(facility_path)
                .env_clear()
                .envs(git_host_env())
                .stdin(Stdio::null())
                .output()
                .await
        })
        .await;

        let output = match output {
            Err(_) => {
                tracing::warn!(path = %facility_path.display(), "git diff timed out");
                return String::new();
            }
            Ok(Err(e)) => {
                tracing::warn!(path = %facility_path.display(), error = %e, "git diff failed");
                return String::new();
            }
            Ok(Ok(out)) => out,
        };
        if !output.status.success() {
            tracing::warn!(
                path = %facility_path.display(),
                status = %output.status,
                "git diff failed"
            );
            return String::new();
        }
        if output.stdout.is_empty() {
            return String::new();
        }

        let max_diff_bytes = if spec.limits.max_diff_bytes > 0 {
            spec.limits.max_diff_bytes
        } else {
            DEFAULT_MAX_DIFF_BYTES
        };
        if output.stdout.len() as u64 > max_diff_bytes {
            tracing::warn!(
                bytes = output.stdout.len(),
                max_bytes = max_diff_bytes,
                "diff too large, skipping"
            );
            return String::new();
        }

        BASE64.encode(&output.stdout)
    }
}

fn acquire_flock(path: &std::path::Path) -> std::io::Result<nix::fcntl::Flock<std::fs::File>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive)
        .map_err(|(_, errno)| std::io::Error::from(errno))
}
