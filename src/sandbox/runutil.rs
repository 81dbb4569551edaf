//! Shared process plumbing for drivers: minimal environments, process-group
//! kill, exit-code derivation, and context-aware child waiting.

use std::collections::BTreeMap;
use std::process::ExitStatus;

use tokio::process::Child;

use crate::protocol::RunStatus;

use super::ExecContext;

/// Environment variables a host-executing driver may inherit. Everything
/// else (API keys, tokens) stays behind on the host.
const INHERITED_ENV_KEYS: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "SHELL", "TMPDIR", "LANG", "LC_ALL",
];

/// Minimal inherited environment for the host driver.
pub fn minimal_host_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for key in INHERITED_ENV_KEYS {
        if let Ok(v) = std::env::var(key) {
            if !v.is_empty() {
                env.insert(key.to_string(), v);
            }
        }
    }
    env
}

/// Same allowlist plus SSH_AUTH_SOCK, for automation scripts that drive
/// git/SSH on macOS.
pub fn minimal_darwin_env() -> BTreeMap<String, String> {
    let mut env = minimal_host_env();
    if let Ok(v) = std::env::var("SSH_AUTH_SOCK") {
        if !v.is_empty() {
            env.insert("SSH_AUTH_SOCK".to_string(), v);
        }
    }
    env
}

/// Fixed environment for spawning sandbox helper binaries (bwrap,
/// firecracker, container runtimes). Nothing is inherited.
pub fn minimal_spawn_env() -> Vec<(String, String)> {
    vec![
        (
            "PATH".to_string(),
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        ),
        ("HOME".to_string(), "/".to_string()),
        ("LANG".to_string(), "C".to_string()),
        ("LC_ALL".to_string(), "C".to_string()),
    ]
}

/// SIGKILL the child's entire process group, so grandchildren die too.
pub fn kill_process_group(child: &Child) {
    let Some(pid) = child.id() else { return };
    let pgid = nix::unistd::Pid::from_raw(pid as i32);
    if nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL).is_err() {
        // Group may already be gone; fall back to the direct pid.
        let _ = nix::sys::signal::kill(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}

/// How a child process finished relative to its execution context.
#[derive(Debug)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    Canceled(Option<ExitStatus>),
    TimedOut(Option<ExitStatus>),
}

impl WaitOutcome {
    /// Map the outcome to the reported (status, exit_code) pair.
    /// Timeouts use the conventional 124; a canceled child killed by
    /// SIGKILL reports 137 (128+9).
    pub fn into_status(self) -> (RunStatus, i32) {
        match self {
            WaitOutcome::Exited(st) => {
                let code = exit_code_of(st);
                let status = if code == 0 {
                    RunStatus::Succeeded
                } else {
                    RunStatus::Failed
                };
                (status, code)
            }
            WaitOutcome::Canceled(st) => (RunStatus::Canceled, st.map(exit_code_of).unwrap_or(137)),
            WaitOutcome::TimedOut(_) => (RunStatus::TimedOut, 124),
        }
    }
}

/// Wait for the child while observing the execution context. On cancel or
/// deadline the whole process group is SIGKILLed and the child reaped.
pub async fn wait_child(child: &mut Child, ctx: &ExecContext) -> std::io::Result<WaitOutcome> {
    let deadline = async {
        match ctx.deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        status = child.wait() => Ok(WaitOutcome::Exited(status?)),
        _ = ctx.cancel.cancelled() => {
            kill_process_group(child);
            let st = child.wait().await.ok();
            Ok(WaitOutcome::Canceled(st))
        }
        _ = deadline => {
            kill_process_group(child);
            let st = child.wait().await.ok();
            Ok(WaitOutcome::TimedOut(st))
        }
    }
}

/// Extract the exit code: the real code for normal exits, 128+signal for
/// signal-killed processes, 1 as fallback.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    1
}
