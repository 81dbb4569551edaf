use std::collections::BTreeMap;
use std::path::Path;

use crate::sandbox::SandboxError;
use crate::sandbox::bwrap::shell_quote;
use crate::sandbox::cwd::{SANDBOX_WORKSPACE, resolve_sandbox_cwd};

fn is_valid_env_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    if !(bytes[0].is_ascii_alphabetic() || bytes[0] == b'_') {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'_')
}

/// Inputs for a `podman run` / `docker run` invocation.
pub struct ContainerCmdConfig<'a> {
    pub runtime: &'a str,
    pub image: &'a str,

    /// Host-side facility directory, mounted at /workspace.
    pub facility_path: &'a Path,

    pub command: &'a str,
    /// Default /bin/sh.
    pub shell: &'a str,
    /// Working directory after prepare; must stay under /workspace.
    pub cwd: &'a str,

    pub env: &'a BTreeMap<String, String>,

    /// "env" injects HTTP_PROXY/HTTPS_PROXY; anything else disables it.
    pub proxy_mode: &'a str,
    /// Loopback proxy URL, used when proxy_mode is "env".
    pub proxy_url: &'a str,

    /// Non-empty triggers an in-container git clone when /workspace is
    /// empty.
    pub repo_url: &'a str,
    pub git_clone_args: &'a [String],
    pub git_clone_env: &'a [(String, String)],
}

/// Construct the container-runtime argv (including the runtime binary).
pub fn build_args(cfg: &ContainerCmdConfig<'_>) -> Result<Vec<String>, SandboxError> {
    if cfg.runtime.is_empty() {
        return Err(SandboxError::InvalidRequest("runtime is required".into()));
    }
    if cfg.image.is_empty() {
        return Err(SandboxError::InvalidRequest("image is required".into()));
    }
    if cfg.facility_path.as_os_str().is_empty() {
        return Err(SandboxError::InvalidRequest("facility path is required".into()));
    }
    if cfg.command.is_empty() {
        return Err(SandboxError::EmptyCommand);
    }

    let shell = if cfg.shell.is_empty() {
        "/bin/sh"
    } else {
        cfg.shell
    };
    let resolved_cwd = resolve_sandbox_cwd(cfg.cwd)?;

    let mut args: Vec<String> = vec![cfg.runtime.to_string(), "run".into(), "--rm".into()];

    // Host networking so the container can reach the loopback proxy.
    args.push("--network=host".into());

    args.push("--cap-drop=ALL".into());
    args.push("--security-opt=no-new-privileges".into());

    args.push("--volume".into());
    args.push(format!(
        "{}:{SANDBOX_WORKSPACE}:Z",
        cfg.facility_path.to_string_lossy()
    ));

    args.push("--workdir".into());
    args.push(SANDBOX_WORKSPACE.into());

    for kv in ["NO_COLOR=1", "TERM=dumb", "CI=true"] {
        args.push("--env".into());
        args.push(kv.into());
    }

    if cfg.proxy_mode == "env" && !cfg.proxy_url.is_empty() {
        for key in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
            args.push("--env".into());
            args.push(format!("{key}={}", cfg.proxy_url));
        }
    }

    for (k, v) in cfg.env {
        if !is_valid_env_key(k) {
            return Err(SandboxError::InvalidRequest(format!("invalid env key: {k:?}")));
        }
        args.push("--env".into());
        args.push(format!("{k}={v}"));
    }

    args.push(cfg.image.to_string());

    args.push(shell.to_string());
    args.push("-c".into());
    args.push(build_inner_command(cfg, &resolved_cwd));

    Ok(args)
}

/// The script run inside the container: optional clone into an empty
/// workspace, cd, then the user command.
fn build_inner_command(cfg: &ContainerCmdConfig<'_>, resolved_cwd: &str) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !cfg.repo_url.is_empty() && !cfg.git_clone_args.is_empty() {
        let mut b = String::new();
        b.push_str(
            "if [ -z \"$(find /workspace -mindepth 1 -maxdepth 1 -print -quit 2>/dev/null)\" ]; then ",
        );
        for (k, v) in cfg.git_clone_env {
            if !is_valid_env_key(k) {
                continue; // validated upstream when the args were built
            }
            b.push_str(&format!("export {k}={}; ", shell_quote(v)));
        }
        let quoted: Vec<String> = cfg.git_clone_args.iter().map(|a| shell_quote(a)).collect();
        b.push_str(&quoted.join(" "));
        b.push_str("; else echo '[prepare] workspace not empty; skipping clone' >&2; fi");
        parts.push(b);
    }

    if resolved_cwd != SANDBOX_WORKSPACE {
        parts.push(format!("cd {}", shell_quote(resolved_cwd)));
    }

    parts.push(cfg.command.to_string());
    parts.join(" && ")
}
