use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::sandbox::SandboxError;
use crate::sandbox::bwrap::shell_quote;
use crate::sandbox::cwd::SANDBOX_WORKSPACE;

/// TCP port the guest-side socat bridge (started by nexus-init) listens
/// on, forwarding to vsock CID=2 port 9080 on the host.
const GUEST_PROXY_PORT: u16 = 9080;

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

/// Inputs for the wrapper script run by nexus-init inside the guest (as
/// /run.sh from the cmd drive).
///
/// Unlike the bwrap wrapper this does not start socat: the guest init
/// already bridges vsock to TCP:9080 before handing control over.
#[derive(Debug, Clone, Default)]
pub struct FcWrapperConfig {
    /// Working directory, already resolved against /workspace.
    pub cwd: String,

    pub user_command: String,

    /// Default /bin/sh.
    pub shell: String,

    pub repo_url: String,
    pub git_clone_args: Vec<String>,
    pub git_clone_env: Vec<(String, String)>,

    pub env: BTreeMap<String, String>,

    /// Nonce-tagged marker prefix, e.g. `NEXUS_EXIT_a1b2c3d4e5f60718=`.
    /// The wrapper echoes it with the exit code so the host can identify
    /// the real result on the serial console.
    pub exit_marker: String,
}

pub fn generate_wrapper(cfg: &FcWrapperConfig) -> Result<String, SandboxError> {
    if cfg.user_command.is_empty() {
        return Err(SandboxError::EmptyCommand);
    }

    let shell = if cfg.shell.is_empty() {
        "/bin/sh"
    } else {
        cfg.shell.as_str()
    };

    let mut b = String::new();
    b.push_str("#!/bin/sh\n");
    b.push_str("set -e\n\n");

    let proxy_url = format!("http://127.0.0.1:{GUEST_PROXY_PORT}");
    writeln!(b, "export HTTP_PROXY={}", shell_quote(&proxy_url)).expect("write to string");
    writeln!(b, "export HTTPS_PROXY={}", shell_quote(&proxy_url)).expect("write to string");
    writeln!(b, "export http_proxy={}", shell_quote(&proxy_url)).expect("write to string");
    writeln!(b, "export https_proxy={}", shell_quote(&proxy_url)).expect("write to string");

    b.push_str("export NO_COLOR=1\n");
    b.push_str("export TERM=dumb\n");
    b.push_str("export CI=true\n");
    b.push_str("export HOME='/workspace'\n");
    b.push_str("export PATH='/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin'\n");

    for (k, v) in &cfg.env {
        if !is_valid_env_key(k) {
            return Err(SandboxError::InvalidRequest(format!("invalid env key: {k:?}")));
        }
        writeln!(b, "export {k}={}", shell_quote(v)).expect("write to string");
    }
    b.push('\n');

    if !cfg.repo_url.is_empty() && !cfg.git_clone_args.is_empty() {
        b.push_str(
            "if [ -z \"$(find /workspace -mindepth 1 -maxdepth 1 -print -quit 2>/dev/null)\" ]; then\n",
        );
        for (k, v) in &cfg.git_clone_env {
            if !is_valid_env_key(k) {
                return Err(SandboxError::InvalidRequest(format!(
                    "invalid git clone env key: {k:?}"
                )));
            }
            writeln!(b, "  export {k}={}", shell_quote(v)).expect("write to string");
        }
        let quoted: Vec<String> = cfg.git_clone_args.iter().map(|a| shell_quote(a)).collect();
        writeln!(b, "  {}", quoted.join(" ")).expect("write to string");
        b.push_str("else\n");
        b.push_str("  echo '[prepare] workspace not empty; skipping clone' >&2\n");
        b.push_str("fi\n\n");
    }

    if !cfg.cwd.is_empty() && cfg.cwd != SANDBOX_WORKSPACE {
        writeln!(b, "cd {}\n", shell_quote(&cfg.cwd)).expect("write to string");
    }

    b.push_str("set +e\n");
    writeln!(b, "{shell} -c {}", shell_quote(&cfg.user_command)).expect("write to string");
    b.push_str("EXIT_CODE=$?\n");
    b.push_str("set -e\n\n");

    if !cfg.exit_marker.is_empty() {
        writeln!(b, "echo '{}'\"${{EXIT_CODE}}\"", cfg.exit_marker).expect("write to string");
    }

    b.push_str("exit $EXIT_CODE\n");
    Ok(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> FcWrapperConfig {
        FcWrapperConfig {
            user_command: "cargo test".into(),
            exit_marker: "NEXUS_EXIT_0123456789abcdef=".into(),
            ..Default::default()
        }
    }

    #[test]
    fn no_socat_in_guest_wrapper() {
        let script = generate_wrapper(&base_config()).unwrap();
        assert!(!script.contains("socat"));
    }

    #[test]
    fn exports_proxy_at_guest_bridge_port() {
        let script = generate_wrapper(&base_config()).unwrap();
        assert!(script.contains("export HTTP_PROXY='http://127.0.0.1:9080'"));
        assert!(script.contains("export https_proxy='http://127.0.0.1:9080'"));
    }

    #[test]
    fn echoes_nonce_tagged_exit_marker() {
        let script = generate_wrapper(&base_config()).unwrap();
        assert!(script.contains("echo 'NEXUS_EXIT_0123456789abcdef='\"${EXIT_CODE}\""));
        assert!(script.ends_with("exit $EXIT_CODE\n"));
    }

    #[test]
    fn marker_omitted_when_empty() {
        let mut cfg = base_config();
        cfg.exit_marker = String::new();
        let script = generate_wrapper(&cfg).unwrap();
        assert!(!script.contains("NEXUS_EXIT"));
    }

    #[test]
    fn invalid_env_key_rejected() {
        let mut cfg = base_config();
        cfg.env.insert("PATH=;evil".into(), "x".into());
        assert!(generate_wrapper(&cfg).is_err());
    }

    #[test]
    fn empty_command_rejected() {
        let mut cfg = base_config();
        cfg.user_command = String::new();
        assert!(matches!(
            generate_wrapper(&cfg),
            Err(SandboxError::EmptyCommand)
        ));
    }

    #[test]
    fn clone_and_cwd_sections() {
        let (args, env) =
            crate::sandbox::prepare::git_clone_args("https://example.com/r.git").unwrap();
        let mut cfg = base_config();
        cfg.repo_url = "https://example.com/r.git".into();
        cfg.git_clone_args = args;
        cfg.git_clone_env = env;
        cfg.cwd = "/workspace/app".into();
        let script = generate_wrapper(&cfg).unwrap();
        assert!(script.contains("find /workspace -mindepth 1"));
        assert!(script.contains("cd '/workspace/app'"));
    }
}
