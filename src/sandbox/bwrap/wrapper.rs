use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::sandbox::SandboxError;
use crate::sandbox::cwd::SANDBOX_WORKSPACE;

use super::cmdbuilder::{SANDBOX_PROXY_PORT, SANDBOX_PROXY_SOCK};

/// Safe POSIX environment variable name.
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

/// Inputs for the wrapper shell script that runs inside the bubblewrap
/// sandbox.
#[derive(Debug, Clone, Default)]
pub struct WrapperConfig {
    /// socat binary path inside the sandbox. Default "socat".
    pub socat_path: String,

    /// Local TCP port for the socat bridge. Default 9080.
    pub proxy_port: u16,

    /// Working directory after prepare, already resolved and validated
    /// against /workspace.
    pub cwd: String,

    pub user_command: String,

    /// Shell for the user command. Default /bin/sh.
    pub shell: String,

    /// Non-empty triggers a git clone when /workspace is empty.
    pub repo_url: String,
    pub git_clone_args: Vec<String>,
    pub git_clone_env: Vec<(String, String)>,

    /// Additional environment to export.
    pub env: BTreeMap<String, String>,
}

/// Produce the wrapper script:
///  1. Re-exec once under `env -i` for a clean, predictable environment.
///  2. Start socat bridging the proxy UDS to a local TCP port.
///  3. Export HTTP(S)_PROXY at the bridge, plus the sandbox env.
///  4. Optionally git clone into an empty /workspace.
///  5. cd to the resolved cwd and run the user command.
///  6. Exit with the command's exit code.
pub fn generate_wrapper(cfg: &WrapperConfig) -> Result<String, SandboxError> {
    if cfg.user_command.is_empty() {
        return Err(SandboxError::EmptyCommand);
    }

    let socat = if cfg.socat_path.is_empty() {
        "socat"
    } else {
        cfg.socat_path.as_str()
    };
    let proxy_port = if cfg.proxy_port == 0 {
        SANDBOX_PROXY_PORT
    } else {
        cfg.proxy_port
    };
    let shell = if cfg.shell.is_empty() {
        "/bin/sh"
    } else {
        cfg.shell.as_str()
    };

    let mut b = String::new();
    b.push_str("#!/bin/sh\n");

    // Clean environment: re-exec once under env -i so nothing from the
    // host leaks in. The guard variable prevents an exec loop.
    b.push_str("if [ \"${NEXUS_WRAPPER_CLEAN_ENV:-}\" != \"1\" ]; then\n");
    b.push_str("  exec /usr/bin/env -i \\\n");
    b.push_str("    NEXUS_WRAPPER_CLEAN_ENV=1 \\\n");
    b.push_str("    PATH='/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin' \\\n");
    b.push_str("    HOME='/workspace' \\\n");
    b.push_str("    LANG='C' \\\n");
    b.push_str("    LC_ALL='C' \\\n");
    b.push_str("    /bin/sh \"$0\"\n");
    b.push_str("fi\n\n");

    b.push_str("set -e\n\n");

    // socat bridge: UDS -> local TCP.
    writeln!(
        b,
        "{socat} TCP-LISTEN:{proxy_port},reuseaddr,fork UNIX-CONNECT:{SANDBOX_PROXY_SOCK} &"
    )
    .expect("write to string");
    b.push_str("SOCAT_PID=$!\n");
    b.push_str("cleanup() { kill \"$SOCAT_PID\" 2>/dev/null || true; }\n");
    b.push_str("trap cleanup EXIT\n\n");

    // Give socat a moment to start listening.
    b.push_str("sleep 0.1\n\n");

    let proxy_url = format!("http://127.0.0.1:{proxy_port}");
    writeln!(b, "export HTTP_PROXY={}", shell_quote(&proxy_url)).expect("write to string");
    writeln!(b, "export HTTPS_PROXY={}", shell_quote(&proxy_url)).expect("write to string");
    writeln!(b, "export http_proxy={}", shell_quote(&proxy_url)).expect("write to string");
    writeln!(b, "export https_proxy={}", shell_quote(&proxy_url)).expect("write to string");

    b.push_str("export NO_COLOR=1\n");
    b.push_str("export TERM=dumb\n");
    b.push_str("export CI=true\n");

    // Directive environment; keys are validated so values cannot smuggle
    // shell syntax through an export statement.
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

    // The user command may fail without killing the wrapper.
    b.push_str("set +e\n");
    writeln!(b, "{shell} -c {}", shell_quote(&cfg.user_command)).expect("write to string");
    b.push_str("EXIT_CODE=$?\n");
    b.push_str("set -e\n\n");
    b.push_str("exit $EXIT_CODE\n");

    Ok(b)
}

/// Single-quote a string for the shell, escaping embedded single quotes.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::prepare::git_clone_args;

    fn base_config() -> WrapperConfig {
        WrapperConfig {
            user_command: "make test".into(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_command_rejected() {
        let err = generate_wrapper(&WrapperConfig::default()).unwrap_err();
        assert!(matches!(err, SandboxError::EmptyCommand));
    }

    #[test]
    fn reexecs_under_clean_env_with_guard() {
        let script = generate_wrapper(&base_config()).unwrap();
        assert!(script.contains("NEXUS_WRAPPER_CLEAN_ENV"));
        assert!(script.contains("exec /usr/bin/env -i"));
        // Exactly one guard test, so a re-exec loop is impossible.
        assert_eq!(script.matches("exec /usr/bin/env -i").count(), 1);
    }

    #[test]
    fn starts_socat_with_exit_trap() {
        let script = generate_wrapper(&base_config()).unwrap();
        assert!(script.contains(
            "socat TCP-LISTEN:9080,reuseaddr,fork UNIX-CONNECT:/run/egress-proxy.sock &"
        ));
        assert!(script.contains("trap cleanup EXIT"));
    }

    #[test]
    fn exports_proxy_env_both_cases() {
        let script = generate_wrapper(&base_config()).unwrap();
        for line in [
            "export HTTP_PROXY='http://127.0.0.1:9080'",
            "export HTTPS_PROXY='http://127.0.0.1:9080'",
            "export http_proxy='http://127.0.0.1:9080'",
            "export https_proxy='http://127.0.0.1:9080'",
        ] {
            assert!(script.contains(line), "{line}");
        }
        assert!(script.contains("export NO_COLOR=1"));
        assert!(script.contains("export TERM=dumb"));
        assert!(script.contains("export CI=true"));
    }

    #[test]
    fn runs_user_command_quoted() {
        let mut cfg = base_config();
        cfg.user_command = "echo 'it works'".into();
        let script = generate_wrapper(&cfg).unwrap();
        assert!(script.contains(r#"/bin/sh -c 'echo '"'"'it works'"'"''"#));
        assert!(script.ends_with("exit $EXIT_CODE\n"));
    }

    #[test]
    fn invalid_env_key_fails_directive() {
        let mut cfg = base_config();
        cfg.env.insert("BAD;KEY".into(), "x".into());
        let err = generate_wrapper(&cfg).unwrap_err();
        assert!(err.to_string().contains("invalid env key"));

        let mut cfg = base_config();
        cfg.env.insert("1STARTS_WITH_DIGIT".into(), "x".into());
        assert!(generate_wrapper(&cfg).is_err());
    }

    #[test]
    fn env_values_are_quoted() {
        let mut cfg = base_config();
        cfg.env.insert("A_VAR".into(), "value; rm -rf /".into());
        let script = generate_wrapper(&cfg).unwrap();
        assert!(script.contains("export A_VAR='value; rm -rf /'"));
    }

    #[test]
    fn clone_runs_only_when_workspace_empty() {
        let (args, env) = git_clone_args("https://example.com/repo.git").unwrap();
        let cfg = WrapperConfig {
            user_command: "make".into(),
            repo_url: "https://example.com/repo.git".into(),
            git_clone_args: args,
            git_clone_env: env,
            ..Default::default()
        };
        let script = generate_wrapper(&cfg).unwrap();
        assert!(script.contains("find /workspace -mindepth 1 -maxdepth 1"));
        assert!(script.contains("'git' 'clone' '--depth' '1' '--' 'https://example.com/repo.git' '.'"));
        assert!(script.contains("export GIT_TERMINAL_PROMPT='0'"));
        assert!(script.contains("workspace not empty; skipping clone"));
    }

    #[test]
    fn cds_to_non_default_cwd() {
        let mut cfg = base_config();
        cfg.cwd = "/workspace/sub".into();
        let script = generate_wrapper(&cfg).unwrap();
        assert!(script.contains("cd '/workspace/sub'"));

        let mut cfg = base_config();
        cfg.cwd = SANDBOX_WORKSPACE.into();
        let script = generate_wrapper(&cfg).unwrap();
        assert!(!script.contains("\ncd "));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("a'b"), r#"'a'"'"'b'"#);
    }

    #[test]
    fn custom_shell_and_port() {
        let mut cfg = base_config();
        cfg.shell = "/bin/bash".into();
        cfg.proxy_port = 9999;
        cfg.socat_path = "/usr/bin/socat".into();
        let script = generate_wrapper(&cfg).unwrap();
        assert!(script.contains("/usr/bin/socat TCP-LISTEN:9999"));
        assert!(script.contains("export HTTP_PROXY='http://127.0.0.1:9999'"));
        assert!(script.contains("/bin/bash -c 'make test'"));
    }
}
