use std::path::Path;

use crate::sandbox::SandboxError;
use crate::sandbox::cwd::{SANDBOX_WORKSPACE, resolve_sandbox_cwd};

pub const SANDBOX_PROXY_SOCK: &str = "/run/egress-proxy.sock";
pub const SANDBOX_WRAPPER_SH: &str = "/run/wrapper.sh";
/// TCP port the in-sandbox socat bridge listens on.
pub const SANDBOX_PROXY_PORT: u16 = 9080;

/// Inputs for constructing a bwrap invocation.
pub struct BwrapCmdConfig<'a> {
    pub bwrap_path: &'a str,

    /// Read-only root filesystem bound at `/`. Empty means build the root
    /// from host directories under a tmpfs (merged-usr layout).
    pub rootfs_path: &'a str,

    /// Host-side facility directory, bound read-write at /workspace.
    pub facility_path: &'a Path,

    /// Host-side egress proxy UDS, bound read-only at /run/egress-proxy.sock.
    pub proxy_socket_path: &'a Path,

    /// Host-side wrapper script, bound read-only at /run/wrapper.sh.
    pub wrapper_script_path: &'a Path,

    /// Requested working directory inside the sandbox. Default /workspace.
    pub cwd: &'a str,

    /// Whether the host has a /lib64 symlink (x86_64 merged-usr systems).
    pub host_has_lib64: bool,
}

/// Construct the bwrap argv (including the bwrap binary itself).
///
/// bwrap always starts at /workspace so in-sandbox prepare (git clone) can
/// run first; the wrapper script cds to the requested cwd afterwards.
pub fn build_args(cfg: &BwrapCmdConfig<'_>) -> Result<Vec<String>, SandboxError> {
    if cfg.bwrap_path.is_empty() {
        return Err(SandboxError::InvalidRequest("bwrap path is required".into()));
    }
    if cfg.facility_path.as_os_str().is_empty() {
        return Err(SandboxError::InvalidRequest("facility path is required".into()));
    }
    if cfg.proxy_socket_path.as_os_str().is_empty() {
        return Err(SandboxError::InvalidRequest("proxy socket path is required".into()));
    }
    if cfg.wrapper_script_path.as_os_str().is_empty() {
        return Err(SandboxError::InvalidRequest(
            "wrapper script path is required".into(),
        ));
    }

    // Validate early; the actual cd happens in the wrapper.
    resolve_sandbox_cwd(cfg.cwd)?;

    let mut args: Vec<String> = vec![cfg.bwrap_path.to_string()];
    let push = |args: &mut Vec<String>, items: &[&str]| {
        args.extend(items.iter().map(|s| s.to_string()));
    };

    if !cfg.rootfs_path.is_empty() {
        // Custom rootfs: bind it read-only as the entire root.
        push(&mut args, &["--ro-bind", cfg.rootfs_path, "/"]);
    } else {
        append_host_root_args(&mut args, cfg.host_has_lib64);
    }

    // Virtual filesystems.
    push(&mut args, &["--proc", "/proc"]);
    push(&mut args, &["--dev", "/dev"]);
    push(&mut args, &["--tmpfs", "/tmp"]);

    // Writable /run for the proxy socket and wrapper script mounts.
    push(&mut args, &["--tmpfs", "/run"]);

    // Writable workspace.
    push(
        &mut args,
        &["--bind", &cfg.facility_path.to_string_lossy(), SANDBOX_WORKSPACE],
    );

    push(
        &mut args,
        &[
            "--ro-bind",
            &cfg.proxy_socket_path.to_string_lossy(),
            SANDBOX_PROXY_SOCK,
        ],
    );
    push(
        &mut args,
        &[
            "--ro-bind",
            &cfg.wrapper_script_path.to_string_lossy(),
            SANDBOX_WRAPPER_SH,
        ],
    );

    // Lock the root down after all mounts: the tmpfs root becomes
    // read-only while /workspace, /tmp, and /run stay writable submounts.
    push(&mut args, &["--remount-ro", "/"]);

    // Namespace isolation.
    push(
        &mut args,
        &["--unshare-net", "--unshare-pid", "--unshare-uts", "--unshare-ipc"],
    );

    // Hardening.
    push(
        &mut args,
        &["--new-session", "--die-with-parent", "--cap-drop", "ALL"],
    );

    push(&mut args, &["--chdir", SANDBOX_WORKSPACE]);

    push(&mut args, &["--", "/bin/sh", SANDBOX_WRAPPER_SH]);

    Ok(args)
}

/// Build the root from host directories: a tmpfs root, read-only /usr and
/// /etc, and the merged-usr symlinks (Ubuntu 24.04 layout).
fn append_host_root_args(args: &mut Vec<String>, has_lib64: bool) {
    let push = |args: &mut Vec<String>, items: &[&str]| {
        args.extend(items.iter().map(|s| s.to_string()));
    };

    push(args, &["--tmpfs", "/"]);
    push(args, &["--ro-bind", "/usr", "/usr"]);
    push(args, &["--symlink", "usr/bin", "/bin"]);
    push(args, &["--symlink", "usr/sbin", "/sbin"]);
    push(args, &["--symlink", "usr/lib", "/lib"]);
    if has_lib64 {
        push(args, &["--symlink", "usr/lib64", "/lib64"]);
    }
    push(args, &["--ro-bind", "/etc", "/etc"]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config<'a>(rootfs: &'a str, facility: &'a Path) -> BwrapCmdConfig<'a> {
        BwrapCmdConfig {
            bwrap_path: "bwrap",
            rootfs_path: rootfs,
            facility_path: facility,
            proxy_socket_path: Path::new("/run/sockets/d1.sock"),
            wrapper_script_path: Path::new("/tmp/wrapper-d1.sh"),
            cwd: "",
            host_has_lib64: true,
        }
    }

    fn window(args: &[String], needle: &[&str]) -> bool {
        args.windows(needle.len())
            .any(|w| w.iter().zip(needle).all(|(a, b)| a == b))
    }

    #[test]
    fn host_root_mode_builds_merged_usr() {
        let facility = PathBuf::from("/srv/fac1");
        let args = build_args(&config("", &facility)).unwrap();
        assert_eq!(args[0], "bwrap");
        assert!(window(&args, &["--tmpfs", "/"]));
        assert!(window(&args, &["--ro-bind", "/usr", "/usr"]));
        assert!(window(&args, &["--symlink", "usr/bin", "/bin"]));
        assert!(window(&args, &["--symlink", "usr/lib64", "/lib64"]));
        assert!(window(&args, &["--ro-bind", "/etc", "/etc"]));
    }

    #[test]
    fn custom_rootfs_binds_root() {
        let facility = PathBuf::from("/srv/fac1");
        let args = build_args(&config("/srv/rootfs", &facility)).unwrap();
        assert!(window(&args, &["--ro-bind", "/srv/rootfs", "/"]));
        assert!(!window(&args, &["--tmpfs", "/"]));
    }

    #[test]
    fn no_lib64_symlink_without_host_lib64() {
        let facility = PathBuf::from("/srv/fac1");
        let mut cfg = config("", &facility);
        cfg.host_has_lib64 = false;
        let args = build_args(&cfg).unwrap();
        assert!(!window(&args, &["--symlink", "usr/lib64", "/lib64"]));
    }

    #[test]
    fn mounts_and_isolation_flags_present() {
        let facility = PathBuf::from("/srv/fac1");
        let args = build_args(&config("", &facility)).unwrap();
        assert!(window(&args, &["--bind", "/srv/fac1", "/workspace"]));
        assert!(window(
            &args,
            &["--ro-bind", "/run/sockets/d1.sock", "/run/egress-proxy.sock"]
        ));
        assert!(window(
            &args,
            &["--ro-bind", "/tmp/wrapper-d1.sh", "/run/wrapper.sh"]
        ));
        for flag in [
            "--unshare-net",
            "--unshare-pid",
            "--unshare-uts",
            "--unshare-ipc",
            "--new-session",
            "--die-with-parent",
        ] {
            assert!(args.contains(&flag.to_string()), "{flag}");
        }
        assert!(window(&args, &["--cap-drop", "ALL"]));
        assert!(window(&args, &["--", "/bin/sh", "/run/wrapper.sh"]));
    }

    #[test]
    fn remount_ro_comes_after_all_mounts() {
        let facility = PathBuf::from("/srv/fac1");
        let args = build_args(&config("", &facility)).unwrap();
        let remount = args.iter().position(|a| a == "--remount-ro").unwrap();
        let last_bind = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "--bind" || *a == "--ro-bind" || *a == "--tmpfs")
            .map(|(i, _)| i)
            .max()
            .unwrap();
        assert!(remount > last_bind);
    }

    #[test]
    fn cwd_escape_rejected_at_build_time() {
        let facility = PathBuf::from("/srv/fac1");
        let mut cfg = config("", &facility);
        cfg.cwd = "../../etc";
        assert!(matches!(
            build_args(&cfg),
            Err(SandboxError::CwdEscapes(_))
        ));
    }

    #[test]
    fn missing_inputs_rejected() {
        let facility = PathBuf::from("");
        assert!(build_args(&config("", &facility)).is_err());
    }
}
