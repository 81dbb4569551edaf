//! Filesystem access control via the Linux Landlock LSM (kernel >= 5.13).
//!
//! A ruleset built from the directive's filesystem capability is applied in
//! the child between fork and exec; once applied it is irrevocable for the
//! whole process tree. This supplements (never replaces) the bwrap and
//! container sandboxes; it restricts the trusted profile where no mount
//! namespace exists.

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use crate::protocol::FsCapability;

// Syscall numbers (identical on x86_64 and aarch64).
const SYS_LANDLOCK_CREATE_RULESET: libc::c_long = 444;
const SYS_LANDLOCK_ADD_RULE: libc::c_long = 445;
const SYS_LANDLOCK_RESTRICT_SELF: libc::c_long = 446;

const RULE_PATH_BENEATH: libc::c_int = 1;

// Access flags, ABI v1.
const ACCESS_FS_EXECUTE: u64 = 1 << 0;
const ACCESS_FS_WRITE_FILE: u64 = 1 << 1;
const ACCESS_FS_READ_FILE: u64 = 1 << 2;
const ACCESS_FS_READ_DIR: u64 = 1 << 3;
const ACCESS_FS_REMOVE_DIR: u64 = 1 << 4;
const ACCESS_FS_REMOVE_FILE: u64 = 1 << 5;
const ACCESS_FS_MAKE_CHAR: u64 = 1 << 6;
const ACCESS_FS_MAKE_DIR: u64 = 1 << 7;
const ACCESS_FS_MAKE_REG: u64 = 1 << 8;
const ACCESS_FS_MAKE_SOCK: u64 = 1 << 9;
const ACCESS_FS_MAKE_FIFO: u64 = 1 << 10;
const ACCESS_FS_MAKE_BLOCK: u64 = 1 << 11;
const ACCESS_FS_MAKE_SYM: u64 = 1 << 12;

const ACCESS_READ: u64 = ACCESS_FS_EXECUTE | ACCESS_FS_READ_FILE | ACCESS_FS_READ_DIR;
const ACCESS_WRITE: u64 = ACCESS_FS_WRITE_FILE
    | ACCESS_FS_REMOVE_DIR
    | ACCESS_FS_REMOVE_FILE
    | ACCESS_FS_MAKE_CHAR
    | ACCESS_FS_MAKE_DIR
    | ACCESS_FS_MAKE_REG
    | ACCESS_FS_MAKE_SOCK
    | ACCESS_FS_MAKE_FIFO
    | ACCESS_FS_MAKE_BLOCK
    | ACCESS_FS_MAKE_SYM;
const ACCESS_ALL: u64 = ACCESS_READ | ACCESS_WRITE;

#[repr(C)]
struct RulesetAttr {
    handled_access_fs: u64,
}

#[repr(C)]
struct PathBeneathAttr {
    allowed_access: u64,
    parent_fd: libc::c_int,
}

/// System paths that must stay readable for a process to function at all
/// (dynamic linker, shared libraries, timezone data).
fn system_read_only_paths() -> Vec<PathBuf> {
    ["/usr", "/lib", "/lib64", "/etc", "/proc", "/dev", "/tmp", "/run"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

/// Whether the running kernel supports Landlock. Does not modify process
/// state.
pub fn available() -> bool {
    let attr = RulesetAttr {
        handled_access_fs: ACCESS_ALL,
    };
    let fd = unsafe {
        libc::syscall(
            SYS_LANDLOCK_CREATE_RULESET,
            &attr as *const RulesetAttr,
            std::mem::size_of::<RulesetAttr>(),
            0,
        )
    };
    if fd < 0 {
        return false;
    }
    unsafe { libc::close(fd as libc::c_int) };
    true
}

/// Accumulated filesystem rules, applied atomically via `apply`.
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    writable: Vec<PathBuf>,
    read_only: Vec<PathBuf>,
}

impl Ruleset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_writable(&mut self, path: impl Into<PathBuf>) {
        self.writable.push(path.into());
    }

    pub fn add_read_only(&mut self, path: impl Into<PathBuf>) {
        self.read_only.push(path.into());
    }

    /// Build a ruleset from a directive's filesystem capability: explicit
    /// writable roots and read-only subpaths when present, otherwise the
    /// workspace as the sole writable root. System paths are always
    /// readable.
    pub fn from_fs_capability(cap: &FsCapability, workspace: &Path) -> Self {
        let mut rs = Ruleset::new();
        if !cap.writable_roots.is_empty() || !cap.read_only_subpaths.is_empty() {
            for p in &cap.writable_roots {
                rs.add_writable(p);
            }
            for p in &cap.read_only_subpaths {
                rs.add_read_only(p);
            }
        } else {
            rs.add_writable(workspace);
        }
        for p in system_read_only_paths() {
            rs.add_read_only(p);
        }
        rs
    }

    /// Create the kernel ruleset, add every existing configured path, set
    /// NO_NEW_PRIVS, and restrict the calling process. Intended to run in
    /// the child between fork and exec.
    pub fn apply(&self) -> std::io::Result<()> {
        if self.writable.is_empty() && self.read_only.is_empty() {
            return Ok(());
        }

        let attr = RulesetAttr {
            handled_access_fs: ACCESS_ALL,
        };
        let ruleset_fd = unsafe {
            libc::syscall(
                SYS_LANDLOCK_CREATE_RULESET,
                &attr as *const RulesetAttr,
                std::mem::size_of::<RulesetAttr>(),
                0,
            )
        };
        if ruleset_fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let ruleset_fd = ruleset_fd as libc::c_int;

        let result = (|| {
            for path in &self.writable {
                add_path_rule(ruleset_fd, path, ACCESS_ALL)?;
            }
            for path in &self.read_only {
                add_path_rule(ruleset_fd, path, ACCESS_READ)?;
            }

            // NO_NEW_PRIVS is required before restrict_self.
            let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }

            let rc = unsafe { libc::syscall(SYS_LANDLOCK_RESTRICT_SELF, ruleset_fd, 0) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        })();

        unsafe { libc::close(ruleset_fd) };
        result
    }
}

fn add_path_rule(ruleset_fd: libc::c_int, path: &Path, access: u64) -> std::io::Result<()> {
    // Paths that do not exist on this host are skipped rather than fatal
    // (e.g. /lib64 on arm64).
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Ok(()),
    };

    let rule = PathBeneathAttr {
        allowed_access: access,
        parent_fd: file.as_raw_fd(),
    };
    let rc = unsafe {
        libc::syscall(
            SYS_LANDLOCK_ADD_RULE,
            ruleset_fd,
            RULE_PATH_BENEATH,
            &rule as *const PathBeneathAttr,
            0,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_capability_defaults_to_workspace() {
        let cap = FsCapability::default();
        let rs = Ruleset::from_fs_capability(&cap, Path::new("/srv/fac1"));
        assert_eq!(rs.writable, vec![PathBuf::from("/srv/fac1")]);
        assert!(rs.read_only.contains(&PathBuf::from("/usr")));
        assert!(rs.read_only.contains(&PathBuf::from("/run")));
    }

    #[test]
    fn from_capability_uses_explicit_roots() {
        let cap = FsCapability {
            writable_roots: vec!["/srv/fac1".into(), "/var/cache/x".into()],
            read_only_subpaths: vec!["/opt/data".into()],
            ..Default::default()
        };
        let rs = Ruleset::from_fs_capability(&cap, Path::new("/ignored"));
        assert_eq!(rs.writable.len(), 2);
        assert!(rs.read_only.contains(&PathBuf::from("/opt/data")));
        assert!(!rs.writable.contains(&PathBuf::from("/ignored")));
    }

    #[test]
    fn empty_ruleset_apply_is_noop() {
        let rs = Ruleset::new();
        assert!(rs.apply().is_ok());
    }

    #[test]
    fn available_does_not_panic() {
        // Either answer is fine; the call must not disturb the process.
        let _ = available();
    }
}
