//! Working-directory resolution with workspace containment.

use std::path::{Component, Path, PathBuf};

use super::SandboxError;

/// The mount point every sandbox sees its facility at.
pub const SANDBOX_WORKSPACE: &str = "/workspace";

/// Resolve a requested cwd against the host-side workspace root for
/// host-executing drivers.
///
/// Mapping rules:
///   - "", ".", "/workspace"   -> work_dir
///   - "/workspace/sub/dir"    -> work_dir/sub/dir
///   - "sub/dir" (relative)    -> work_dir/sub/dir
///   - "/etc" (abs outside)    -> error
///   - "../escape"             -> error
pub fn resolve_workspace_cwd(work_dir: &Path, requested: &str) -> Result<PathBuf, SandboxError> {
    if work_dir.as_os_str().is_empty() {
        return Err(SandboxError::InvalidRequest("work dir is required".into()));
    }

    if requested.is_empty() || requested == "." || requested == SANDBOX_WORKSPACE {
        return Ok(work_dir.to_path_buf());
    }

    let req = Path::new(requested);
    let rel = if req.is_absolute() {
        match req.strip_prefix(SANDBOX_WORKSPACE) {
            Ok(rest) => rest,
            Err(_) => return Err(SandboxError::CwdEscapes(requested.to_string())),
        }
    } else {
        req
    };

    safe_join(work_dir, rel).ok_or_else(|| SandboxError::CwdEscapes(requested.to_string()))
}

/// Resolve a requested cwd to a sandbox-internal absolute path under
/// /workspace, for drivers that run the command inside a mount namespace
/// or guest VM.
pub fn resolve_sandbox_cwd(requested: &str) -> Result<String, SandboxError> {
    if requested.is_empty() || requested == "." {
        return Ok(SANDBOX_WORKSPACE.to_string());
    }

    let joined = if requested.starts_with('/') {
        requested.to_string()
    } else {
        format!("{SANDBOX_WORKSPACE}/{requested}")
    };

    // Normalize lexically to catch ".." traversal before any filesystem
    // exists for the path.
    let mut parts: Vec<&str> = Vec::new();
    for comp in joined.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(SandboxError::CwdEscapes(requested.to_string()));
                }
            }
            seg => parts.push(seg),
        }
    }
    let cleaned = format!("/{}", parts.join("/"));

    if cleaned != SANDBOX_WORKSPACE && !cleaned.starts_with(&format!("{SANDBOX_WORKSPACE}/")) {
        return Err(SandboxError::CwdEscapes(requested.to_string()));
    }
    Ok(cleaned)
}

/// Join base and rel, rejecting any result that escapes base.
fn safe_join(base: &Path, rel: &Path) -> Option<PathBuf> {
    let mut out = base.to_path_buf();
    for comp in rel.components() {
        match comp {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            Component::ParentDir => {
                if out == base || !out.pop() {
                    return None;
                }
                if !out.starts_with(base) {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_dot_map_to_workdir() {
        let wd = Path::new("/srv/fac1");
        assert_eq!(resolve_workspace_cwd(wd, "").unwrap(), wd);
        assert_eq!(resolve_workspace_cwd(wd, ".").unwrap(), wd);
        assert_eq!(resolve_workspace_cwd(wd, "/workspace").unwrap(), wd);
    }

    #[test]
    fn workspace_prefixed_paths_remap() {
        let wd = Path::new("/srv/fac1");
        assert_eq!(
            resolve_workspace_cwd(wd, "/workspace/sub/dir").unwrap(),
            Path::new("/srv/fac1/sub/dir")
        );
    }

    #[test]
    fn relative_paths_join() {
        let wd = Path::new("/srv/fac1");
        assert_eq!(
            resolve_workspace_cwd(wd, "sub/dir").unwrap(),
            Path::new("/srv/fac1/sub/dir")
        );
    }

    #[test]
    fn absolute_outside_rejected() {
        let wd = Path::new("/srv/fac1");
        assert!(matches!(
            resolve_workspace_cwd(wd, "/etc"),
            Err(SandboxError::CwdEscapes(_))
        ));
    }

    #[test]
    fn traversal_rejected() {
        let wd = Path::new("/srv/fac1");
        assert!(resolve_workspace_cwd(wd, "../escape").is_err());
        assert!(resolve_workspace_cwd(wd, "sub/../../escape").is_err());
        assert!(resolve_workspace_cwd(wd, "/workspace/../etc").is_err());
    }

    #[test]
    fn dotdot_within_workspace_allowed() {
        let wd = Path::new("/srv/fac1");
        assert_eq!(
            resolve_workspace_cwd(wd, "a/b/../c").unwrap(),
            Path::new("/srv/fac1/a/c")
        );
    }

    #[test]
    fn sandbox_cwd_defaults() {
        assert_eq!(resolve_sandbox_cwd("").unwrap(), "/workspace");
        assert_eq!(resolve_sandbox_cwd(".").unwrap(), "/workspace");
    }

    #[test]
    fn sandbox_cwd_relative_and_absolute() {
        assert_eq!(resolve_sandbox_cwd("src").unwrap(), "/workspace/src");
        assert_eq!(
            resolve_sandbox_cwd("/workspace/src/deep").unwrap(),
            "/workspace/src/deep"
        );
    }

    #[test]
    fn sandbox_cwd_rejects_escapes() {
        assert!(resolve_sandbox_cwd("/etc").is_err());
        assert!(resolve_sandbox_cwd("../../etc").is_err());
        assert!(resolve_sandbox_cwd("/workspace/../etc").is_err());
    }

    #[test]
    fn sandbox_cwd_normalizes_inner_dotdot() {
        assert_eq!(
            resolve_sandbox_cwd("a/b/../c").unwrap(),
            "/workspace/a/c"
        );
    }
}
