use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Config;
use crate::protocol::DirectiveSpec;

/// Minimum free disk space to accept a directive. Below this threshold the
/// directive is rejected immediately with a clear error rather than
/// risking a mid-execution failure.
pub const MIN_DISK_BYTES: u64 = 1 << 30;

/// Available bytes on the filesystem containing `path`.
pub fn check_disk_space(path: &Path) -> std::io::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Whether a facility ID is safe to use as a directory name: leading
/// alphanumeric, then alphanumerics, underscore, dot, dash. Dot-prefixed
/// names (".", "..", hidden dirs) and separators are rejected by
/// construction.
pub fn is_valid_facility_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.is_empty() || !bytes[0].is_ascii_alphanumeric() {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// The standard environment injected into every directive command.
pub fn build_directive_env(
    cfg: &Config,
    directive_id: &str,
    spec: &DirectiveSpec,
) -> BTreeMap<String, String> {
    let locale = if cfg!(target_os = "macos") {
        "en_US.UTF-8"
    } else {
        "C.UTF-8"
    };

    let mut env = BTreeMap::new();

    // Output stability / non-interactive defaults.
    env.insert("NO_COLOR".into(), "1".into());
    env.insert("TERM".into(), "dumb".into());
    env.insert("LANG".into(), locale.into());
    env.insert("LC_ALL".into(), locale.into());
    env.insert("PAGER".into(), "cat".into());
    env.insert("GIT_PAGER".into(), "cat".into());

    // Marker for in-sandbox tooling.
    env.insert("NEXUS_AGENT".into(), "1".into());

    env.insert("NEXUS_DIRECTIVE_ID".into(), directive_id.into());
    env.insert("NEXUS_FACILITY_ID".into(), spec.facility.id.clone());
    env.insert("NEXUS_TERRITORY_ID".into(), cfg.territory_id.clone());
    env.insert("NEXUS_SANDBOX_PROFILE".into(), spec.sandbox_profile.clone());
    env.insert("NEXUS_WORKSPACE".into(), spec.facility.mount.clone());

    env.insert("CI".into(), "true".into());

    env
}

/// Environment for host-side git invocations (clone, diff): the minimal
/// inherited set plus non-interactive git pinning.
pub fn git_host_env() -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> =
        crate::sandbox::minimal_host_env().into_iter().collect();
    env.push(("GIT_TERMINAL_PROMPT".into(), "0".into()));
    env.push(("GIT_ASKPASS".into(), "true".into()));
    env.push(("GIT_PAGER".into(), "cat".into()));
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_space_of_tempdir_is_positive() {
        let dir = tempfile::tempdir().unwrap();
        let avail = check_disk_space(dir.path()).unwrap();
        assert!(avail > 0);
    }

    #[test]
    fn facility_id_validation() {
        assert!(is_valid_facility_id("fac1"));
        assert!(is_valid_facility_id("team-a_repo.main"));
        assert!(!is_valid_facility_id(""));
        assert!(!is_valid_facility_id("."));
        assert!(!is_valid_facility_id(".."));
        assert!(!is_valid_facility_id(".hidden"));
        assert!(!is_valid_facility_id("has/slash"));
        assert!(!is_valid_facility_id("-dash-first"));
        assert!(!is_valid_facility_id("sp ace"));
    }

    #[test]
    fn directive_env_contains_markers() {
        let cfg = Config {
            territory_id: "t-9".into(),
            ..Default::default()
        };
        let spec = DirectiveSpec {
            facility: crate::protocol::FacilitySpec {
                id: "fac1".into(),
                mount: "/workspace".into(),
                repo_url: String::new(),
            },
            sandbox_profile: "untrusted".into(),
            ..Default::default()
        };
        let env = build_directive_env(&cfg, "d-1", &spec);
        assert_eq!(env["NO_COLOR"], "1");
        assert_eq!(env["TERM"], "dumb");
        assert_eq!(env["CI"], "true");
        assert_eq!(env["NEXUS_AGENT"], "1");
        assert_eq!(env["NEXUS_DIRECTIVE_ID"], "d-1");
        assert_eq!(env["NEXUS_FACILITY_ID"], "fac1");
        assert_eq!(env["NEXUS_TERRITORY_ID"], "t-9");
        assert_eq!(env["NEXUS_SANDBOX_PROFILE"], "untrusted");
        assert_eq!(env["PAGER"], "cat");
    }

    #[test]
    fn git_env_is_non_interactive() {
        let env = git_host_env();
        assert!(env.iter().any(|(k, v)| k == "GIT_TERMINAL_PROMPT" && v == "0"));
        assert!(env.iter().any(|(k, v)| k == "GIT_ASKPASS" && v == "true"));
    }
}
