//! Cgroup v2 resource limiter, shared by the host and bwrap drivers.
//!
//! A per-directive cgroup is created under /sys/fs/cgroup/nexusd, the
//! memory/cpu limits are written, and the child pid is moved in. The
//! directory is removed when the limiter is dropped, after the child has
//! exited.

use std::path::PathBuf;

use crate::protocol::Limits;

const CGROUP_BASE: &str = "/sys/fs/cgroup/nexusd";

/// Overflow guards: 1024 cores and 1 TiB.
const MAX_CPU_MILLICORES: u64 = 1_024_000;
const MAX_MEMORY_MB: u64 = 1 << 20;

const CPU_PERIOD_USEC: u64 = 100_000;
const MIN_CPU_QUOTA_USEC: u64 = 1_000;

/// Directive IDs become cgroup path components; restrict accordingly.
fn is_valid_cgroup_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.is_empty() || !bytes[0].is_ascii_alphanumeric() {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// `cpu.max` value: "<quota> <period>" in microseconds, floored at 1ms.
fn cpu_max_value(millicores: u64) -> String {
    let quota = (millicores * CPU_PERIOD_USEC / 1000).max(MIN_CPU_QUOTA_USEC);
    format!("{quota} {CPU_PERIOD_USEC}")
}

fn memory_max_value(memory_mb: u64) -> String {
    (memory_mb * 1_048_576).to_string()
}

/// An applied cgroup; removing the directory on drop is best-effort (the
/// kernel refuses while processes remain, which is logged, not fatal).
#[derive(Debug)]
pub struct CgroupLimiter {
    path: PathBuf,
}

impl Drop for CgroupLimiter {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir(&self.path) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "cgroup cleanup failed (processes may still be running)"
            );
        }
    }
}

/// Create the per-directive cgroup, write limits, and add `pid`.
/// Returns Ok(None) when the directive carries no limits.
pub fn apply_limits(
    directive_id: &str,
    pid: u32,
    limits: &Limits,
) -> Result<Option<CgroupLimiter>, String> {
    if limits.cpu == 0 && limits.memory_mb == 0 {
        return Ok(None);
    }

    if !is_valid_cgroup_id(directive_id) {
        return Err(format!("invalid directive ID for cgroup: {directive_id:?}"));
    }
    if limits.cpu > MAX_CPU_MILLICORES {
        return Err(format!(
            "CPU limit {} exceeds maximum {MAX_CPU_MILLICORES} millicores",
            limits.cpu
        ));
    }
    if limits.memory_mb > MAX_MEMORY_MB {
        return Err(format!(
            "memory limit {} MB exceeds maximum {MAX_MEMORY_MB} MB",
            limits.memory_mb
        ));
    }

    let path = PathBuf::from(CGROUP_BASE).join(directive_id);
    create_dir_0700(&path).map_err(|e| format!("create cgroup dir: {e}"))?;
    let limiter = CgroupLimiter { path: path.clone() };

    if limits.memory_mb > 0 {
        std::fs::write(path.join("memory.max"), memory_max_value(limits.memory_mb))
            .map_err(|e| format!("write memory.max: {e}"))?;
    }
    if limits.cpu > 0 {
        std::fs::write(path.join("cpu.max"), cpu_max_value(limits.cpu))
            .map_err(|e| format!("write cpu.max: {e}"))?;
    }

    std::fs::write(path.join("cgroup.procs"), pid.to_string())
        .map_err(|e| format!("write cgroup.procs: {e}"))?;

    tracing::info!(
        directive_id,
        cgroup_path = %path.display(),
        memory_mb = limits.memory_mb,
        cpu_millicores = limits.cpu,
        "cgroup limits applied"
    );

    Ok(Some(limiter))
}

fn create_dir_0700(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder.create(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup_id_validation() {
        assert!(is_valid_cgroup_id("d-123"));
        assert!(is_valid_cgroup_id("a.b_c"));
        assert!(!is_valid_cgroup_id(""));
        assert!(!is_valid_cgroup_id("../escape"));
        assert!(!is_valid_cgroup_id("with/slash"));
        assert!(!is_valid_cgroup_id(".."));
    }

    #[test]
    fn cpu_max_math() {
        // One core.
        assert_eq!(cpu_max_value(1000), "100000 100000");
        // Floor at 1ms quota.
        assert_eq!(cpu_max_value(1), "1000 100000");
        assert_eq!(cpu_max_value(5), "1000 100000");
        // Half core.
        assert_eq!(cpu_max_value(500), "50000 100000");
    }

    #[test]
    fn memory_max_math() {
        assert_eq!(memory_max_value(1), "1048576");
        assert_eq!(memory_max_value(256), "268435456");
    }

    #[test]
    fn no_limits_is_noop() {
        let limiter = apply_limits("d-1", 1234, &Limits::default()).unwrap();
        assert!(limiter.is_none());
    }

    #[test]
    fn invalid_id_rejected() {
        let limits = Limits {
            cpu: 1000,
            ..Default::default()
        };
        let err = apply_limits("../evil", 1234, &limits).unwrap_err();
        assert!(err.contains("invalid directive ID"));
    }

    #[test]
    fn overflow_guards() {
        let limits = Limits {
            cpu: MAX_CPU_MILLICORES + 1,
            ..Default::default()
        };
        assert!(apply_limits("d-1", 1, &limits).unwrap_err().contains("CPU limit"));

        let limits = Limits {
            memory_mb: MAX_MEMORY_MB + 1,
            ..Default::default()
        };
        assert!(
            apply_limits("d-1", 1, &limits)
                .unwrap_err()
                .contains("memory limit")
        );
    }
}
