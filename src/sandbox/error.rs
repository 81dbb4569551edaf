use std::io;

use crate::egressproxy::ProxyError;

/// Errors from sandbox driver operations.
///
/// Driver-precondition failures (proxy start, cgroup apply, staging) reject
/// the directive; a non-zero exit from the command itself is NOT an error,
/// it is a `RunResult` with `status=failed`.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("empty command")]
    EmptyCommand,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no driver registered for profile {profile:?} (driver {driver:?})")]
    NoDriver { profile: String, driver: String },

    #[error("cwd {0:?} escapes workspace")]
    CwdEscapes(String),

    #[error("start egress proxy: {0}")]
    Proxy(#[from] ProxyError),

    #[error("prepare git clone: {0}")]
    Prepare(String),

    #[error("cgroup limits required but failed to apply: {0}")]
    Cgroup(String),

    #[error("stage sandbox: {0}")]
    Stage(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(SandboxError::EmptyCommand.to_string(), "empty command");
        assert_eq!(
            SandboxError::CwdEscapes("../etc".into()).to_string(),
            "cwd \"../etc\" escapes workspace"
        );
        assert_eq!(
            SandboxError::Cgroup("write cpu.max: permission denied".into()).to_string(),
            "cgroup limits required but failed to apply: write cpu.max: permission denied"
        );
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: SandboxError = io_err.into();
        assert!(matches!(err, SandboxError::Io(_)));
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SandboxError>();
    }
}
