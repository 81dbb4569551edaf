//! Sandbox drivers and the shared execution contract.
//!
//! A driver turns a [`RunRequest`] into a [`RunResult`] under an explicit
//! [`ExecContext`] (cancellation token + optional deadline). Profiles map to
//! drivers through the [`factory::DriverFactory`].

pub mod bwrap;
pub mod container;
pub mod cwd;
pub mod darwin;
mod error;
pub mod factory;
pub mod firecracker;
pub mod host;
pub mod prepare;
mod runutil;

#[cfg(target_os = "linux")]
pub mod cgroup;
#[cfg(target_os = "linux")]
pub mod landlock;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

pub use error::SandboxError;
pub use runutil::{
    WaitOutcome, exit_code_of, kill_process_group, minimal_host_env, wait_child,
};

use crate::protocol::{FsCapability, Limits, NetCapability, RunStatus};

/// Explicit execution scope passed down to every driver: a cancellation
/// token (heartbeat-requested cancel, shutdown) and an optional deadline
/// (directive timeout). Cancellation kills the whole child process group.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub cancel: CancellationToken,
    pub deadline: Option<tokio::time::Instant>,
}

impl ExecContext {
    pub fn new(cancel: CancellationToken, deadline: Option<tokio::time::Instant>) -> Self {
        Self { cancel, deadline }
    }

    /// An unconstrained context, for tests and health probes.
    pub fn unbounded() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// Destination for captured command output.
///
/// Truncation reporting is part of the contract so host-executing drivers
/// can fill `RunResult` without downcasting the sink.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Deliver a blob of output (blocking with respect to the producer).
    async fn upload_bytes(&self, cancel: &CancellationToken, stream: LogStream, bytes: &[u8]);

    /// Drain a reader to completion.
    async fn consume(
        &self,
        cancel: &CancellationToken,
        stream: LogStream,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> std::io::Result<()>;

    fn stdout_truncated(&self) -> bool;
    fn stderr_truncated(&self) -> bool;
}

/// A LogSink that reads and discards all output. Useful in tests.
pub struct DiscardSink;

#[async_trait]
impl LogSink for DiscardSink {
    async fn upload_bytes(&self, _cancel: &CancellationToken, _stream: LogStream, _bytes: &[u8]) {}

    async fn consume(
        &self,
        _cancel: &CancellationToken,
        _stream: LogStream,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> std::io::Result<()> {
        let mut sink = tokio::io::sink();
        tokio::io::copy(reader, &mut sink).await.map(|_| ())
    }

    fn stdout_truncated(&self) -> bool {
        false
    }

    fn stderr_truncated(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HealthResult {
    pub healthy: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl HealthResult {
    pub fn healthy(driver: &str) -> Self {
        let mut details = BTreeMap::new();
        details.insert("driver".to_string(), driver.to_string());
        Self {
            healthy: true,
            details,
        }
    }

    pub fn unhealthy(driver: &str, error: impl Into<String>) -> Self {
        let mut details = BTreeMap::new();
        details.insert("driver".to_string(), driver.to_string());
        details.insert("error".to_string(), error.into());
        Self {
            healthy: false,
            details,
        }
    }
}

#[derive(Clone)]
pub struct RunRequest {
    pub directive_id: String,

    /// Shell command string.
    pub command: String,
    /// Default /bin/sh (driver-specific override for darwin-automation).
    pub shell: String,
    pub cwd: String,

    /// Directive environment overlay on top of the minimal inherited env.
    pub env: BTreeMap<String, String>,

    /// Absolute host-side path to the facility workspace directory.
    pub facility_path: PathBuf,

    pub max_output_bytes: u64,
    pub chunk_bytes: usize,

    pub log_sink: Arc<dyn LogSink>,

    /// Network policy for the egress proxy. None means deny-all.
    pub net_capability: Option<NetCapability>,
    /// Filesystem policy, consumed by the Landlock limiter on Linux.
    pub fs_capability: Option<FsCapability>,

    /// Non-empty triggers facility preparation (git clone) inside the
    /// sandbox for isolated drivers.
    pub repo_url: String,

    pub limits: Limits,
}

#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub exit_code: i32,
    pub status: RunStatus,

    pub stdout_truncated: bool,
    pub stderr_truncated: bool,

    /// Non-fatal issues observed during execution (e.g. workspace
    /// extraction failure). Logged upstream; do not change status.
    pub warnings: Vec<String>,
}

/// Bridge proxy audit lines into a directive's stderr stream: the sandbox
/// owner sees every egress decision inline with the command output.
/// The forwarder task ends when the proxy instance (the sender) is dropped.
pub(crate) fn audit_to_log_sink(
    sink: Arc<dyn LogSink>,
    cancel: CancellationToken,
) -> crate::egressproxy::AuditSink {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            sink.upload_bytes(&cancel, LogStream::Stderr, &bytes).await;
        }
    });
    crate::egressproxy::AuditSink::Channel(tx)
}

/// The interface every sandbox driver implements.
#[async_trait]
pub trait Driver: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Verify the driver's dependencies are available and functional.
    /// Called by the territory heartbeat and before each assignment; the
    /// caller bounds it with a timeout.
    async fn health_check(&self) -> HealthResult;

    async fn run(&self, ctx: &ExecContext, req: RunRequest) -> Result<RunResult, SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_stream_names() {
        assert_eq!(LogStream::Stdout.as_str(), "stdout");
        assert_eq!(LogStream::Stderr.as_str(), "stderr");
    }

    #[tokio::test]
    async fn discard_sink_drains_reader() {
        let sink = DiscardSink;
        let cancel = CancellationToken::new();
        let mut reader: &[u8] = b"some output\n";
        sink.consume(&cancel, LogStream::Stdout, &mut reader)
            .await
            .unwrap();
        assert!(!sink.stdout_truncated());
    }

    #[test]
    fn health_result_constructors() {
        let ok = HealthResult::healthy("host");
        assert!(ok.healthy);
        assert_eq!(ok.details["driver"], "host");

        let bad = HealthResult::unhealthy("bwrap", "bwrap not found in PATH");
        assert!(!bad.healthy);
        assert_eq!(bad.details["error"], "bwrap not found in PATH");
    }
}
