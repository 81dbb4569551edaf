//! Daemon configuration: YAML file with `${ENV}` expansion, defaults for
//! every section, and validation of the boundary rules the daemon relies on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM bundle used to validate the control-plane server cert.
    pub ca_file: String,
    /// PEM files for mTLS client auth.
    pub client_cert_file: String,
    pub client_key_file: String,

    /// ONLY for local dev. Do not use in production.
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// HTTP client timeout for poll requests.
    pub long_poll_timeout_seconds: u64,
    /// Sleep when the server returns no directives or the poll errors.
    pub retry_backoff_seconds: u64,
    /// Maximum number of directives to request per poll; also sizes the
    /// worker pool.
    pub max_directives_to_claim: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout_seconds: 25,
            retry_backoff_seconds: 2,
            max_directives_to_claim: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Hard cap for combined stdout+stderr per directive (best-effort).
    pub max_output_bytes: u64,
    /// Size of each log_chunk upload.
    pub chunk_bytes: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 2_000_000,
            chunk_bytes: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogOverflowConfig {
    /// Write stdout/stderr overflow beyond max_output_bytes to disk.
    pub enabled: bool,
    /// Workspace-relative directory (within the facility) for overflow files.
    pub dir: String,
    /// On-disk overflow cap per stream.
    pub max_bytes_per_stream: u64,
}

impl Default for LogOverflowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: ".nexus/overflow".into(),
            max_bytes_per_stream: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugTapeConfig {
    /// Write a local JSONL tape for offline debugging.
    pub enabled: bool,
    pub path: PathBuf,
    /// Rotation to "<path>.1" triggers when exceeded.
    pub max_bytes: u64,
}

impl Default for DebugTapeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("./nexusd-debug-tape.jsonl"),
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_seconds: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TerritoryHeartbeatConfig {
    pub interval_seconds: u64,
}

impl Default for TerritoryHeartbeatConfig {
    fn default() -> Self {
        Self { interval_seconds: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub enabled: bool,
    /// Address for the health/metrics server (e.g. "127.0.0.1:9090").
    pub listen_addr: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9090".into(),
        }
    }
}

/// Bubblewrap sandbox driver settings (Linux only).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BwrapConfig {
    pub bwrap_path: String,
    pub socat_path: String,
    /// Optional read-only rootfs bound at `/` instead of host directories.
    pub rootfs_path: String,
    /// Where per-directive proxy UDS files are created.
    /// Empty means `<work_dir>/.proxy-sockets/`.
    pub proxy_socket_dir: String,
}

impl Default for BwrapConfig {
    fn default() -> Self {
        Self {
            bwrap_path: "bwrap".into(),
            socat_path: "socat".into(),
            rootfs_path: String::new(),
            proxy_socket_dir: String::new(),
        }
    }
}

/// Container sandbox driver settings (Linux only).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime executable: "podman" or "docker".
    pub runtime: String,
    pub image: String,
    /// "env" injects HTTP_PROXY/HTTPS_PROXY; "none" disables the proxy.
    pub proxy_mode: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "podman".into(),
            image: "ubuntu:24.04".into(),
            proxy_mode: "env".into(),
        }
    }
}

/// Firecracker microVM sandbox driver settings (Linux only).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirecrackerConfig {
    pub firecracker_path: String,
    /// Guest vmlinux kernel.
    pub kernel_path: String,
    /// Base ext4 rootfs image.
    pub rootfs_image_path: String,
    pub vcpus: u32,
    pub mem_size_mib: u32,
    /// Maximum ext4 workspace image size in MiB.
    pub workspace_size_mib: u32,
    /// Empty means `<work_dir>/.proxy-sockets/`.
    pub proxy_socket_dir: String,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            firecracker_path: "firecracker".into(),
            kernel_path: String::new(),
            rootfs_image_path: String::new(),
            vcpus: 2,
            mem_size_mib: 512,
            workspace_size_mib: 2048,
            proxy_socket_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    pub territory_id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,

    pub work_dir: PathBuf,

    pub tls: TlsConfig,
    pub poll: PollConfig,
    pub log: LogConfig,
    pub log_overflow: LogOverflowConfig,
    pub debug_tape: DebugTapeConfig,
    pub heartbeat: HeartbeatConfig,
    pub territory_heartbeat: TerritoryHeartbeatConfig,
    pub observability: ObservabilityConfig,

    /// Maximum wait for in-flight directives during graceful shutdown.
    /// Zero means wait indefinitely.
    pub shutdown_timeout_seconds: u64,

    pub bwrap: BwrapConfig,
    pub container: ContainerConfig,
    pub firecracker: FirecrackerConfig,

    /// Driver serving the "untrusted" profile: "bwrap" (default) or
    /// "firecracker".
    pub untrusted_driver: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".into(),
            territory_id: String::new(),
            name: "nexusd".into(),
            labels: BTreeMap::new(),
            work_dir: PathBuf::from("./facilities"),
            tls: TlsConfig::default(),
            poll: PollConfig::default(),
            log: LogConfig::default(),
            log_overflow: LogOverflowConfig::default(),
            debug_tape: DebugTapeConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            territory_heartbeat: TerritoryHeartbeatConfig::default(),
            observability: ObservabilityConfig::default(),
            shutdown_timeout_seconds: 60,
            bwrap: BwrapConfig::default(),
            container: ContainerConfig::default(),
            firecracker: FirecrackerConfig::default(),
            untrusted_driver: "bwrap".into(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references before parsing, so containerized
        // deployments can inject secrets and endpoints.
        let expanded = expand_env(raw);
        let cfg: Config =
            serde_yaml::from_str(&expanded).context("failed to parse config yaml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            bail!("server_url is required");
        }
        if self.poll.max_directives_to_claim == 0 {
            bail!("poll.max_directives_to_claim must be >= 1");
        }
        if self.log.chunk_bytes == 0 {
            bail!("log.chunk_bytes must be >= 1");
        }
        if self.log.max_output_bytes == 0 {
            bail!("log.max_output_bytes must be >= 1");
        }

        if self.log_overflow.enabled {
            let dir = Path::new(&self.log_overflow.dir);
            if self.log_overflow.dir.is_empty() {
                bail!("log_overflow.dir is required when enabled");
            }
            if dir.is_absolute() {
                bail!("log_overflow.dir must be workspace-relative (not an absolute path)");
            }
            if dir
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                bail!("log_overflow.dir must be within the workspace");
            }
            if self.log_overflow.max_bytes_per_stream == 0 {
                bail!("log_overflow.max_bytes_per_stream must be >= 1 when enabled");
            }
        }

        if self.debug_tape.enabled {
            if self.debug_tape.path.as_os_str().is_empty() {
                bail!("debug_tape.path is required when enabled");
            }
            if self.debug_tape.max_bytes == 0 {
                bail!("debug_tape.max_bytes must be >= 1 when enabled");
            }
        }

        match self.untrusted_driver.as_str() {
            "" | "bwrap" | "firecracker" => {}
            other => bail!("untrusted_driver must be \"bwrap\" or \"firecracker\", got {other:?}"),
        }

        if self.untrusted_driver == "firecracker" {
            if self.firecracker.kernel_path.is_empty() {
                bail!("firecracker.kernel_path is required when untrusted_driver is firecracker");
            }
            if self.firecracker.rootfs_image_path.is_empty() {
                bail!(
                    "firecracker.rootfs_image_path is required when untrusted_driver is firecracker"
                );
            }
            if self.firecracker.vcpus == 0 {
                bail!("firecracker.vcpus must be >= 1");
            }
            if self.firecracker.mem_size_mib == 0 {
                bail!("firecracker.mem_size_mib must be >= 1");
            }
            if self.firecracker.workspace_size_mib == 0 {
                bail!("firecracker.workspace_size_mib must be >= 1");
            }
            if self.firecracker.workspace_size_mib > 32768 {
                bail!("firecracker.workspace_size_mib must be <= 32768 (32 GiB)");
            }
        }

        Ok(())
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll.long_poll_timeout_seconds)
    }

    pub fn poll_retry_backoff(&self) -> Duration {
        Duration::from_secs(self.poll.retry_backoff_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_seconds.max(1))
    }

    pub fn territory_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.territory_heartbeat.interval_seconds.max(1))
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        match self.shutdown_timeout_seconds {
            0 => None,
            s => Some(Duration::from_secs(s)),
        }
    }
}

/// Expand `${VAR}` references from the process environment. Unset variables
/// expand to the empty string.
fn expand_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
