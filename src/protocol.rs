//! Wire contracts between nexusd and the mothership.
//!
//! These types form the contract layer for the conduits API. Keep them
//! stable and version-friendly: every optional field defaults on decode and
//! is skipped on encode when empty.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type LooseMap = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectiveSpec {
    pub directive_id: String,
    pub facility: FacilitySpec,
    /// untrusted / trusted / host / darwin-automation
    #[serde(default)]
    pub sandbox_profile: String,

    /// Shell command string (not an argv array).
    pub command: String,
    /// Default /bin/sh; unified across all platforms.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub shell: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,

    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub limits: Limits,

    #[serde(default)]
    pub capabilities: Capabilities,

    #[serde(default)]
    pub artifacts: ArtifactsSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacilitySpec {
    pub id: String,
    /// Mount path inside the sandbox. Default /workspace.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mount: String,
    /// Clone hint for the prepare stage.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_url: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Limits {
    /// CPU limit in millicores (1000 = one core).
    #[serde(default)]
    pub cpu: u64,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_mb: u64,
    #[serde(default)]
    pub max_output_bytes: u64,
    #[serde(default)]
    pub max_diff_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<NetCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsCapability>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetMode {
    #[default]
    None,
    Allowlist,
    Unrestricted,
    /// Forward-compat: an unrecognized mode fails closed at policy evaluation.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetCapability {
    pub mode: NetMode,
    /// host:port entries; required when mode=allowlist.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default)]
    pub ttl_seconds: u64,
}

/// Filesystem access policy. `writable_roots` / `read_only_subpaths` are
/// host-absolute paths consumed by the Landlock limiter; `read` / `write`
/// are logical workspace selectors kept for audit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsCapability {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub writable_roots: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_only_subpaths: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactsSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collect: Vec<String>,
    #[serde(default)]
    pub always_diff: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectiveLease {
    pub directive_id: String,
    pub directive_token: String,
    pub spec: DirectiveSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollRequest {
    pub supported_sandbox_profiles: Vec<String>,
    #[serde(default)]
    pub max_directives_to_claim: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub directives: Vec<DirectiveLease>,
    #[serde(default)]
    pub lease_ttl_seconds: u64,
    #[serde(default)]
    pub retry_after_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub enroll_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: LooseMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: LooseMap,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub csr_pem: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub territory_id: String,
    #[serde(default)]
    pub mtls_client_cert_pem: String,
    #[serde(default)]
    pub ca_bundle_pem: String,
    #[serde(default)]
    pub config: LooseMap,
}

/// Territory-level presence heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerritoryHeartbeatRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nexusd_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_directives_count: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: LooseMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: LooseMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerritoryHeartbeatResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub territory_id: String,

    // Version negotiation hints from the server; informational only.
    #[serde(default)]
    pub upgrade_available: bool,
    #[serde(default)]
    pub latest_version: String,
    #[serde(default)]
    pub min_compatible_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartedRequest {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub effective_capabilities_summary: LooseMap,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nexusd_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub started_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub progress: LooseMap,
    #[serde(default)]
    pub last_output_seq: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub now: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub lease_renewed: bool,
    /// Refreshed token; replaces the previous one when non-empty.
    #[serde(default)]
    pub directive_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogChunkRequest {
    /// stdout / stderr
    pub stream: String,
    pub seq: u64,
    /// base64-encoded chunk payload
    pub bytes: String,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    #[default]
    Failed,
    Canceled,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
            RunStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinishedRequest {
    /// None means the exit code was never determined; 0 is a valid value.
    pub exit_code: Option<i32>,
    pub status: RunStatus,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    #[serde(default)]
    pub diff_truncated: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub diff_base64: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts_manifest: LooseMap,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub finished_at: String,
}

/// RFC3339 timestamp with nanosecond precision in UTC, the format used in
/// every wire payload and persisted record.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}
