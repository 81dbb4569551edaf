use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::audit::{AuditLogger, AuditSink};
use super::policy::Policy;
use super::proxy::{Proxy, ProxyListener};
use crate::netpolicy::AllowlistError;
use crate::protocol::NetCapability;

/// Conservative Unix domain socket path limit, portable across platforms.
const MAX_SOCKET_PATH_LEN: usize = 104;

/// Directive IDs become filesystem path components; restrict accordingly.
fn is_valid_directive_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.is_empty() || !bytes[0].is_ascii_alphanumeric() {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid directive ID: {0:?}")]
    InvalidDirectiveId(String),
    #[error("socket path too long ({len} > {max} chars): {path}")]
    SocketPathTooLong {
        len: usize,
        max: usize,
        path: String,
    },
    #[error("invalid allowlist entry: {0}")]
    Policy(#[from] AllowlistError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A running per-directive proxy instance.
///
/// Created before `started` is posted and stopped after the driver returns.
/// `stop` is idempotent: it cancels the accept loop, awaits shutdown, and
/// removes the socket file.
#[derive(Debug)]
pub struct ProxyInstance {
    socket_path: Option<PathBuf>,
    proxy_url: Option<String>,
    cancel: CancellationToken,
    done: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProxyInstance {
    /// UDS path this proxy is listening on (UDS mode only).
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// HTTP proxy URL (TCP mode only).
    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy_url.as_deref()
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.done.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Start an egress proxy for a single directive on a UDS at
/// `<socket_dir>/<directive_id>.sock`.
pub fn start_for_directive(
    socket_dir: &Path,
    directive_id: &str,
    cap: Option<&NetCapability>,
    audit_sink: AuditSink,
) -> Result<ProxyInstance, ProxyError> {
    if !is_valid_directive_id(directive_id) {
        return Err(ProxyError::InvalidDirectiveId(directive_id.to_string()));
    }

    std::fs::create_dir_all(socket_dir)?;
    set_mode_0700(socket_dir);

    let socket_path = socket_dir.join(format!("{directive_id}.sock"));
    let path_len = socket_path.as_os_str().len();
    if path_len > MAX_SOCKET_PATH_LEN {
        return Err(ProxyError::SocketPathTooLong {
            len: path_len,
            max: MAX_SOCKET_PATH_LEN,
            path: socket_path.display().to_string(),
        });
    }

    // Remove a stale socket from a previous run.
    let _ = std::fs::remove_file(&socket_path);

    let policy = Policy::new(cap)?;
    let audit = AuditLogger::new(directive_id, audit_sink);
    let listener = UnixListener::bind(&socket_path)?;

    Ok(spawn(
        Proxy::new(policy, audit),
        ProxyListener::Unix(listener),
        Some(socket_path),
        None,
        directive_id,
    ))
}

/// Start an egress proxy for a single directive on a loopback TCP port.
/// Used by the trusted container driver, which shares the host network
/// namespace (soft constraint via HTTP_PROXY/HTTPS_PROXY).
pub async fn start_for_directive_tcp(
    directive_id: &str,
    cap: Option<&NetCapability>,
    audit_sink: AuditSink,
) -> Result<ProxyInstance, ProxyError> {
    if !is_valid_directive_id(directive_id) {
        return Err(ProxyError::InvalidDirectiveId(directive_id.to_string()));
    }

    let policy = Policy::new(cap)?;
    let audit = AuditLogger::new(directive_id, audit_sink);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let proxy_url = format!("http://{}", listener.local_addr()?);

    Ok(spawn(
        Proxy::new(policy, audit),
        ProxyListener::Tcp(listener),
        None,
        Some(proxy_url),
        directive_id,
    ))
}

fn spawn(
    proxy: Proxy,
    listener: ProxyListener,
    socket_path: Option<PathBuf>,
    proxy_url: Option<String>,
    directive_id: &str,
) -> ProxyInstance {
    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    let proxy = Arc::new(proxy);
    let id = directive_id.to_string();
    let handle = tokio::spawn(async move {
        tracing::debug!(directive_id = %id, "egress proxy started");
        proxy.serve(listener, serve_cancel).await;
        tracing::debug!(directive_id = %id, "egress proxy stopped");
    });

    ProxyInstance {
        socket_path,
        proxy_url,
        cancel,
        done: tokio::sync::Mutex::new(Some(handle)),
    }
}

#[cfg(unix)]
fn set_mode_0700(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
}

#[cfg(not(unix))]
fn set_mode_0700(_dir: &Path) {}
