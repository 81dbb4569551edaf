use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Concurrent-connection bound, so a malicious guest cannot exhaust host
/// resources by hammering the vsock port.
const MAX_VSOCK_CONNS: usize = 128;

/// Bridges a Firecracker vsock UDS listener to an egress proxy UDS.
///
/// When a guest dials vsock port 9080, Firecracker connects to
/// `<vsock_uds_path>_9080` on the host. The bridge accepts those
/// connections and splices each one onto the proxy socket.
pub struct VsockBridge {
    cancel: CancellationToken,
    done: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl VsockBridge {
    /// Listen on `vsock_listen_path` and forward each accepted connection
    /// to the egress proxy at `proxy_socket_path`.
    pub fn start(
        vsock_listen_path: &Path,
        proxy_socket_path: &Path,
    ) -> std::io::Result<VsockBridge> {
        let listener = UnixListener::bind(vsock_listen_path)?;
        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let proxy_path = proxy_socket_path.to_path_buf();

        let handle = tokio::spawn(serve(listener, proxy_path, serve_cancel));

        Ok(VsockBridge {
            cancel,
            done: tokio::sync::Mutex::new(Some(handle)),
        })
    }

    /// Idempotent shutdown: cancel the accept loop and await completion.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.done.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn serve(listener: UnixListener, proxy_path: PathBuf, cancel: CancellationToken) {
    let sem = Arc::new(Semaphore::new(MAX_VSOCK_CONNS));
    let tracker = TaskTracker::new();

    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok((conn, _)) => conn,
                Err(e) => {
                    if !cancel.is_cancelled() {
                        tracing::error!(error = %e, "vsock bridge: accept error");
                    }
                    break;
                }
            },
        };

        // Enforce the connection limit; excess connections are dropped
        // immediately rather than queued.
        let Ok(permit) = Arc::clone(&sem).try_acquire_owned() else {
            tracing::warn!(
                max_conns = MAX_VSOCK_CONNS,
                "vsock bridge: connection limit reached, rejecting"
            );
            drop(conn);
            continue;
        };

        let proxy_path = proxy_path.clone();
        tracker.spawn(async move {
            let _permit = permit;
            handle_conn(conn, &proxy_path).await;
        });
    }

    tracker.close();
    tracker.wait().await;
}

async fn handle_conn(mut client: UnixStream, proxy_path: &Path) {
    let mut proxy = match UnixStream::connect(proxy_path).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "vsock bridge: dial proxy failed");
            return;
        }
    };
    let _ = tokio::io::copy_bidirectional(&mut client, &mut proxy).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// A tiny UDS echo server standing in for the egress proxy socket.
    async fn start_echo_uds(path: &Path) {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
    }

    #[tokio::test]
    async fn forwards_connections_to_proxy_socket() {
        let dir = tempfile::tempdir().unwrap();
        let proxy_path = dir.path().join("proxy.sock");
        let vsock_path = dir.path().join("vsock.sock_9080");
        start_echo_uds(&proxy_path).await;

        let bridge = VsockBridge::start(&vsock_path, &proxy_path).unwrap();

        let mut conn = UnixStream::connect(&vsock_path).await.unwrap();
        conn.write_all(b"guest-bytes").await.unwrap();
        let mut back = [0u8; 11];
        conn.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"guest-bytes");

        bridge.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let proxy_path = dir.path().join("proxy.sock");
        let vsock_path = dir.path().join("vsock.sock_9080");
        start_echo_uds(&proxy_path).await;

        let bridge = VsockBridge::start(&vsock_path, &proxy_path).unwrap();
        bridge.stop().await;
        bridge.stop().await;
    }

    #[tokio::test]
    async fn dead_proxy_socket_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let proxy_path = dir.path().join("missing.sock");
        let vsock_path = dir.path().join("vsock.sock_9080");

        let bridge = VsockBridge::start(&vsock_path, &proxy_path).unwrap();

        let mut conn = UnixStream::connect(&vsock_path).await.unwrap();
        let mut buf = [0u8; 1];
        // The bridge fails to dial the proxy and closes our side.
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        bridge.stop().await;
    }
}
