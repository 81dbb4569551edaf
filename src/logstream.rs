//! Ordered, chunked, capped upload of directive output.
//!
//! One uploader serves both streams of a directive and enforces a combined
//! byte cap across them. Chunks carry per-stream sequence numbers starting
//! at zero; bytes beyond the cap optionally spill to per-stream overflow
//! files on disk.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::protocol::LogChunkRequest;
use crate::retry::post_with_retry;
use crate::sandbox::{LogSink, LogStream};

/// Supplies the current directive token for each chunk post; the heartbeat
/// loop may refresh it mid-directive.
pub type TokenProvider = Arc<dyn Fn() -> String + Send + Sync>;

pub struct Uploader {
    client: Arc<Client>,
    directive_id: String,
    token: TokenProvider,
    chunk_bytes: usize,
    max_output_bytes: u64,
    stdout_truncated: AtomicBool,
    stderr_truncated: AtomicBool,
    state: tokio::sync::Mutex<UploadState>,
}

#[derive(Default)]
struct UploadState {
    total_sent: u64,
    stdout: StreamState,
    stderr: StreamState,
    overflow: Option<OverflowConfig>,
}

#[derive(Default)]
struct StreamState {
    seq: u64,
    overflow_file: Option<File>,
    overflow_written: u64,
    overflow_notified: bool,
}

struct OverflowConfig {
    dir: PathBuf,
    max_bytes_per_stream: u64,
}

/// Snapshot of overflow accounting for the artifacts manifest.
#[derive(Debug, Clone, Default)]
pub struct OverflowInfo {
    pub enabled: bool,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub max_bytes_per_stream: u64,
}

impl Uploader {
    pub fn new(
        client: Arc<Client>,
        directive_id: impl Into<String>,
        token: TokenProvider,
        chunk_bytes: usize,
        max_output_bytes: u64,
    ) -> Self {
        Self {
            client,
            directive_id: directive_id.into(),
            token,
            chunk_bytes: chunk_bytes.max(1),
            max_output_bytes,
            stdout_truncated: AtomicBool::new(false),
            stderr_truncated: AtomicBool::new(false),
            state: tokio::sync::Mutex::new(UploadState::default()),
        }
    }

    /// Spill bytes beyond the cap to `<dir>/{stdout,stderr}.log`, capped at
    /// `max_bytes_per_stream` each.
    pub async fn enable_overflow(&self, dir: PathBuf, max_bytes_per_stream: u64) {
        let mut st = self.state.lock().await;
        st.overflow = Some(OverflowConfig {
            dir,
            max_bytes_per_stream,
        });
    }

    pub async fn overflow_info(&self) -> OverflowInfo {
        let st = self.state.lock().await;
        match &st.overflow {
            None => OverflowInfo::default(),
            Some(cfg) => OverflowInfo {
                enabled: true,
                stdout_bytes: st.stdout.overflow_written,
                stderr_bytes: st.stderr.overflow_written,
                max_bytes_per_stream: cfg.max_bytes_per_stream,
            },
        }
    }

    pub async fn last_seq(&self, stream: LogStream) -> u64 {
        let st = self.state.lock().await;
        match stream {
            LogStream::Stdout => st.stdout.seq,
            LogStream::Stderr => st.stderr.seq,
        }
    }

    async fn upload_locked(&self, cancel: &CancellationToken, stream: LogStream, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut st = self.state.lock().await;

        let mut off = 0;
        while off < data.len() {
            let remaining_cap = self.max_output_bytes.saturating_sub(st.total_sent);
            if remaining_cap == 0 {
                self.mark_truncated(stream);
                st.overflow_write(stream, &data[off..]);
                return;
            }

            let piece_len = self.chunk_bytes.min(data.len() - off);
            let send_len = (piece_len as u64).min(remaining_cap) as usize;
            let truncated_now = send_len < piece_len;

            let seq = {
                let s = st.stream_mut(stream);
                let seq = s.seq;
                s.seq += 1;
                seq
            };

            let req = LogChunkRequest {
                stream: stream.as_str().to_string(),
                seq,
                bytes: BASE64.encode(&data[off..off + send_len]),
                truncated: truncated_now,
            };

            let client = Arc::clone(&self.client);
            let directive_id = self.directive_id.clone();
            let token = (self.token)();
            let post = post_with_retry(cancel, "log_chunk", || {
                let client = Arc::clone(&client);
                let directive_id = directive_id.clone();
                let token = token.clone();
                let req = req.clone();
                async move { client.log_chunk(&directive_id, &token, &req).await }
            })
            .await;
            if let Err(e) = post {
                // Best-effort: a lost chunk must not stall the command.
                tracing::warn!(
                    directive_id = %self.directive_id,
                    stream = stream.as_str(),
                    seq,
                    error = %e,
                    "log chunk upload failed"
                );
            }

            st.total_sent += send_len as u64;
            off += send_len;

            if truncated_now {
                self.mark_truncated(stream);
                st.overflow_write(stream, &data[off..]);
                return;
            }
        }
    }

    fn mark_truncated(&self, stream: LogStream) {
        match stream {
            LogStream::Stdout => self.stdout_truncated.store(true, Ordering::SeqCst),
            LogStream::Stderr => self.stderr_truncated.store(true, Ordering::SeqCst),
        }
    }
}

impl UploadState {
    fn stream_mut(&mut self, stream: LogStream) -> &mut StreamState {
        match stream {
            LogStream::Stdout => &mut self.stdout,
            LogStream::Stderr => &mut self.stderr,
        }
    }

    /// Append capped bytes to the stream's overflow file; once the per-file
    /// cap is reached a terminal notice line is written and the rest is
    /// discarded.
    fn overflow_write(&mut self, stream: LogStream, data: &[u8]) {
        let Some(cfg) = &self.overflow else { return };
        let dir = cfg.dir.clone();
        let max = cfg.max_bytes_per_stream;

        let name = format!("{}.log", stream.as_str());
        let s = self.stream_mut(stream);
        if s.overflow_notified || data.is_empty() {
            return;
        }

        if s.overflow_file.is_none() {
            if std::fs::create_dir_all(&dir).is_err() {
                return;
            }
            match OpenOptions::new().create(true).append(true).open(dir.join(name)) {
                Ok(f) => s.overflow_file = Some(f),
                Err(_) => return,
            }
        }
        let Some(file) = s.overflow_file.as_mut() else {
            return;
        };

        let room = max.saturating_sub(s.overflow_written);
        let take = (data.len() as u64).min(room) as usize;
        if take > 0 && file.write_all(&data[..take]).is_ok() {
            s.overflow_written += take as u64;
        }

        if s.overflow_written >= max {
            let notice = format!(
                "\n[log overflow] overflow file reached max_bytes_per_stream={max}; further output discarded\n"
            );
            let _ = file.write_all(notice.as_bytes());
            s.overflow_notified = true;
        }
    }
}

#[async_trait]
impl LogSink for Uploader {
    async fn upload_bytes(&self, cancel: &CancellationToken, stream: LogStream, bytes: &[u8]) {
        self.upload_locked(cancel, stream, bytes).await;
    }

    async fn consume(
        &self,
        cancel: &CancellationToken,
        stream: LogStream,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> std::io::Result<()> {
        let mut buf = vec![0u8; self.chunk_bytes];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            self.upload_locked(cancel, stream, &buf[..n]).await;
        }
    }

    fn stdout_truncated(&self) -> bool {
        self.stdout_truncated.load(Ordering::SeqCst)
    }

    fn stderr_truncated(&self) -> bool {
        self.stderr_truncated.load(Ordering::SeqCst)
    }
}

/// Build the artifacts-manifest entry describing overflow files, or None
/// when nothing was truncated (paths are only advertised when they exist).
pub fn overflow_manifest(
    mount: &str,
    overflow_dir: &str,
    directive_id: &str,
    info: &OverflowInfo,
    stdout_truncated: bool,
    stderr_truncated: bool,
) -> Option<BTreeMap<String, serde_json::Value>> {
    if !info.enabled || (!stdout_truncated && !stderr_truncated) {
        return None;
    }
    let mount = if mount.is_empty() { "/workspace" } else { mount };
    let base = format!("{}/{}/{}", mount.trim_end_matches('/'), overflow_dir, directive_id);

    let mut m = BTreeMap::new();
    m.insert("stdout_path".to_string(), format!("{base}/stdout.log").into());
    m.insert("stderr_path".to_string(), format!("{base}/stderr.log").into());
    m.insert("stdout_bytes".to_string(), info.stdout_bytes.into());
    m.insert("stderr_bytes".to_string(), info.stderr_bytes.into());
    m.insert(
        "max_bytes_per_stream".to_string(),
        info.max_bytes_per_stream.into(),
    );
    Some(m)
}
