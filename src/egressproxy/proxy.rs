use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_util::either::Either;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::audit::{AuditEvent, AuditLogger};
use super::policy::{Policy, reason};
use super::socks5;

/// First-byte classification must never stall the accept loop.
const PEEK_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound for a request or response head.
const MAX_HEAD_BYTES: usize = 32 * 1024;

/// Upper bound when a chunked request body has to be buffered for
/// re-framing with a content-length.
const MAX_BUFFERED_BODY_BYTES: u64 = 64 << 20;

/// Headers that must not be forwarded by a proxy (RFC 9110 §7.6.1).
/// Content framing headers are re-derived rather than forwarded verbatim.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub type Conn = Either<UnixStream, TcpStream>;

pub enum ProxyListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl ProxyListener {
    pub async fn accept(&self) -> io::Result<Conn> {
        match self {
            ProxyListener::Unix(l) => l.accept().await.map(|(s, _)| Either::Left(s)),
            ProxyListener::Tcp(l) => l.accept().await.map(|(s, _)| Either::Right(s)),
        }
    }
}

/// An egress proxy serving HTTP CONNECT, plain HTTP proxying, and SOCKS5 on
/// one listener, distinguished by the first byte of each connection.
pub struct Proxy {
    pub(crate) policy: Policy,
    pub(crate) audit: AuditLogger,
}

struct RequestHead {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
}

struct ResponseHead {
    status_line: String,
    headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    None,
    Length(u64),
    Chunked,
}

impl Proxy {
    pub fn new(policy: Policy, audit: AuditLogger) -> Self {
        Self { policy, audit }
    }

    /// Accept loop. Returns once the token is canceled and all in-flight
    /// connection handlers have finished.
    pub async fn serve(self: Arc<Self>, listener: ProxyListener, cancel: CancellationToken) {
        let tracker = TaskTracker::new();

        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => break,
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        if !cancel.is_cancelled() {
                            tracing::warn!(error = %e, "egress proxy accept failed");
                        }
                        break;
                    }
                },
            };

            let this = Arc::clone(&self);
            let conn_cancel = cancel.clone();
            tracker.spawn(async move {
                tokio::select! {
                    _ = conn_cancel.cancelled() => {}
                    _ = this.handle_conn(conn) => {}
                }
            });
        }

        tracker.close();
        tracker.wait().await;
    }

    async fn handle_conn(&self, conn: Conn) {
        let mut reader = BufReader::new(conn);

        let first = match tokio::time::timeout(PEEK_TIMEOUT, reader.fill_buf()).await {
            Ok(Ok(buf)) if !buf.is_empty() => buf[0],
            _ => return,
        };

        if first == socks5::VERSION {
            socks5::handle(self, &mut reader).await;
            return;
        }

        let head = match read_request_head(&mut reader).await {
            Ok(Some(h)) => h,
            _ => return,
        };

        if head.method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(reader, head).await;
        } else {
            self.handle_forward(reader, head).await;
        }
    }

    async fn handle_connect(&self, mut client: BufReader<Conn>, head: RequestHead) {
        let Some((dest_host, dest_port)) = split_host_port(&head.target, 443) else {
            self.audit.log(AuditEvent {
                dest_host: head.target.trim().to_string(),
                decision: "deny",
                reason_code: reason::INVALID_DESTINATION,
                method: "CONNECT",
                ..Default::default()
            });
            write_http_error(&mut client, 400, "Bad Request", "invalid host:port").await;
            return;
        };

        let check = self.policy.check(&dest_host, dest_port);
        if !check.allowed {
            self.audit.log(AuditEvent {
                dest_host,
                dest_port,
                decision: "deny",
                reason_code: check.reason_code,
                method: "CONNECT",
                ..Default::default()
            });
            let body = format!("egress denied: {}", check.reason_code);
            write_http_error(&mut client, 403, "Forbidden", &body).await;
            return;
        }

        let (mut target, resolved_ip) = match self.policy.dial_checked(&dest_host, dest_port).await
        {
            Ok(ok) => ok,
            Err(f) => {
                self.audit.log(AuditEvent {
                    dest_host,
                    dest_port,
                    resolved_ip: f.resolved_ip,
                    decision: "deny",
                    reason_code: f.reason_code,
                    method: "CONNECT",
                    ..Default::default()
                });
                if f.reason_code == reason::DNS_DENIED {
                    write_http_error(&mut client, 403, "Forbidden", "connection failed").await;
                } else {
                    write_http_error(&mut client, 502, "Bad Gateway", "connection failed").await;
                }
                return;
            }
        };

        self.audit.log(AuditEvent {
            dest_host,
            dest_port,
            resolved_ip: Some(resolved_ip),
            decision: "allow",
            reason_code: reason::OK,
            method: "CONNECT",
            ..Default::default()
        });

        if client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .is_err()
        {
            return;
        }

        // Splice until both directions are drained; copy_bidirectional
        // propagates half-close so neither side leaks.
        let _ = tokio::io::copy_bidirectional(&mut client, &mut target).await;
    }

    async fn handle_forward(&self, mut client: BufReader<Conn>, head: RequestHead) {
        // Only absolute-form http:// targets are proxy requests; TLS goes
        // through CONNECT.
        let target = head.target.trim();
        let Some(rest) = strip_prefix_ignore_case(target, "http://") else {
            self.audit.log(AuditEvent {
                decision: "deny",
                reason_code: reason::INVALID_DESTINATION,
                method: "HTTP",
                ..Default::default()
            });
            write_http_error(&mut client, 400, "Bad Request", "not a proxy request").await;
            return;
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let Some((dest_host, dest_port)) = split_host_port(authority, 80) else {
            self.audit.log(AuditEvent {
                dest_host: authority.to_string(),
                decision: "deny",
                reason_code: reason::INVALID_DESTINATION,
                method: "HTTP",
                ..Default::default()
            });
            write_http_error(&mut client, 400, "Bad Request", "invalid port").await;
            return;
        };

        let check = self.policy.check(&dest_host, dest_port);
        if !check.allowed {
            self.audit.log(AuditEvent {
                dest_host,
                dest_port,
                decision: "deny",
                reason_code: check.reason_code,
                method: "HTTP",
                ..Default::default()
            });
            let body = format!("egress denied: {}", check.reason_code);
            write_http_error(&mut client, 403, "Forbidden", &body).await;
            return;
        }

        let (target_conn, resolved_ip) =
            match self.policy.dial_checked(&dest_host, dest_port).await {
                Ok(ok) => ok,
                Err(f) => {
                    self.audit.log(AuditEvent {
                        dest_host,
                        dest_port,
                        resolved_ip: f.resolved_ip,
                        decision: "deny",
                        reason_code: f.reason_code,
                        method: "HTTP",
                        ..Default::default()
                    });
                    if f.reason_code == reason::DNS_DENIED {
                        write_http_error(&mut client, 403, "Forbidden", "upstream error").await;
                    } else {
                        write_http_error(&mut client, 502, "Bad Gateway", "upstream error").await;
                    }
                    return;
                }
            };

        match self
            .round_trip(&mut client, target_conn, &head, authority, path)
            .await
        {
            Ok(()) => {
                self.audit.log(AuditEvent {
                    dest_host,
                    dest_port,
                    resolved_ip: Some(resolved_ip),
                    decision: "allow",
                    reason_code: reason::OK,
                    method: "HTTP",
                    ..Default::default()
                });
            }
            Err(e) => {
                tracing::debug!(error = %e, "egress proxy http round trip failed");
                self.audit.log(AuditEvent {
                    dest_host,
                    dest_port,
                    resolved_ip: Some(resolved_ip),
                    decision: "deny",
                    reason_code: reason::OTHER,
                    method: "HTTP",
                    ..Default::default()
                });
                write_http_error(&mut client, 502, "Bad Gateway", "upstream error").await;
            }
        }
    }

    /// Forward one request to the dialed origin and relay the response.
    /// Keep-alive is disabled on both legs so no connection outlives the
    /// exchange.
    async fn round_trip(
        &self,
        client: &mut BufReader<Conn>,
        target: TcpStream,
        head: &RequestHead,
        authority: &str,
        path: &str,
    ) -> io::Result<()> {
        let mut upstream = BufReader::new(target);

        // Request body framing from the incoming head. A chunked body is
        // decoded and re-framed with an explicit content-length.
        let body = match request_framing(&head.headers) {
            Framing::Chunked => {
                let mut buf = Vec::new();
                copy_chunked(client, &mut buf, MAX_BUFFERED_BODY_BYTES).await?;
                Some(buf)
            }
            Framing::Length(n) => {
                let mut buf = Vec::with_capacity(n.min(MAX_BUFFERED_BODY_BYTES) as usize);
                let mut limited = (&mut *client).take(n);
                limited.read_to_end(&mut buf).await?;
                if (buf.len() as u64) < n {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Some(buf)
            }
            Framing::None => None,
        };

        let host_value = head
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("host"))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| authority.to_string());

        let mut out = format!("{} {} HTTP/1.1\r\n", head.method, path);
        out.push_str(&format!("host: {host_value}\r\n"));
        for (k, v) in &head.headers {
            if is_hop_by_hop(k)
                || k.eq_ignore_ascii_case("host")
                || k.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            out.push_str(&format!("{k}: {v}\r\n"));
        }
        if let Some(body) = &body {
            out.push_str(&format!("content-length: {}\r\n", body.len()));
        }
        out.push_str("connection: close\r\n\r\n");

        upstream.write_all(out.as_bytes()).await?;
        if let Some(body) = &body {
            upstream.write_all(body).await?;
        }
        upstream.flush().await?;

        // Relay the response, stripping hop-by-hop headers.
        let resp = read_response_head(&mut upstream).await?;
        let framing = response_framing(&resp.headers);

        let mut out = format!("{}\r\n", resp.status_line);
        for (k, v) in &resp.headers {
            if is_hop_by_hop(k) || k.eq_ignore_ascii_case("content-length") {
                continue;
            }
            out.push_str(&format!("{k}: {v}\r\n"));
        }
        if let Framing::Length(n) = framing {
            out.push_str(&format!("content-length: {n}\r\n"));
        }
        out.push_str("connection: close\r\n\r\n");
        client.write_all(out.as_bytes()).await?;

        match framing {
            Framing::Length(n) => {
                let mut limited = (&mut upstream).take(n);
                tokio::io::copy(&mut limited, client).await?;
            }
            Framing::Chunked => {
                // The client reads to EOF: the head above carries neither
                // content-length nor transfer-encoding.
                copy_chunked(&mut upstream, client, u64::MAX).await?;
            }
            Framing::None => {
                tokio::io::copy(&mut upstream, client).await?;
            }
        }
        client.flush().await?;
        client.shutdown().await?;
        Ok(())
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn request_framing(headers: &[(String, String)]) -> Framing {
    for (k, v) in headers {
        if k.eq_ignore_ascii_case("transfer-encoding")
            && v.to_ascii_lowercase().contains("chunked")
        {
            return Framing::Chunked;
        }
    }
    for (k, v) in headers {
        if k.eq_ignore_ascii_case("content-length") {
            if let Ok(n) = v.trim().parse::<u64>() {
                if n > 0 {
                    return Framing::Length(n);
                }
                return Framing::None;
            }
        }
    }
    Framing::None
}

fn response_framing(headers: &[(String, String)]) -> Framing {
    for (k, v) in headers {
        if k.eq_ignore_ascii_case("transfer-encoding")
            && v.to_ascii_lowercase().contains("chunked")
        {
            return Framing::Chunked;
        }
    }
    for (k, v) in headers {
        if k.eq_ignore_ascii_case("content-length") {
            if let Ok(n) = v.trim().parse::<u64>() {
                return Framing::Length(n);
            }
        }
    }
    Framing::None
}

/// Parse "host:port" with a default port. Bracketed and bare IPv6 hosts are
/// passed through so the SSRF guard can reject them at resolution time.
fn split_host_port(hostport: &str, default_port: u16) -> Option<(String, u16)> {
    let s = hostport.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        if host.is_empty() {
            return None;
        }
        let after = &rest[end + 1..];
        if after.is_empty() {
            return Some((host.to_string(), default_port));
        }
        let port: u32 = after.strip_prefix(':')?.parse().ok()?;
        if !(1..=65535).contains(&port) {
            return None;
        }
        return Some((host.to_string(), port as u16));
    }

    match s.rfind(':') {
        Some(idx) if !s[..idx].contains(':') => {
            let host = &s[..idx];
            if host.is_empty() {
                return None;
            }
            let port: u32 = s[idx + 1..].parse().ok()?;
            if !(1..=65535).contains(&port) {
                return None;
            }
            Some((host.to_string(), port as u16))
        }
        // More than one colon without brackets: a bare IPv6 address.
        Some(_) => Some((s.to_string(), default_port)),
        None => Some((s.to_string(), default_port)),
    }
}

async fn read_line_capped<R: AsyncBufRead + Unpin>(
    r: &mut R,
    total: &mut usize,
) -> io::Result<Option<String>> {
    let mut line = Vec::new();
    let n = r.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    *total += n;
    if *total > MAX_HEAD_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "head too large"));
    }
    let mut s = String::from_utf8_lossy(&line).into_owned();
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
    Ok(Some(s))
}

async fn read_headers<R: AsyncBufRead + Unpin>(
    r: &mut R,
    total: &mut usize,
) -> io::Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    loop {
        let Some(line) = read_line_capped(r, total).await? else {
            return Err(io::ErrorKind::UnexpectedEof.into());
        };
        if line.is_empty() {
            return Ok(headers);
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
}

async fn read_request_head<R: AsyncBufRead + Unpin>(
    r: &mut R,
) -> io::Result<Option<RequestHead>> {
    let mut total = 0;
    let Some(request_line) = read_line_capped(r, &mut total).await? else {
        return Ok(None);
    };
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Ok(None);
    };
    let method = method.to_string();
    let target = target.to_string();
    let headers = read_headers(r, &mut total).await?;
    Ok(Some(RequestHead {
        method,
        target,
        headers,
    }))
}

async fn read_response_head<R: AsyncBufRead + Unpin>(r: &mut R) -> io::Result<ResponseHead> {
    let mut total = 0;
    let Some(status_line) = read_line_capped(r, &mut total).await? else {
        return Err(io::ErrorKind::UnexpectedEof.into());
    };
    let headers = read_headers(r, &mut total).await?;
    Ok(ResponseHead {
        status_line,
        headers,
    })
}

/// Decode a chunked body from `r`, writing the decoded bytes to `w`.
async fn copy_chunked<R, W>(r: &mut R, w: &mut W, limit: u64) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut written: u64 = 0;
    let mut total = 0;
    loop {
        let Some(size_line) = read_line_capped(r, &mut total).await? else {
            return Err(io::ErrorKind::UnexpectedEof.into());
        };
        total = 0; // the head cap does not apply across chunks
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_str, 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size"))?;

        if size == 0 {
            // Drain optional trailers up to the terminating blank line.
            let mut trailer_total = 0;
            loop {
                let Some(line) = read_line_capped(r, &mut trailer_total).await? else {
                    return Ok(written);
                };
                if line.is_empty() {
                    return Ok(written);
                }
            }
        }

        written = written
            .checked_add(size)
            .filter(|w| *w <= limit)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "chunked body too large"))?;

        let mut limited = (&mut *r).take(size);
        let copied = tokio::io::copy(&mut limited, w).await?;
        if copied < size {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        // Trailing CRLF after each chunk.
        let mut crlf = [0u8; 2];
        r.read_exact(&mut crlf).await?;
    }
}

async fn write_http_error<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: u16,
    phrase: &str,
    body: &str,
) {
    let payload = format!("{body}\n");
    let head = format!(
        "HTTP/1.1 {status} {phrase}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        payload.len()
    );
    let _ = w.write_all(head.as_bytes()).await;
    let _ = w.write_all(payload.as_bytes()).await;
    let _ = w.flush().await;
}
