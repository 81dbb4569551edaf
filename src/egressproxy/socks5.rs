//! SOCKS5 handler for the egress proxy listener.
//!
//! Only the CONNECT command with the domain address type is supported: the
//! whole point of the proxy is that name resolution happens proxy-side, so
//! raw-address requests are refused with "address type not supported".

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

use super::audit::AuditEvent;
use super::policy::reason;
use super::proxy::{Conn, Proxy};

pub(crate) const VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPT: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_CMD_UNSUPPORTED: u8 = 0x07;
const REP_ATYP_UNSUPPORTED: u8 = 0x08;

pub(crate) async fn handle(proxy: &Proxy, conn: &mut BufReader<Conn>) {
    // Greeting: VER NMETHODS METHODS...
    let Ok(ver) = conn.read_u8().await else { return };
    if ver != VERSION {
        return;
    }
    let Ok(n_methods) = conn.read_u8().await else {
        return;
    };
    let mut methods = vec![0u8; n_methods as usize];
    if conn.read_exact(&mut methods).await.is_err() {
        return;
    }

    let selected = if methods.contains(&METHOD_NO_AUTH) {
        METHOD_NO_AUTH
    } else {
        METHOD_NO_ACCEPT
    };
    if conn.write_all(&[VERSION, selected]).await.is_err() || selected != METHOD_NO_AUTH {
        return;
    }

    // Request: VER CMD RSV ATYP ...
    let mut req_header = [0u8; 4];
    if conn.read_exact(&mut req_header).await.is_err() || req_header[0] != VERSION {
        return;
    }
    let cmd = req_header[1];
    let atyp = req_header[3];

    if cmd != CMD_CONNECT {
        proxy.audit.log(AuditEvent {
            decision: "deny",
            reason_code: reason::INVALID_DESTINATION,
            method: "SOCKS5",
            ..Default::default()
        });
        let _ = write_reply(conn, REP_CMD_UNSUPPORTED).await;
        return;
    }

    let (dest_host, dest_port) = match read_domain_dest(conn, atyp).await {
        Ok(dest) => dest,
        Err(_) => {
            proxy.audit.log(AuditEvent {
                decision: "deny",
                reason_code: reason::INVALID_DESTINATION,
                method: "SOCKS5",
                ..Default::default()
            });
            let _ = write_reply(conn, REP_ATYP_UNSUPPORTED).await;
            return;
        }
    };

    let check = proxy.policy.check(&dest_host, dest_port);
    if !check.allowed {
        proxy.audit.log(AuditEvent {
            dest_host,
            dest_port,
            decision: "deny",
            reason_code: check.reason_code,
            method: "SOCKS5",
            ..Default::default()
        });
        let _ = write_reply(conn, REP_NOT_ALLOWED).await;
        return;
    }

    let (mut target, resolved_ip) = match proxy.policy.dial_checked(&dest_host, dest_port).await {
        Ok(ok) => ok,
        Err(f) => {
            proxy.audit.log(AuditEvent {
                dest_host,
                dest_port,
                resolved_ip: f.resolved_ip,
                decision: "deny",
                reason_code: f.reason_code,
                method: "SOCKS5",
                ..Default::default()
            });
            let _ = write_reply(conn, REP_NOT_ALLOWED).await;
            return;
        }
    };

    proxy.audit.log(AuditEvent {
        dest_host,
        dest_port,
        resolved_ip: Some(resolved_ip),
        decision: "allow",
        reason_code: reason::OK,
        method: "SOCKS5",
        ..Default::default()
    });

    if write_reply(conn, REP_SUCCESS).await.is_err() {
        return;
    }

    let _ = tokio::io::copy_bidirectional(conn, &mut target).await;
}

/// Read the destination for the domain address type. Raw-address types are
/// drained and refused so the reply still reaches the client.
async fn read_domain_dest(
    conn: &mut BufReader<Conn>,
    atyp: u8,
) -> std::io::Result<(String, u16)> {
    use std::io::{Error, ErrorKind};

    if atyp != ATYP_DOMAIN {
        let skip = match atyp {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            _ => 0,
        };
        let mut scratch = vec![0u8; skip + 2];
        let _ = conn.read_exact(&mut scratch).await;
        return Err(Error::new(ErrorKind::InvalidData, "unsupported address type"));
    }

    let len = conn.read_u8().await? as usize;
    if len == 0 {
        return Err(Error::new(ErrorKind::InvalidData, "empty host"));
    }
    let mut host_bytes = vec![0u8; len];
    conn.read_exact(&mut host_bytes).await?;
    let host = String::from_utf8(host_bytes)
        .map_err(|_| Error::new(ErrorKind::InvalidData, "host is not utf-8"))?;

    if host.trim() != host {
        return Err(Error::new(ErrorKind::InvalidData, "host contains whitespace"));
    }
    // Reject null bytes, control characters, and non-DNS characters to
    // prevent SSRF via resolver edge cases.
    if host.contains(['\0', '\n', '\r', '\t', ' ', '/', '\\', '@', '#', '?']) {
        return Err(Error::new(ErrorKind::InvalidData, "host contains invalid characters"));
    }

    let port = conn.read_u16().await?;
    if port == 0 {
        return Err(Error::new(ErrorKind::InvalidData, "port out of range"));
    }
    Ok((host, port))
}

async fn write_reply(conn: &mut BufReader<Conn>, rep: u8) -> std::io::Result<()> {
    // Minimal reply: bind addr 0.0.0.0:0.
    conn.write_all(&[
        VERSION, rep, 0x00, ATYP_IPV4, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ])
    .await?;
    conn.flush().await
}

#[cfg(test)]
mod tests {
    use super::super::audit::{AuditLogger, AuditSink};
    use super::super::policy::Policy;
    use super::super::policy::testsupport::{RedirectDialer, StaticResolver};
    use super::super::proxy::ProxyListener;
    use super::*;
    use crate::protocol::{NetCapability, NetMode};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    async fn start_proxy(
        policy: Policy,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let audit = AuditLogger::new("d-socks", AuditSink::Channel(tx));
        let proxy = Arc::new(Proxy::new(policy, audit));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(proxy.serve(ProxyListener::Tcp(listener), CancellationToken::new()));
        (addr, rx)
    }

    async fn greet(conn: &mut TcpStream) {
        conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut resp = [0u8; 2];
        conn.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x05, 0x00]);
    }

    fn connect_request(host: &str, port: u16) -> Vec<u8> {
        let mut req = vec![0x05, 0x01, 0x00, ATYP_DOMAIN, host.len() as u8];
        req.extend_from_slice(host.as_bytes());
        req.extend_from_slice(&port.to_be_bytes());
        req
    }

    async fn read_reply(conn: &mut TcpStream) -> u8 {
        let mut reply = [0u8; 10];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        reply[1]
    }

    async fn next_audit(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for audit line")
            .expect("audit channel closed");
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn deny_when_mode_none() {
        let (addr, mut rx) = start_proxy(Policy::new(None).unwrap()).await;
        let mut conn = TcpStream::connect(addr).await.unwrap();
        greet(&mut conn).await;
        conn.write_all(&connect_request("example.com", 443)).await.unwrap();
        assert_eq!(read_reply(&mut conn).await, REP_NOT_ALLOWED);

        let v = next_audit(&mut rx).await;
        assert_eq!(v["reason_code"], "NET_MODE_NONE");
        assert_eq!(v["method"], "SOCKS5");
    }

    #[tokio::test]
    async fn connect_allowed_and_spliced() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = conn.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let mut policy = Policy::new(Some(&NetCapability {
            mode: NetMode::Allowlist,
            allow: vec!["api.example.com:9000".into()],
            ttl_seconds: 0,
        }))
        .unwrap();
        policy.set_resolver(Arc::new(StaticResolver(vec![
            "93.184.216.34".parse().unwrap(),
        ])));
        policy.set_dialer(Arc::new(RedirectDialer(echo_addr)));
        let (addr, mut rx) = start_proxy(policy).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        greet(&mut conn).await;
        conn.write_all(&connect_request("api.example.com", 9000)).await.unwrap();
        assert_eq!(read_reply(&mut conn).await, REP_SUCCESS);

        conn.write_all(b"roundtrip").await.unwrap();
        let mut back = [0u8; 9];
        conn.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"roundtrip");

        let v = next_audit(&mut rx).await;
        assert_eq!(v["decision"], "allow");
        assert_eq!(v["dest_host"], "api.example.com");
        assert_eq!(v["dest_port"], 9000);
    }

    #[tokio::test]
    async fn non_connect_command_rejected() {
        let (addr, mut rx) = start_proxy(Policy::new(None).unwrap()).await;
        let mut conn = TcpStream::connect(addr).await.unwrap();
        greet(&mut conn).await;
        // BIND command
        let mut req = vec![0x05, 0x02, 0x00, ATYP_DOMAIN, 1, b'x'];
        req.extend_from_slice(&443u16.to_be_bytes());
        conn.write_all(&req).await.unwrap();
        assert_eq!(read_reply(&mut conn).await, REP_CMD_UNSUPPORTED);

        let v = next_audit(&mut rx).await;
        assert_eq!(v["reason_code"], "INVALID_DESTINATION");
    }

    #[tokio::test]
    async fn ipv4_address_type_rejected() {
        let (addr, _rx) = start_proxy(Policy::new(None).unwrap()).await;
        let mut conn = TcpStream::connect(addr).await.unwrap();
        greet(&mut conn).await;
        let mut req = vec![0x05, 0x01, 0x00, ATYP_IPV4, 127, 0, 0, 1];
        req.extend_from_slice(&80u16.to_be_bytes());
        conn.write_all(&req).await.unwrap();
        assert_eq!(read_reply(&mut conn).await, REP_ATYP_UNSUPPORTED);
    }

    #[tokio::test]
    async fn hostile_hostname_rejected() {
        let (addr, _rx) = start_proxy(Policy::new(None).unwrap()).await;
        let mut conn = TcpStream::connect(addr).await.unwrap();
        greet(&mut conn).await;
        conn.write_all(&connect_request("bad host", 443)).await.unwrap();
        assert_eq!(read_reply(&mut conn).await, REP_ATYP_UNSUPPORTED);
    }

    #[tokio::test]
    async fn no_acceptable_auth_method() {
        let (addr, _rx) = start_proxy(Policy::new(None).unwrap()).await;
        let mut conn = TcpStream::connect(addr).await.unwrap();
        // Offer only GSSAPI.
        conn.write_all(&[0x05, 0x01, 0x01]).await.unwrap();
        let mut resp = [0u8; 2];
        conn.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [0x05, 0xFF]);
    }
}
