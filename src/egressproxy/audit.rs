use std::net::IpAddr;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::protocol::now_rfc3339;

/// One egress connection decision.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditEvent {
    #[serde(rename = "ts")]
    pub timestamp: String,
    pub directive_id: String,
    pub dest_host: String,
    pub dest_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_ip: Option<IpAddr>,
    /// "allow" or "deny"
    pub decision: &'static str,
    pub reason_code: &'static str,
    /// "CONNECT", "HTTP", or "SOCKS5"
    #[serde(skip_serializing_if = "str::is_empty")]
    pub method: &'static str,
}

/// Destination for audit lines. Write failures are swallowed: audit is
/// best-effort and must never break a tunnel.
pub enum AuditSink {
    Null,
    Writer(std::sync::Mutex<Box<dyn std::io::Write + Send>>),
    Channel(mpsc::UnboundedSender<String>),
}

/// Serializes audit events as JSONL into a sink. Safe for concurrent use.
pub struct AuditLogger {
    directive_id: String,
    sink: AuditSink,
}

impl AuditLogger {
    pub fn new(directive_id: impl Into<String>, sink: AuditSink) -> Self {
        Self {
            directive_id: directive_id.into(),
            sink,
        }
    }

    /// Write one event, filling in the timestamp and directive id.
    pub fn log(&self, mut event: AuditEvent) {
        event.timestamp = now_rfc3339();
        event.directive_id = self.directive_id.clone();

        let Ok(line) = serde_json::to_string(&event) else {
            return;
        };

        match &self.sink {
            AuditSink::Null => {}
            AuditSink::Writer(w) => {
                use std::io::Write as _;
                if let Ok(mut w) = w.lock() {
                    let _ = writeln!(w, "{line}");
                }
            }
            AuditSink::Channel(tx) => {
                let _ = tx.send(line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_receives_filled_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logger = AuditLogger::new("d-1", AuditSink::Channel(tx));
        logger.log(AuditEvent {
            dest_host: "example.com".into(),
            dest_port: 443,
            decision: "deny",
            reason_code: "NOT_IN_ALLOWLIST",
            method: "CONNECT",
            ..Default::default()
        });

        let line = rx.try_recv().unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["directive_id"], "d-1");
        assert_eq!(v["dest_host"], "example.com");
        assert_eq!(v["dest_port"], 443);
        assert_eq!(v["decision"], "deny");
        assert_eq!(v["reason_code"], "NOT_IN_ALLOWLIST");
        assert_eq!(v["method"], "CONNECT");
        assert!(!v["ts"].as_str().unwrap().is_empty());
        assert!(v.get("resolved_ip").is_none());
    }

    #[test]
    fn writer_sink_appends_lines() {
        let buf: Vec<u8> = Vec::new();
        let logger = AuditLogger::new(
            "d-2",
            AuditSink::Writer(std::sync::Mutex::new(Box::new(buf))),
        );
        logger.log(AuditEvent {
            dest_host: "a.example".into(),
            dest_port: 80,
            decision: "allow",
            reason_code: "OK",
            method: "HTTP",
            resolved_ip: Some("93.184.216.34".parse().unwrap()),
            ..Default::default()
        });
        // The sink owns the buffer; this test only exercises the no-panic path.
    }

    #[test]
    fn null_sink_discards() {
        let logger = AuditLogger::new("d-3", AuditSink::Null);
        logger.log(AuditEvent::default());
    }
}
